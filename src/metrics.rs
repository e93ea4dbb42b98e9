//! Process-wide metrics registry
//!
//! Counters register themselves under a dotted name (`listener.<id>.query`)
//! and the admin listener serves the whole registry as JSON under
//! `/routedns/vars`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde_json::{json, Value};

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, Var>> = RwLock::new(HashMap::new());
}

#[derive(Clone)]
enum Var {
    Int(Arc<AtomicU64>),
    Map(Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>),
}

/// Monotonic counter published in the vars registry.
#[derive(Clone)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Labelled counters published as a JSON object, e.g. responses by Rcode.
#[derive(Clone)]
pub struct CounterMap {
    values: Arc<RwLock<HashMap<String, Arc<AtomicU64>>>>,
}

impl CounterMap {
    pub fn add(&self, label: &str, n: u64) {
        if let Some(value) = self.values.read().get(label) {
            value.fetch_add(n, Ordering::Relaxed);
            return;
        }
        let mut values = self.values.write();
        values
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.values
            .read()
            .get(label)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Register (or look up) a counter named `scope.id.name`.
pub fn get_var_int(scope: &str, id: &str, name: &str) -> Counter {
    let key = format!("{}.{}.{}", scope, id, name);
    let mut registry = REGISTRY.write();
    let var = registry
        .entry(key)
        .or_insert_with(|| Var::Int(Arc::new(AtomicU64::new(0))));
    match var {
        Var::Int(value) => Counter {
            value: value.clone(),
        },
        // A map already took the name; hand out an unregistered counter
        // rather than fail at runtime
        Var::Map(_) => Counter {
            value: Arc::new(AtomicU64::new(0)),
        },
    }
}

/// Register (or look up) a labelled counter map named `scope.id.name`.
pub fn get_var_map(scope: &str, id: &str, name: &str) -> CounterMap {
    let key = format!("{}.{}.{}", scope, id, name);
    let mut registry = REGISTRY.write();
    let var = registry
        .entry(key)
        .or_insert_with(|| Var::Map(Arc::new(RwLock::new(HashMap::new()))));
    match var {
        Var::Map(values) => CounterMap {
            values: values.clone(),
        },
        Var::Int(_) => CounterMap {
            values: Arc::new(RwLock::new(HashMap::new())),
        },
    }
}

/// Current state of the whole registry as JSON.
pub fn snapshot() -> Value {
    let registry = REGISTRY.read();
    let mut out = serde_json::Map::new();
    for (key, var) in registry.iter() {
        let value = match var {
            Var::Int(v) => json!(v.load(Ordering::Relaxed)),
            Var::Map(m) => {
                let m = m.read();
                let mut obj = serde_json::Map::new();
                for (label, v) in m.iter() {
                    obj.insert(label.clone(), json!(v.load(Ordering::Relaxed)));
                }
                Value::Object(obj)
            }
        };
        out.insert(key.clone(), value);
    }
    Value::Object(out)
}

/// Standard per-listener counters.
pub struct ListenerMetrics {
    pub query: Counter,
    pub response: CounterMap,
    pub drop: Counter,
    pub err: CounterMap,
}

impl ListenerMetrics {
    pub fn new(scope: &str, id: &str) -> ListenerMetrics {
        ListenerMetrics {
            query: get_var_int(scope, id, "query"),
            response: get_var_map(scope, id, "response"),
            drop: get_var_int(scope, id, "drop"),
            err: get_var_map(scope, id, "error"),
        }
    }
}

/// Standard counters of the blocklist resolver family.
pub struct BlocklistMetrics {
    pub allowed: Counter,
    pub blocked: Counter,
}

impl BlocklistMetrics {
    pub fn new(id: &str) -> BlocklistMetrics {
        BlocklistMetrics {
            allowed: get_var_int("blocklist", id, "allowed"),
            blocked: get_var_int("blocklist", id, "blocked"),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_counter_registration() {
        let counter = get_var_int("test", "metrics-a", "query");
        counter.add(2);
        // Same name resolves to the same counter
        let again = get_var_int("test", "metrics-a", "query");
        again.add(1);
        assert_eq!(3, again.get());
    }

    #[test]
    fn test_counter_map() {
        let map = get_var_map("test", "metrics-b", "response");
        map.add("NOERROR", 2);
        map.add("NXDOMAIN", 1);
        assert_eq!(2, map.get("NOERROR"));
        assert_eq!(1, map.get("NXDOMAIN"));
        assert_eq!(0, map.get("SERVFAIL"));
    }

    #[test]
    fn test_snapshot_contains_registered_vars() {
        let counter = get_var_int("test", "metrics-c", "query");
        counter.add(5);
        let snap = snapshot();
        assert_eq!(json!(5), snap["test.metrics-c.query"]);
    }
}
