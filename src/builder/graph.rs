//! The dependency DAG over node ids. Vertices are resolver, group and
//! router declarations; an edge a→b means a consumes b. Duplicate
//! vertices, dangling edges and cycles are build failures, and leaf-first
//! consumption guarantees children exist before their parents.

use std::collections::{HashMap, HashSet};

use super::BuildError;

#[derive(Default)]
pub struct Dag {
    vertices: HashSet<String>,
    edges: HashMap<String, HashSet<String>>,
}

impl Dag {
    pub fn new() -> Dag {
        Dag::default()
    }

    pub fn add_vertex(&mut self, id: &str) -> Result<(), BuildError> {
        if !self.vertices.insert(id.to_string()) {
            return Err(BuildError::DuplicateId(id.to_string()));
        }
        Ok(())
    }

    /// Insert an edge, failing on unknown endpoints or if it would close a
    /// cycle.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), BuildError> {
        if !self.vertices.contains(from) {
            return Err(BuildError::UnknownReference(from.to_string()));
        }
        if !self.vertices.contains(to) {
            return Err(BuildError::UnknownReference(format!(
                "'{}' references non-existent resolver, group or router '{}'",
                from, to
            )));
        }
        if from == to || self.reachable(to, from) {
            return Err(BuildError::Cycle(format!("{} -> {}", from, to)));
        }
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        Ok(())
    }

    fn reachable(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !seen.insert(current.to_string()) {
                continue;
            }
            if let Some(next) = self.edges.get(current) {
                stack.extend(next.iter().map(|s| s.as_str()));
            }
        }
        false
    }

    /// Vertices without outgoing edges; their dependencies (if any) have
    /// already been consumed.
    pub fn leaves(&self) -> Vec<String> {
        let mut leaves: Vec<String> = self
            .vertices
            .iter()
            .filter(|v| self.edges.get(*v).map(|e| e.is_empty()).unwrap_or(true))
            .cloned()
            .collect();
        // Deterministic instantiation order helps debugging
        leaves.sort();
        leaves
    }

    pub fn remove_vertex(&mut self, id: &str) {
        self.vertices.remove(id);
        self.edges.remove(id);
        for targets in self.edges.values_mut() {
            targets.remove(id);
        }
    }

    pub fn order(&self) -> usize {
        self.vertices.len()
    }
}
