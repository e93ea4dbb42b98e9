//! Pipeline builder
//!
//! Turns the declarative configuration into a running pipeline: all
//! resolver/group/router declarations become vertices of a DAG keyed by id,
//! edges point at consumed children, and instantiation proceeds leaf-first
//! so each constructor receives fully-built children. Duplicate ids,
//! dangling references, cycles and invalid panel topologies abort the build
//! with no partial graph exposed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::group::PanelRotate;
use crate::listener::{DynListener, Listener};
use crate::matcher::MatcherError;
use crate::resolver::{Cache, DynResolver, ResolveError, Resolver};
use crate::tls::TlsError;

pub mod config;
pub mod graph;
mod instantiate;

pub use config::Config;
pub use graph::Dag;

#[derive(Debug, Display, From, Error)]
pub enum BuildError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Node(ResolveError),
    Tls(TlsError),
    Matcher(MatcherError),
    #[from(ignore)]
    DuplicateId(#[error(not(source))] String),
    #[from(ignore)]
    UnknownReference(#[error(not(source))] String),
    #[from(ignore)]
    Cycle(#[error(not(source))] String),
    #[from(ignore)]
    UnsupportedType(#[error(not(source))] String),
    #[from(ignore)]
    InvalidValue(#[error(not(source))] String),
    #[from(ignore)]
    InvalidPanelTopology(#[error(not(source))] String),
}

/// A periodic certificate-renewal task registered during the build and
/// started with the manager.
pub struct PeriodicTask {
    pub tag: String,
    pub interval: Duration,
    pub target: CertTarget,
}

pub enum CertTarget {
    Resolver(DynResolver),
    Listener(DynListener),
}

/// State accumulated while walking the DAG.
#[derive(Default)]
pub(crate) struct BuildContext {
    pub resolvers: HashMap<String, DynResolver>,
    pub panel_rotates: HashMap<String, Arc<PanelRotate>>,
    pub caches: Vec<Arc<Cache>>,
    pub tasks: Vec<PeriodicTask>,
}

/// The built pipeline: listeners to run, the resolver map for
/// introspection, cert-monitor tasks and caches to flush on shutdown.
pub struct Manager {
    pub listeners: Vec<DynListener>,
    pub resolvers: HashMap<String, DynResolver>,
    pub tasks: Vec<PeriodicTask>,
    caches: Vec<Arc<Cache>>,
}

impl Manager {
    /// Run every listener on its own task, restarting after a pause when
    /// one fails.
    pub fn spawn_listeners(&self) -> Vec<tokio::task::JoinHandle<()>> {
        self.listeners
            .iter()
            .map(|listener| {
                let listener = listener.clone();
                tokio::spawn(async move {
                    loop {
                        if let Err(err) = listener.start().await {
                            log::error!("listener {} failed: {}", listener.describe(), err);
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                })
            })
            .collect()
    }

    /// Start the periodic cert-monitor tasks. Failures are logged and
    /// retried on the next tick; the tasks never end.
    pub fn start_tasks(&self) {
        for task in &self.tasks {
            let tag = task.tag.clone();
            let interval = task.interval;
            let target = match &task.target {
                CertTarget::Resolver(r) => CertTarget::Resolver(r.clone()),
                CertTarget::Listener(l) => CertTarget::Listener(l.clone()),
            };
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let result = match &target {
                        CertTarget::Resolver(r) => r.cert_renew().await,
                        CertTarget::Listener(l) => l.cert_renew().await,
                    };
                    if let Err(err) = result {
                        log::error!("{} failed: {}", tag, err);
                    }
                }
            });
        }
    }

    /// Flush cache snapshots and stop all listeners.
    pub async fn close(&self) {
        log::info!("stopping");
        for cache in &self.caches {
            cache.save_snapshot();
        }
        for listener in &self.listeners {
            if let Err(err) = listener.stop().await {
                log::error!("failed to stop listener {}: {}", listener.describe(), err);
            }
        }
    }
}

/// Build the full pipeline from a parsed configuration.
pub async fn build(config: &Config) -> Result<Manager, BuildError> {
    let mut ctx = BuildContext::default();

    // The bootstrap resolver comes first so every other client can resolve
    // its endpoint hostname through it
    if let Some(bootstrap) = &config.bootstrap_resolver {
        instantiate::instantiate_resolver("bootstrap-resolver", bootstrap, &mut ctx).await?;
        if let Some(resolver) = ctx.resolvers.get("bootstrap-resolver") {
            crate::client::set_bootstrap_resolver(resolver.clone());
        }
    }

    // All node declarations become DAG vertices; this also catches
    // duplicate ids across the three maps
    let mut graph = Dag::new();
    for id in config.resolvers.keys() {
        graph.add_vertex(id)?;
    }

    let mut panel_blocklists = Vec::new();
    let mut panel_rotates = Vec::new();
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for (id, group) in &config.groups {
        graph.add_vertex(id)?;
        match group.group_type.as_str() {
            "blocklist-panel" => panel_blocklists.push(id.clone()),
            "panel-rotate" => panel_rotates.push(id.clone()),
            _ => {}
        }
        let mut deps = group.resolvers.clone();
        for extra in [
            &group.allowlist_resolver,
            &group.blocklist_resolver,
            &group.ip_allowlist_resolver,
            &group.limit_resolver,
            &group.retry_resolver,
        ] {
            if !extra.is_empty() {
                deps.push(extra.clone());
            }
        }
        edges.insert(id.clone(), deps);
    }

    // A blocklist-panel is only usable when exactly one panel-rotate
    // exists to attach to
    if !panel_blocklists.is_empty() && panel_rotates.is_empty() {
        return Err(BuildError::InvalidPanelTopology(format!(
            "{} blocklist-panel found but panel-rotate not found",
            panel_blocklists.len()
        )));
    }
    if panel_rotates.len() > 1 {
        return Err(BuildError::InvalidPanelTopology(format!(
            "currently only one panel-rotate is supported, found {}",
            panel_rotates.len()
        )));
    }

    for (id, router) in &config.routers {
        graph.add_vertex(id)?;
        // One router can carry multiple routes to the same resolver,
        // deduplicate before inserting edges
        let mut deps: Vec<String> = router.routes.iter().map(|r| r.resolver.clone()).collect();
        deps.sort();
        deps.dedup();
        edges.insert(id.clone(), deps);
    }

    for (id, deps) in &edges {
        for dep in deps {
            if dep.is_empty() {
                continue;
            }
            graph.add_edge(id, dep)?;
        }
    }

    // Leaf-first instantiation: children always exist when their parent's
    // constructor runs
    while graph.order() > 0 {
        let leaves = graph.leaves();
        for id in leaves {
            if let Some(cfg) = config.resolvers.get(&id) {
                instantiate::instantiate_resolver(&id, cfg, &mut ctx).await?;
            } else if let Some(cfg) = config.groups.get(&id) {
                instantiate::instantiate_group(&id, cfg, &mut ctx).await?;
            } else if let Some(cfg) = config.routers.get(&id) {
                instantiate::instantiate_router(&id, cfg, &mut ctx)?;
            }
            graph.remove_vertex(&id);
        }
    }

    // Attach the panel blocklists to the sole panel-rotate; this child set
    // is dynamic and deliberately not part of the DAG
    if let Some(rotate_id) = panel_rotates.first() {
        let rotate = ctx
            .panel_rotates
            .get(rotate_id)
            .cloned()
            .ok_or_else(|| BuildError::UnknownReference(rotate_id.clone()))?;
        for id in &panel_blocklists {
            if let Some(resolver) = ctx.resolvers.remove(id) {
                rotate.attach(resolver);
            }
        }
    }

    // Listeners come last, they can point at any node
    let mut listeners = Vec::with_capacity(config.listeners.len());
    for (id, cfg) in &config.listeners {
        listeners.push(instantiate::instantiate_listener(id, cfg, &mut ctx)?);
    }

    Ok(Manager {
        listeners,
        resolvers: ctx.resolvers,
        tasks: ctx.tasks,
        caches: ctx.caches,
    })
}

#[cfg(test)]
mod tests {

    use super::*;

    async fn build_str(content: &str) -> Result<Manager, BuildError> {
        let config = Config::from_str(content).unwrap();
        build(&config).await
    }

    #[tokio::test]
    async fn test_well_formed_config() {
        let manager = build_str(
            r#"
            [resolvers.upstream]
            address = "1.1.1.1:53"
            protocol = "udp"

            [groups.cached]
            type = "cache"
            resolvers = ["upstream"]

            [routers.main]
            routes = [
                { types = ["AAAA"], resolver = "upstream" },
                { resolver = "cached" },
            ]

            [listeners.local]
            address = "127.0.0.1:15301"
            protocol = "udp"
            resolver = "main"
            "#,
        )
        .await
        .unwrap();

        assert_eq!(1, manager.listeners.len());
        assert!(manager.resolvers.contains_key("main"));
        assert!(manager.resolvers.contains_key("cached"));
        assert!(manager.resolvers.contains_key("upstream"));
    }

    #[tokio::test]
    async fn test_dangling_reference_fails() {
        let result = build_str(
            r#"
            [groups.cached]
            type = "cache"
            resolvers = ["missing"]

            [listeners.local]
            address = "127.0.0.1:15302"
            protocol = "udp"
            resolver = "cached"
            "#,
        )
        .await;
        assert!(matches!(result, Err(BuildError::UnknownReference(_))));
    }

    #[tokio::test]
    async fn test_cycle_fails() {
        let result = build_str(
            r#"
            [groups.a]
            type = "round-robin"
            resolvers = ["b"]

            [groups.b]
            type = "round-robin"
            resolvers = ["a"]
            "#,
        )
        .await;
        assert!(matches!(result, Err(BuildError::Cycle(_))));
    }

    #[tokio::test]
    async fn test_panel_without_rotate_fails() {
        let result = build_str(
            r#"
            [resolvers.upstream]
            address = "1.1.1.1:53"
            protocol = "udp"

            [groups.panel]
            type = "blocklist-panel"
            resolvers = ["upstream"]
            panel-url = "https://panel.example.com"
            "#,
        )
        .await;
        assert!(matches!(result, Err(BuildError::InvalidPanelTopology(_))));
    }

    #[tokio::test]
    async fn test_listener_dangling_resolver_fails() {
        let result = build_str(
            r#"
            [listeners.local]
            address = "127.0.0.1:15303"
            protocol = "udp"
            resolver = "nope"
            "#,
        )
        .await;
        assert!(matches!(result, Err(BuildError::UnknownReference(_))));
    }

    #[tokio::test]
    async fn test_router_requires_catch_all() {
        let result = build_str(
            r#"
            [resolvers.upstream]
            address = "1.1.1.1:53"
            protocol = "udp"

            [routers.main]
            routes = [
                { types = ["AAAA"], resolver = "upstream" },
            ]
            "#,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_type_fails() {
        let result = build_str(
            r#"
            [resolvers.upstream]
            address = "1.1.1.1:53"
            protocol = "carrier-pigeon"
            "#,
        )
        .await;
        assert!(matches!(result, Err(BuildError::UnsupportedType(_))));
    }

    #[tokio::test]
    async fn test_static_blocklist_pipeline() {
        let manager = build_str(
            r#"
            [groups.filter]
            type = "blocklist"
            resolvers = ["spoofed"]
            blocklist = ["full:evil.test"]

            [groups.spoofed]
            type = "static-responder"
            answer = [". 3600 A 1.2.3.4"]

            [listeners.local]
            address = "127.0.0.1:15304"
            protocol = "udp"
            resolver = "filter"
            "#,
        )
        .await
        .unwrap();

        use crate::dns::protocol::{DnsPacket, RecordType, ResultCode};
        use crate::resolver::Resolver as _;
        let filter = manager.resolvers.get("filter").unwrap();

        let blocked = DnsPacket::query("evil.test.", RecordType::A);
        let answer = filter
            .resolve(&blocked, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NXDOMAIN, answer.header.rescode);

        let good = DnsPacket::query("good.test.", RecordType::A);
        let answer = filter
            .resolve(&good, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);
    }
}
