//! Group with one static primary child and a set of panel resolvers that
//! is attached dynamically after the pipeline DAG is built. Queries race
//! the panel resolvers like the fastest group; without any attached panel
//! resolvers the primary child serves alone.

use async_trait::async_trait;
use parking_lot::RwLock;

use super::fastest::race;
use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;
use crate::resolver::{ClientInfo, DynResolver, Resolver, Result};

pub struct PanelRotate {
    id: String,
    resolver: DynResolver,
    panel_resolvers: RwLock<Vec<DynResolver>>,
}

impl PanelRotate {
    pub fn new(id: &str, resolver: DynResolver) -> PanelRotate {
        PanelRotate {
            id: id.to_string(),
            resolver,
            panel_resolvers: RwLock::new(Vec::new()),
        }
    }

    /// Attach a panel resolver. Called by the builder after the topological
    /// instantiation loop; this child set is deliberately not part of the
    /// DAG.
    pub fn attach(&self, resolver: DynResolver) {
        log::debug!(
            "id={} attaching panel resolver {}",
            self.id,
            resolver.describe()
        );
        self.panel_resolvers.write().push(resolver);
    }

    pub fn panel_resolver_count(&self) -> usize {
        self.panel_resolvers.read().len()
    }
}

#[async_trait]
impl Resolver for PanelRotate {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let panel = self.panel_resolvers.read().clone();
        if panel.is_empty() {
            return self.resolver.resolve(query, ci, dialer).await;
        }
        race(&self.id, &panel, query, ci, dialer).await
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}
