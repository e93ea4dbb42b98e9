//! Rotates queries over its children, one step per query.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;
use crate::resolver::{ClientInfo, DynResolver, Resolver, Result};

pub struct RoundRobin {
    id: String,
    resolvers: Vec<DynResolver>,
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new(id: &str, resolvers: Vec<DynResolver>) -> RoundRobin {
        RoundRobin {
            id: id.to_string(),
            resolvers,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Resolver for RoundRobin {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.resolvers.len();
        let resolver = &self.resolvers[index];
        log::debug!(
            "id={} client={} qname={} resolver={} forwarding",
            self.id,
            ci,
            query.qname(),
            resolver.describe()
        );
        resolver.resolve(query, ci, dialer).await
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::RecordType;
    use crate::resolver::test_util::TestResolver;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fair_rotation() {
        let children: Vec<Arc<TestResolver>> = (0..3).map(|_| Arc::new(TestResolver::new())).collect();
        let group = RoundRobin::new(
            "rr",
            children.iter().map(|c| c.clone() as DynResolver).collect(),
        );

        let query = DnsPacket::query("example.com.", RecordType::A);
        for _ in 0..9 {
            group.resolve(&query, &Default::default(), None).await.unwrap();
        }

        for child in &children {
            assert_eq!(3, child.hit_count());
        }
    }

    #[tokio::test]
    async fn test_order_cycles() {
        let first = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let second = Arc::new(TestResolver::with_ip("192.0.2.2"));
        let group = RoundRobin::new("rr", vec![first, second]);

        let query = DnsPacket::query("example.com.", RecordType::A);
        let mut ips = Vec::new();
        for _ in 0..4 {
            let answer = group
                .resolve(&query, &Default::default(), None)
                .await
                .unwrap()
                .unwrap();
            ips.push(answer.answers[0].ip().unwrap().to_string());
        }
        assert_eq!(vec!["192.0.2.1", "192.0.2.2", "192.0.2.1", "192.0.2.2"], ips);
    }
}
