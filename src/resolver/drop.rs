//! Drops every query: the empty response tells the listener to close the
//! connection without answering.

use async_trait::async_trait;

use super::{ClientInfo, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;

pub struct DropResolver {
    id: String,
}

impl DropResolver {
    pub fn new(id: &str) -> DropResolver {
        DropResolver { id: id.to_string() }
    }
}

#[async_trait]
impl Resolver for DropResolver {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        _dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        log::debug!(
            "id={} client={} qname={} dropping query",
            self.id,
            ci,
            query.qname()
        );
        Ok(None)
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::RecordType;

    #[tokio::test]
    async fn test_drop() {
        let resolver = DropResolver::new("sinkhole");
        let query = DnsPacket::query("anything.test.", RecordType::A);
        let response = resolver.resolve(&query, &Default::default(), None).await.unwrap();
        assert!(response.is_none());
    }
}
