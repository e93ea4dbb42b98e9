//! Retries truncated responses over a second resolver, typically a TCP
//! client behind a UDP one.

use async_trait::async_trait;

use super::{ClientInfo, DynResolver, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;

pub struct TruncateRetry {
    id: String,
    resolver: DynResolver,
    retry_resolver: DynResolver,
}

impl TruncateRetry {
    pub fn new(id: &str, resolver: DynResolver, retry_resolver: DynResolver) -> TruncateRetry {
        TruncateRetry {
            id: id.to_string(),
            resolver,
            retry_resolver,
        }
    }
}

#[async_trait]
impl Resolver for TruncateRetry {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let answer = self.resolver.resolve(query, ci, dialer).await?;
        if let Some(answer) = &answer {
            if answer.header.truncated_message {
                log::debug!(
                    "id={} client={} qname={} truncated response, retrying",
                    self.id,
                    ci,
                    query.qname()
                );
                return self.retry_resolver.resolve(query, ci, dialer).await;
            }
        }
        Ok(answer)
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use super::super::test_util::TestResolver;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_on_truncation() {
        let truncating = Arc::new(TestResolver::new().respond_with(|q, _| {
            let mut a = q.reply();
            a.header.truncated_message = true;
            Some(a)
        }));
        let full = Arc::new(TestResolver::with_ip("192.0.2.1"));

        let node = TruncateRetry::new("tc", truncating.clone(), full.clone());
        let query = DnsPacket::query("example.com.", crate::dns::protocol::RecordType::A);

        let answer = node
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert!(!answer.header.truncated_message);
        assert_eq!(1, truncating.hit_count());
        assert_eq!(1, full.hit_count());
    }

    #[tokio::test]
    async fn test_no_retry_without_tc() {
        let upstream = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let retry = Arc::new(TestResolver::with_ip("192.0.2.2"));

        let node = TruncateRetry::new("tc", upstream, retry.clone());
        let query = DnsPacket::query("example.com.", crate::dns::protocol::RecordType::A);
        node.resolve(&query, &Default::default(), None).await.unwrap();
        assert_eq!(0, retry.hit_count());
    }
}
