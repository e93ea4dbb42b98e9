//! Coalesces concurrent identical queries: the first caller performs the
//! upstream request, everyone else waits for a copy of its result.

use std::collections::HashMap;
use parking_lot::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{ClientInfo, DynResolver, ResolveError, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;

type Key = (String, u16, u16);

#[derive(Clone)]
enum SharedResult {
    Response(Option<DnsPacket>),
    Failed(String),
}

pub struct RequestDedup {
    id: String,
    resolver: DynResolver,
    pending: Mutex<HashMap<Key, Vec<oneshot::Sender<SharedResult>>>>,
}

impl RequestDedup {
    pub fn new(id: &str, resolver: DynResolver) -> RequestDedup {
        RequestDedup {
            id: id.to_string(),
            resolver,
            pending: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Resolver for RequestDedup {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let question = match query.first_question() {
            Some(q) => q,
            None => return self.resolver.resolve(query, ci, dialer).await,
        };
        let key: Key = (
            question.name.trim_end_matches('.').to_lowercase(),
            question.qtype.to_num(),
            question.qclass,
        );

        // Attach to an in-flight request for the same question if there is
        // one, otherwise claim it
        let waiter = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    pending.insert(key.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            log::debug!(
                "id={} client={} qname={} waiting for in-flight query",
                self.id,
                ci,
                query.qname()
            );
            return match rx.await {
                Ok(SharedResult::Response(response)) => Ok(response.map(|mut r| {
                    r.header.id = query.header.id;
                    r
                })),
                Ok(SharedResult::Failed(msg)) => Err(ResolveError::Config(msg)),
                Err(_) => Err(ResolveError::Config(
                    "deduplicated query was abandoned".to_string(),
                )),
            };
        }

        let result = self.resolver.resolve(query, ci, dialer).await;

        // Deliver the outcome to everyone who attached in the meantime
        let waiters = self.pending.lock().remove(&key).unwrap_or_default();
        let shared = match &result {
            Ok(response) => SharedResult::Response(response.clone()),
            Err(err) => SharedResult::Failed(err.to_string()),
        };
        for tx in waiters {
            let _ = tx.send(shared.clone());
        }

        result
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use super::super::test_util::TestResolver;
    use crate::dns::protocol::RecordType;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_queries_coalesce() {
        let upstream =
            Arc::new(TestResolver::with_ip("192.0.2.1").with_delay(Duration::from_millis(100)));
        let dedup = Arc::new(RequestDedup::new("dedup", upstream.clone()));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let dedup = dedup.clone();
            tasks.push(tokio::spawn(async move {
                let query = DnsPacket::query("example.com.", RecordType::A);
                dedup.resolve(&query, &Default::default(), None).await
            }));
        }

        for task in tasks {
            let response = task.await.unwrap().unwrap().unwrap();
            assert_eq!(1, response.answers.len());
        }
        assert_eq!(1, upstream.hit_count());
    }

    #[tokio::test]
    async fn test_waiters_keep_their_query_id() {
        let upstream =
            Arc::new(TestResolver::with_ip("192.0.2.1").with_delay(Duration::from_millis(100)));
        let dedup = Arc::new(RequestDedup::new("dedup", upstream));

        let d1 = dedup.clone();
        let first = tokio::spawn(async move {
            let mut query = DnsPacket::query("example.com.", RecordType::A);
            query.header.id = 1111;
            d1.resolve(&query, &Default::default(), None).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut query = DnsPacket::query("example.com.", RecordType::A);
        query.header.id = 2222;
        let second = dedup
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(2222, second.header.id);

        let first = first.await.unwrap().unwrap().unwrap();
        assert_eq!(1111, first.header.id);
    }

    #[tokio::test]
    async fn test_distinct_questions_not_coalesced() {
        let upstream = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let dedup = RequestDedup::new("dedup", upstream.clone());

        let q1 = DnsPacket::query("one.test.", RecordType::A);
        let q2 = DnsPacket::query("two.test.", RecordType::A);
        dedup.resolve(&q1, &Default::default(), None).await.unwrap();
        dedup.resolve(&q2, &Default::default(), None).await.unwrap();
        assert_eq!(2, upstream.hit_count());
    }
}
