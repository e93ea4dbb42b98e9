//! Races all children for the same query and returns the first usable
//! response; outstanding requests are abandoned and their responses
//! discarded on delivery.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;
use crate::resolver::{is_servfail, ClientInfo, DynResolver, ResolveError, Resolver, Result};

pub struct Fastest {
    id: String,
    resolvers: Vec<DynResolver>,
}

impl Fastest {
    pub fn new(id: &str, resolvers: Vec<DynResolver>) -> Fastest {
        Fastest {
            id: id.to_string(),
            resolvers,
        }
    }
}

/// Send the query to every resolver concurrently; the first response that
/// is neither an error nor SERVFAIL wins. If none qualifies, the last
/// result is returned.
pub(crate) async fn race(
    id: &str,
    resolvers: &[DynResolver],
    query: &DnsPacket,
    ci: &ClientInfo,
    dialer: Option<&Socks5Dialer>,
) -> Result<Option<DnsPacket>> {
    if resolvers.is_empty() {
        return Err(ResolveError::Config("no resolvers configured".to_string()));
    }

    let (tx, mut rx) = mpsc::channel(resolvers.len());
    for resolver in resolvers {
        let tx = tx.clone();
        let resolver = resolver.clone();
        let query = query.clone();
        let ci = ci.clone();
        let dialer = dialer.cloned();
        tokio::spawn(async move {
            let result = resolver.resolve(&query, &ci, dialer.as_ref()).await;
            // The receiver may be gone if another child already won
            let _ = tx.send((resolver.describe(), result)).await;
        });
    }
    drop(tx);

    let mut last = None;
    for _ in 0..resolvers.len() {
        let (name, result) = match rx.recv().await {
            Some(r) => r,
            None => break,
        };
        match result {
            Ok(response) if !is_servfail(&response) => {
                log::debug!("id={} resolver={} using response", id, name);
                return Ok(response);
            }
            other => {
                log::debug!("id={} resolver={} returned failure, waiting for next response", id, name);
                last = Some(other);
            }
        }
    }

    match last {
        Some(result) => result,
        None => Err(ResolveError::Config("no response received".to_string())),
    }
}

#[async_trait]
impl Resolver for Fastest {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        race(&self.id, &self.resolvers, query, ci, dialer).await
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
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_fastest_wins() {
        let slow = Arc::new(
            TestResolver::with_ip("192.0.2.1").with_delay(Duration::from_millis(300)),
        );
        let fast = Arc::new(TestResolver::with_ip("192.0.2.2"));

        let group = Fastest::new("fast", vec![slow as DynResolver, fast as DynResolver]);
        let query = DnsPacket::query("example.com.", RecordType::A);

        let start = Instant::now();
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.2".parse().unwrap()), answer.answers[0].ip());
        // The aggregate completed without waiting for the slow child
        assert!(start.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_servfail_not_selected() {
        let servfail = Arc::new(TestResolver::new().respond_with(|q, _| {
            Some(crate::resolver::servfail(q))
        }));
        let slow_good = Arc::new(
            TestResolver::with_ip("192.0.2.9").with_delay(Duration::from_millis(50)),
        );

        let group = Fastest::new(
            "fast",
            vec![servfail as DynResolver, slow_good as DynResolver],
        );
        let query = DnsPacket::query("example.com.", RecordType::A);
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.9".parse().unwrap()), answer.answers[0].ip());
    }

    #[tokio::test]
    async fn test_all_failures_returns_last() {
        let a = Arc::new(TestResolver::new());
        let b = Arc::new(TestResolver::new());
        a.set_fail(true);
        b.set_fail(true);

        let group = Fastest::new("fast", vec![a as DynResolver, b as DynResolver]);
        let query = DnsPacket::query("example.com.", RecordType::A);
        assert!(group.resolve(&query, &Default::default(), None).await.is_err());
    }
}
