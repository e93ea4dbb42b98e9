//! Picks a child uniformly at random per query. A failing child leaves the
//! rotation and rejoins after the reset period.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;
use crate::resolver::{is_servfail, ClientInfo, DynResolver, ResolveError, Resolver, Result};

pub struct RandomGroup {
    id: String,
    servfail_error: bool,
    reset_after: Duration,
    resolvers: Vec<DynResolver>,
    deactivated: Mutex<Vec<Option<Instant>>>,
}

impl RandomGroup {
    pub fn new(
        id: &str,
        servfail_error: bool,
        reset_after: Duration,
        resolvers: Vec<DynResolver>,
    ) -> RandomGroup {
        let count = resolvers.len();
        RandomGroup {
            id: id.to_string(),
            servfail_error,
            reset_after,
            resolvers,
            deactivated: Mutex::new(vec![None; count]),
        }
    }

    /// A random child that is currently in rotation. Deactivated children
    /// whose reset period has passed rejoin first.
    fn pick(&self) -> Option<usize> {
        let mut deactivated = self.deactivated.lock();
        let now = Instant::now();
        for slot in deactivated.iter_mut() {
            if let Some(since) = slot {
                if now.duration_since(*since) >= self.reset_after {
                    *slot = None;
                }
            }
        }

        let active: Vec<usize> = deactivated
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_none())
            .map(|(i, _)| i)
            .collect();
        if active.is_empty() {
            return None;
        }
        Some(active[rand::thread_rng().gen_range(0..active.len())])
    }

    fn deactivate(&self, index: usize) {
        let mut deactivated = self.deactivated.lock();
        deactivated[index] = Some(Instant::now());
        log::debug!(
            "id={} deactivating resolver={}",
            self.id,
            self.resolvers[index].describe()
        );
    }
}

#[async_trait]
impl Resolver for RandomGroup {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let mut last_err = None;
        for _ in 0..self.resolvers.len() {
            let index = match self.pick() {
                Some(index) => index,
                None => break,
            };
            let resolver = &self.resolvers[index];
            log::debug!(
                "id={} client={} qname={} resolver={} forwarding",
                self.id,
                ci,
                query.qname(),
                resolver.describe()
            );

            match resolver.resolve(query, ci, dialer).await {
                Ok(response) => {
                    if self.servfail_error && is_servfail(&response) {
                        self.deactivate(index);
                        last_err = Some(Ok(response));
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    self.deactivate(index);
                    last_err = Some(Err(err));
                }
            }
        }

        match last_err {
            Some(result) => result,
            None => Err(ResolveError::Config(
                "no resolvers in rotation".to_string(),
            )),
        }
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
    async fn test_failed_child_leaves_rotation() {
        let bad = Arc::new(TestResolver::new());
        let good = Arc::new(TestResolver::with_ip("192.0.2.1"));
        bad.set_fail(true);

        let group = RandomGroup::new(
            "rnd",
            false,
            Duration::from_secs(600),
            vec![bad.clone() as DynResolver, good.clone() as DynResolver],
        );

        let query = DnsPacket::query("example.com.", RecordType::A);
        for _ in 0..10 {
            let answer = group
                .resolve(&query, &Default::default(), None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(Some("192.0.2.1".parse().unwrap()), answer.answers[0].ip());
        }
        // The failed child was tried at most once
        assert!(bad.hit_count() <= 1);
    }

    #[tokio::test]
    async fn test_rejoin_after_reset() {
        let bad = Arc::new(TestResolver::new());
        bad.set_fail(true);

        let group = RandomGroup::new(
            "rnd",
            false,
            Duration::from_millis(10),
            vec![bad.clone() as DynResolver],
        );

        let query = DnsPacket::query("example.com.", RecordType::A);
        assert!(group.resolve(&query, &Default::default(), None).await.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        bad.set_fail(false);
        assert!(group.resolve(&query, &Default::default(), None).await.is_ok());
    }
}
