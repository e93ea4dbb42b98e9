//! Fail-over group: all queries go to the active child; when it fails the
//! head advances to the next one and stays there until that one fails too.

use parking_lot::Mutex;

use async_trait::async_trait;

use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;
use crate::resolver::{is_servfail, ClientInfo, DynResolver, ResolveError, Resolver, Result};

pub struct FailRotate {
    id: String,
    opt: FailRotateOptions,
    resolvers: Vec<DynResolver>,
    active: Mutex<usize>,
}

#[derive(Clone, Default)]
pub struct FailRotateOptions {
    /// Treat SERVFAIL responses as failures too.
    pub servfail_error: bool,
}

impl FailRotate {
    pub fn new(id: &str, opt: FailRotateOptions, resolvers: Vec<DynResolver>) -> FailRotate {
        FailRotate {
            id: id.to_string(),
            opt,
            resolvers,
            active: Mutex::new(0),
        }
    }

    pub(crate) fn current(&self) -> usize {
        *self.active.lock()
    }

    /// Advance the head, but only if the failure came from the child that
    /// is still active; a concurrent query may have rotated already.
    pub(crate) fn error_from(&self, index: usize) {
        let mut active = self.active.lock();
        if *active == index {
            *active = (*active + 1) % self.resolvers.len();
            log::debug!(
                "id={} failing over to resolver={}",
                self.id,
                self.resolvers[*active].describe()
            );
        }
    }

    pub(crate) async fn resolve_rotating(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let mut last_err = None;
        for _ in 0..self.resolvers.len() {
            let index = self.current();
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
                    if self.opt.servfail_error && is_servfail(&response) {
                        self.error_from(index);
                        last_err = Some(Ok(response));
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    log::debug!(
                        "id={} resolver={} failed: {}",
                        self.id,
                        resolver.describe(),
                        err
                    );
                    self.error_from(index);
                    last_err = Some(Err(err));
                }
            }
        }

        match last_err {
            Some(result) => result,
            None => Err(ResolveError::Config("no resolvers configured".to_string())),
        }
    }
}

#[async_trait]
impl Resolver for FailRotate {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        self.resolve_rotating(query, ci, dialer).await
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
    async fn test_sticky_rotation() {
        let first = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let second = Arc::new(TestResolver::with_ip("192.0.2.2"));
        let group = FailRotate::new(
            "fr",
            Default::default(),
            vec![first.clone() as DynResolver, second.clone() as DynResolver],
        );
        let query = DnsPacket::query("example.com.", RecordType::A);

        // First child fails, the query lands on the second
        first.set_fail(true);
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.2".parse().unwrap()), answer.answers[0].ip());

        // First child recovers, the head stays with the second
        first.set_fail(false);
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.2".parse().unwrap()), answer.answers[0].ip());

        // Second fails, the head wraps back around to the first
        second.set_fail(true);
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.1".parse().unwrap()), answer.answers[0].ip());
    }

    #[tokio::test]
    async fn test_all_failing_returns_error() {
        let first = Arc::new(TestResolver::new());
        let second = Arc::new(TestResolver::new());
        first.set_fail(true);
        second.set_fail(true);

        let group = FailRotate::new(
            "fr",
            Default::default(),
            vec![first as DynResolver, second as DynResolver],
        );
        let query = DnsPacket::query("example.com.", RecordType::A);
        assert!(group.resolve(&query, &Default::default(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_servfail_as_error() {
        let first = Arc::new(TestResolver::new().respond_with(|q, _| {
            Some(crate::resolver::servfail(q))
        }));
        let second = Arc::new(TestResolver::with_ip("192.0.2.2"));

        let group = FailRotate::new(
            "fr",
            FailRotateOptions {
                servfail_error: true,
            },
            vec![first as DynResolver, second as DynResolver],
        );
        let query = DnsPacket::query("example.com.", RecordType::A);
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.2".parse().unwrap()), answer.answers[0].ip());
    }
}
