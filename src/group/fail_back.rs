//! Fail-over group like fail-rotate, but after a quiet period on a
//! non-primary child it snaps back to the configured primary.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;
use crate::resolver::{is_servfail, ClientInfo, DynResolver, ResolveError, Resolver, Result};

pub struct FailBack {
    id: String,
    servfail_error: bool,
    reset_after: Duration,
    resolvers: Vec<DynResolver>,
    state: Mutex<State>,
}

struct State {
    active: usize,
    last_switch: Instant,
}

impl FailBack {
    pub fn new(
        id: &str,
        servfail_error: bool,
        reset_after: Duration,
        resolvers: Vec<DynResolver>,
    ) -> FailBack {
        FailBack {
            id: id.to_string(),
            servfail_error,
            reset_after,
            resolvers,
            state: Mutex::new(State {
                active: 0,
                last_switch: Instant::now(),
            }),
        }
    }

    fn current(&self) -> usize {
        let mut state = self.state.lock();
        if state.active != 0 && state.last_switch.elapsed() >= self.reset_after {
            log::debug!("id={} falling back to the primary resolver", self.id);
            state.active = 0;
            state.last_switch = Instant::now();
        }
        state.active
    }

    fn error_from(&self, index: usize) {
        let mut state = self.state.lock();
        if state.active == index {
            state.active = (state.active + 1) % self.resolvers.len();
            state.last_switch = Instant::now();
            log::debug!(
                "id={} failing over to resolver={}",
                self.id,
                self.resolvers[state.active].describe()
            );
        }
    }
}

#[async_trait]
impl Resolver for FailBack {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let mut last_err = None;
        for _ in 0..self.resolvers.len() {
            let index = self.current();
            let resolver = &self.resolvers[index];

            match resolver.resolve(query, ci, dialer).await {
                Ok(response) => {
                    if self.servfail_error && is_servfail(&response) {
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
    async fn test_fail_back_to_primary() {
        let primary = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let secondary = Arc::new(TestResolver::with_ip("192.0.2.2"));
        let group = FailBack::new(
            "fb",
            false,
            Duration::from_millis(50),
            vec![primary.clone() as DynResolver, secondary as DynResolver],
        );
        let query = DnsPacket::query("example.com.", RecordType::A);

        primary.set_fail(true);
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.2".parse().unwrap()), answer.answers[0].ip());

        // Still on the secondary right away
        primary.set_fail(false);
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.2".parse().unwrap()), answer.answers[0].ip());

        // After the reset period the primary takes over again
        tokio::time::sleep(Duration::from_millis(80)).await;
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.1".parse().unwrap()), answer.answers[0].ip());
    }
}
