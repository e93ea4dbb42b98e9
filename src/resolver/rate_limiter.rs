//! Token-bucket rate limiter keyed by client prefix. Over-limit queries go
//! to an alternative resolver when one is configured, otherwise they are
//! answered REFUSED.

use std::collections::HashMap;
use std::net::IpAddr;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::ecs_modifier::mask_ip;
use super::{refused, ClientInfo, DynResolver, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;

pub struct RateLimiter {
    id: String,
    resolver: DynResolver,
    opt: RateLimiterOptions,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

#[derive(Clone)]
pub struct RateLimiterOptions {
    /// Allowed queries per window.
    pub requests: u32,
    /// Window length in seconds.
    pub window: u64,
    /// Prefix length grouping IPv4 clients into buckets.
    pub prefix4: u8,
    /// Prefix length grouping IPv6 clients into buckets.
    pub prefix6: u8,
    /// Over-limit queries go here instead of being refused.
    pub limit_resolver: Option<DynResolver>,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        RateLimiterOptions {
            requests: 0,
            window: 60,
            prefix4: 24,
            prefix6: 56,
            limit_resolver: None,
        }
    }
}

struct Bucket {
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    pub fn new(id: &str, resolver: DynResolver, opt: RateLimiterOptions) -> RateLimiter {
        RateLimiter {
            id: id.to_string(),
            resolver,
            opt,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// True if this query pushes the client's bucket over the limit.
    fn over_limit(&self, client: IpAddr) -> bool {
        if self.opt.requests == 0 {
            return false;
        }
        let prefix = match client {
            IpAddr::V4(_) => self.opt.prefix4,
            IpAddr::V6(_) => self.opt.prefix6,
        };
        let key = mask_ip(client, prefix);
        let window = Duration::from_secs(self.opt.window);
        let now = Instant::now();

        let mut buckets = self.buckets.lock();

        // Drop stale buckets once in a while so the map stays bounded
        if buckets.len() > 10_000 {
            buckets.retain(|_, b| now.duration_since(b.window_start) < window);
        }

        let bucket = buckets.entry(key).or_insert(Bucket {
            count: 0,
            window_start: now,
        });
        if now.duration_since(bucket.window_start) >= window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        bucket.count += 1;
        bucket.count > self.opt.requests
    }
}

#[async_trait]
impl Resolver for RateLimiter {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let limited = match ci.source_ip {
            Some(ip) => self.over_limit(ip),
            None => false,
        };

        if limited {
            log::debug!(
                "id={} client={} qname={} rate limit exceeded",
                self.id,
                ci,
                query.qname()
            );
            if let Some(alt) = &self.opt.limit_resolver {
                return alt.resolve(query, ci, dialer).await;
            }
            return Ok(Some(refused(query)));
        }

        self.resolver.resolve(query, ci, dialer).await
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use super::super::test_util::TestResolver;
    use crate::dns::protocol::{RecordType, ResultCode};
    use std::sync::Arc;

    fn client(ip: &str) -> ClientInfo {
        ClientInfo {
            source_ip: Some(ip.parse().unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_limit_per_prefix() {
        let upstream = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let limiter = RateLimiter::new(
            "rl",
            upstream,
            RateLimiterOptions {
                requests: 2,
                window: 60,
                prefix4: 24,
                ..Default::default()
            },
        );

        let query = DnsPacket::query("example.com.", RecordType::A);

        // Two queries within the limit, from different IPs of one /24
        for ip in ["10.0.0.1", "10.0.0.2"] {
            let answer = limiter
                .resolve(&query, &client(ip), None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(ResultCode::NOERROR, answer.header.rescode);
        }

        // The third from the same prefix is refused
        let answer = limiter
            .resolve(&query, &client("10.0.0.3"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::REFUSED, answer.header.rescode);

        // A different prefix is unaffected
        let answer = limiter
            .resolve(&query, &client("10.0.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);
    }

    #[tokio::test]
    async fn test_limit_resolver() {
        let upstream = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let fallback = Arc::new(TestResolver::with_ip("192.0.2.99"));
        let limiter = RateLimiter::new(
            "rl",
            upstream,
            RateLimiterOptions {
                requests: 1,
                limit_resolver: Some(fallback.clone()),
                ..Default::default()
            },
        );

        let query = DnsPacket::query("example.com.", RecordType::A);
        limiter
            .resolve(&query, &client("10.0.0.1"), None)
            .await
            .unwrap();
        limiter
            .resolve(&query, &client("10.0.0.1"), None)
            .await
            .unwrap();
        assert_eq!(1, fallback.hit_count());
    }
}
