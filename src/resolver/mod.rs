//! The resolver contract and the pipeline node library
//!
//! Every node in the query pipeline - upstream clients, combinators,
//! modifiers, blocklists, routers - implements [`Resolver`]: map a query
//! plus client metadata to a response. Nodes composing children must not
//! mutate the query their parent sees; they work on a private copy. A `None`
//! response tells the listener to drop the query and close the connection.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use derive_more::{Display, Error, From};

use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, DnsRecord, DnsQuestion, RecordData, RecordType, ResultCode};
use crate::loader::LoaderError;
use crate::matcher::MatcherError;

pub mod blocklist;
pub mod blocklist_panel;
pub mod cache;
pub mod client_blocklist;
pub mod dedup;
pub mod drop;
pub mod ecs_modifier;
pub mod edns0_modifier;
pub mod rate_limiter;
pub mod replace;
pub mod response_blocklist_ip;
pub mod response_blocklist_name;
pub mod response_collapse;
pub mod response_minimize;
pub mod static_responder;
pub mod truncate_retry;
pub mod ttl_modifier;

pub use blocklist::{Blocklist, BlocklistOptions};
pub use blocklist_panel::{PanelBlocklist, PanelBlocklistOptions};
pub use cache::{Cache, CacheOptions};
pub use client_blocklist::{ClientBlocklist, ClientBlocklistOptions};
pub use dedup::RequestDedup;
pub use drop::DropResolver;
pub use ecs_modifier::{EcsModifier, EcsModifierMode};
pub use edns0_modifier::{Edns0Modifier, Edns0ModifierMode};
pub use rate_limiter::{RateLimiter, RateLimiterOptions};
pub use replace::{Replace, ReplaceRule};
pub use response_blocklist_ip::{ResponseBlocklistIp, ResponseBlocklistIpOptions};
pub use response_blocklist_name::{ResponseBlocklistName, ResponseBlocklistNameOptions};
pub use response_collapse::ResponseCollapse;
pub use response_minimize::ResponseMinimize;
pub use static_responder::{StaticResolver, StaticResolverOptions};
pub use truncate_retry::TruncateRetry;
pub use ttl_modifier::{TtlModifier, TtlSelect};

/// Cap on synthesised PTR answers from blocklist hits.
pub const MAX_PTR_RESPONSES: usize = 10;

#[derive(Debug, Display, From, Error)]
pub enum ResolveError {
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    Loader(LoaderError),
    Matcher(MatcherError),
    Http(reqwest::Error),
    Tls(rustls::Error),
    QuicConnect(quinn::ConnectError),
    QuicConnection(quinn::ConnectionError),
    QuicWrite(quinn::WriteError),
    QuicRead(quinn::ReadExactError),
    Timeout(tokio::time::error::Elapsed),
    NoQuestion,
    Config(#[error(not(source))] String),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Per-request metadata attached at the listener boundary.
#[derive(Clone, Debug, Default)]
pub struct ClientInfo {
    /// Resolved source of the query; CDN headers take precedence over the
    /// peer address on HTTP-carried transports.
    pub source_ip: Option<IpAddr>,
    /// Server name of the TLS handshake, if the transport terminated TLS.
    pub tls_server_name: String,
    /// Id of the listener that accepted the query.
    pub listener: String,
    /// Request path for queries that arrived over DoH.
    pub doh_path: String,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source_ip {
            Some(ip) => write!(f, "{}", ip),
            None => write!(f, "unknown"),
        }
    }
}

/// A node in the query pipeline.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a query. `Ok(None)` instructs the listener to drop the query
    /// and close the connection. The optional dialer is passed through the
    /// pipeline so panel-controlled nodes can direct upstream traffic
    /// through a proxy.
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>>;

    /// Identifier of this node for logs, usually the configured id.
    fn describe(&self) -> String;

    /// Hook invoked by the cert-monitor task for nodes carrying certificate
    /// material.
    async fn cert_renew(&self) -> Result<()> {
        Ok(())
    }
}

pub type DynResolver = Arc<dyn Resolver>;

/// Reply with SERVFAIL, used by listeners when the pipeline returns an
/// error.
pub fn servfail(query: &DnsPacket) -> DnsPacket {
    reply_with_rcode(query, ResultCode::SERVFAIL)
}

/// Reply with NXDOMAIN.
pub fn nxdomain(query: &DnsPacket) -> DnsPacket {
    reply_with_rcode(query, ResultCode::NXDOMAIN)
}

/// Reply with REFUSED, used for policy denials.
pub fn refused(query: &DnsPacket) -> DnsPacket {
    reply_with_rcode(query, ResultCode::REFUSED)
}

pub fn reply_with_rcode(query: &DnsPacket, rcode: ResultCode) -> DnsPacket {
    let mut answer = query.reply();
    answer.header.rescode = rcode;
    answer
}

/// Synthesise a PTR response from blocklist-supplied names.
pub fn ptr_reply(query: &DnsPacket, names: &[String]) -> DnsPacket {
    let mut answer = query.reply();
    if let Some(question) = query.first_question() {
        for name in names.iter().take(MAX_PTR_RESPONSES) {
            answer.answers.push(DnsRecord {
                name: question.name.clone(),
                class: question.qclass,
                ttl: 3600,
                data: RecordData::Ptr(name.clone()),
            });
        }
    }
    answer
}

/// A/AAAA records for the spoof addresses matching the question type.
/// Addresses of the wrong family are skipped.
pub fn spoof_records(question: &DnsQuestion, ips: &[IpAddr]) -> Vec<DnsRecord> {
    ips.iter()
        .filter(|ip| match question.qtype {
            RecordType::A => ip.is_ipv4(),
            RecordType::Aaaa => ip.is_ipv6(),
            _ => false,
        })
        .map(|ip| DnsRecord::from_ip(&question.name, question.qclass, 3600, *ip))
        .collect()
}

/// True when the response carries a DNS-level failure the fail-over groups
/// treat as an error.
pub fn is_servfail(response: &Option<DnsPacket>) -> bool {
    response
        .as_ref()
        .map(|a| a.header.rescode == ResultCode::SERVFAIL)
        .unwrap_or(false)
}

#[cfg(test)]
pub mod test_util {
    //! A configurable resolver used across the node tests. It counts
    //! queries, can be set to fail, and the response can be defined
    //! externally.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    type ResponseFn = dyn Fn(&DnsPacket, &ClientInfo) -> Option<DnsPacket> + Send + Sync;

    pub struct TestResolver {
        hits: AtomicUsize,
        should_fail: AtomicBool,
        delay: Option<Duration>,
        response: Option<Box<ResponseFn>>,
    }

    impl TestResolver {
        pub fn new() -> TestResolver {
            TestResolver {
                hits: AtomicUsize::new(0),
                should_fail: AtomicBool::new(false),
                delay: None,
                response: None,
            }
        }

        /// Respond to every query with a single fixed A record.
        pub fn with_ip(ip: &str) -> TestResolver {
            let ip: IpAddr = ip.parse().unwrap();
            TestResolver::new().respond_with(move |q, _| {
                let mut answer = q.reply();
                if let Some(question) = q.first_question() {
                    answer
                        .answers
                        .push(DnsRecord::from_ip(&question.name, question.qclass, 3600, ip));
                }
                Some(answer)
            })
        }

        pub fn respond_with<F>(mut self, f: F) -> TestResolver
        where
            F: Fn(&DnsPacket, &ClientInfo) -> Option<DnsPacket> + Send + Sync + 'static,
        {
            self.response = Some(Box::new(f));
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> TestResolver {
            self.delay = Some(delay);
            self
        }

        pub fn set_fail(&self, fail: bool) {
            self.should_fail.store(fail, Ordering::SeqCst);
        }

        pub fn hit_count(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl Default for TestResolver {
        fn default() -> Self {
            TestResolver::new()
        }
    }

    #[async_trait]
    impl Resolver for TestResolver {
        async fn resolve(
            &self,
            query: &DnsPacket,
            ci: &ClientInfo,
            _dialer: Option<&Socks5Dialer>,
        ) -> Result<Option<DnsPacket>> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.should_fail.load(Ordering::SeqCst) {
                return Err(ResolveError::Config("test failure".to_string()));
            }
            match &self.response {
                Some(f) => Ok(f(query, ci)),
                None => Ok(Some(query.reply())),
            }
        }

        fn describe(&self) -> String {
            "TestResolver".to_string()
        }
    }
}
