//! Rule matcher databases
//!
//! Two database families back the blocklist resolvers: name databases match
//! DNS questions, IP databases match addresses. Both are built from plain
//! rule lists produced by a loader and are swapped wholesale on reload; the
//! owning resolver holds them behind a reader/writer lock so a swap is
//! atomic for concurrent queries.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use derive_more::{Display, Error, From};

use crate::dns::protocol::DnsQuestion;
use crate::loader::LoaderError;

pub mod cidr;
pub mod domain;
pub mod geoip;
pub mod geosite;
pub mod hosts;
pub mod multi;
pub mod regexp;
mod trie;

pub use cidr::CidrDb;
pub use domain::{DomainDb, DomainDbOptions};
pub use geoip::GeoIpDb;
pub use hosts::HostsDb;
pub use multi::{MultiIpDb, MultiNameDb};
pub use regexp::RegexpDb;

#[derive(Debug, Display, From, Error)]
pub enum MatcherError {
    Io(std::io::Error),
    Regex(regex::Error),
    Loader(LoaderError),
    #[from(ignore)]
    InvalidRule(#[error(not(source))] String),
    #[from(ignore)]
    SiteNotFound(#[error(not(source))] String),
}

type Result<T> = std::result::Result<T, MatcherError>;

/// Identifies which list and which rule matched; used for logging only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlocklistMatch {
    pub list: String,
    pub rule: String,
}

impl fmt::Display for BlocklistMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.list, self.rule)
    }
}

/// A name database hit. `ips` carries spoof addresses when the rules supply
/// them (hosts format), `names` carries hostnames for PTR responses.
#[derive(Debug, Clone, Default)]
pub struct NameMatch {
    pub ips: Vec<IpAddr>,
    pub names: Vec<String>,
    pub descriptor: Option<BlocklistMatch>,
}

/// Database matching DNS questions against a rule set. Matching itself is
/// synchronous; only reloading (which may fetch rules remotely) suspends.
#[async_trait]
pub trait NameDb: Send + Sync {
    /// Match a question, returning spoof IPs / PTR names where the rule set
    /// provides them.
    fn matches(&self, question: &DnsQuestion) -> Option<NameMatch>;

    /// Build a fresh database from the same source. The caller swaps it in
    /// under its own lock.
    async fn reload(&self) -> Result<Arc<dyn NameDb>>;

    /// Short type tag for logs.
    fn describe(&self) -> String;
}

/// Database matching client or response IPs against a rule set.
#[async_trait]
pub trait IpDb: Send + Sync {
    fn matches(&self, ip: IpAddr) -> Option<BlocklistMatch>;

    /// Insert additional rules. Databases without incremental update
    /// support ignore this.
    fn add(&self, rules: &[String]) -> Result<()>;

    /// Remove rules previously added.
    fn remove(&self, rules: &[String]) -> Result<()>;

    async fn reload(&self) -> Result<Arc<dyn IpDb>>;

    fn describe(&self) -> String;
}
