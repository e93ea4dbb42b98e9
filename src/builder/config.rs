//! Declarative configuration model. Four top-level tables (resolvers,
//! groups, routers, listeners) plus an optional bootstrap resolver, in
//! TOML. Multiple files merge by union; a key defined twice fails the
//! merge.

use std::collections::HashMap;

use serde_derive::Deserialize;

use super::BuildError;
use crate::tls::CertConfig;

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Config {
    pub bootstrap_resolver: Option<ResolverConfig>,
    pub resolvers: HashMap<String, ResolverConfig>,
    pub groups: HashMap<String, GroupConfig>,
    pub routers: HashMap<String, RouterConfig>,
    pub listeners: HashMap<String, ListenerConfig>,
}

/// An upstream client definition.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ResolverConfig {
    pub address: String,
    /// udp, tcp, dot, doh, doq or dtls
    pub protocol: String,
    pub bootstrap_address: String,
    /// Overrides the TLS server name derived from the address.
    pub server_name: String,
    /// DoH method, GET or POST.
    pub doh_method: String,
    pub ca: String,
    pub client_crt: String,
    pub client_key: String,
    /// Per-query timeout in seconds; 0 uses the default.
    pub query_timeout: u64,
    pub cert: CertConfig,
}

/// A pipeline node composed of child resolvers.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct GroupConfig {
    #[serde(rename = "type")]
    pub group_type: String,
    pub resolvers: Vec<String>,

    // Cross-references to other nodes
    pub allowlist_resolver: String,
    pub blocklist_resolver: String,
    pub ip_allowlist_resolver: String,
    pub limit_resolver: String,
    pub retry_resolver: String,

    // Blocklist family
    pub blocklist: Vec<String>,
    pub blocklist_source: Vec<String>,
    pub blocklist_format: String,
    pub blocklist_refresh: u64,
    pub allowlist: Vec<String>,
    pub allowlist_source: Vec<String>,
    pub allowlist_format: String,
    pub allowlist_refresh: u64,
    /// Cache directory for HTTP rule sources.
    pub cache_dir: String,
    /// Directory holding geosite/geoip database files.
    pub asset_dir: String,
    /// GeoIP database file for "location" format lists.
    pub geodb: String,
    pub filter: bool,
    pub inverted: bool,

    // Cache
    pub cache_size: usize,
    pub cache_gc_period: u64,
    pub cache_negative_ttl: u32,
    pub cache_max_ttl: u32,
    pub cache_answer_shuffle: String,
    pub cache_harden_below_nxdomain: bool,
    pub cache_prefetch_trigger: u32,
    pub cache_prefetch_eligible: u32,
    pub cache_snapshot_file: String,
    pub cache_save_interval: u64,

    // TTL modifier
    pub ttl_select: String,
    pub ttl_min: u32,
    pub ttl_max: u32,

    // ECS modifier
    pub ecs_op: String,
    pub ecs_address: String,
    pub ecs_prefix4: u8,
    pub ecs_prefix6: u8,

    // EDNS0 modifier
    pub edns0_op: String,
    pub edns0_code: u16,
    /// Option payload as a hex string.
    pub edns0_data: String,

    // Replace
    pub replace: Vec<ReplaceConfig>,

    // Static responder
    pub answer: Vec<String>,
    pub ns: Vec<String>,
    pub extra: Vec<String>,
    pub rcode: u8,
    pub truncate: bool,
    pub edns0_ede: Option<EdeConfig>,

    // Rate limiter
    pub requests: u32,
    pub window: u64,
    pub prefix4: u8,
    pub prefix6: u8,

    // Fail-over and random groups
    pub servfail_error: bool,
    pub reset_after: u64,

    // Fastest-TCP
    pub port: u16,
    pub wait_all: bool,
    pub success_ttl_min: u32,

    // Panel
    pub panel_url: String,
    pub panel_key: String,
    pub panel_node_id: u64,
    pub refresh: u64,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ReplaceConfig {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct EdeConfig {
    pub code: u16,
    pub text: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct RouterConfig {
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct RouteConfig {
    pub types: Vec<String>,
    pub class: Option<u16>,
    /// Regular expression over the query name.
    pub name: String,
    pub source: Vec<String>,
    pub weekdays: Vec<String>,
    /// Time of day bounds, "HH:MM".
    pub before: String,
    pub after: String,
    pub doh_path: String,
    pub listener: String,
    pub tls_server_name: String,
    pub invert: bool,
    pub resolver: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ListenerConfig {
    pub address: String,
    /// udp, tcp, dot, doh, doq, dtls or admin
    pub protocol: String,
    pub resolver: String,
    pub allowed_net: Vec<String>,
    pub no_tls: bool,
    pub mutual_tls: bool,
    pub server_crt: String,
    pub server_key: String,
    pub ca: String,
    pub frontend: FrontendConfig,
    pub cert: CertConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct FrontendConfig {
    /// Trusted proxy network for CDN-forwarded headers.
    pub http_proxy_net: String,
}

impl Config {
    pub fn from_str(content: &str) -> Result<Config, BuildError> {
        Ok(toml::from_str(content)?)
    }

    /// Load and merge one or more configuration files.
    pub fn load(paths: &[String]) -> Result<Config, BuildError> {
        let mut merged = Config::default();
        for path in paths {
            let content = std::fs::read_to_string(path)?;
            let config = Config::from_str(&content)?;
            merged.merge(config)?;
        }
        Ok(merged)
    }

    /// Union merge; duplicate keys across files fail.
    pub fn merge(&mut self, other: Config) -> Result<(), BuildError> {
        if let Some(bootstrap) = other.bootstrap_resolver {
            if self.bootstrap_resolver.is_some() {
                return Err(BuildError::DuplicateId("bootstrap-resolver".to_string()));
            }
            self.bootstrap_resolver = Some(bootstrap);
        }
        for (id, v) in other.resolvers {
            if self.resolvers.insert(id.clone(), v).is_some() {
                return Err(BuildError::DuplicateId(id));
            }
        }
        for (id, v) in other.groups {
            if self.groups.insert(id.clone(), v).is_some() {
                return Err(BuildError::DuplicateId(id));
            }
        }
        for (id, v) in other.routers {
            if self.routers.insert(id.clone(), v).is_some() {
                return Err(BuildError::DuplicateId(id));
            }
        }
        for (id, v) in other.listeners {
            if self.listeners.insert(id.clone(), v).is_some() {
                return Err(BuildError::DuplicateId(id));
            }
        }
        Ok(())
    }
}

/// Parse a list of CIDR strings into (address, prefix) pairs.
pub fn parse_cidr_list(list: &[String]) -> Result<Vec<(std::net::IpAddr, u8)>, BuildError> {
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let (addr, prefix) = match entry.split_once('/') {
            Some((addr, prefix)) => {
                let prefix = prefix.parse().map_err(|_| {
                    BuildError::InvalidValue(format!("invalid network '{}'", entry))
                })?;
                (addr, prefix)
            }
            None => (entry.as_str(), 0),
        };
        let ip: std::net::IpAddr = addr
            .parse()
            .map_err(|_| BuildError::InvalidValue(format!("invalid network '{}'", entry)))?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        let prefix = if prefix == 0 && !entry.contains('/') {
            max
        } else {
            prefix
        };
        if prefix > max {
            return Err(BuildError::InvalidValue(format!(
                "invalid network '{}'",
                entry
            )));
        }
        out.push((ip, prefix));
    }
    Ok(out)
}
