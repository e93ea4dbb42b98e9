//! Remote panel integration
//!
//! A panel is a control plane serving two documents: node-info (routing
//! rules, spoof addresses, SOCKS5 proxy settings) and a user list whose
//! identity keys feed the IP allowlist. The loader turns the current remote
//! state into a [`PanelDb`]; the panel blocklist resolver reconciles it on
//! a refresh cadence, rebuilding only the parts whose source changed.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_derive::Deserialize;

use crate::client::Socks5Dialer;
use crate::loader::StaticLoader;
use crate::matcher::{CidrDb, DomainDb, DomainDbOptions, HostsDb, IpDb, NameDb};
use crate::resolver::{ResolveError, Result};

pub mod api;

pub use api::{PanelApi, PanelApiOptions, PanelError};

/// Node-info payload served by the panel.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeInfo {
    pub route_dns: RouteDnsRules,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouteDnsRules {
    pub allow: RuleSet,
    pub block: RuleSet,
    pub spoof4: String,
    pub spoof6: String,
    pub socks5: Socks5Rules,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleSet {
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Socks5Rules {
    pub socks5_address: String,
    pub username: String,
    pub password: String,
    pub resolve_local: bool,
}

/// One panel user; the identity key doubles as the IP allowlist entry.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct UserInfo {
    pub id: u64,
    pub passwd: String,
}

/// The matcher state assembled from the remote panel.
#[derive(Clone)]
pub struct PanelDb {
    pub allowlist_db: Arc<dyn NameDb>,
    pub blocklist_db: Arc<dyn NameDb>,
    pub ip_allowlist_db: Arc<dyn IpDb>,
    pub spoof: Vec<IpAddr>,
    pub socks5_dialer: Option<Socks5Dialer>,
}

#[derive(Clone, Default)]
pub struct PanelLoaderOptions {
    /// Name database format for both rule sets: "domain" or "hosts".
    pub blocklist_format: String,
    pub allowlist_format: String,
    /// Directory holding site database files for geosite rules.
    pub asset_dir: String,
}

/// Tracks the last successfully applied remote state so the refresh loop
/// can diff against it.
#[derive(Default)]
pub struct PanelState {
    pub node_info: NodeInfo,
    pub user_list: Vec<UserInfo>,
}

pub struct PanelLoader {
    pub api: Arc<PanelApi>,
    opt: PanelLoaderOptions,
    pub state: Mutex<PanelState>,
}

pub(crate) fn build_dialer(rules: &Socks5Rules) -> Option<Socks5Dialer> {
    if rules.socks5_address.is_empty() {
        return None;
    }
    Some(Socks5Dialer {
        address: rules.socks5_address.clone(),
        username: rules.username.clone(),
        password: rules.password.clone(),
        resolve_local: rules.resolve_local,
    })
}

fn parse_spoof(rules: &RouteDnsRules) -> Result<Vec<IpAddr>> {
    let mut spoof = Vec::new();
    for (field, value) in [("spoof4", &rules.spoof4), ("spoof6", &rules.spoof6)] {
        if value.is_empty() {
            continue;
        }
        let ip: IpAddr = value
            .parse()
            .map_err(|_| ResolveError::Config(format!("{} format error", field)))?;
        spoof.push(ip);
    }
    Ok(spoof)
}

impl PanelLoader {
    pub fn new(api: Arc<PanelApi>, opt: PanelLoaderOptions) -> PanelLoader {
        PanelLoader {
            api,
            opt,
            state: Mutex::new(PanelState::default()),
        }
    }

    /// Build a name database from one of the panel rule sets. The database
    /// is keyed by its type tag, so one panel node carries at most one
    /// "allow" and one "block" database.
    pub async fn name_db(&self, tag: &str, node_info: &NodeInfo) -> Result<Arc<dyn NameDb>> {
        let (rules, format) = match tag {
            "allow" => (
                node_info.route_dns.allow.domains.clone(),
                &self.opt.allowlist_format,
            ),
            "block" => (
                node_info.route_dns.block.domains.clone(),
                &self.opt.blocklist_format,
            ),
            _ => return Err(ResolveError::Config(format!("unsupported type '{}'", tag))),
        };
        let loader = Arc::new(StaticLoader::new(rules));

        let db: Arc<dyn NameDb> = match format.as_str() {
            "domain" | "" => {
                let opt = DomainDbOptions {
                    asset_dir: if self.opt.asset_dir.is_empty() {
                        ".".into()
                    } else {
                        self.opt.asset_dir.clone().into()
                    },
                };
                Arc::new(DomainDb::load(tag, loader, opt).await?)
            }
            "hosts" => Arc::new(HostsDb::load(tag, loader).await?),
            format => {
                return Err(ResolveError::Config(format!(
                    "unsupported format '{}'",
                    format
                )))
            }
        };
        Ok(db)
    }

    /// Build the IP allowlist from the user identity keys.
    pub async fn user_db(&self, users: &[UserInfo]) -> Result<Arc<dyn IpDb>> {
        let rules: Vec<String> = users.iter().map(|u| u.passwd.clone()).collect();
        let loader = Arc::new(StaticLoader::new(rules));
        Ok(Arc::new(CidrDb::load("iplist", loader).await?))
    }

    /// Fetch the full remote state and assemble the matcher databases.
    /// Used once at build time; the refresh loop afterwards only rebuilds
    /// what changed.
    pub async fn get(&self) -> Result<PanelDb> {
        log::debug!("node={} loading panel state", self.api.node_id());
        let start = std::time::Instant::now();

        let node_info = self
            .api
            .get_node_info()
            .await
            .map_err(|e| ResolveError::Config(e.to_string()))?;
        let user_list = self
            .api
            .get_user_list()
            .await
            .map_err(|e| ResolveError::Config(e.to_string()))?;

        let allowlist_db = self.name_db("allow", &node_info).await?;
        let blocklist_db = self.name_db("block", &node_info).await?;
        let ip_allowlist_db = self.user_db(&user_list).await?;
        let spoof = parse_spoof(&node_info.route_dns)?;
        let socks5_dialer = build_dialer(&node_info.route_dns.socks5);

        {
            let mut state = self.state.lock();
            state.node_info = node_info;
            state.user_list = user_list;
        }

        log::debug!(
            "node={} load-time={:?} completed loading panel state",
            self.api.node_id(),
            start.elapsed()
        );

        Ok(PanelDb {
            allowlist_db,
            blocklist_db,
            ip_allowlist_db,
            spoof,
            socks5_dialer,
        })
    }
}

/// Compute which users disappeared and which are new, keyed by identity.
pub fn compare_user_lists(old: &[UserInfo], new: &[UserInfo]) -> (Vec<UserInfo>, Vec<UserInfo>) {
    let deleted: Vec<UserInfo> = old
        .iter()
        .filter(|o| !new.iter().any(|n| n.passwd == o.passwd))
        .cloned()
        .collect();
    let added: Vec<UserInfo> = new
        .iter()
        .filter(|n| !old.iter().any(|o| o.passwd == n.passwd))
        .cloned()
        .collect();
    (deleted, added)
}

#[cfg(test)]
mod tests {

    use super::*;

    fn user(id: u64, passwd: &str) -> UserInfo {
        UserInfo {
            id,
            passwd: passwd.to_string(),
        }
    }

    #[test]
    fn test_compare_user_lists() {
        let old = vec![user(1, "10.0.0.1"), user(2, "10.0.0.2")];
        let new = vec![user(2, "10.0.0.2"), user(3, "10.0.0.3")];

        let (deleted, added) = compare_user_lists(&old, &new);
        assert_eq!(vec![user(1, "10.0.0.1")], deleted);
        assert_eq!(vec![user(3, "10.0.0.3")], added);
    }

    #[test]
    fn test_spoof_validation() {
        let mut rules = RouteDnsRules::default();
        rules.spoof4 = "192.0.2.1".to_string();
        rules.spoof6 = "2001:db8::1".to_string();
        assert_eq!(2, parse_spoof(&rules).unwrap().len());

        rules.spoof4 = "not-an-ip".to_string();
        assert!(parse_spoof(&rules).is_err());
    }

    #[test]
    fn test_dialer_only_with_address() {
        let mut rules = Socks5Rules::default();
        assert!(build_dialer(&rules).is_none());

        rules.socks5_address = "127.0.0.1:1080".to_string();
        let dialer = build_dialer(&rules).unwrap();
        assert_eq!("127.0.0.1:1080", dialer.address);
    }
}
