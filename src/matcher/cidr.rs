//! IP database over a list of networks in CIDR notation, backed by one
//! binary trie per address family. Lookups report the shortest configured
//! prefix covering the address. Supports incremental add/remove so the
//! panel reconciliation can mutate the user allowlist in place.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::trie::CidrTrie;
use super::{BlocklistMatch, IpDb, MatcherError, Result};
use crate::loader::RuleLoader;

pub struct CidrDb {
    name: String,
    loader: Arc<dyn RuleLoader>,
    tries: RwLock<Tries>,
}

#[derive(Default)]
struct Tries {
    v4: CidrTrie,
    v6: CidrTrie,
}

/// A parsed rule: address bytes plus prefix length.
fn parse_rule(rule: &str) -> Result<(Vec<u8>, usize)> {
    let (addr, prefix) = match rule.split_once('/') {
        Some((addr, prefix)) => {
            let prefix: usize = prefix
                .parse()
                .map_err(|_| MatcherError::InvalidRule(rule.to_string()))?;
            (addr, Some(prefix))
        }
        None => (rule, None),
    };

    let ip: IpAddr = addr
        .trim()
        .parse()
        .map_err(|_| MatcherError::InvalidRule(rule.to_string()))?;

    let bytes = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    let max = bytes.len() * 8;
    let prefix = prefix.unwrap_or(max);
    if prefix > max {
        return Err(MatcherError::InvalidRule(rule.to_string()));
    }
    Ok((bytes, prefix))
}

/// String form of the network covering `ip` at the given prefix length.
fn rule_string(ip: IpAddr, prefix: usize) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            mask_bytes(&mut octets, prefix);
            format!("{}/{}", std::net::Ipv4Addr::from(octets), prefix)
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            mask_bytes(&mut octets, prefix);
            format!("{}/{}", std::net::Ipv6Addr::from(octets), prefix)
        }
    }
}

fn mask_bytes(bytes: &mut [u8], prefix: usize) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        let bit_start = i * 8;
        if bit_start + 8 <= prefix {
            continue;
        }
        if bit_start >= prefix {
            *byte = 0;
        } else {
            *byte &= 0xFF << (8 - (prefix - bit_start));
        }
    }
}

impl CidrDb {
    /// Build the database from the loader's current rules. Malformed rules
    /// fail the build rather than being ignored silently.
    pub async fn load(name: &str, loader: Arc<dyn RuleLoader>) -> Result<CidrDb> {
        let rules = loader.load().await?;
        let db = CidrDb {
            name: name.to_string(),
            loader,
            tries: RwLock::new(Tries::default()),
        };
        db.add_rules(&rules)?;
        Ok(db)
    }

    fn add_rules(&self, rules: &[String]) -> Result<()> {
        let mut tries = self.tries.write();
        for rule in rules {
            let (bytes, prefix) = parse_rule(rule)?;
            match bytes.len() {
                4 => tries.v4.add(&bytes, prefix),
                _ => tries.v6.add(&bytes, prefix),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IpDb for CidrDb {
    fn matches(&self, ip: IpAddr) -> Option<BlocklistMatch> {
        let tries = self.tries.read();
        let prefix = match ip {
            IpAddr::V4(v4) => tries.v4.lookup(&v4.octets()),
            IpAddr::V6(v6) => tries.v6.lookup(&v6.octets()),
        }?;

        Some(BlocklistMatch {
            list: self.name.clone(),
            rule: rule_string(ip, prefix),
        })
    }

    fn add(&self, rules: &[String]) -> Result<()> {
        self.add_rules(rules)
    }

    fn remove(&self, rules: &[String]) -> Result<()> {
        let mut tries = self.tries.write();
        for rule in rules {
            let (bytes, prefix) = parse_rule(rule)?;
            match bytes.len() {
                4 => tries.v4.remove(&bytes, prefix),
                _ => tries.v6.remove(&bytes, prefix),
            }
        }
        Ok(())
    }

    async fn reload(&self) -> Result<Arc<dyn IpDb>> {
        Ok(Arc::new(
            CidrDb::load(&self.name, self.loader.clone()).await?,
        ))
    }

    fn describe(&self) -> String {
        "Cidr".to_string()
    }
}
