//! Hosts-file name database. Each rule associates one or more addresses
//! with a name; matches on A/AAAA queries return the addresses for
//! spoofing, matches on PTR queries return the names mapped to the
//! address. An unspecified address (0.0.0.0 or ::) associates the name
//! with no spoof target, blocking it outright.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{BlocklistMatch, NameDb, NameMatch, Result};
use crate::dns::protocol::{DnsQuestion, RecordType};
use crate::loader::RuleLoader;

pub struct HostsDb {
    name: String,
    loader: Arc<dyn RuleLoader>,
    by_name: HashMap<String, Vec<IpAddr>>,
    by_ip: HashMap<IpAddr, Vec<String>>,
}

impl HostsDb {
    pub async fn load(name: &str, loader: Arc<dyn RuleLoader>) -> Result<HostsDb> {
        let rules = loader.load().await?;
        let mut by_name: HashMap<String, Vec<IpAddr>> = HashMap::new();
        let mut by_ip: HashMap<IpAddr, Vec<String>> = HashMap::new();

        for rule in rules {
            let mut fields = rule.split_whitespace();
            let ip: IpAddr = match fields.next().and_then(|f| f.parse().ok()) {
                Some(ip) => ip,
                None => continue,
            };
            for host in fields {
                let host = host.trim_end_matches('.').to_lowercase();
                if host.is_empty() || host.starts_with('#') {
                    break;
                }
                let entry = by_name.entry(host.clone()).or_default();
                if !ip.is_unspecified() {
                    entry.push(ip);
                    by_ip.entry(ip).or_default().push(host);
                }
            }
        }

        Ok(HostsDb {
            name: name.to_string(),
            loader,
            by_name,
            by_ip,
        })
    }

    fn match_ptr(&self, qname: &str) -> Option<NameMatch> {
        let ip = parse_arpa(qname)?;
        let names = self.by_ip.get(&ip)?;
        Some(NameMatch {
            ips: Vec::new(),
            names: names.clone(),
            descriptor: Some(BlocklistMatch {
                list: self.name.clone(),
                rule: format!("{} {}", ip, names[0]),
            }),
        })
    }
}

#[async_trait]
impl NameDb for HostsDb {
    fn matches(&self, question: &DnsQuestion) -> Option<NameMatch> {
        let name = question.name.trim_end_matches('.').to_lowercase();
        if name.is_empty() {
            return None;
        }

        if question.qtype == RecordType::Ptr {
            return self.match_ptr(&name);
        }

        let ips = self.by_name.get(&name)?;
        Some(NameMatch {
            ips: ips.clone(),
            names: Vec::new(),
            descriptor: Some(BlocklistMatch {
                list: self.name.clone(),
                rule: name,
            }),
        })
    }

    async fn reload(&self) -> Result<Arc<dyn NameDb>> {
        Ok(Arc::new(
            HostsDb::load(&self.name, self.loader.clone()).await?,
        ))
    }

    fn describe(&self) -> String {
        "Hosts".to_string()
    }
}

/// Parse a reverse-lookup name (`in-addr.arpa` / `ip6.arpa`) back into the
/// address it refers to.
pub fn parse_arpa(name: &str) -> Option<IpAddr> {
    if let Some(v4) = name.strip_suffix(".in-addr.arpa") {
        let mut octets = [0u8; 4];
        let mut count = 0;
        for (i, part) in v4.rsplit('.').enumerate() {
            if i >= 4 {
                return None;
            }
            octets[i] = part.parse().ok()?;
            count += 1;
        }
        if count != 4 {
            return None;
        }
        return Some(IpAddr::from(octets));
    }

    if let Some(v6) = name.strip_suffix(".ip6.arpa") {
        let mut nibbles = [0u8; 32];
        let mut count = 0;
        for (i, part) in v6.rsplit('.').enumerate() {
            if i >= 32 || part.len() != 1 {
                return None;
            }
            nibbles[i] = u8::from_str_radix(part, 16).ok()?;
            count += 1;
        }
        if count != 32 {
            return None;
        }
        let mut octets = [0u8; 16];
        for i in 0..16 {
            octets[i] = (nibbles[2 * i] << 4) | nibbles[2 * i + 1];
        }
        return Some(IpAddr::from(octets));
    }

    None
}
