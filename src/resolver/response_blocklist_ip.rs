//! Filters responses by matching the addresses they carry against an IP
//! database. A match either blocks the whole response with NXDOMAIN,
//! redirects to an alternative resolver, or (in filter mode) drops just
//! the offending records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{nxdomain, ClientInfo, DynResolver, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, DnsRecord, ResultCode};
use crate::matcher::IpDb;

pub struct ResponseBlocklistIp {
    id: String,
    resolver: DynResolver,
    opt: ResponseBlocklistIpOptions,
    db: Arc<RwLock<Arc<dyn IpDb>>>,
}

#[derive(Clone)]
pub struct ResponseBlocklistIpOptions {
    pub db: Arc<dyn IpDb>,

    /// Send matching responses here instead of blocking them. Cannot be
    /// combined with `filter`.
    pub blocklist_resolver: Option<DynResolver>,

    /// Remove matching records from the response instead of blocking it
    /// wholesale.
    pub filter: bool,

    /// Only allow responses with at least one matching record.
    pub inverted: bool,

    /// Rebuild the database from its loader on this cadence.
    pub refresh: Option<Duration>,
}

impl ResponseBlocklistIp {
    pub fn new(
        id: &str,
        resolver: DynResolver,
        opt: ResponseBlocklistIpOptions,
    ) -> Arc<ResponseBlocklistIp> {
        let node = Arc::new(ResponseBlocklistIp {
            id: id.to_string(),
            resolver,
            db: Arc::new(RwLock::new(opt.db.clone())),
            opt,
        });

        if let Some(refresh) = node.opt.refresh {
            tokio::spawn(refresh_loop(node.id.clone(), node.db.clone(), refresh));
        }
        node
    }

    fn block_if_match(
        &self,
        query: &DnsPacket,
        answer: DnsPacket,
        ci: &ClientInfo,
    ) -> std::result::Result<Option<DnsPacket>, DnsPacket> {
        let db = self.db.read().clone();
        let mut blocked = false;
        for record in answer
            .answers
            .iter()
            .chain(answer.authorities.iter())
            .chain(answer.resources.iter())
        {
            let ip = match record.ip() {
                Some(ip) => ip,
                None => continue,
            };
            let matched = db.matches(ip);
            if matched.is_some() != self.opt.inverted {
                if let Some(m) = matched {
                    log::debug!(
                        "id={} client={} qname={} list={} rule={} ip={} blocking response",
                        self.id,
                        ci,
                        query.qname(),
                        m.list,
                        m.rule,
                        ip
                    );
                } else {
                    log::debug!(
                        "id={} client={} qname={} ip={} not on inverted blocklist, blocking",
                        self.id,
                        ci,
                        query.qname(),
                        ip
                    );
                }
                blocked = true;
                break;
            }
        }
        if blocked {
            Err(answer)
        } else {
            Ok(Some(answer))
        }
    }

    fn filter_records(&self, records: Vec<DnsRecord>) -> Vec<DnsRecord> {
        let db = self.db.read().clone();
        records
            .into_iter()
            .filter(|record| match record.ip() {
                Some(ip) => (db.matches(ip).is_some()) == self.opt.inverted,
                None => true,
            })
            .collect()
    }
}

async fn refresh_loop(id: String, db: Arc<RwLock<Arc<dyn IpDb>>>, refresh: Duration) {
    let mut interval = tokio::time::interval(refresh);
    interval.tick().await;
    loop {
        interval.tick().await;
        log::debug!("id={} reloading blocklist", id);
        let current = db.read().clone();
        match current.reload().await {
            Ok(new_db) => *db.write() = new_db,
            Err(err) => log::error!("id={} failed to load rules: {}", id, err),
        }
    }
}

#[async_trait]
impl Resolver for ResponseBlocklistIp {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let answer = match self.resolver.resolve(query, ci, dialer).await? {
            Some(answer) => answer,
            None => return Ok(None),
        };
        if answer.header.rescode != ResultCode::NOERROR {
            return Ok(Some(answer));
        }

        if self.opt.filter {
            let mut answer = answer;
            answer.answers = self.filter_records(answer.answers);
            if answer.answers.is_empty() {
                if let Some(alt) = &self.opt.blocklist_resolver {
                    log::debug!(
                        "id={} client={} qname={} no answers after filtering, forwarding to blocklist-resolver",
                        self.id,
                        ci,
                        query.qname()
                    );
                    return alt.resolve(query, ci, dialer).await;
                }
                return Ok(Some(nxdomain(query)));
            }
            answer.authorities = self.filter_records(answer.authorities);
            answer.resources = self.filter_records(answer.resources);
            return Ok(Some(answer));
        }

        match self.block_if_match(query, answer, ci) {
            Ok(answer) => Ok(answer),
            Err(_blocked) => {
                if let Some(alt) = &self.opt.blocklist_resolver {
                    return alt.resolve(query, ci, dialer).await;
                }
                Ok(Some(nxdomain(query)))
            }
        }
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}
