//! Allows or blocks queries based on the client source address alone.
//! Configured as a blocklist (matching clients are denied) or, inverted,
//! as an allowlist (only matching clients pass).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{refused, ClientInfo, DynResolver, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;
use crate::matcher::IpDb;
use crate::metrics::BlocklistMetrics;

pub struct ClientBlocklist {
    id: String,
    resolver: DynResolver,
    opt: ClientBlocklistOptions,
    db: Arc<RwLock<Arc<dyn IpDb>>>,
    metrics: BlocklistMetrics,
}

#[derive(Clone)]
pub struct ClientBlocklistOptions {
    pub db: Arc<dyn IpDb>,

    /// Allowlist semantics: deny clients that do NOT match the database.
    pub inverted: bool,

    /// Send denied clients here instead of answering REFUSED.
    pub blocklist_resolver: Option<DynResolver>,

    pub refresh: Option<Duration>,
}

impl ClientBlocklist {
    pub fn new(
        id: &str,
        resolver: DynResolver,
        opt: ClientBlocklistOptions,
    ) -> Arc<ClientBlocklist> {
        let node = Arc::new(ClientBlocklist {
            id: id.to_string(),
            resolver,
            db: Arc::new(RwLock::new(opt.db.clone())),
            metrics: BlocklistMetrics::new(id),
            opt,
        });

        if let Some(refresh) = node.opt.refresh {
            let id = node.id.clone();
            let db = node.db.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(refresh);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    log::debug!("id={} reloading client list", id);
                    let current = db.read().clone();
                    match current.reload().await {
                        Ok(new_db) => *db.write() = new_db,
                        Err(err) => log::error!("id={} failed to load rules: {}", id, err),
                    }
                }
            });
        }
        node
    }
}

#[async_trait]
impl Resolver for ClientBlocklist {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let matched = match ci.source_ip {
            Some(ip) => self.db.read().matches(ip),
            None => None,
        };

        if matched.is_some() != self.opt.inverted {
            self.metrics.blocked.add(1);
            if let Some(m) = &matched {
                log::debug!(
                    "id={} client={} qname={} list={} rule={} blocking client",
                    self.id,
                    ci,
                    query.qname(),
                    m.list,
                    m.rule
                );
            } else {
                log::debug!(
                    "id={} client={} qname={} client not on allowlist, blocking",
                    self.id,
                    ci,
                    query.qname()
                );
            }

            if let Some(alt) = &self.opt.blocklist_resolver {
                return alt.resolve(query, ci, dialer).await;
            }
            return Ok(Some(refused(query)));
        }

        self.metrics.allowed.add(1);
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
    use crate::loader::StaticLoader;
    use crate::matcher::CidrDb;

    async fn db(rules: &[&str]) -> Arc<dyn IpDb> {
        Arc::new(
            CidrDb::load(
                "clients",
                Arc::new(StaticLoader::new(
                    rules.iter().map(|r| r.to_string()).collect(),
                )),
            )
            .await
            .unwrap(),
        )
    }

    fn client(ip: &str) -> ClientInfo {
        ClientInfo {
            source_ip: Some(ip.parse().unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_blocklist_refuses_matching_client() {
        let upstream = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let node = ClientBlocklist::new(
            "cbl",
            upstream.clone(),
            ClientBlocklistOptions {
                db: db(&["10.0.0.0/8"]).await,
                inverted: false,
                blocklist_resolver: None,
                refresh: None,
            },
        );

        let query = DnsPacket::query("example.com.", RecordType::A);

        let answer = node
            .resolve(&query, &client("10.1.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::REFUSED, answer.header.rescode);
        assert_eq!(0, upstream.hit_count());

        let answer = node
            .resolve(&query, &client("192.168.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);
        assert_eq!(1, upstream.hit_count());
    }

    #[tokio::test]
    async fn test_allowlist_passes_only_matching_client() {
        let upstream = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let node = ClientBlocklist::new(
            "cal",
            upstream,
            ClientBlocklistOptions {
                db: db(&["10.0.0.0/8"]).await,
                inverted: true,
                blocklist_resolver: None,
                refresh: None,
            },
        );

        let query = DnsPacket::query("example.com.", RecordType::A);

        let answer = node
            .resolve(&query, &client("10.1.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);

        let answer = node
            .resolve(&query, &client("192.168.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::REFUSED, answer.header.rescode);
    }
}
