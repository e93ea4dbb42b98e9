//! Query blocklist with optional allowlist override. Matches are answered
//! with NXDOMAIN, a spoofed address supplied by the rules, a synthesised
//! PTR response, or are handed to an alternative resolver. Both databases
//! reload on their own timers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{nxdomain, ptr_reply, spoof_records, ClientInfo, DynResolver, ResolveError, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, RecordType};
use crate::matcher::NameDb;
use crate::metrics::BlocklistMetrics;

type SharedNameDb = Arc<RwLock<Arc<dyn NameDb>>>;

pub struct Blocklist {
    id: String,
    resolver: DynResolver,
    opt: BlocklistOptions,
    block_db: SharedNameDb,
    allow_db: Option<SharedNameDb>,
    metrics: BlocklistMetrics,
}

#[derive(Clone)]
pub struct BlocklistOptions {
    pub blocklist_db: Arc<dyn NameDb>,

    /// Rules overriding the blocklist, effectively negating it.
    pub allowlist_db: Option<Arc<dyn NameDb>>,

    /// Send anything matching the blocklist here rather than blocking it.
    pub blocklist_resolver: Option<DynResolver>,

    /// Send anything matching the allowlist here rather than to the default
    /// upstream.
    pub allowlist_resolver: Option<DynResolver>,

    pub blocklist_refresh: Option<Duration>,
    pub allowlist_refresh: Option<Duration>,
}

fn spawn_refresh(id: String, db: SharedNameDb, refresh: Duration) {
    tokio::spawn(async move {
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
    });
}

impl Blocklist {
    pub fn new(id: &str, resolver: DynResolver, opt: BlocklistOptions) -> Arc<Blocklist> {
        let block_db = Arc::new(RwLock::new(opt.blocklist_db.clone()));
        let allow_db = opt
            .allowlist_db
            .clone()
            .map(|db| Arc::new(RwLock::new(db)));

        if let Some(refresh) = opt.blocklist_refresh {
            spawn_refresh(id.to_string(), block_db.clone(), refresh);
        }
        if let (Some(refresh), Some(db)) = (opt.allowlist_refresh, allow_db.clone()) {
            spawn_refresh(id.to_string(), db, refresh);
        }

        Arc::new(Blocklist {
            id: id.to_string(),
            resolver,
            block_db,
            allow_db,
            metrics: BlocklistMetrics::new(id),
            opt,
        })
    }
}

#[async_trait]
impl Resolver for Blocklist {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let question = match query.first_question() {
            Some(q) => q.clone(),
            None => return Err(ResolveError::NoQuestion),
        };

        // The allowlist negates the blocklist
        if let Some(allow_db) = &self.allow_db {
            let matched = allow_db.read().matches(&question);
            if let Some(m) = matched {
                self.metrics.allowed.add(1);
                if let Some(descriptor) = &m.descriptor {
                    log::debug!(
                        "id={} client={} qname={} list={} rule={} matched allowlist",
                        self.id,
                        ci,
                        question.name,
                        descriptor.list,
                        descriptor.rule
                    );
                }
                if let Some(alt) = &self.opt.allowlist_resolver {
                    return alt.resolve(query, ci, dialer).await;
                }
                return self.resolver.resolve(query, ci, dialer).await;
            }
        }

        let matched = self.block_db.read().matches(&question);
        if let Some(m) = matched {
            self.metrics.blocked.add(1);
            if let Some(descriptor) = &m.descriptor {
                log::debug!(
                    "id={} client={} qname={} list={} rule={} matched blocklist",
                    self.id,
                    ci,
                    question.name,
                    descriptor.list,
                    descriptor.rule
                );
            }

            // PTR queries with names from the rules are answered directly
            if question.qtype == RecordType::Ptr && !m.names.is_empty() {
                return Ok(Some(ptr_reply(query, &m.names)));
            }

            if let Some(alt) = &self.opt.blocklist_resolver {
                return alt.resolve(query, ci, dialer).await;
            }

            let spoof = spoof_records(&question, &m.ips);
            if !spoof.is_empty() {
                let mut answer = query.reply();
                answer.answers = spoof;
                return Ok(Some(answer));
            }

            return Ok(Some(nxdomain(query)));
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
    use crate::dns::protocol::{RecordData, ResultCode};
    use crate::loader::StaticLoader;
    use crate::matcher::{DomainDb, HostsDb};

    async fn domain_db(rules: &[&str]) -> Arc<dyn NameDb> {
        Arc::new(
            DomainDb::load(
                "list",
                Arc::new(StaticLoader::new(
                    rules.iter().map(|r| r.to_string()).collect(),
                )),
                Default::default(),
            )
            .await
            .unwrap(),
        )
    }

    fn options(block: Arc<dyn NameDb>) -> BlocklistOptions {
        BlocklistOptions {
            blocklist_db: block,
            allowlist_db: None,
            blocklist_resolver: None,
            allowlist_resolver: None,
            blocklist_refresh: None,
            allowlist_refresh: None,
        }
    }

    #[tokio::test]
    async fn test_exact_block() {
        let upstream = Arc::new(TestResolver::with_ip("1.2.3.4"));
        let node = Blocklist::new(
            "bl",
            upstream,
            options(domain_db(&["full:evil.test"]).await),
        );

        let blocked = DnsPacket::query("evil.test.", RecordType::A);
        let answer = node
            .resolve(&blocked, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NXDOMAIN, answer.header.rescode);

        let good = DnsPacket::query("good.test.", RecordType::A);
        let answer = node
            .resolve(&good, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);
        assert_eq!(Some("1.2.3.4".parse().unwrap()), answer.answers[0].ip());
    }

    #[tokio::test]
    async fn test_allowlist_overrides_blocklist() {
        let upstream = Arc::new(TestResolver::with_ip("1.2.3.4"));
        let mut opt = options(domain_db(&["domain:ads.test"]).await);
        opt.allowlist_db = Some(domain_db(&["full:good.ads.test"]).await);
        let node = Blocklist::new("bl", upstream.clone(), opt);

        let query = DnsPacket::query("good.ads.test.", RecordType::A);
        let answer = node
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);
        assert_eq!(1, upstream.hit_count());
    }

    #[tokio::test]
    async fn test_spoof_from_hosts_rules() {
        let hosts = Arc::new(
            HostsDb::load(
                "hosts",
                Arc::new(StaticLoader::new(vec![
                    "192.0.2.99 spoofed.test".to_string()
                ])),
            )
            .await
            .unwrap(),
        );
        let upstream = Arc::new(TestResolver::with_ip("1.2.3.4"));
        let node = Blocklist::new("bl", upstream, options(hosts));

        let query = DnsPacket::query("spoofed.test.", RecordType::A);
        let answer = node
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.99".parse().unwrap()), answer.answers[0].ip());
        assert_eq!(3600, answer.answers[0].ttl);

        // AAAA finds no spoofable address of that family
        let query = DnsPacket::query("spoofed.test.", RecordType::Aaaa);
        let answer = node
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NXDOMAIN, answer.header.rescode);
    }

    #[tokio::test]
    async fn test_ptr_synthesis() {
        let hosts = Arc::new(
            HostsDb::load(
                "hosts",
                Arc::new(StaticLoader::new(vec![
                    "192.0.2.99 spoofed.test".to_string()
                ])),
            )
            .await
            .unwrap(),
        );
        let upstream = Arc::new(TestResolver::with_ip("1.2.3.4"));
        let node = Blocklist::new("bl", upstream, options(hosts));

        let query = DnsPacket::query("99.2.0.192.in-addr.arpa.", RecordType::Ptr);
        let answer = node
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(1, answer.answers.len());
        assert_eq!(
            RecordData::Ptr("spoofed.test".to_string()),
            answer.answers[0].data
        );
    }

    #[tokio::test]
    async fn test_blocklist_resolver_redirect() {
        let upstream = Arc::new(TestResolver::with_ip("1.2.3.4"));
        let walled = Arc::new(TestResolver::with_ip("192.0.2.53"));
        let mut opt = options(domain_db(&["full:evil.test"]).await);
        opt.blocklist_resolver = Some(walled.clone());
        let node = Blocklist::new("bl", upstream, opt);

        let query = DnsPacket::query("evil.test.", RecordType::A);
        let answer = node
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Some("192.0.2.53".parse().unwrap()), answer.answers[0].ip());
        assert_eq!(1, walled.hit_count());
    }
}
