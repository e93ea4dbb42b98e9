//! Filters responses by matching the names they carry (owner names and
//! CNAME/NS/MX/SRV/PTR targets) against a name database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{nxdomain, ClientInfo, DynResolver, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, RecordData, RecordType, ResultCode};
use crate::matcher::NameDb;

pub struct ResponseBlocklistName {
    id: String,
    resolver: DynResolver,
    opt: ResponseBlocklistNameOptions,
    db: Arc<RwLock<Arc<dyn NameDb>>>,
}

#[derive(Clone)]
pub struct ResponseBlocklistNameOptions {
    pub db: Arc<dyn NameDb>,
    pub blocklist_resolver: Option<DynResolver>,
    pub filter: bool,
    pub inverted: bool,
    pub refresh: Option<Duration>,
}

/// Names carried by a record, for matching purposes.
fn record_names(record: &DnsRecord) -> Vec<&str> {
    let mut names = vec![record.name.as_str()];
    match &record.data {
        RecordData::Cname(host)
        | RecordData::Ns(host)
        | RecordData::Ptr(host) => names.push(host),
        RecordData::Mx { exchange, .. } => names.push(exchange),
        RecordData::Srv { target, .. } => names.push(target),
        _ => {}
    }
    names
}

impl ResponseBlocklistName {
    pub fn new(
        id: &str,
        resolver: DynResolver,
        opt: ResponseBlocklistNameOptions,
    ) -> Arc<ResponseBlocklistName> {
        let node = Arc::new(ResponseBlocklistName {
            id: id.to_string(),
            resolver,
            db: Arc::new(RwLock::new(opt.db.clone())),
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
                    log::debug!("id={} reloading blocklist", id);
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

    fn name_matches(&self, db: &Arc<dyn NameDb>, record: &DnsRecord) -> bool {
        record_names(record).iter().any(|name| {
            db.matches(&DnsQuestion::new(name.to_string(), RecordType::A))
                .is_some()
        })
    }
}

#[async_trait]
impl Resolver for ResponseBlocklistName {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let mut answer = match self.resolver.resolve(query, ci, dialer).await? {
            Some(answer) => answer,
            None => return Ok(None),
        };
        if answer.header.rescode != ResultCode::NOERROR {
            return Ok(Some(answer));
        }

        let db = self.db.read().clone();

        if self.opt.filter {
            answer.answers = answer
                .answers
                .into_iter()
                .filter(|r| self.name_matches(&db, r) == self.opt.inverted)
                .collect();
            if answer.answers.is_empty() {
                if let Some(alt) = &self.opt.blocklist_resolver {
                    return alt.resolve(query, ci, dialer).await;
                }
                return Ok(Some(nxdomain(query)));
            }
            return Ok(Some(answer));
        }

        let blocked = answer
            .answers
            .iter()
            .chain(answer.authorities.iter())
            .any(|r| self.name_matches(&db, r) != self.opt.inverted);

        if blocked {
            log::debug!(
                "id={} client={} qname={} blocking response",
                self.id,
                ci,
                query.qname()
            );
            if let Some(alt) = &self.opt.blocklist_resolver {
                return alt.resolve(query, ci, dialer).await;
            }
            return Ok(Some(nxdomain(query)));
        }

        Ok(Some(answer))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use super::super::test_util::TestResolver;
    use crate::loader::StaticLoader;
    use crate::matcher::DomainDb;

    async fn name_db(rules: &[&str]) -> Arc<dyn NameDb> {
        Arc::new(
            DomainDb::load(
                "names",
                Arc::new(StaticLoader::new(
                    rules.iter().map(|r| r.to_string()).collect(),
                )),
                Default::default(),
            )
            .await
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_blocks_on_cname_target() {
        let upstream = Arc::new(TestResolver::new().respond_with(|q, _| {
            let mut a = q.reply();
            a.answers.push(DnsRecord::new(
                q.qname(),
                60,
                RecordData::Cname("tracker.evil.test".to_string()),
            ));
            Some(a)
        }));

        let node = ResponseBlocklistName::new(
            "rbn",
            upstream,
            ResponseBlocklistNameOptions {
                db: name_db(&["domain:evil.test"]).await,
                blocklist_resolver: None,
                filter: false,
                inverted: false,
                refresh: None,
            },
        );

        let query = DnsPacket::query("www.example.com.", RecordType::A);
        let answer = node
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NXDOMAIN, answer.header.rescode);
    }

    #[tokio::test]
    async fn test_clean_response_passes() {
        let upstream = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let node = ResponseBlocklistName::new(
            "rbn",
            upstream,
            ResponseBlocklistNameOptions {
                db: name_db(&["domain:evil.test"]).await,
                blocklist_resolver: None,
                filter: false,
                inverted: false,
                refresh: None,
            },
        );

        let query = DnsPacket::query("www.example.com.", RecordType::A);
        let answer = node
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);
        assert_eq!(1, answer.answers.len());
    }
}
