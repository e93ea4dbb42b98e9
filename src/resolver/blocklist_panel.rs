//! Panel-driven blocklist resolver
//!
//! Composes three matcher databases (allow names, block names, allowed
//! client IPs) plus spoof addresses and a SOCKS5 dialer, all reconciled
//! from a remote panel on a refresh cadence. Only the sub-structures whose
//! remote source changed are rebuilt; user-list changes are applied as
//! incremental add/remove on the IP allowlist.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    nxdomain, ptr_reply, refused, spoof_records, ClientInfo, DynResolver, ResolveError, Resolver,
    Result,
};
use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, RecordType};
use crate::metrics::BlocklistMetrics;
use crate::panel::{build_dialer, compare_user_lists, PanelDb, PanelError, PanelLoader};

pub struct PanelBlocklist {
    id: String,
    resolver: DynResolver,
    opt: PanelBlocklistOptions,
    loader: Arc<PanelLoader>,
    db: Arc<RwLock<PanelDb>>,
    metrics: BlocklistMetrics,
}

#[derive(Clone, Default)]
pub struct PanelBlocklistOptions {
    /// Send allowlisted queries here instead of the default upstream.
    pub allowlist_resolver: Option<DynResolver>,

    /// Send blocklisted queries here instead of blocking them.
    pub blocklist_resolver: Option<DynResolver>,

    /// Send queries from clients missing on the IP allowlist here instead
    /// of answering REFUSED.
    pub ip_allowlist_resolver: Option<DynResolver>,

    /// Panel reconciliation cadence. Disabled if unset.
    pub refresh: Option<Duration>,
}

impl PanelBlocklist {
    pub fn new(
        id: &str,
        resolver: DynResolver,
        loader: Arc<PanelLoader>,
        db: PanelDb,
        opt: PanelBlocklistOptions,
    ) -> Arc<PanelBlocklist> {
        let node = Arc::new(PanelBlocklist {
            id: id.to_string(),
            resolver,
            loader,
            db: Arc::new(RwLock::new(db)),
            metrics: BlocklistMetrics::new(id),
            opt,
        });

        if let Some(refresh) = node.opt.refresh {
            let refresher = node.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(refresh);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    refresher.refresh_tick().await;
                }
            });
        }
        node
    }

    /// One reconciliation pass. Errors skip the tick and keep the prior
    /// state; a NotModified sentinel counts as success without changes.
    async fn refresh_tick(&self) {
        log::debug!("id={} reconciling panel state", self.id);

        let baseline = {
            let state = self.loader.state.lock();
            (state.node_info.clone(), state.user_list.clone())
        };

        let (mut node_info_changed, new_node_info) = match self.loader.api.get_node_info().await {
            Ok(info) => (true, info),
            Err(PanelError::NotModified) => (false, baseline.0.clone()),
            Err(err) => {
                log::error!("id={} failed to load panel rules: {}", self.id, err);
                return;
            }
        };

        let (users_changed, new_user_list) = match self.loader.api.get_user_list().await {
            Ok(users) => (true, users),
            Err(PanelError::NotModified) => (false, baseline.1.clone()),
            Err(err) => {
                log::error!("id={} failed to load panel user list: {}", self.id, err);
                return;
            }
        };

        if node_info_changed {
            if new_node_info.route_dns == baseline.0.route_dns {
                node_info_changed = false;
            } else {
                if new_node_info.route_dns.socks5 != baseline.0.route_dns.socks5 {
                    let dialer = build_dialer(&new_node_info.route_dns.socks5);
                    self.db.write().socks5_dialer = dialer;
                    log::debug!("id={} rebuilt socks5 dialer", self.id);
                }
                if new_node_info.route_dns.allow != baseline.0.route_dns.allow {
                    match self.loader.name_db("allow", &new_node_info).await {
                        Ok(db) => {
                            self.db.write().allowlist_db = db;
                            log::debug!("id={} reloaded allowlist", self.id);
                        }
                        Err(err) => {
                            log::error!("id={} failed to rebuild allowlist: {}", self.id, err)
                        }
                    }
                }
                if new_node_info.route_dns.block != baseline.0.route_dns.block {
                    match self.loader.name_db("block", &new_node_info).await {
                        Ok(db) => {
                            self.db.write().blocklist_db = db;
                            log::debug!("id={} reloaded blocklist", self.id);
                        }
                        Err(err) => {
                            log::error!("id={} failed to rebuild blocklist: {}", self.id, err)
                        }
                    }
                }
            }
        }

        let mut deleted_count = 0;
        let mut added_count = 0;
        if users_changed {
            let (deleted, added) = compare_user_lists(&baseline.1, &new_user_list);
            deleted_count = deleted.len();
            added_count = added.len();

            let ip_db = self.db.read().ip_allowlist_db.clone();
            if !deleted.is_empty() {
                let rules: Vec<String> = deleted.into_iter().map(|u| u.passwd).collect();
                if let Err(err) = ip_db.remove(&rules) {
                    log::error!("id={} failed to remove users: {}", self.id, err);
                }
            }
            if !added.is_empty() {
                let rules: Vec<String> = added.into_iter().map(|u| u.passwd).collect();
                if let Err(err) = ip_db.add(&rules) {
                    log::error!("id={} failed to add users: {}", self.id, err);
                }
            }
        }
        log::info!(
            "id={} {} user deleted, {} user added",
            self.id,
            deleted_count,
            added_count
        );

        // The new remote state is the baseline for the next tick
        let mut state = self.loader.state.lock();
        if node_info_changed {
            state.node_info = new_node_info;
        }
        if users_changed {
            state.user_list = new_user_list;
        }
    }
}

#[async_trait]
impl Resolver for PanelBlocklist {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        _dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let question = match query.first_question() {
            Some(q) => q.clone(),
            None => return Err(ResolveError::NoQuestion),
        };

        let (allow_db, block_db, ip_db, spoof, dialer) = {
            let db = self.db.read();
            (
                db.allowlist_db.clone(),
                db.blocklist_db.clone(),
                db.ip_allowlist_db.clone(),
                db.spoof.clone(),
                db.socks5_dialer.clone(),
            )
        };

        // Clients have to be on the allowlist before anything else
        let allowed = ci.source_ip.map(|ip| ip_db.matches(ip).is_some());
        if allowed == Some(false) || allowed.is_none() {
            self.metrics.blocked.add(1);
            log::debug!(
                "id={} client={} qname={} client not on allowlist",
                self.id,
                ci,
                question.name
            );
            if let Some(alt) = &self.opt.ip_allowlist_resolver {
                return alt.resolve(query, ci, dialer.as_ref()).await;
            }
            return Ok(Some(refused(query)));
        }

        if let Some(m) = block_db.matches(&question) {
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

            if question.qtype == RecordType::Ptr && !m.names.is_empty() {
                return Ok(Some(ptr_reply(query, &m.names)));
            }
            if let Some(alt) = &self.opt.blocklist_resolver {
                return alt.resolve(query, ci, dialer.as_ref()).await;
            }
            let records = spoof_records(&question, &m.ips);
            if !records.is_empty() {
                let mut answer = query.reply();
                answer.answers = records;
                return Ok(Some(answer));
            }
            return Ok(Some(nxdomain(query)));
        }

        if let Some(m) = allow_db.matches(&question) {
            self.metrics.allowed.add(1);
            if let Some(alt) = &self.opt.allowlist_resolver {
                return alt.resolve(query, ci, dialer.as_ref()).await;
            }
            let records = spoof_records(&question, &m.ips);
            if !records.is_empty() {
                let mut answer = query.reply();
                answer.answers = records;
                return Ok(Some(answer));
            }
            // No spoof target for this query type, fall through to the
            // default upstream
        }

        if !spoof.is_empty() {
            let records = spoof_records(&question, &spoof);
            if !records.is_empty() {
                log::debug!(
                    "id={} client={} qname={} spoofing response",
                    self.id,
                    ci,
                    question.name
                );
                let mut answer = query.reply();
                answer.answers = records;
                return Ok(Some(answer));
            }
        }

        self.metrics.allowed.add(1);
        self.resolver.resolve(query, ci, dialer.as_ref()).await
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
    use crate::matcher::{CidrDb, DomainDb};
    use crate::panel::{PanelApi, PanelApiOptions, PanelLoaderOptions};
    use crate::dns::protocol::ResultCode;

    async fn panel_db(allow: &[&str], block: &[&str], users: &[&str]) -> PanelDb {
        let allow_loader = Arc::new(StaticLoader::new(
            allow.iter().map(|r| r.to_string()).collect(),
        ));
        let block_loader = Arc::new(StaticLoader::new(
            block.iter().map(|r| r.to_string()).collect(),
        ));
        let user_loader = Arc::new(StaticLoader::new(
            users.iter().map(|r| r.to_string()).collect(),
        ));

        PanelDb {
            allowlist_db: Arc::new(
                DomainDb::load("allow", allow_loader, Default::default())
                    .await
                    .unwrap(),
            ),
            blocklist_db: Arc::new(
                DomainDb::load("block", block_loader, Default::default())
                    .await
                    .unwrap(),
            ),
            ip_allowlist_db: Arc::new(CidrDb::load("iplist", user_loader).await.unwrap()),
            spoof: Vec::new(),
            socks5_dialer: None,
        }
    }

    fn loader() -> Arc<PanelLoader> {
        Arc::new(PanelLoader::new(
            Arc::new(PanelApi::new(PanelApiOptions::default())),
            PanelLoaderOptions::default(),
        ))
    }

    fn client(ip: &str) -> ClientInfo {
        ClientInfo {
            source_ip: Some(ip.parse().unwrap()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_client_refused() {
        let upstream = Arc::new(TestResolver::with_ip("1.2.3.4"));
        let db = panel_db(&[], &[], &["10.0.0.0/8"]).await;
        let node = PanelBlocklist::new("panel", upstream, loader(), db, Default::default());

        let query = DnsPacket::query("example.com.", RecordType::A);
        let answer = node
            .resolve(&query, &client("192.168.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::REFUSED, answer.header.rescode);
    }

    #[tokio::test]
    async fn test_allowed_client_block_rules() {
        let upstream = Arc::new(TestResolver::with_ip("1.2.3.4"));
        let db = panel_db(&[], &["domain:ads.test"], &["10.0.0.0/8"]).await;
        let node = PanelBlocklist::new("panel", upstream, loader(), db, Default::default());

        let blocked = DnsPacket::query("x.ads.test.", RecordType::A);
        let answer = node
            .resolve(&blocked, &client("10.1.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NXDOMAIN, answer.header.rescode);

        let good = DnsPacket::query("good.test.", RecordType::A);
        let answer = node
            .resolve(&good, &client("10.1.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);
    }

    #[tokio::test]
    async fn test_incremental_user_update() {
        let upstream = Arc::new(TestResolver::with_ip("1.2.3.4"));
        let db = panel_db(&[], &[], &["10.0.0.0/8"]).await;
        let node = PanelBlocklist::new("panel", upstream, loader(), db.clone(), Default::default());

        let query = DnsPacket::query("example.com.", RecordType::A);

        // Simulate the reconciliation applying a user-list diff
        db.ip_allowlist_db
            .add(&["192.168.0.0/16".to_string()])
            .unwrap();
        let answer = node
            .resolve(&query, &client("192.168.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);

        db.ip_allowlist_db
            .remove(&["192.168.0.0/16".to_string()])
            .unwrap();
        let answer = node
            .resolve(&query, &client("192.168.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::REFUSED, answer.header.rescode);
    }

    #[tokio::test]
    async fn test_spoof_list() {
        let upstream = Arc::new(TestResolver::with_ip("1.2.3.4"));
        let mut db = panel_db(&[], &[], &["10.0.0.0/8"]).await;
        db.spoof = vec!["203.0.113.7".parse().unwrap()];
        let node = PanelBlocklist::new("panel", upstream.clone(), loader(), db, Default::default());

        let query = DnsPacket::query("anything.test.", RecordType::A);
        let answer = node
            .resolve(&query, &client("10.1.1.1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            Some("203.0.113.7".parse().unwrap()),
            answer.answers[0].ip()
        );
        assert_eq!(0, upstream.hit_count());
    }
}
