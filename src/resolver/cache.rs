//! TTL-aware response cache
//!
//! Keyed on `(qname, qtype, qclass, ECS)` so subnet-scoped answers are kept
//! apart. The effective TTL is the minimum across the answer records,
//! optionally capped; negative responses use the configured override or the
//! SOA minimum. The in-memory backend is an LRU with periodic garbage
//! collection and an optional snapshot file, answers can be shuffled per
//! hit, and entries close to expiry can be refreshed ahead of time.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lru::LruCache;
use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};

use super::{nxdomain, ClientInfo, DynResolver, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::edns0::EdnsOption;
use crate::dns::protocol::{DnsPacket, RecordType, ResultCode};
use crate::metrics::{get_var_int, Counter};

#[derive(Clone, Hash, PartialEq, Eq, Debug)]
struct CacheKey {
    name: String,
    qtype: u16,
    qclass: u16,
    ecs: Option<(IpAddr, u8)>,
}

impl CacheKey {
    fn from_query(query: &DnsPacket) -> Option<CacheKey> {
        let question = query.first_question()?;
        let ecs = query.edns().and_then(|e| {
            e.options.iter().find_map(|o| match o {
                EdnsOption::ClientSubnet(ecs) => Some((ecs.address, ecs.source_prefix)),
                _ => None,
            })
        });
        Some(CacheKey {
            name: question.name.trim_end_matches('.').to_lowercase(),
            qtype: question.qtype.to_num(),
            qclass: question.qclass,
            ecs,
        })
    }

    /// Key of the parent domain, used by the harden-below-NXDOMAIN walk.
    fn parent(&self) -> Option<CacheKey> {
        let (_, rest) = self.name.split_once('.')?;
        Some(CacheKey {
            name: rest.to_string(),
            qtype: self.qtype,
            qclass: self.qclass,
            ecs: self.ecs,
        })
    }
}

struct CacheEntry {
    packet: DnsPacket,
    inserted: Instant,
    ttl: u32,
    serve_count: u64,
    prefetching: bool,
}

impl CacheEntry {
    fn age(&self) -> u32 {
        self.inserted.elapsed().as_secs() as u32
    }

    fn expired(&self) -> bool {
        self.age() >= self.ttl
    }
}

type Entries = Arc<Mutex<LruCache<CacheKey, CacheEntry>>>;

/// Answer-order strategy applied on cache hits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheShuffle {
    #[default]
    None,
    Random,
    RoundRobin,
}

impl CacheShuffle {
    pub fn from_name(name: &str) -> Option<CacheShuffle> {
        match name {
            "" => Some(CacheShuffle::None),
            "random" => Some(CacheShuffle::Random),
            "round-robin" => Some(CacheShuffle::RoundRobin),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct CacheOptions {
    /// Maximum number of entries held.
    pub capacity: usize,
    /// Cadence of the expired-entry sweep.
    pub gc_period: Duration,
    /// TTL for negative responses; 0 uses the SOA minimum.
    pub negative_ttl: u32,
    /// Cap on the effective TTL; 0 leaves it uncapped.
    pub max_ttl: u32,
    /// A cached NXDOMAIN covers all names below it.
    pub harden_below_nxdomain: bool,
    pub shuffle: CacheShuffle,
    /// Refresh an entry ahead of expiry once its remaining TTL drops below
    /// this; 0 disables prefetching.
    pub prefetch_trigger: u32,
    /// Entries whose effective TTL started below this are not worth
    /// prefetching.
    pub prefetch_eligible: u32,
    /// Snapshot file; empty disables snapshots.
    pub snapshot_file: String,
    pub save_interval: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            capacity: 4096,
            gc_period: Duration::from_secs(60),
            negative_ttl: 0,
            max_ttl: 0,
            harden_below_nxdomain: false,
            shuffle: CacheShuffle::None,
            prefetch_trigger: 0,
            prefetch_eligible: 0,
            snapshot_file: String::new(),
            save_interval: Duration::from_secs(300),
        }
    }
}

pub struct Cache {
    id: String,
    resolver: DynResolver,
    opt: CacheOptions,
    entries: Entries,
    hit: Counter,
    miss: Counter,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    name: String,
    qtype: u16,
    qclass: u16,
    ecs: Option<(IpAddr, u8)>,
    ttl: u32,
    packet: String,
}

/// Effective TTL of a response; `None` means the response is not cacheable.
fn effective_ttl(opt: &CacheOptions, answer: &DnsPacket) -> Option<u32> {
    let ttl = match answer.header.rescode {
        ResultCode::NOERROR if !answer.answers.is_empty() => answer
            .answers
            .iter()
            .filter(|r| r.rtype() != RecordType::Opt)
            .map(|r| r.ttl)
            .min()?,
        ResultCode::NOERROR | ResultCode::NXDOMAIN => {
            if opt.negative_ttl > 0 {
                opt.negative_ttl
            } else {
                answer.soa_min_ttl()?
            }
        }
        _ => return None,
    };

    if opt.max_ttl > 0 {
        Some(ttl.min(opt.max_ttl))
    } else {
        Some(ttl)
    }
}

fn store_entry(entries: &Entries, opt: &CacheOptions, key: CacheKey, answer: &DnsPacket) {
    if let Some(ttl) = effective_ttl(opt, answer) {
        if ttl == 0 {
            return;
        }
        let mut entries = entries.lock();
        entries.put(
            key,
            CacheEntry {
                packet: answer.clone(),
                inserted: Instant::now(),
                ttl,
                serve_count: 0,
                prefetching: false,
            },
        );
    }
}

impl Cache {
    pub fn new(id: &str, resolver: DynResolver, opt: CacheOptions) -> Arc<Cache> {
        let capacity = NonZeroUsize::new(opt.capacity.max(1)).unwrap();
        let cache = Arc::new(Cache {
            id: id.to_string(),
            resolver,
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            hit: get_var_int("cache", id, "hit"),
            miss: get_var_int("cache", id, "miss"),
            opt,
        });

        if !cache.opt.snapshot_file.is_empty() {
            cache.load_snapshot();
            let snapshot = cache.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(snapshot.opt.save_interval);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    snapshot.save_snapshot();
                }
            });
        }

        let gc = cache.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(gc.opt.gc_period);
            interval.tick().await;
            loop {
                interval.tick().await;
                gc.collect_garbage();
            }
        });

        cache
    }

    fn collect_garbage(&self) {
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| e.expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            entries.pop(&key);
        }
    }

    /// Serve from the cache if a live entry exists. Returns the response
    /// and whether a prefetch should be started.
    fn lookup(&self, key: &CacheKey, query: &DnsPacket) -> Option<(DnsPacket, bool)> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if entry.expired() {
            entries.pop(key);
            return None;
        }

        let age = entry.age();
        let remaining = entry.ttl - age;
        entry.serve_count += 1;

        let mut response = entry.packet.clone();
        response.header.id = query.header.id;
        for record in response
            .answers
            .iter_mut()
            .chain(response.authorities.iter_mut())
        {
            if record.rtype() != RecordType::Opt {
                record.ttl = record.ttl.saturating_sub(age);
            }
        }

        match self.opt.shuffle {
            CacheShuffle::None => {}
            CacheShuffle::Random => response.answers.shuffle(&mut rand::thread_rng()),
            CacheShuffle::RoundRobin => {
                let len = response.answers.len();
                if len > 1 {
                    response
                        .answers
                        .rotate_left((entry.serve_count as usize) % len);
                }
            }
        }

        let prefetch = self.opt.prefetch_trigger > 0
            && remaining < self.opt.prefetch_trigger
            && entry.ttl >= self.opt.prefetch_eligible
            && !entry.prefetching;
        if prefetch {
            entry.prefetching = true;
        }

        Some((response, prefetch))
    }

    /// NXDOMAIN of a parent domain covers this query.
    fn hardened_nxdomain(&self, key: &CacheKey) -> bool {
        if !self.opt.harden_below_nxdomain {
            return false;
        }
        let mut entries = self.entries.lock();
        let mut parent = key.parent();
        while let Some(p) = parent {
            if let Some(entry) = entries.get(&p) {
                if !entry.expired() && entry.packet.header.rescode == ResultCode::NXDOMAIN {
                    return true;
                }
            }
            parent = p.parent();
        }
        false
    }

    /// Refresh an entry in the background before it expires.
    fn spawn_prefetch(&self, key: CacheKey, query: DnsPacket, ci: ClientInfo) {
        let id = self.id.clone();
        let resolver = self.resolver.clone();
        let entries = self.entries.clone();
        let opt = self.opt.clone();
        tokio::spawn(async move {
            log::debug!("id={} qname={} prefetching", id, query.qname());
            match resolver.resolve(&query, &ci, None).await {
                Ok(Some(answer)) => store_entry(&entries, &opt, key, &answer),
                Ok(None) => {}
                Err(err) => {
                    log::debug!("id={} qname={} prefetch failed: {}", id, query.qname(), err);
                    // Allow another attempt on the next hit
                    let mut entries = entries.lock();
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.prefetching = false;
                    }
                }
            }
        });
    }

    fn load_snapshot(&self) {
        let data = match std::fs::read(&self.opt.snapshot_file) {
            Ok(data) => data,
            Err(_) => return,
        };
        let snapshot: Vec<SnapshotEntry> = match serde_json::from_slice(&data) {
            Ok(s) => s,
            Err(err) => {
                log::warn!("id={} failed to read cache snapshot: {}", self.id, err);
                return;
            }
        };

        let mut entries = self.entries.lock();
        let mut loaded = 0;
        for item in snapshot {
            let raw = match BASE64.decode(&item.packet) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let packet = match DnsPacket::from_bytes(&raw) {
                Ok(packet) => packet,
                Err(_) => continue,
            };
            entries.put(
                CacheKey {
                    name: item.name,
                    qtype: item.qtype,
                    qclass: item.qclass,
                    ecs: item.ecs,
                },
                CacheEntry {
                    packet,
                    inserted: Instant::now(),
                    ttl: item.ttl,
                    serve_count: 0,
                    prefetching: false,
                },
            );
            loaded += 1;
        }
        log::info!("id={} loaded {} cache entries from snapshot", self.id, loaded);
    }

    /// Write the live entries to the snapshot file. Also invoked on clean
    /// shutdown.
    pub fn save_snapshot(&self) {
        if self.opt.snapshot_file.is_empty() {
            return;
        }
        let snapshot: Vec<SnapshotEntry> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|(_, e)| !e.expired())
                .filter_map(|(k, e)| {
                    let raw = e.packet.to_bytes(crate::dns::protocol::MAX_MSG_SIZE).ok()?;
                    Some(SnapshotEntry {
                        name: k.name.clone(),
                        qtype: k.qtype,
                        qclass: k.qclass,
                        ecs: k.ecs,
                        ttl: e.ttl - e.age(),
                        packet: BASE64.encode(raw),
                    })
                })
                .collect()
        };

        let data = match serde_json::to_vec(&snapshot) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("id={} failed to serialise cache snapshot: {}", self.id, err);
                return;
            }
        };
        let tmp = format!("{}.tmp", self.opt.snapshot_file);
        if let Err(err) =
            std::fs::write(&tmp, &data).and_then(|_| std::fs::rename(&tmp, &self.opt.snapshot_file))
        {
            log::warn!("id={} failed to write cache snapshot: {}", self.id, err);
        }
    }
}

#[async_trait]
impl Resolver for Cache {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let key = match CacheKey::from_query(query) {
            Some(key) => key,
            None => return self.resolver.resolve(query, ci, dialer).await,
        };

        if let Some((response, prefetch)) = self.lookup(&key, query) {
            self.hit.add(1);
            log::debug!(
                "id={} client={} qname={} cache hit",
                self.id,
                ci,
                query.qname()
            );
            if prefetch {
                self.spawn_prefetch(key, query.clone(), ci.clone());
            }
            return Ok(Some(response));
        }

        if self.hardened_nxdomain(&key) {
            self.hit.add(1);
            log::debug!(
                "id={} client={} qname={} covered by cached NXDOMAIN",
                self.id,
                ci,
                query.qname()
            );
            return Ok(Some(nxdomain(query)));
        }

        self.miss.add(1);
        let answer = self.resolver.resolve(query, ci, dialer).await?;
        if let Some(answer) = &answer {
            store_entry(&self.entries, &self.opt, key, answer);
        }
        Ok(answer)
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use super::super::test_util::TestResolver;
    use crate::dns::protocol::{DnsRecord, RecordData};

    fn upstream_with_ttl(ttl: u32) -> Arc<TestResolver> {
        Arc::new(TestResolver::new().respond_with(move |q, _| {
            let mut a = q.reply();
            a.answers.push(DnsRecord::new(
                q.qname(),
                ttl,
                RecordData::A("192.0.2.1".parse().unwrap()),
            ));
            Some(a)
        }))
    }

    #[tokio::test]
    async fn test_second_query_served_from_cache() {
        let upstream = upstream_with_ttl(300);
        let cache = Cache::new("cache", upstream.clone(), Default::default());

        let query = DnsPacket::query("example.com.", RecordType::A);
        let first = cache
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        let second = cache
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.answers, second.answers);
        assert_eq!(1, upstream.hit_count());
    }

    #[tokio::test]
    async fn test_expired_entry_reconsults_upstream() {
        let upstream = upstream_with_ttl(0);
        let cache = Cache::new("cache", upstream.clone(), Default::default());

        let query = DnsPacket::query("example.com.", RecordType::A);
        cache.resolve(&query, &Default::default(), None).await.unwrap();
        cache.resolve(&query, &Default::default(), None).await.unwrap();
        // TTL 0 responses are not cached at all
        assert_eq!(2, upstream.hit_count());
    }

    #[tokio::test]
    async fn test_distinct_ecs_keys() {
        let upstream = upstream_with_ttl(300);
        let cache = Cache::new("cache", upstream.clone(), Default::default());

        let plain = DnsPacket::query("example.com.", RecordType::A);
        cache.resolve(&plain, &Default::default(), None).await.unwrap();

        let mut scoped = plain.clone();
        let mut edns = crate::dns::edns0::Edns::default();
        edns.options
            .push(EdnsOption::ClientSubnet(crate::dns::edns0::ClientSubnet::new(
                "10.0.0.0".parse().unwrap(),
                24,
            )));
        scoped.set_edns(&edns);
        cache.resolve(&scoped, &Default::default(), None).await.unwrap();

        // Different ECS scope means a separate upstream query
        assert_eq!(2, upstream.hit_count());
    }

    #[tokio::test]
    async fn test_round_robin_shuffle_rotates() {
        let upstream = Arc::new(TestResolver::new().respond_with(|q, _| {
            let mut a = q.reply();
            for ip in ["192.0.2.1", "192.0.2.2", "192.0.2.3"] {
                a.answers.push(DnsRecord::new(
                    q.qname(),
                    300,
                    RecordData::A(ip.parse().unwrap()),
                ));
            }
            Some(a)
        }));
        let cache = Cache::new(
            "cache",
            upstream,
            CacheOptions {
                shuffle: CacheShuffle::RoundRobin,
                ..Default::default()
            },
        );

        let query = DnsPacket::query("example.com.", RecordType::A);
        cache.resolve(&query, &Default::default(), None).await.unwrap();

        let a = cache
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        let b = cache
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(a.answers[0], b.answers[0]);
    }

    #[tokio::test]
    async fn test_negative_caching_with_override() {
        let upstream = Arc::new(TestResolver::new().respond_with(|q, _| {
            let mut a = q.reply();
            a.header.rescode = ResultCode::NXDOMAIN;
            Some(a)
        }));
        let cache = Cache::new(
            "cache",
            upstream.clone(),
            CacheOptions {
                negative_ttl: 30,
                ..Default::default()
            },
        );

        let query = DnsPacket::query("missing.test.", RecordType::A);
        cache.resolve(&query, &Default::default(), None).await.unwrap();
        let answer = cache
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NXDOMAIN, answer.header.rescode);
        assert_eq!(1, upstream.hit_count());
    }

    #[tokio::test]
    async fn test_harden_below_nxdomain() {
        let upstream = Arc::new(TestResolver::new().respond_with(|q, _| {
            let mut a = q.reply();
            a.header.rescode = ResultCode::NXDOMAIN;
            Some(a)
        }));
        let cache = Cache::new(
            "cache",
            upstream.clone(),
            CacheOptions {
                negative_ttl: 300,
                harden_below_nxdomain: true,
                ..Default::default()
            },
        );

        let parent = DnsPacket::query("gone.test.", RecordType::A);
        cache.resolve(&parent, &Default::default(), None).await.unwrap();

        let child = DnsPacket::query("www.gone.test.", RecordType::A);
        let answer = cache
            .resolve(&child, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NXDOMAIN, answer.header.rescode);
        // The child query never reached the upstream
        assert_eq!(1, upstream.hit_count());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cache.json");

        let upstream = upstream_with_ttl(300);
        let cache = Cache::new(
            "cache",
            upstream.clone(),
            CacheOptions {
                snapshot_file: file.to_str().unwrap().to_string(),
                ..Default::default()
            },
        );
        let query = DnsPacket::query("example.com.", RecordType::A);
        cache.resolve(&query, &Default::default(), None).await.unwrap();
        cache.save_snapshot();

        // A new cache instance picks the entry up from disk
        let upstream2 = upstream_with_ttl(300);
        let restored = Cache::new(
            "cache2",
            upstream2.clone(),
            CacheOptions {
                snapshot_file: file.to_str().unwrap().to_string(),
                ..Default::default()
            },
        );
        let answer = restored
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(1, answer.answers.len());
        assert_eq!(0, upstream2.hit_count());
    }
}
