//! Resolves via its child, then probes each returned address by opening a
//! TCP connection and orders the answers by measured latency.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, DnsRecord};
use crate::resolver::{ClientInfo, DynResolver, Resolver, Result};

pub struct FastestTcp {
    id: String,
    resolver: DynResolver,
    opt: FastestTcpOptions,
}

#[derive(Clone)]
pub struct FastestTcpOptions {
    /// Port the probe connections go to.
    pub port: u16,
    /// Wait for every probe and order all answers, rather than returning
    /// on the first successful connection.
    pub wait_all: bool,
    /// Lower bound applied to the TTL of returned records so clients do
    /// not flood the probes.
    pub success_ttl_min: u32,
    /// Per-probe timeout.
    pub timeout: Duration,
}

impl Default for FastestTcpOptions {
    fn default() -> Self {
        FastestTcpOptions {
            port: 443,
            wait_all: false,
            success_ttl_min: 0,
            timeout: Duration::from_secs(2),
        }
    }
}

async fn probe(ip: IpAddr, port: u16, timeout: Duration) -> Option<Duration> {
    let start = Instant::now();
    let addr = SocketAddr::new(ip, port);
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => Some(start.elapsed()),
        _ => None,
    }
}

impl FastestTcp {
    pub fn new(id: &str, resolver: DynResolver, opt: FastestTcpOptions) -> FastestTcp {
        FastestTcp {
            id: id.to_string(),
            resolver,
            opt,
        }
    }

    fn apply_ttl_floor(&self, records: &mut [DnsRecord]) {
        if self.opt.success_ttl_min > 0 {
            for record in records {
                record.ttl = record.ttl.max(self.opt.success_ttl_min);
            }
        }
    }
}

#[async_trait]
impl Resolver for FastestTcp {
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

        let probe_targets: Vec<(usize, IpAddr)> = answer
            .answers
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.ip().map(|ip| (i, ip)))
            .collect();
        if probe_targets.len() < 2 {
            return Ok(Some(answer));
        }

        let (tx, mut rx) = mpsc::channel(probe_targets.len());
        for (index, ip) in &probe_targets {
            let tx = tx.clone();
            let index = *index;
            let ip = *ip;
            let port = self.opt.port;
            let timeout = self.opt.timeout;
            tokio::spawn(async move {
                let latency = probe(ip, port, timeout).await;
                let _ = tx.send((index, latency)).await;
            });
        }
        drop(tx);

        let mut results: Vec<(usize, Option<Duration>)> = Vec::new();
        while let Some((index, latency)) = rx.recv().await {
            let success = latency.is_some();
            results.push((index, latency));
            if !self.opt.wait_all && success {
                // First working address wins, the rest are abandoned
                break;
            }
            if results.len() == probe_targets.len() {
                break;
            }
        }

        // Fastest first, failed probes keep their original relative order
        // at the end
        results.sort_by_key(|(index, latency)| (latency.is_none(), *latency, *index));
        let ordered: Vec<usize> = results.iter().map(|(index, _)| *index).collect();

        let mut reordered = Vec::with_capacity(answer.answers.len());
        let mut address_records: Vec<Option<DnsRecord>> =
            answer.answers.drain(..).map(Some).collect();

        // Probed records in measured order first
        for index in &ordered {
            if let Some(record) = address_records[*index].take() {
                reordered.push(record);
            }
        }
        // Everything else keeps its place after them
        for record in address_records.into_iter().flatten() {
            reordered.push(record);
        }

        self.apply_ttl_floor(&mut reordered);
        answer.answers = reordered;

        log::debug!(
            "id={} client={} qname={} ordered {} answers by probe latency",
            self.id,
            ci,
            query.qname(),
            ordered.len()
        );

        Ok(Some(answer))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::{RecordData, RecordType};
    use crate::resolver::test_util::TestResolver;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reachable_address_first() {
        // One reachable local listener, one address that refuses
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let upstream = Arc::new(TestResolver::new().respond_with(|q, _| {
            let mut a = q.reply();
            // Unroutable test address first, loopback second
            a.answers.push(DnsRecord::new(
                q.qname(),
                60,
                RecordData::A("192.0.2.222".parse().unwrap()),
            ));
            a.answers.push(DnsRecord::new(
                q.qname(),
                60,
                RecordData::A("127.0.0.1".parse().unwrap()),
            ));
            Some(a)
        }));

        let group = FastestTcp::new(
            "ftcp",
            upstream,
            FastestTcpOptions {
                port,
                wait_all: false,
                success_ttl_min: 300,
                timeout: Duration::from_millis(500),
            },
        );

        let query = DnsPacket::query("example.com.", RecordType::A);
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            Some("127.0.0.1".parse().unwrap()),
            answer.answers[0].ip()
        );
        assert!(answer.answers.iter().all(|r| r.ttl >= 300));
    }

    #[tokio::test]
    async fn test_single_answer_passthrough() {
        let upstream = Arc::new(TestResolver::with_ip("192.0.2.1"));
        let group = FastestTcp::new("ftcp", upstream, Default::default());

        let query = DnsPacket::query("example.com.", RecordType::A);
        let answer = group
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(1, answer.answers.len());
    }
}
