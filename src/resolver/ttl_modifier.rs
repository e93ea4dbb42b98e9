//! Normalises the TTLs of a response: one value is selected across the
//! answer records, clamped to a configured range, and applied to all of
//! them.

use async_trait::async_trait;
use rand::Rng;

use super::{ClientInfo, DynResolver, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, RecordType};

/// How the common TTL is chosen from the answer records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TtlSelect {
    #[default]
    Lowest,
    Highest,
    Average,
    First,
    Last,
    Random,
}

impl TtlSelect {
    pub fn from_name(name: &str) -> Option<TtlSelect> {
        match name {
            "lowest" | "" => Some(TtlSelect::Lowest),
            "highest" => Some(TtlSelect::Highest),
            "average" => Some(TtlSelect::Average),
            "first" => Some(TtlSelect::First),
            "last" => Some(TtlSelect::Last),
            "random" => Some(TtlSelect::Random),
            _ => None,
        }
    }
}

pub struct TtlModifier {
    id: String,
    resolver: DynResolver,
    select: TtlSelect,
    min: u32,
    max: u32,
}

impl TtlModifier {
    pub fn new(id: &str, resolver: DynResolver, select: TtlSelect, min: u32, max: u32) -> TtlModifier {
        let max = if max == 0 { u32::MAX } else { max };
        TtlModifier {
            id: id.to_string(),
            resolver,
            select,
            min,
            max,
        }
    }

    fn pick(&self, ttls: &[u32]) -> Option<u32> {
        if ttls.is_empty() {
            return None;
        }
        let value = match self.select {
            TtlSelect::Lowest => *ttls.iter().min().unwrap(),
            TtlSelect::Highest => *ttls.iter().max().unwrap(),
            TtlSelect::Average => {
                (ttls.iter().map(|&t| t as u64).sum::<u64>() / ttls.len() as u64) as u32
            }
            TtlSelect::First => ttls[0],
            TtlSelect::Last => ttls[ttls.len() - 1],
            TtlSelect::Random => {
                let min = *ttls.iter().min().unwrap();
                let max = *ttls.iter().max().unwrap();
                if min == max {
                    min
                } else {
                    rand::thread_rng().gen_range(min..=max)
                }
            }
        };
        Some(value.clamp(self.min, self.max))
    }
}

#[async_trait]
impl Resolver for TtlModifier {
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

        let ttls: Vec<u32> = answer
            .answers
            .iter()
            .filter(|r| r.rtype() != RecordType::Opt)
            .map(|r| r.ttl)
            .collect();

        if let Some(ttl) = self.pick(&ttls) {
            log::debug!(
                "id={} client={} qname={} ttl={} rewriting ttl",
                self.id,
                ci,
                query.qname(),
                ttl
            );
            for record in answer
                .answers
                .iter_mut()
                .chain(answer.authorities.iter_mut())
            {
                if record.rtype() != RecordType::Opt {
                    record.ttl = ttl;
                }
            }
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
    use crate::dns::protocol::{DnsRecord, RecordData};
    use std::sync::Arc;

    fn upstream() -> Arc<TestResolver> {
        Arc::new(TestResolver::new().respond_with(|q, _| {
            let mut a = q.reply();
            a.answers.push(DnsRecord::new(
                q.qname(),
                30,
                RecordData::A("192.0.2.1".parse().unwrap()),
            ));
            a.answers.push(DnsRecord::new(
                q.qname(),
                900,
                RecordData::A("192.0.2.2".parse().unwrap()),
            ));
            Some(a)
        }))
    }

    async fn modified(select: TtlSelect, min: u32, max: u32) -> DnsPacket {
        let modifier = TtlModifier::new("ttl", upstream(), select, min, max);
        let query = DnsPacket::query("example.com.", RecordType::A);
        modifier
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lowest_clamped() {
        let answer = modified(TtlSelect::Lowest, 60, 600).await;
        assert!(answer.answers.iter().all(|r| r.ttl == 60));
    }

    #[tokio::test]
    async fn test_highest_clamped() {
        let answer = modified(TtlSelect::Highest, 0, 600).await;
        assert!(answer.answers.iter().all(|r| r.ttl == 600));
    }

    #[tokio::test]
    async fn test_average() {
        let answer = modified(TtlSelect::Average, 0, 0).await;
        assert!(answer.answers.iter().all(|r| r.ttl == 465));
    }

    #[tokio::test]
    async fn test_first_and_last() {
        let answer = modified(TtlSelect::First, 0, 0).await;
        assert!(answer.answers.iter().all(|r| r.ttl == 30));

        let answer = modified(TtlSelect::Last, 0, 0).await;
        assert!(answer.answers.iter().all(|r| r.ttl == 900));
    }
}
