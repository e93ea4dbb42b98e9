//! Flattens CNAME chains in responses: intermediate CNAME records are
//! removed and the terminal records renamed to the query name.

use async_trait::async_trait;

use super::{nxdomain, ClientInfo, DynResolver, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, RecordType};

pub struct ResponseCollapse {
    id: String,
    resolver: DynResolver,
}

impl ResponseCollapse {
    pub fn new(id: &str, resolver: DynResolver) -> ResponseCollapse {
        ResponseCollapse {
            id: id.to_string(),
            resolver,
        }
    }
}

#[async_trait]
impl Resolver for ResponseCollapse {
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

        let has_cname = answer
            .answers
            .iter()
            .any(|r| r.rtype() == RecordType::Cname);
        if !has_cname {
            return Ok(Some(answer));
        }

        let qname = query.qname().to_string();
        let mut collapsed = Vec::with_capacity(answer.answers.len());
        for mut record in answer.answers.drain(..) {
            if record.rtype() == RecordType::Cname {
                continue;
            }
            record.name = qname.clone();
            collapsed.push(record);
        }

        if collapsed.is_empty() {
            log::debug!(
                "id={} client={} qname={} nothing left after collapsing",
                self.id,
                ci,
                qname
            );
            return Ok(Some(nxdomain(query)));
        }

        answer.answers = collapsed;
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
    use crate::dns::protocol::{DnsRecord, RecordData, ResultCode};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_collapse_chain() {
        let upstream = Arc::new(TestResolver::new().respond_with(|q, _| {
            let mut a = q.reply();
            a.answers.push(DnsRecord::new(
                q.qname(),
                60,
                RecordData::Cname("cdn.test".to_string()),
            ));
            a.answers.push(DnsRecord::new(
                "cdn.test",
                60,
                RecordData::A("192.0.2.1".parse().unwrap()),
            ));
            Some(a)
        }));

        let collapse = ResponseCollapse::new("collapse", upstream);
        let query = DnsPacket::query("www.example.com.", RecordType::A);
        let answer = collapse
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(1, answer.answers.len());
        assert_eq!("www.example.com.", answer.answers[0].name);
        assert_eq!(RecordType::A, answer.answers[0].rtype());
    }

    #[tokio::test]
    async fn test_cname_only_yields_nxdomain() {
        let upstream = Arc::new(TestResolver::new().respond_with(|q, _| {
            let mut a = q.reply();
            a.answers.push(DnsRecord::new(
                q.qname(),
                60,
                RecordData::Cname("cdn.test".to_string()),
            ));
            Some(a)
        }));

        let collapse = ResponseCollapse::new("collapse", upstream);
        let query = DnsPacket::query("www.example.com.", RecordType::A);
        let answer = collapse
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ResultCode::NXDOMAIN, answer.header.rescode);
    }
}
