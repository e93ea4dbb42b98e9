//! Static responder: answers every query with a fixed, synthesised
//! response. Useful as a blocklist target, a walled-garden answer or a test
//! fixture.

use async_trait::async_trait;

use super::{ClientInfo, ResolveError, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::edns0::{Edns, EdnsOption};
use crate::dns::protocol::{DnsPacket, DnsRecord, RecordData, RecordType, ResultCode};

pub struct StaticResolver {
    id: String,
    opt: StaticResolverOptions,
}

#[derive(Default, Clone)]
pub struct StaticResolverOptions {
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
    pub rcode: ResultCode,
    pub truncate: bool,
    /// Extended DNS error attached to the response.
    pub ede: Option<(u16, String)>,
}

impl StaticResolver {
    pub fn new(id: &str, opt: StaticResolverOptions) -> StaticResolver {
        StaticResolver {
            id: id.to_string(),
            opt,
        }
    }
}

/// Substitute the query name for records declared with an empty owner name.
fn with_owner(records: &[DnsRecord], qname: &str) -> Vec<DnsRecord> {
    records
        .iter()
        .map(|r| {
            let mut record = r.clone();
            if record.name.is_empty() || record.name == "." {
                record.name = qname.to_string();
            }
            record
        })
        .collect()
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(
        &self,
        query: &DnsPacket,
        _ci: &ClientInfo,
        _dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let qname = query.qname().to_string();

        let mut answer = query.reply();
        answer.header.rescode = self.opt.rcode;
        answer.header.truncated_message = self.opt.truncate;
        answer.answers = with_owner(&self.opt.answers, &qname);
        answer.authorities = with_owner(&self.opt.authorities, &qname);
        answer.resources = with_owner(&self.opt.resources, &qname);

        if let Some((info_code, extra_text)) = &self.opt.ede {
            let mut edns = answer.edns().unwrap_or_default();
            edns.options.push(EdnsOption::ExtendedError {
                info_code: *info_code,
                extra_text: extra_text.clone(),
            });
            answer.set_edns(&edns);
        } else if query.edns().is_some() && answer.edns().is_none() {
            answer.set_edns(&Edns::default());
        }

        Ok(Some(answer))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

/// Parse a record in the short text form used by the configuration:
/// `[owner] <ttl> <type> <data...>`, e.g. `". 3600 A 192.0.2.1"`. An owner
/// of `.` (or empty) is substituted with the query name at resolve time.
pub fn parse_record(text: &str) -> Result<DnsRecord> {
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() < 3 {
        return Err(ResolveError::Config(format!("invalid record '{}'", text)));
    }

    let name = match fields[0] {
        "." => String::new(),
        owner => owner.trim_end_matches('.').to_string(),
    };
    let ttl: u32 = fields[1]
        .parse()
        .map_err(|_| ResolveError::Config(format!("invalid TTL in record '{}'", text)))?;
    let rtype = fields[2].to_uppercase();
    let rdata = &fields[3..];

    let field = |i: usize| -> Result<&str> {
        rdata
            .get(i)
            .copied()
            .ok_or_else(|| ResolveError::Config(format!("missing data in record '{}'", text)))
    };

    let data = match rtype.as_str() {
        "A" => RecordData::A(
            field(0)?
                .parse()
                .map_err(|_| ResolveError::Config(format!("invalid address in '{}'", text)))?,
        ),
        "AAAA" => RecordData::Aaaa(
            field(0)?
                .parse()
                .map_err(|_| ResolveError::Config(format!("invalid address in '{}'", text)))?,
        ),
        "CNAME" => RecordData::Cname(field(0)?.trim_end_matches('.').to_string()),
        "NS" => RecordData::Ns(field(0)?.trim_end_matches('.').to_string()),
        "PTR" => RecordData::Ptr(field(0)?.trim_end_matches('.').to_string()),
        "MX" => RecordData::Mx {
            preference: field(0)?
                .parse()
                .map_err(|_| ResolveError::Config(format!("invalid preference in '{}'", text)))?,
            exchange: field(1)?.trim_end_matches('.').to_string(),
        },
        "TXT" => RecordData::Txt(rdata.join(" ")),
        _ => {
            return Err(ResolveError::Config(format!(
                "unsupported record type '{}' in '{}'",
                rtype, text
            )))
        }
    };

    Ok(DnsRecord::new(&name, ttl, data))
}

/// A resolver answering with the fixed address, shorthand used in tests and
/// simple configurations.
pub fn spoof_resolver(id: &str, ip: std::net::IpAddr) -> StaticResolver {
    let data = match ip {
        std::net::IpAddr::V4(v4) => RecordData::A(v4),
        std::net::IpAddr::V6(v6) => RecordData::Aaaa(v6),
    };
    StaticResolver::new(
        id,
        StaticResolverOptions {
            answers: vec![DnsRecord::new("", 3600, data)],
            ..Default::default()
        },
    )
}

#[cfg(test)]
mod tests {

    use super::*;

    #[tokio::test]
    async fn test_static_answer() {
        let resolver = StaticResolver::new(
            "static",
            StaticResolverOptions {
                answers: vec![parse_record(". 3600 A 192.0.2.1").unwrap()],
                ..Default::default()
            },
        );

        let query = DnsPacket::query("walled.test.", RecordType::A);
        let answer = resolver
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(query.header.id, answer.header.id);
        assert_eq!(1, answer.answers.len());
        assert_eq!("walled.test.", answer.answers[0].name);
        assert_eq!(ResultCode::NOERROR, answer.header.rescode);
    }

    #[tokio::test]
    async fn test_static_nxdomain_with_ede() {
        let resolver = StaticResolver::new(
            "static",
            StaticResolverOptions {
                rcode: ResultCode::NXDOMAIN,
                ede: Some((15, "blocked".to_string())),
                ..Default::default()
            },
        );

        let query = DnsPacket::query("blocked.test.", RecordType::A);
        let answer = resolver
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(ResultCode::NXDOMAIN, answer.header.rescode);
        let edns = answer.edns().unwrap();
        assert!(edns
            .options
            .iter()
            .any(|o| matches!(o, EdnsOption::ExtendedError { info_code: 15, .. })));
    }

    #[test]
    fn test_parse_record() {
        let rec = parse_record("host.test. 60 CNAME target.test.").unwrap();
        assert_eq!("host.test", rec.name);
        assert_eq!(60, rec.ttl);
        assert_eq!(RecordData::Cname("target.test".to_string()), rec.data);

        assert!(parse_record("bad").is_err());
        assert!(parse_record(". x A 1.2.3.4").is_err());
        assert!(parse_record(". 60 SOA too complex").is_err());
    }
}
