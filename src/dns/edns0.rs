//! EDNS(0) support - RFC 6891
//!
//! Interprets the OPT pseudo-record as a typed options structure and
//! provides the option handling used by the pipeline: client subnet
//! (RFC 7871), padding (RFC 7830/8467), tcp-keepalive (RFC 7828) and
//! extended DNS errors (RFC 8914).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::dns::protocol::{DnsPacket, DnsRecord, RecordData, RecordType};

/// Client Subnet (RFC 7871)
pub const EDNS0_SUBNET: u16 = 8;
/// Cookie (RFC 7873)
pub const EDNS0_COOKIE: u16 = 10;
/// TCP Keepalive (RFC 7828)
pub const EDNS0_TCP_KEEPALIVE: u16 = 11;
/// Padding (RFC 7830)
pub const EDNS0_PADDING: u16 = 12;
/// Extended DNS Error (RFC 8914)
pub const EDNS0_EDE: u16 = 15;

/// UDP size advertised when this service adds an OPT record itself.
pub const DEFAULT_UDP_SIZE: u16 = 4096;

/// RFC 8467 recommended padding block sizes.
const QUERY_PAD_BLOCK: usize = 128;
const RESPONSE_PAD_BLOCK: usize = 468;

/// Client Subnet option payload (RFC 7871)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSubnet {
    /// Address family: 1 = IPv4, 2 = IPv6
    pub family: u16,
    pub source_prefix: u8,
    pub scope_prefix: u8,
    pub address: IpAddr,
}

impl ClientSubnet {
    pub fn new(address: IpAddr, prefix: u8) -> ClientSubnet {
        let family = match address {
            IpAddr::V4(_) => 1,
            IpAddr::V6(_) => 2,
        };
        ClientSubnet {
            family,
            source_prefix: prefix,
            scope_prefix: 0,
            address,
        }
    }

    fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.family.to_be_bytes());
        data.push(self.source_prefix);
        data.push(self.scope_prefix);

        // Only the significant bytes of the address are carried
        let byte_len = ((self.source_prefix as usize) + 7) / 8;
        match self.address {
            IpAddr::V4(addr) => data.extend_from_slice(&addr.octets()[..byte_len.min(4)]),
            IpAddr::V6(addr) => data.extend_from_slice(&addr.octets()[..byte_len.min(16)]),
        }
        data
    }

    fn parse(data: &[u8]) -> Option<ClientSubnet> {
        if data.len() < 4 {
            return None;
        }
        let family = u16::from_be_bytes([data[0], data[1]]);
        let source_prefix = data[2];
        let scope_prefix = data[3];
        let byte_len = ((source_prefix as usize) + 7) / 8;

        let address = match family {
            1 => {
                let mut bytes = [0u8; 4];
                let n = byte_len.min(4).min(data.len() - 4);
                bytes[..n].copy_from_slice(&data[4..4 + n]);
                IpAddr::V4(Ipv4Addr::from(bytes))
            }
            2 => {
                let mut bytes = [0u8; 16];
                let n = byte_len.min(16).min(data.len() - 4);
                bytes[..n].copy_from_slice(&data[4..4 + n]);
                IpAddr::V6(Ipv6Addr::from(bytes))
            }
            _ => return None,
        };

        Some(ClientSubnet {
            family,
            source_prefix,
            scope_prefix,
            address,
        })
    }
}

/// A single EDNS(0) option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdnsOption {
    ClientSubnet(ClientSubnet),
    TcpKeepalive(Vec<u8>),
    Padding(usize),
    ExtendedError { info_code: u16, extra_text: String },
    Generic { code: u16, data: Vec<u8> },
}

impl EdnsOption {
    pub fn code(&self) -> u16 {
        match self {
            EdnsOption::ClientSubnet(_) => EDNS0_SUBNET,
            EdnsOption::TcpKeepalive(_) => EDNS0_TCP_KEEPALIVE,
            EdnsOption::Padding(_) => EDNS0_PADDING,
            EdnsOption::ExtendedError { .. } => EDNS0_EDE,
            EdnsOption::Generic { code, .. } => *code,
        }
    }

    fn wire_data(&self) -> Vec<u8> {
        match self {
            EdnsOption::ClientSubnet(ecs) => ecs.serialize(),
            EdnsOption::TcpKeepalive(data) => data.clone(),
            EdnsOption::Padding(len) => vec![0; *len],
            EdnsOption::ExtendedError {
                info_code,
                extra_text,
            } => {
                let mut data = info_code.to_be_bytes().to_vec();
                data.extend_from_slice(extra_text.as_bytes());
                data
            }
            EdnsOption::Generic { data, .. } => data.clone(),
        }
    }

    fn parse(code: u16, data: &[u8]) -> EdnsOption {
        match code {
            EDNS0_SUBNET => match ClientSubnet::parse(data) {
                Some(ecs) => EdnsOption::ClientSubnet(ecs),
                None => EdnsOption::Generic {
                    code,
                    data: data.to_vec(),
                },
            },
            EDNS0_TCP_KEEPALIVE => EdnsOption::TcpKeepalive(data.to_vec()),
            EDNS0_PADDING => EdnsOption::Padding(data.len()),
            EDNS0_EDE if data.len() >= 2 => EdnsOption::ExtendedError {
                info_code: u16::from_be_bytes([data[0], data[1]]),
                extra_text: String::from_utf8_lossy(&data[2..]).to_string(),
            },
            _ => EdnsOption::Generic {
                code,
                data: data.to_vec(),
            },
        }
    }
}

/// Decoded form of the OPT pseudo-record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edns {
    pub udp_size: u16,
    pub ext_rcode: u8,
    pub version: u8,
    pub dnssec_ok: bool,
    pub options: Vec<EdnsOption>,
}

impl Default for Edns {
    fn default() -> Self {
        Edns {
            udp_size: DEFAULT_UDP_SIZE,
            ext_rcode: 0,
            version: 0,
            dnssec_ok: false,
            options: Vec::new(),
        }
    }
}

impl Edns {
    pub fn from_record(record: &DnsRecord) -> Option<Edns> {
        let data = match &record.data {
            RecordData::Opt(data) => data,
            _ => return None,
        };

        let mut options = Vec::new();
        let mut pos = 0;
        while pos + 4 <= data.len() {
            let code = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 4;
            if pos + len > data.len() {
                break;
            }
            options.push(EdnsOption::parse(code, &data[pos..pos + len]));
            pos += len;
        }

        Some(Edns {
            udp_size: record.class,
            ext_rcode: (record.ttl >> 24) as u8,
            version: (record.ttl >> 16) as u8,
            dnssec_ok: record.ttl & 0x8000 != 0,
            options,
        })
    }

    pub fn to_record(&self) -> DnsRecord {
        let mut data = Vec::new();
        for opt in &self.options {
            let wire = opt.wire_data();
            data.extend_from_slice(&opt.code().to_be_bytes());
            data.extend_from_slice(&(wire.len() as u16).to_be_bytes());
            data.extend_from_slice(&wire);
        }

        let mut ttl = ((self.ext_rcode as u32) << 24) | ((self.version as u32) << 16);
        if self.dnssec_ok {
            ttl |= 0x8000;
        }

        DnsRecord {
            name: String::new(),
            class: self.udp_size,
            ttl,
            data: RecordData::Opt(data),
        }
    }

    pub fn option(&self, code: u16) -> Option<&EdnsOption> {
        self.options.iter().find(|o| o.code() == code)
    }

    pub fn remove_option(&mut self, code: u16) {
        self.options.retain(|o| o.code() != code);
    }
}

impl DnsPacket {
    /// The decoded OPT record of the message, if present.
    pub fn edns(&self) -> Option<Edns> {
        self.resources
            .iter()
            .find(|r| r.rtype() == RecordType::Opt)
            .and_then(Edns::from_record)
    }

    /// Replace (or add) the OPT record.
    pub fn set_edns(&mut self, edns: &Edns) {
        self.clear_edns();
        self.resources.push(edns.to_record());
    }

    /// Remove the OPT record altogether.
    pub fn clear_edns(&mut self) {
        self.resources.retain(|r| r.rtype() != RecordType::Opt);
    }

    /// The decoded OPT record, adding a default one first if there is none.
    pub fn edns_or_default(&mut self) -> Edns {
        match self.edns() {
            Some(edns) => edns,
            None => {
                let edns = Edns::default();
                self.set_edns(&edns);
                edns
            }
        }
    }
}

/// True if the message carries the edns-tcp-keepalive option. Receiving it
/// over DoQ is a fatal error per RFC 9250.
pub fn has_tcp_keepalive(packet: &DnsPacket) -> bool {
    packet
        .edns()
        .map(|e| e.option(EDNS0_TCP_KEEPALIVE).is_some())
        .unwrap_or(false)
}

/// Pad `packet` with an EDNS(0) padding option so its encoded size is a
/// multiple of `block`. The message must already carry an OPT record.
fn pad_packet(packet: &mut DnsPacket, block: usize) {
    let mut edns = match packet.edns() {
        Some(edns) => edns,
        None => return,
    };

    // Measure with an empty padding option in place, then grow it to the
    // next block boundary. Growing the option data grows the message by
    // exactly the same number of bytes.
    edns.remove_option(EDNS0_PADDING);
    edns.options.push(EdnsOption::Padding(0));
    packet.set_edns(&edns);

    let len = match packet.to_bytes(crate::dns::protocol::MAX_MSG_SIZE) {
        Ok(bytes) => bytes.len(),
        Err(_) => return,
    };
    let pad = (block - len % block) % block;
    if pad > 0 {
        edns.remove_option(EDNS0_PADDING);
        edns.options.push(EdnsOption::Padding(pad));
        packet.set_edns(&edns);
    }
}

/// Pad a query to a multiple of 128 bytes (RFC 8467), used by the encrypted
/// upstream clients. Queries without EDNS(0) get a default OPT record first.
pub fn pad_query(query: &mut DnsPacket) {
    if query.edns().is_none() {
        query.set_edns(&Edns::default());
    }
    pad_packet(query, QUERY_PAD_BLOCK);
}

/// Pad a response to a multiple of 468 bytes (RFC 8467), but only if the
/// client indicated padding support by padding its query.
pub fn pad_answer(query: &DnsPacket, answer: &mut DnsPacket) {
    let client_padded = query
        .edns()
        .map(|e| e.option(EDNS0_PADDING).is_some())
        .unwrap_or(false);
    if !client_padded {
        return;
    }
    if answer.edns().is_none() {
        let mut edns = Edns::default();
        if let Some(q) = query.edns() {
            edns.udp_size = q.udp_size;
        }
        answer.set_edns(&edns);
    }
    pad_answer_unconditional(answer);
}

fn pad_answer_unconditional(answer: &mut DnsPacket) {
    pad_packet(answer, RESPONSE_PAD_BLOCK);
}

/// Remove any padding option; used on transports where padding only wastes
/// space.
pub fn strip_padding(packet: &mut DnsPacket) {
    if let Some(mut edns) = packet.edns() {
        if edns.option(EDNS0_PADDING).is_some() {
            edns.remove_option(EDNS0_PADDING);
            packet.set_edns(&edns);
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::RecordType;

    #[test]
    fn test_ecs_roundtrip() {
        let ecs = ClientSubnet::new("192.0.2.0".parse().unwrap(), 24);
        let parsed = ClientSubnet::parse(&ecs.serialize()).unwrap();
        assert_eq!(ecs, parsed);
        assert_eq!(1, parsed.family);
        assert_eq!(24, parsed.source_prefix);
    }

    #[test]
    fn test_edns_record_roundtrip() {
        let mut edns = Edns::default();
        edns.options
            .push(EdnsOption::ClientSubnet(ClientSubnet::new(
                "10.1.2.0".parse().unwrap(),
                24,
            )));
        edns.options.push(EdnsOption::ExtendedError {
            info_code: 15,
            extra_text: "blocked".to_string(),
        });

        let record = edns.to_record();
        assert_eq!(RecordType::Opt, record.rtype());

        let parsed = Edns::from_record(&record).unwrap();
        assert_eq!(edns, parsed);
    }

    #[test]
    fn test_query_padding_block_size() {
        let mut query = DnsPacket::query("www.example.com", RecordType::A);
        pad_query(&mut query);

        let len = query.to_bytes(crate::dns::protocol::MAX_MSG_SIZE).unwrap().len();
        assert_eq!(0, len % 128);
    }

    #[test]
    fn test_answer_padding_requires_client_padding() {
        let mut query = DnsPacket::query("www.example.com", RecordType::A);
        let mut answer = query.reply();
        pad_answer(&query, &mut answer);
        assert!(answer.edns().is_none());

        pad_query(&mut query);
        let mut answer = query.reply();
        pad_answer(&query, &mut answer);
        let len = answer
            .to_bytes(crate::dns::protocol::MAX_MSG_SIZE)
            .unwrap()
            .len();
        assert_eq!(0, len % 468);
    }

    #[test]
    fn test_strip_padding() {
        let mut query = DnsPacket::query("www.example.com", RecordType::A);
        pad_query(&mut query);
        assert!(has_padding(&query));

        strip_padding(&mut query);
        assert!(!has_padding(&query));

        fn has_padding(p: &DnsPacket) -> bool {
            p.edns()
                .map(|e| e.option(EDNS0_PADDING).is_some())
                .unwrap_or(false)
        }
    }

    #[test]
    fn test_tcp_keepalive_detection() {
        let mut query = DnsPacket::query("www.example.com", RecordType::A);
        assert!(!has_tcp_keepalive(&query));

        let mut edns = Edns::default();
        edns.options.push(EdnsOption::TcpKeepalive(Vec::new()));
        query.set_edns(&edns);
        assert!(has_tcp_keepalive(&query));
    }
}
