//! implements the DNS protocol in a transport agnostic fashion

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// Smallest message size every transport must accept (RFC 1035).
pub const MIN_MSG_SIZE: usize = 512;

/// Upper bound on any DNS message.
pub const MAX_MSG_SIZE: usize = 65535;

/// `RecordType` is the type of a record or of the record requested by a
/// question. Unknown types retain their numeric value so they survive a
/// decode/encode round trip.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Hash)]
pub enum RecordType {
    A,     // 1
    Ns,    // 2
    Cname, // 5
    Soa,   // 6
    Ptr,   // 12
    Mx,    // 15
    Txt,   // 16
    Aaaa,  // 28
    Srv,   // 33
    Opt,   // 41
    Unknown(u16),
}

impl RecordType {
    pub fn to_num(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Srv => 33,
            RecordType::Opt => 41,
            RecordType::Unknown(x) => x,
        }
    }

    pub fn from_num(num: u16) -> RecordType {
        match num {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            6 => RecordType::Soa,
            12 => RecordType::Ptr,
            15 => RecordType::Mx,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            33 => RecordType::Srv,
            41 => RecordType::Opt,
            _ => RecordType::Unknown(num),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Unknown(x) => write!(f, "TYPE{}", x),
            other => write!(f, "{}", format!("{:?}", other).to_uppercase()),
        }
    }
}

/// The result code of a response as carried in the header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Hash)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The `IN` class; all queries this service routes use it.
pub const CLASS_IN: u16 = 1;

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | (self.opcode << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: RecordType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            qclass: CLASS_IN,
        }
    }

    pub fn binary_len(&self) -> usize {
        self.name
            .split('.')
            .map(|x| x.len() + 1)
            .fold(1, |x, y| x + y)
            + 4
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(self.qclass)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = RecordType::from_num(buffer.read_u16()?);
        self.qclass = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.qtype)
    }
}

/// The type-specific payload of a resource record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(String),
    Cname(String),
    Ptr(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Soa {
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Txt(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// EDNS(0) pseudo-record payload; the record header fields carry the
    /// advertised UDP size and extended flags, see the `edns0` module.
    Opt(Vec<u8>),
    Unknown {
        rtype: u16,
        data: Vec<u8>,
    },
}

impl RecordData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Aaaa(_) => RecordType::Aaaa,
            RecordData::Ns(_) => RecordType::Ns,
            RecordData::Cname(_) => RecordType::Cname,
            RecordData::Ptr(_) => RecordType::Ptr,
            RecordData::Mx { .. } => RecordType::Mx,
            RecordData::Soa { .. } => RecordType::Soa,
            RecordData::Txt(_) => RecordType::Txt,
            RecordData::Srv { .. } => RecordType::Srv,
            RecordData::Opt(_) => RecordType::Opt,
            RecordData::Unknown { rtype, .. } => RecordType::Unknown(*rtype),
        }
    }
}

/// A resource record: common header plus type-specific payload. Keeping the
/// header uniform lets the TTL and response filters treat all records alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsRecord {
    pub name: String,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl DnsRecord {
    pub fn new(name: &str, ttl: u32, data: RecordData) -> DnsRecord {
        DnsRecord {
            name: name.to_string(),
            class: CLASS_IN,
            ttl,
            data,
        }
    }

    /// A or AAAA record for the given address, picked by address family.
    pub fn from_ip(name: &str, class: u16, ttl: u32, ip: IpAddr) -> DnsRecord {
        let data = match ip {
            IpAddr::V4(addr) => RecordData::A(addr),
            IpAddr::V6(addr) => RecordData::Aaaa(addr),
        };
        DnsRecord {
            name: name.to_string(),
            class,
            ttl,
            data,
        }
    }

    pub fn rtype(&self) -> RecordType {
        self.data.rtype()
    }

    /// The address payload for A/AAAA records, used by the response filters.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.data {
            RecordData::A(addr) => Some(IpAddr::V4(addr)),
            RecordData::Aaaa(addr) => Some(IpAddr::V6(addr)),
            _ => None,
        }
    }

    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut name = String::new();
        buffer.read_qname(&mut name)?;

        let rtype_num = buffer.read_u16()?;
        let rtype = RecordType::from_num(rtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()? as usize;

        let data = match rtype {
            RecordType::A => {
                let raw_addr = buffer.read_u32()?;
                RecordData::A(Ipv4Addr::from(raw_addr))
            }
            RecordType::Aaaa => {
                let mut octets = [0u8; 16];
                for octet in octets.iter_mut() {
                    *octet = buffer.read()?;
                }
                RecordData::Aaaa(Ipv6Addr::from(octets))
            }
            RecordType::Ns => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                RecordData::Ns(host)
            }
            RecordType::Cname => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                RecordData::Cname(host)
            }
            RecordType::Ptr => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                RecordData::Ptr(host)
            }
            RecordType::Mx => {
                let preference = buffer.read_u16()?;
                let mut exchange = String::new();
                buffer.read_qname(&mut exchange)?;
                RecordData::Mx {
                    preference,
                    exchange,
                }
            }
            RecordType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;
                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                RecordData::Soa {
                    m_name,
                    r_name,
                    serial: buffer.read_u32()?,
                    refresh: buffer.read_u32()?,
                    retry: buffer.read_u32()?,
                    expire: buffer.read_u32()?,
                    minimum: buffer.read_u32()?,
                }
            }
            RecordType::Txt => {
                // Concatenation of the character-strings in the payload
                let mut txt = String::new();
                let mut remaining = data_len;
                while remaining > 0 {
                    let len = buffer.read()? as usize;
                    let cur_pos = buffer.pos();
                    txt.push_str(&String::from_utf8_lossy(buffer.get_range(cur_pos, len)?));
                    buffer.step(len)?;
                    remaining = remaining.saturating_sub(len + 1);
                }
                RecordData::Txt(txt)
            }
            RecordType::Srv => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;
                let mut target = String::new();
                buffer.read_qname(&mut target)?;
                RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            RecordType::Opt => {
                let cur_pos = buffer.pos();
                let data = buffer.get_range(cur_pos, data_len)?.to_vec();
                buffer.step(data_len)?;
                RecordData::Opt(data)
            }
            RecordType::Unknown(_) => {
                let cur_pos = buffer.pos();
                let data = buffer.get_range(cur_pos, data_len)?.to_vec();
                buffer.step(data_len)?;
                RecordData::Unknown {
                    rtype: rtype_num,
                    data,
                }
            }
        };

        Ok(DnsRecord {
            name,
            class,
            ttl,
            data,
        })
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.rtype().to_num())?;
        buffer.write_u16(self.class)?;
        buffer.write_u32(self.ttl)?;

        // Placeholder length, payload, then backfill
        let len_pos = buffer.pos();
        buffer.write_u16(0)?;

        match &self.data {
            RecordData::A(addr) => {
                for octet in addr.octets() {
                    buffer.write_u8(octet)?;
                }
            }
            RecordData::Aaaa(addr) => {
                for octet in addr.octets() {
                    buffer.write_u8(octet)?;
                }
            }
            RecordData::Ns(host) | RecordData::Cname(host) | RecordData::Ptr(host) => {
                buffer.write_qname(host)?;
            }
            RecordData::Mx {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference)?;
                buffer.write_qname(exchange)?;
            }
            RecordData::Soa {
                m_name,
                r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(*serial)?;
                buffer.write_u32(*refresh)?;
                buffer.write_u32(*retry)?;
                buffer.write_u32(*expire)?;
                buffer.write_u32(*minimum)?;
            }
            RecordData::Txt(data) => {
                // One character-string per 255-byte chunk
                for chunk in data.as_bytes().chunks(255) {
                    buffer.write_u8(chunk.len() as u8)?;
                    for b in chunk {
                        buffer.write_u8(*b)?;
                    }
                }
            }
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority)?;
                buffer.write_u16(*weight)?;
                buffer.write_u16(*port)?;
                buffer.write_qname(target)?;
            }
            RecordData::Opt(data) | RecordData::Unknown { data, .. } => {
                for b in data {
                    buffer.write_u8(*b)?;
                }
            }
        }

        let size = buffer.pos() - (len_pos + 2);
        buffer.set_u16(len_pos, size as u16)?;

        Ok(buffer.pos() - start_pos)
    }
}

/// Representation of a complete DNS message
///
/// A message can be read and written in a single operation and is used both
/// by the network facing components and internally by the resolver pipeline.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    /// A query for a single question with a random id.
    pub fn query(name: &str, qtype: RecordType) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = rand::random();
        packet.header.recursion_desired = true;
        packet
            .questions
            .push(DnsQuestion::new(name.to_string(), qtype));
        packet
    }

    /// Start of a reply: copies id, opcode, RD flag and the question section.
    pub fn reply(&self) -> DnsPacket {
        let mut answer = DnsPacket::new();
        answer.header.id = self.header.id;
        answer.header.opcode = self.header.opcode;
        answer.header.response = true;
        answer.header.recursion_desired = self.header.recursion_desired;
        answer.header.recursion_available = true;
        answer.questions = self.questions.clone();
        answer
    }

    pub fn first_question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }

    /// The query name of the first question, for logging.
    pub fn qname(&self) -> &str {
        self.questions
            .first()
            .map(|q| q.name.as_str())
            .unwrap_or("")
    }

    /// Minimum field of the first SOA record in the authority section, used
    /// for negative caching.
    pub fn soa_min_ttl(&self) -> Option<u32> {
        for record in &self.authorities {
            if let RecordData::Soa { minimum, .. } = record.data {
                return Some(minimum);
            }
        }
        None
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new(String::new(), RecordType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            result.answers.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.authoritative_entries {
            result.authorities.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.resource_entries {
            result.resources.push(DnsRecord::read(buffer)?);
        }

        Ok(result)
    }

    /// Decode a message from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Result<DnsPacket> {
        let mut buffer = VectorPacketBuffer::from_bytes(data);
        DnsPacket::from_buffer(&mut buffer)
    }

    /// Write the message, dropping tail records and setting the TC flag if
    /// the encoded size would exceed `max_size`.
    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();

        let mut size = self.header.binary_len();
        for question in &self.questions {
            size += question.binary_len();
            question.write(&mut test_buffer)?;
        }

        let mut record_count = 0;
        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
        {
            size += rec.write(&mut test_buffer)?;
            if size > max_size {
                self.header.truncated_message = true;
                break;
            }
            record_count += 1;
        }

        let answers = record_count.min(self.answers.len());
        let authorities = record_count
            .saturating_sub(self.answers.len())
            .min(self.authorities.len());
        let resources = record_count.saturating_sub(self.answers.len() + self.authorities.len());

        self.header.questions = self.questions.len() as u16;
        self.header.answers = answers as u16;
        self.header.authoritative_entries = authorities as u16;
        self.header.resource_entries = resources as u16;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }

    /// Encode to raw bytes, truncating to `max_size`.
    pub fn to_bytes(&self, max_size: usize) -> Result<Vec<u8>> {
        let mut packet = self.clone();
        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, max_size)?;
        Ok(buffer.buffer)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

    #[test]
    fn test_packet_roundtrip() {
        let mut packet = DnsPacket::new();
        packet.header.id = 1337;
        packet.header.response = true;

        packet
            .questions
            .push(DnsQuestion::new("example.com".to_string(), RecordType::Ns));
        packet.answers.push(DnsRecord::new(
            "example.com",
            3600,
            RecordData::Ns("ns1.example.com".to_string()),
        ));
        packet.answers.push(DnsRecord::new(
            "example.com",
            3600,
            RecordData::Ns("ns2.example.com".to_string()),
        ));
        packet.authorities.push(DnsRecord::new(
            "example.com",
            1800,
            RecordData::Soa {
                m_name: "ns1.example.com".to_string(),
                r_name: "hostmaster.example.com".to_string(),
                serial: 2024010101,
                refresh: 7200,
                retry: 3600,
                expire: 1209600,
                minimum: 300,
            },
        ));

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, MAX_MSG_SIZE).unwrap();

        buffer.seek(0).unwrap();
        let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();

        assert_eq!(packet.questions[0], parsed.questions[0]);
        assert_eq!(packet.answers[0], parsed.answers[0]);
        assert_eq!(packet.answers[1], parsed.answers[1]);
        assert_eq!(packet.authorities[0], parsed.authorities[0]);
        assert_eq!(parsed.soa_min_ttl(), Some(300));
    }

    #[test]
    fn test_truncation() {
        let mut packet = DnsPacket::new();
        packet.header.id = 99;
        packet
            .questions
            .push(DnsQuestion::new("example.com".to_string(), RecordType::A));
        for i in 0..64u32 {
            packet.answers.push(DnsRecord::new(
                "example.com",
                60,
                RecordData::A(Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8)),
            ));
        }

        let bytes = packet.to_bytes(MIN_MSG_SIZE).unwrap();
        assert!(bytes.len() <= MIN_MSG_SIZE);

        let parsed = DnsPacket::from_bytes(&bytes).unwrap();
        assert!(parsed.header.truncated_message);
        assert!(parsed.answers.len() < 64);
    }

    #[test]
    fn test_reply_copies_question() {
        let query = DnsPacket::query("www.example.com", RecordType::A);
        let answer = query.reply();

        assert_eq!(query.header.id, answer.header.id);
        assert!(answer.header.response);
        assert_eq!(query.questions, answer.questions);
    }

    #[test]
    fn test_record_ip_accessor() {
        let a = DnsRecord::from_ip("x.test", CLASS_IN, 60, "1.2.3.4".parse().unwrap());
        assert_eq!(a.rtype(), RecordType::A);
        assert_eq!(a.ip(), Some("1.2.3.4".parse().unwrap()));

        let aaaa = DnsRecord::from_ip("x.test", CLASS_IN, 60, "::1".parse().unwrap());
        assert_eq!(aaaa.rtype(), RecordType::Aaaa);

        let ns = DnsRecord::new("x.test", 60, RecordData::Ns("ns.test".to_string()));
        assert_eq!(ns.ip(), None);
    }
}
