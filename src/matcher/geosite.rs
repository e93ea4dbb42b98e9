//! Reader for the varint-framed protobuf site databases (`geosite.dat` and
//! compatible files). The file is a sequence of length-delimited entries,
//! each carrying a country/list code and its domain rules. Only the entry
//! matching the requested code is decoded; the rest of the file is skipped
//! over by frame length.

use std::path::Path;

use super::{MatcherError, Result};

/// Wire types used by the format.
const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

/// Decode a varint at `pos`, returning the value and the bytes consumed.
pub(crate) fn read_varint(data: &[u8], pos: usize) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    let mut len = 0;
    loop {
        let byte = *data.get(pos + len)?;
        value |= ((byte & 0x7F) as u64) << shift;
        len += 1;
        if byte & 0x80 == 0 {
            return Some((value, len));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

/// One decoded protobuf field: number, wire type and payload location.
pub(crate) struct Field {
    pub number: u64,
    pub wire: u64,
    pub start: usize,
    pub end: usize,
    pub varint: u64,
}

/// Decode the field at `pos`, returning it and the position of the next
/// field.
pub(crate) fn read_field(data: &[u8], pos: usize) -> Option<(Field, usize)> {
    let (key, key_len) = read_varint(data, pos)?;
    let number = key >> 3;
    let wire = key & 0x7;
    let pos = pos + key_len;

    match wire {
        WIRE_VARINT => {
            let (value, len) = read_varint(data, pos)?;
            Some((
                Field {
                    number,
                    wire,
                    start: pos,
                    end: pos + len,
                    varint: value,
                },
                pos + len,
            ))
        }
        WIRE_LEN => {
            let (len, len_len) = read_varint(data, pos)?;
            let start = pos + len_len;
            let end = start + len as usize;
            if end > data.len() {
                return None;
            }
            Some((
                Field {
                    number,
                    wire,
                    start,
                    end,
                    varint: 0,
                },
                end,
            ))
        }
        WIRE_FIXED64 => Some((
            Field {
                number,
                wire,
                start: pos,
                end: pos + 8,
                varint: 0,
            },
            pos + 8,
        )),
        WIRE_FIXED32 => Some((
            Field {
                number,
                wire,
                start: pos,
                end: pos + 4,
                varint: 0,
            },
            pos + 4,
        )),
        _ => None,
    }
}

/// Matching mode of a site rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    /// Substring match
    Plain,
    /// Regular expression
    Regex,
    /// The name and any subdomain
    Domain,
    /// Exact name
    Full,
}

impl DomainKind {
    fn from_num(num: u64) -> DomainKind {
        match num {
            1 => DomainKind::Regex,
            2 => DomainKind::Domain,
            3 => DomainKind::Full,
            _ => DomainKind::Plain,
        }
    }
}

/// A single rule from a site list, with the attribute tags attached to it.
#[derive(Debug, Clone)]
pub struct SiteDomain {
    pub kind: DomainKind,
    pub value: String,
    pub attrs: Vec<String>,
}

fn parse_attribute(data: &[u8]) -> Option<String> {
    let mut pos = 0;
    let mut key = None;
    while pos < data.len() {
        let (field, next) = read_field(data, pos)?;
        if field.number == 1 && field.wire == WIRE_LEN {
            key = Some(String::from_utf8_lossy(&data[field.start..field.end]).to_string());
        }
        pos = next;
    }
    key
}

fn parse_domain(data: &[u8]) -> Option<SiteDomain> {
    let mut kind = DomainKind::Plain;
    let mut value = String::new();
    let mut attrs = Vec::new();

    let mut pos = 0;
    while pos < data.len() {
        let (field, next) = read_field(data, pos)?;
        match (field.number, field.wire) {
            (1, WIRE_VARINT) => kind = DomainKind::from_num(field.varint),
            (2, WIRE_LEN) => {
                value = String::from_utf8_lossy(&data[field.start..field.end]).to_lowercase()
            }
            (3, WIRE_LEN) => {
                if let Some(key) = parse_attribute(&data[field.start..field.end]) {
                    attrs.push(key.to_lowercase());
                }
            }
            _ => {}
        }
        pos = next;
    }

    if value.is_empty() {
        return None;
    }
    Some(SiteDomain { kind, value, attrs })
}

/// Decode the domains of one site entry.
fn parse_site_entry(data: &[u8]) -> Vec<SiteDomain> {
    let mut domains = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (field, next) = match read_field(data, pos) {
            Some(f) => f,
            None => break,
        };
        if field.number == 2 && field.wire == WIRE_LEN {
            if let Some(domain) = parse_domain(&data[field.start..field.end]) {
                domains.push(domain);
            }
        }
        pos = next;
    }
    domains
}

/// Country/list code of a site entry, without decoding its rules.
fn entry_code(data: &[u8]) -> Option<String> {
    let mut pos = 0;
    while pos < data.len() {
        let (field, next) = read_field(data, pos)?;
        if field.number == 1 && field.wire == WIRE_LEN {
            return Some(String::from_utf8_lossy(&data[field.start..field.end]).to_uppercase());
        }
        pos = next;
    }
    None
}

/// Load the rules of `code` from a site database file.
pub fn load_site(file: &Path, code: &str) -> Result<Vec<SiteDomain>> {
    let data = std::fs::read(file)?;
    let code = code.to_uppercase();

    let mut pos = 0;
    while pos < data.len() {
        let (field, next) = match read_field(&data, pos) {
            Some(f) => f,
            None => break,
        };
        if field.number == 1 && field.wire == WIRE_LEN {
            let entry = &data[field.start..field.end];
            if entry_code(entry).as_deref() == Some(code.as_str()) {
                return Ok(parse_site_entry(entry));
            }
        }
        pos = next;
    }

    Err(MatcherError::SiteNotFound(format!(
        "{}:{}",
        file.display(),
        code
    )))
}

/// Load `CODE[@attr...]`, keeping only rules that carry every listed
/// attribute.
pub fn load_site_with_attrs(file: &Path, site_with_attrs: &str) -> Result<Vec<SiteDomain>> {
    let mut parts = site_with_attrs.split('@');
    let code = parts.next().unwrap_or_default();
    if code.is_empty() {
        return Err(MatcherError::InvalidRule(site_with_attrs.to_string()));
    }
    let attrs: Vec<String> = parts.map(|a| a.to_lowercase()).collect();

    let domains = load_site(file, code)?;
    if attrs.is_empty() {
        return Ok(domains);
    }

    Ok(domains
        .into_iter()
        .filter(|d| attrs.iter().all(|a| d.attrs.contains(a)))
        .collect())
}

/// Test helper and reference for the wire format: encode a site list.
#[cfg(test)]
pub mod encode {
    use super::DomainKind;

    fn varint(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    fn len_field(number: u64, payload: &[u8], out: &mut Vec<u8>) {
        varint(number << 3 | 2, out);
        varint(payload.len() as u64, out);
        out.extend_from_slice(payload);
    }

    pub fn domain(kind: DomainKind, value: &str, attrs: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        let kind_num = match kind {
            DomainKind::Plain => 0u64,
            DomainKind::Regex => 1,
            DomainKind::Domain => 2,
            DomainKind::Full => 3,
        };
        varint(1 << 3, &mut out);
        varint(kind_num, &mut out);
        len_field(2, value.as_bytes(), &mut out);
        for attr in attrs {
            let mut a = Vec::new();
            len_field(1, attr.as_bytes(), &mut a);
            len_field(3, &a, &mut out);
        }
        out
    }

    pub fn site(code: &str, domains: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        len_field(1, code.as_bytes(), &mut out);
        for d in domains {
            len_field(2, d, &mut out);
        }
        out
    }

    pub fn site_list(sites: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for s in sites {
            len_field(1, s, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::io::Write;

    fn test_db() -> tempfile::NamedTempFile {
        let ads = encode::site(
            "ADS",
            &[
                encode::domain(DomainKind::Domain, "adnet.test", &[]),
                encode::domain(DomainKind::Full, "track.test", &["cn"]),
            ],
        );
        let cn = encode::site("CN", &[encode::domain(DomainKind::Regex, r".+\.cn$", &[])]);
        let data = encode::site_list(&[ads, cn]);

        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_load_site() {
        let f = test_db();
        let domains = load_site(f.path(), "ads").unwrap();
        assert_eq!(2, domains.len());
        assert_eq!(DomainKind::Domain, domains[0].kind);
        assert_eq!("adnet.test", domains[0].value);
        assert_eq!(vec!["cn".to_string()], domains[1].attrs);
    }

    #[test]
    fn test_load_site_case_insensitive() {
        let f = test_db();
        assert_eq!(1, load_site(f.path(), "cn").unwrap().len());
        assert_eq!(1, load_site(f.path(), "CN").unwrap().len());
    }

    #[test]
    fn test_unknown_code() {
        let f = test_db();
        assert!(load_site(f.path(), "nope").is_err());
    }

    #[test]
    fn test_attribute_filter() {
        let f = test_db();
        let all = load_site_with_attrs(f.path(), "ads").unwrap();
        assert_eq!(2, all.len());

        let cn_only = load_site_with_attrs(f.path(), "ads@cn").unwrap();
        assert_eq!(1, cn_only.len());
        assert_eq!("track.test", cn_only[0].value);

        let none = load_site_with_attrs(f.path(), "ads@cn@extra").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_varint() {
        assert_eq!(Some((0, 1)), read_varint(&[0x00], 0));
        assert_eq!(Some((300, 2)), read_varint(&[0xAC, 0x02], 0));
        assert_eq!(None, read_varint(&[0x80], 0));
    }
}
