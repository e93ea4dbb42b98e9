//! IP database loading named CIDR groups from a GeoIP file (same
//! varint-framed protobuf framing as the site databases). An address is a
//! member if any of the selected groups covers it.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::geosite::read_field;
use super::trie::CidrTrie;
use super::{BlocklistMatch, IpDb, MatcherError, Result};

pub struct GeoIpDb {
    name: String,
    file: PathBuf,
    codes: Vec<String>,
    groups: Vec<Group>,
}

struct Group {
    code: String,
    v4: CidrTrie,
    v6: CidrTrie,
}

/// Decode one CIDR message: address bytes (field 1) and prefix (field 2).
fn parse_cidr(data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let mut ip = Vec::new();
    let mut prefix = 0usize;
    let mut pos = 0;
    while pos < data.len() {
        let (field, next) = read_field(data, pos)?;
        match (field.number, field.wire) {
            (1, 2) => ip = data[field.start..field.end].to_vec(),
            (2, 0) => prefix = field.varint as usize,
            _ => {}
        }
        pos = next;
    }
    if ip.len() != 4 && ip.len() != 16 {
        return None;
    }
    Some((ip, prefix))
}

fn parse_group(code: &str, data: &[u8]) -> Group {
    let mut group = Group {
        code: code.to_string(),
        v4: CidrTrie::new(),
        v6: CidrTrie::new(),
    };

    let mut pos = 0;
    while pos < data.len() {
        let (field, next) = match read_field(data, pos) {
            Some(f) => f,
            None => break,
        };
        if field.number == 2 && field.wire == 2 {
            if let Some((ip, prefix)) = parse_cidr(&data[field.start..field.end]) {
                match ip.len() {
                    4 => group.v4.add(&ip, prefix),
                    _ => group.v6.add(&ip, prefix),
                }
            }
        }
        pos = next;
    }
    group
}

fn entry_code(data: &[u8]) -> Option<String> {
    let mut pos = 0;
    while pos < data.len() {
        let (field, next) = read_field(data, pos)?;
        if field.number == 1 && field.wire == 2 {
            return Some(String::from_utf8_lossy(&data[field.start..field.end]).to_uppercase());
        }
        pos = next;
    }
    None
}

impl GeoIpDb {
    /// Load the groups named in `codes` from `file`. Unknown group names
    /// fail the build.
    pub fn load(name: &str, file: &Path, codes: &[String]) -> Result<GeoIpDb> {
        let data = std::fs::read(file)?;
        let wanted: Vec<String> = codes.iter().map(|c| c.to_uppercase()).collect();
        let mut groups = Vec::new();

        let mut pos = 0;
        while pos < data.len() {
            let (field, next) = match read_field(&data, pos) {
                Some(f) => f,
                None => break,
            };
            if field.number == 1 && field.wire == 2 {
                let entry = &data[field.start..field.end];
                if let Some(code) = entry_code(entry) {
                    if wanted.contains(&code) {
                        groups.push(parse_group(&code, entry));
                    }
                }
            }
            pos = next;
        }

        for code in &wanted {
            if !groups.iter().any(|g| &g.code == code) {
                return Err(MatcherError::SiteNotFound(format!(
                    "{}:{}",
                    file.display(),
                    code
                )));
            }
        }

        Ok(GeoIpDb {
            name: name.to_string(),
            file: file.to_path_buf(),
            codes: codes.to_vec(),
            groups,
        })
    }
}

#[async_trait]
impl IpDb for GeoIpDb {
    fn matches(&self, ip: IpAddr) -> Option<BlocklistMatch> {
        for group in &self.groups {
            let hit = match ip {
                IpAddr::V4(v4) => group.v4.lookup(&v4.octets()).is_some(),
                IpAddr::V6(v6) => group.v6.lookup(&v6.octets()).is_some(),
            };
            if hit {
                return Some(BlocklistMatch {
                    list: self.name.clone(),
                    rule: group.code.clone(),
                });
            }
        }
        None
    }

    fn add(&self, _rules: &[String]) -> Result<()> {
        // GeoIP groups are file-defined, incremental updates do not apply
        Ok(())
    }

    fn remove(&self, _rules: &[String]) -> Result<()> {
        Ok(())
    }

    async fn reload(&self) -> Result<Arc<dyn IpDb>> {
        Ok(Arc::new(GeoIpDb::load(&self.name, &self.file, &self.codes)?))
    }

    fn describe(&self) -> String {
        "GeoIP".to_string()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::io::Write;

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

    fn cidr(ip: &[u8], prefix: u64) -> Vec<u8> {
        let mut out = Vec::new();
        len_field(1, ip, &mut out);
        varint(2 << 3, &mut out);
        varint(prefix, &mut out);
        out
    }

    fn geoip_file() -> tempfile::NamedTempFile {
        let mut entry = Vec::new();
        len_field(1, b"PRIVATE", &mut entry);
        len_field(2, &cidr(&[10, 0, 0, 0], 8), &mut entry);
        len_field(2, &cidr(&[192, 168, 0, 0], 16), &mut entry);

        let mut other = Vec::new();
        len_field(1, b"TEST", &mut other);
        len_field(2, &cidr(&[192, 0, 2, 0], 24), &mut other);

        let mut data = Vec::new();
        len_field(1, &entry, &mut data);
        len_field(1, &other, &mut data);

        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&data).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_geoip_groups() {
        let f = geoip_file();
        let db = GeoIpDb::load("geo", f.path(), &["private".to_string()]).unwrap();

        let m = db.matches("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!("PRIVATE", m.rule);
        assert!(db.matches("192.0.2.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_any_group_matches() {
        let f = geoip_file();
        let db = GeoIpDb::load(
            "geo",
            f.path(),
            &["private".to_string(), "test".to_string()],
        )
        .unwrap();

        assert!(db.matches("10.1.2.3".parse().unwrap()).is_some());
        assert!(db.matches("192.0.2.1".parse().unwrap()).is_some());
        assert!(db.matches("8.8.8.8".parse().unwrap()).is_none());
    }

    #[test]
    fn test_unknown_group_fails() {
        let f = geoip_file();
        assert!(GeoIpDb::load("geo", f.path(), &["missing".to_string()]).is_err());
    }
}
