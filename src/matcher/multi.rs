//! Union databases combining several child databases with first-match-wins
//! semantics. Reloading returns a new union whose children have each been
//! reloaded.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{BlocklistMatch, IpDb, NameDb, NameMatch, Result};
use crate::dns::protocol::DnsQuestion;

pub struct MultiNameDb {
    name: String,
    dbs: Vec<Arc<dyn NameDb>>,
}

impl MultiNameDb {
    pub fn new(name: &str, dbs: Vec<Arc<dyn NameDb>>) -> MultiNameDb {
        MultiNameDb {
            name: name.to_string(),
            dbs,
        }
    }
}

#[async_trait]
impl NameDb for MultiNameDb {
    fn matches(&self, question: &DnsQuestion) -> Option<NameMatch> {
        self.dbs.iter().find_map(|db| db.matches(question))
    }

    async fn reload(&self) -> Result<Arc<dyn NameDb>> {
        let mut reloaded = Vec::with_capacity(self.dbs.len());
        for db in &self.dbs {
            reloaded.push(db.reload().await?);
        }
        Ok(Arc::new(MultiNameDb::new(&self.name, reloaded)))
    }

    fn describe(&self) -> String {
        "Multi".to_string()
    }
}

pub struct MultiIpDb {
    name: String,
    dbs: Vec<Arc<dyn IpDb>>,
}

impl MultiIpDb {
    pub fn new(name: &str, dbs: Vec<Arc<dyn IpDb>>) -> MultiIpDb {
        MultiIpDb {
            name: name.to_string(),
            dbs,
        }
    }
}

#[async_trait]
impl IpDb for MultiIpDb {
    fn matches(&self, ip: IpAddr) -> Option<BlocklistMatch> {
        self.dbs.iter().find_map(|db| db.matches(ip))
    }

    fn add(&self, rules: &[String]) -> Result<()> {
        for db in &self.dbs {
            db.add(rules)?;
        }
        Ok(())
    }

    fn remove(&self, rules: &[String]) -> Result<()> {
        for db in &self.dbs {
            db.remove(rules)?;
        }
        Ok(())
    }

    async fn reload(&self) -> Result<Arc<dyn IpDb>> {
        let mut reloaded = Vec::with_capacity(self.dbs.len());
        for db in &self.dbs {
            reloaded.push(db.reload().await?);
        }
        Ok(Arc::new(MultiIpDb::new(&self.name, reloaded)))
    }

    fn describe(&self) -> String {
        "Multi".to_string()
    }
}
