//! Strips the authority and additional sections from responses, keeping
//! only the OPT pseudo-record.

use async_trait::async_trait;

use super::{ClientInfo, DynResolver, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, RecordType};

pub struct ResponseMinimize {
    id: String,
    resolver: DynResolver,
}

impl ResponseMinimize {
    pub fn new(id: &str, resolver: DynResolver) -> ResponseMinimize {
        ResponseMinimize {
            id: id.to_string(),
            resolver,
        }
    }
}

#[async_trait]
impl Resolver for ResponseMinimize {
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

        answer.authorities.clear();
        answer.resources.retain(|r| r.rtype() == RecordType::Opt);

        Ok(Some(answer))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}
