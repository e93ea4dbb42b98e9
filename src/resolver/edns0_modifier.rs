//! Adds or deletes arbitrary EDNS(0) options by option code before
//! forwarding.

use async_trait::async_trait;

use super::{ClientInfo, DynResolver, ResolveError, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::edns0::{Edns, EdnsOption};
use crate::dns::protocol::DnsPacket;

#[derive(Clone, Debug)]
pub enum Edns0ModifierMode {
    Add { code: u16, data: Vec<u8> },
    Delete { code: u16 },
}

pub struct Edns0Modifier {
    id: String,
    resolver: DynResolver,
    mode: Edns0ModifierMode,
}

impl Edns0Modifier {
    pub fn new(id: &str, resolver: DynResolver, mode: Edns0ModifierMode) -> Edns0Modifier {
        Edns0Modifier {
            id: id.to_string(),
            resolver,
            mode,
        }
    }
}

#[async_trait]
impl Resolver for Edns0Modifier {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        if query.first_question().is_none() {
            return Err(ResolveError::NoQuestion);
        }

        let mut modified = query.clone();
        match &self.mode {
            Edns0ModifierMode::Add { code, data } => {
                let mut edns = modified.edns().unwrap_or_else(Edns::default);
                edns.remove_option(*code);
                edns.options.push(EdnsOption::Generic {
                    code: *code,
                    data: data.clone(),
                });
                modified.set_edns(&edns);
            }
            Edns0ModifierMode::Delete { code } => {
                if let Some(mut edns) = modified.edns() {
                    edns.remove_option(*code);
                    modified.set_edns(&edns);
                }
            }
        }

        self.resolver.resolve(&modified, ci, dialer).await
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}
