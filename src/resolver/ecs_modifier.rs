//! Manipulates the EDNS(0) Client Subnet option of queries: add one derived
//! from the client address (or a fixed one), remove it, or reduce its
//! precision for privacy.

use std::net::IpAddr;

use async_trait::async_trait;

use super::{ClientInfo, DynResolver, ResolveError, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::edns0::{ClientSubnet, Edns, EdnsOption, EDNS0_SUBNET};
use crate::dns::protocol::DnsPacket;

#[derive(Clone, Debug)]
pub enum EcsModifierMode {
    /// Replace any ECS option with one for `address` (the client source
    /// address when none is configured), masked to the prefix widths.
    Add {
        address: Option<IpAddr>,
        prefix4: u8,
        prefix6: u8,
    },
    /// Remove the ECS option.
    Delete,
    /// Reduce the precision of an existing ECS option.
    Privacy { prefix4: u8, prefix6: u8 },
}

pub struct EcsModifier {
    id: String,
    resolver: DynResolver,
    mode: EcsModifierMode,
}

/// Zero the address bits beyond the prefix.
pub(crate) fn mask_ip(ip: IpAddr, prefix: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let masked = if prefix >= 32 {
                u32::from(v4)
            } else if prefix == 0 {
                0
            } else {
                u32::from(v4) & (u32::MAX << (32 - prefix))
            };
            IpAddr::V4(masked.into())
        }
        IpAddr::V6(v6) => {
            let masked = if prefix >= 128 {
                u128::from(v6)
            } else if prefix == 0 {
                0
            } else {
                u128::from(v6) & (u128::MAX << (128 - prefix))
            };
            IpAddr::V6(masked.into())
        }
    }
}

impl EcsModifier {
    pub fn new(id: &str, resolver: DynResolver, mode: EcsModifierMode) -> EcsModifier {
        EcsModifier {
            id: id.to_string(),
            resolver,
            mode,
        }
    }

    fn apply(&self, query: &mut DnsPacket, ci: &ClientInfo) {
        match &self.mode {
            EcsModifierMode::Delete => {
                if let Some(mut edns) = query.edns() {
                    if edns.option(EDNS0_SUBNET).is_some() {
                        edns.remove_option(EDNS0_SUBNET);
                        query.set_edns(&edns);
                        log::debug!(
                            "id={} client={} qname={} removing ecs option",
                            self.id,
                            ci,
                            query.qname()
                        );
                    }
                }
            }
            EcsModifierMode::Add {
                address,
                prefix4,
                prefix6,
            } => {
                let source = match address.or(ci.source_ip) {
                    Some(ip) => ip,
                    None => return,
                };
                let (masked, prefix) = match source {
                    IpAddr::V4(_) => (mask_ip(source, *prefix4), *prefix4),
                    IpAddr::V6(_) => (mask_ip(source, *prefix6), *prefix6),
                };

                let mut edns = query.edns().unwrap_or_else(Edns::default);
                edns.remove_option(EDNS0_SUBNET);
                edns.options
                    .push(EdnsOption::ClientSubnet(ClientSubnet::new(masked, prefix)));
                query.set_edns(&edns);
                log::debug!(
                    "id={} client={} qname={} ecs={}/{} adding ecs option",
                    self.id,
                    ci,
                    query.qname(),
                    masked,
                    prefix
                );
            }
            EcsModifierMode::Privacy { prefix4, prefix6 } => {
                let mut edns = match query.edns() {
                    Some(edns) => edns,
                    None => return,
                };
                let mut changed = false;
                for opt in edns.options.iter_mut() {
                    if let EdnsOption::ClientSubnet(ecs) = opt {
                        let prefix = match ecs.address {
                            IpAddr::V4(_) => *prefix4,
                            IpAddr::V6(_) => *prefix6,
                        };
                        ecs.address = mask_ip(ecs.address, prefix);
                        ecs.source_prefix = prefix;
                        changed = true;
                    }
                }
                if changed {
                    query.set_edns(&edns);
                    log::debug!(
                        "id={} client={} qname={} masking ecs option",
                        self.id,
                        ci,
                        query.qname()
                    );
                }
            }
        }
    }
}

#[async_trait]
impl Resolver for EcsModifier {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        if query.first_question().is_none() {
            return Err(ResolveError::NoQuestion);
        }

        // The parent's view of the query must not change
        let mut modified = query.clone();
        self.apply(&mut modified, ci);
        self.resolver.resolve(&modified, ci, dialer).await
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}
