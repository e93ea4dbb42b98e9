//! Listeners terminate one transport each and forward every decoded query
//! to their configured resolver. The shared handler applies the access
//! control list, the padding policy (pad on DoT/DTLS, strip elsewhere) and
//! datagram truncation, and keeps the per-listener counters.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::dns::edns0::{pad_answer, strip_padding};
use crate::dns::protocol::{DnsPacket, MAX_MSG_SIZE, MIN_MSG_SIZE};
use crate::metrics::ListenerMetrics;
use crate::resolver::ecs_modifier::mask_ip;
use crate::resolver::{refused, servfail, ClientInfo, DynResolver, Resolver, Result};

pub mod admin;
pub mod dns;
pub mod doh;
pub mod doq;
pub mod dot;
pub mod dtls;

pub use admin::{AdminListener, AdminListenerOptions};
pub use dns::{DnsListener, DnsProtocol};
pub use doh::{DohListener, DohListenerOptions};
pub use doq::{DoqListener, DoqListenerOptions};
pub use dot::{DotListener, DotListenerOptions};
pub use dtls::{DtlsListener, DtlsListenerOptions};

/// Well-known ports per transport, applied when the configured address
/// omits one.
pub const PLAIN_DNS_PORT: u16 = 53;
pub const DOT_PORT: u16 = 853;
pub const DTLS_PORT: u16 = 853;
pub const DOH_PORT: u16 = 443;
pub const DOQ_PORT: u16 = 853;

/// A transport termination. Listeners are created by the builder, started
/// once, and stopped on shutdown or by the cert-monitor before a config
/// swap.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Serve until a fatal error or [`Listener::stop`].
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn describe(&self) -> String;

    /// Renew certificate material and restart with the new config.
    async fn cert_renew(&self) -> Result<()> {
        Ok(())
    }
}

pub type DynListener = std::sync::Arc<dyn Listener>;

/// Options shared by all listeners.
#[derive(Clone, Default)]
pub struct ListenOptions {
    /// Networks allowed to query this listener; empty allows everyone.
    pub allowed_nets: Vec<(IpAddr, u8)>,
}

pub(crate) fn is_allowed(allowed: &[(IpAddr, u8)], ip: Option<IpAddr>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let ip = match ip {
        Some(ip) => ip,
        None => return false,
    };
    allowed.iter().any(|(net, prefix)| {
        ip.is_ipv4() == net.is_ipv4() && mask_ip(ip, *prefix) == mask_ip(*net, *prefix)
    })
}

/// Append the default port if the address has none.
pub fn address_with_default(addr: &str, port: u16) -> String {
    if let Some(rest) = addr.strip_prefix('[') {
        if rest.contains("]:") {
            return addr.to_string();
        }
        return format!("{}:{}", addr, port);
    }
    match addr.matches(':').count() {
        0 => format!("{}:{}", addr, port),
        1 => addr.to_string(),
        // Bare IPv6 address
        _ => format!("[{}]:{}", addr, port),
    }
}

/// Padding/truncation rules differ per transport.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Udp,
    Tcp,
    Dot,
    Dtls,
    Doh,
    Doq,
}

impl Transport {
    fn name(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Dot => "dot",
            Transport::Dtls => "dtls",
            Transport::Doh => "doh",
            Transport::Doq => "doq",
        }
    }

    fn datagram(&self) -> bool {
        matches!(self, Transport::Udp | Transport::Dtls)
    }

    fn padded(&self) -> bool {
        matches!(self, Transport::Dot | Transport::Dtls)
    }
}

/// Decode a raw query, run it through the resolver and encode the reply.
/// `None` means drop: the caller closes the connection without responding.
pub(crate) async fn handle_query(
    id: &str,
    transport: Transport,
    raw: &[u8],
    ci: ClientInfo,
    resolver: &DynResolver,
    allowed_nets: &[(IpAddr, u8)],
    metrics: &ListenerMetrics,
) -> Option<Vec<u8>> {
    let query = match DnsPacket::from_bytes(raw) {
        Ok(query) => query,
        Err(err) => {
            metrics.err.add("unpack", 1);
            log::debug!("id={} client={} failed to decode query: {}", id, ci, err);
            return None;
        }
    };

    log::debug!(
        "id={} client={} qname={} protocol={} received query",
        id,
        ci,
        query.qname(),
        transport.name()
    );
    metrics.query.add(1);

    let mut answer = if is_allowed(allowed_nets, ci.source_ip) {
        match resolver.resolve(&query, &ci, None).await {
            Ok(Some(answer)) => answer,
            Ok(None) => {
                metrics.drop.add(1);
                return None;
            }
            Err(err) => {
                metrics.err.add("resolve", 1);
                log::error!("id={} client={} qname={} failed to resolve: {}", id, ci, query.qname(), err);
                servfail(&query)
            }
        }
    } else {
        metrics.err.add("acl", 1);
        log::debug!("id={} client={} refusing client ip", id, ci);
        refused(&query)
    };

    // Encrypted datagram/stream transports get padded answers, everything
    // else has padding stripped
    if transport.padded() {
        pad_answer(&query, &mut answer);
    } else {
        strip_padding(&mut answer);
    }

    // Size limit for datagram transports comes from the client's EDNS(0)
    let max_size = if transport.datagram() {
        query
            .edns()
            .map(|e| e.udp_size as usize)
            .unwrap_or(MIN_MSG_SIZE)
            .clamp(MIN_MSG_SIZE, MAX_MSG_SIZE)
    } else {
        MAX_MSG_SIZE
    };

    metrics.response.add(&answer.header.rescode.to_string(), 1);
    match answer.to_bytes(max_size) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            metrics.err.add("encode", 1);
            log::error!("id={} failed to encode response: {}", id, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_is_allowed() {
        let nets = vec![("10.0.0.0".parse().unwrap(), 8u8)];
        assert!(is_allowed(&nets, Some("10.1.2.3".parse().unwrap())));
        assert!(!is_allowed(&nets, Some("192.168.1.1".parse().unwrap())));
        assert!(!is_allowed(&nets, None));
        assert!(is_allowed(&[], Some("192.168.1.1".parse().unwrap())));
        assert!(is_allowed(&[], None));
    }

    #[test]
    fn test_address_with_default() {
        assert_eq!("127.0.0.1:53", address_with_default("127.0.0.1", 53));
        assert_eq!("127.0.0.1:5353", address_with_default("127.0.0.1:5353", 53));
        assert_eq!("[::1]:53", address_with_default("::1", 53));
        assert_eq!("[::1]:5353", address_with_default("[::1]:5353", 53));
        assert_eq!("0.0.0.0:853", address_with_default("0.0.0.0", 853));
    }
}
