//! Upstream clients, one per transport
//!
//! A client sends a wire-format query to one remote DNS server and returns
//! the response. All clients share the same option set: a query timeout, an
//! optional bootstrap address used to dial the endpoint without resolving
//! its hostname first, and an optional SOCKS5 dialer the panel can inject
//! per query.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::dns::protocol::{DnsPacket, RecordType};
use crate::resolver::{DynResolver, ResolveError, Result};

pub mod doh;
pub mod doq;
pub mod dot;
pub mod dtls;
pub mod socks;
pub mod tcp;
pub mod udp;

pub use doh::{DohClient, DohClientOptions};
pub use doq::{DoqClient, DoqClientOptions};
pub use dot::{DotClient, DotClientOptions};
pub use dtls::{DtlsClient, DtlsClientOptions};
pub use socks::Socks5Dialer;
pub use tcp::TcpClient;
pub use udp::UdpClient;

/// Timeout applied to a single upstream query when none is configured.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Options common to all upstream clients.
#[derive(Clone)]
pub struct ClientOptions {
    /// Dial this address instead of resolving the endpoint's hostname. The
    /// hostname is still used for TLS verification.
    pub bootstrap_addr: String,

    /// Per-query timeout.
    pub query_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            bootstrap_addr: String::new(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

lazy_static! {
    /// Process-wide bootstrap resolver. When set, upstream clients resolve
    /// their endpoint hostnames through it instead of the system resolver.
    static ref BOOTSTRAP_RESOLVER: RwLock<Option<DynResolver>> = RwLock::new(None);
}

/// Install the bootstrap resolver; called once by the pipeline builder.
pub fn set_bootstrap_resolver(resolver: DynResolver) {
    *BOOTSTRAP_RESOLVER.write() = Some(resolver);
}

/// Split an `address:port` endpoint.
pub fn host_port(endpoint: &str) -> Result<(String, u16)> {
    // Handle bracketed IPv6 as well as plain host:port
    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| ResolveError::Config(format!("invalid endpoint '{}'", endpoint)))?;
        let port = port
            .parse()
            .map_err(|_| ResolveError::Config(format!("invalid endpoint '{}'", endpoint)))?;
        return Ok((host.to_string(), port));
    }
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ResolveError::Config(format!("invalid endpoint '{}'", endpoint)))?;
    let port = port
        .parse()
        .map_err(|_| ResolveError::Config(format!("invalid endpoint '{}'", endpoint)))?;
    Ok((host.to_string(), port))
}

/// Resolve a hostname, going through the bootstrap resolver when one is
/// installed.
pub async fn resolve_host(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(ip);
    }

    let bootstrap = BOOTSTRAP_RESOLVER.read().clone();
    if let Some(resolver) = bootstrap {
        let query = DnsPacket::query(&format!("{}.", host.trim_end_matches('.')), RecordType::A);
        let ci = Default::default();
        if let Some(response) = resolver.resolve(&query, &ci, None).await? {
            if let Some(ip) = response.answers.iter().find_map(|r| r.ip()) {
                return Ok(ip);
            }
        }
        return Err(ResolveError::Config(format!(
            "bootstrap resolver returned no address for '{}'",
            host
        )));
    }

    let mut addrs = tokio::net::lookup_host((host, 0)).await.map_err(ResolveError::Io)?;
    addrs
        .next()
        .map(|a| a.ip())
        .ok_or_else(|| ResolveError::Config(format!("no address for '{}'", host)))
}

/// The socket address to dial for an endpoint, honouring the bootstrap
/// address override.
pub async fn dial_addr(endpoint: &str, opt: &ClientOptions) -> Result<SocketAddr> {
    let (host, port) = host_port(endpoint)?;
    let host = if opt.bootstrap_addr.is_empty() {
        host
    } else {
        opt.bootstrap_addr.clone()
    };
    let ip = resolve_host(&host).await?;
    Ok(SocketAddr::new(ip, port))
}
