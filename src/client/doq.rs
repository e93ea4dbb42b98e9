//! DNS-over-QUIC upstream client (RFC 9250). One bidirectional stream per
//! query, two-byte length prefix, message id 0 on the wire.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use quinn::Endpoint;
use tokio::time::timeout;

use super::{dial_addr, host_port, ClientOptions};
use crate::client::Socks5Dialer;
use crate::dns::edns0::pad_query;
use crate::dns::protocol::{DnsPacket, MAX_MSG_SIZE};
use crate::resolver::{ClientInfo, ResolveError, Resolver, Result};

pub struct DoqClient {
    id: String,
    endpoint_addr: String,
    server_name: String,
    opt: DoqClientOptions,
    endpoint: Endpoint,
}

#[derive(Clone)]
pub struct DoqClientOptions {
    pub common: ClientOptions,
    pub tls_config: Arc<rustls::ClientConfig>,
    pub server_name: String,
}

impl DoqClient {
    pub fn new(id: &str, endpoint_addr: &str, opt: DoqClientOptions) -> Result<DoqClient> {
        let (host, _) = host_port(endpoint_addr)?;
        let server_name = if opt.server_name.is_empty() {
            host
        } else {
            opt.server_name.clone()
        };

        // The local endpoint is shared by all queries of this client
        let bind: SocketAddr = if endpoint_addr.starts_with('[') {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        };
        let mut endpoint = Endpoint::client(bind).map_err(ResolveError::Io)?;

        let mut tls_config = (*opt.tls_config).clone();
        tls_config.alpn_protocols = vec![b"doq".to_vec()];
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(tls_config)));

        Ok(DoqClient {
            id: id.to_string(),
            endpoint_addr: endpoint_addr.to_string(),
            server_name,
            opt,
            endpoint,
        })
    }
}

#[async_trait]
impl Resolver for DoqClient {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        _dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        log::debug!(
            "id={} client={} qname={} resolver={} protocol=doq querying upstream",
            self.id,
            ci,
            query.qname(),
            self.endpoint_addr
        );

        let addr = dial_addr(&self.endpoint_addr, &self.opt.common).await?;

        // RFC 9250 requires id 0 on the wire; pad like the other encrypted
        // transports
        let mut outgoing = query.clone();
        outgoing.header.id = 0;
        pad_query(&mut outgoing);
        let msg = outgoing.to_bytes(MAX_MSG_SIZE)?;

        let mut packet = timeout(self.opt.common.query_timeout, async {
            let connection = self
                .endpoint
                .connect(addr, &self.server_name)?
                .await?;
            let (mut send, mut recv) = connection.open_bi().await?;

            let mut out = Vec::with_capacity(2 + msg.len());
            out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
            out.extend_from_slice(&msg);
            send.write_all(&out).await?;
            send.finish().await.map_err(ResolveError::QuicWrite)?;

            let mut len_buf = [0u8; 2];
            recv.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;

            let mut body = vec![0u8; len];
            recv.read_exact(&mut body).await?;
            Ok::<DnsPacket, ResolveError>(DnsPacket::from_bytes(&body)?)
        })
        .await??;

        packet.header.id = query.header.id;
        Ok(Some(packet))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::tls::insecure_client_config;

    #[tokio::test]
    async fn test_doq_timeout_without_server() {
        let opt = DoqClientOptions {
            common: ClientOptions {
                query_timeout: std::time::Duration::from_millis(200),
                ..Default::default()
            },
            tls_config: insecure_client_config(),
            server_name: "localhost".to_string(),
        };
        let client = DoqClient::new("doq", "127.0.0.1:1", opt).unwrap();

        let query = DnsPacket::query("example.com.", crate::dns::protocol::RecordType::A);
        assert!(client.resolve(&query, &Default::default(), None).await.is_err());
    }
}
