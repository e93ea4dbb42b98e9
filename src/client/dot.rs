//! DNS-over-TLS upstream client (RFC 7858). Queries are padded before
//! leaving over the encrypted channel.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::tcp::connect_stream;
use super::{host_port, ClientOptions};
use crate::client::Socks5Dialer;
use crate::dns::edns0::pad_query;
use crate::dns::netutil::{read_message, write_message};
use crate::dns::protocol::{DnsPacket, MAX_MSG_SIZE};
use crate::resolver::{ClientInfo, ResolveError, Resolver, Result};
use crate::tls::CertConfig;

pub struct DotClient {
    id: String,
    endpoint: String,
    server_name: String,
    opt: DotClientOptions,
    tls_config: RwLock<Arc<rustls::ClientConfig>>,
}

#[derive(Clone)]
pub struct DotClientOptions {
    pub common: ClientOptions,
    pub tls_config: Arc<rustls::ClientConfig>,
    /// Overrides the TLS server name derived from the endpoint.
    pub server_name: String,
    pub cert: CertConfig,
}

impl DotClient {
    pub fn new(id: &str, endpoint: &str, opt: DotClientOptions) -> Result<DotClient> {
        let (host, _) = host_port(endpoint)?;
        let server_name = if opt.server_name.is_empty() {
            host
        } else {
            opt.server_name.clone()
        };
        Ok(DotClient {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            server_name,
            tls_config: RwLock::new(opt.tls_config.clone()),
            opt,
        })
    }
}

#[async_trait]
impl Resolver for DotClient {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        log::debug!(
            "id={} client={} qname={} resolver={} protocol=dot querying upstream",
            self.id,
            ci,
            query.qname(),
            self.endpoint
        );

        // Work on a copy, padding must not be visible to the caller
        let mut padded = query.clone();
        pad_query(&mut padded);
        let msg = padded.to_bytes(MAX_MSG_SIZE)?;

        let server_name = rustls::ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ResolveError::Config(format!("invalid server name '{}'", self.server_name)))?;
        let connector = TlsConnector::from(self.tls_config.read().clone());

        let response = timeout(self.opt.common.query_timeout, async {
            let stream = connect_stream(&self.endpoint, &self.opt.common, dialer).await?;
            let mut stream = connector.connect(server_name, stream).await?;
            write_message(&mut stream, &msg).await?;
            loop {
                let raw = read_message(&mut stream).await?;
                let packet = DnsPacket::from_bytes(&raw)?;
                if packet.header.id == query.header.id {
                    return Ok::<DnsPacket, ResolveError>(packet);
                }
            }
        })
        .await??;

        Ok(Some(response))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }

    async fn cert_renew(&self) -> Result<()> {
        if !self.opt.cert.monitored() {
            return Ok(());
        }
        let material = self
            .opt
            .cert
            .renew()
            .map_err(|e| ResolveError::Config(e.to_string()))?;
        let config = crate::tls::tls_client_config(
            material.ca.as_deref(),
            Some((&material.cert, &material.key)),
        )
        .map_err(|e| ResolveError::Config(e.to_string()))?;

        *self.tls_config.write() = config;
        log::info!("id={} reloaded client certificate", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::RecordType;
    use crate::tls::{insecure_client_config, self_signed, tls_server_config};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    async fn dot_server() -> std::net::SocketAddr {
        let material = self_signed(&["localhost".to_string()]).unwrap();
        let config = tls_server_config(&material, false).unwrap();
        let acceptor = TlsAcceptor::from(config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = acceptor.accept(stream).await.unwrap();
            let raw = read_message(&mut stream).await.unwrap();
            let query = DnsPacket::from_bytes(&raw).unwrap();
            let answer = query.reply();
            let out = answer.to_bytes(MAX_MSG_SIZE).unwrap();
            write_message(&mut stream, &out).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_dot_query_padded() {
        let addr = dot_server().await;
        let opt = DotClientOptions {
            common: Default::default(),
            tls_config: insecure_client_config(),
            server_name: "localhost".to_string(),
            cert: Default::default(),
        };
        let client = DotClient::new("test-dot", &addr.to_string(), opt).unwrap();

        let query = DnsPacket::query("example.com.", RecordType::A);
        let response = client
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(query.header.id, response.header.id);
        // The query copy was padded, the original must be untouched
        assert!(query.edns().is_none());
    }
}
