//! Plain DNS over TCP upstream client with two-byte length framing.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{dial_addr, host_port, ClientOptions};
use crate::client::Socks5Dialer;
use crate::dns::netutil::{read_message, write_message};
use crate::dns::protocol::{DnsPacket, MAX_MSG_SIZE};
use crate::resolver::{ClientInfo, Resolver, Result};

pub struct TcpClient {
    id: String,
    endpoint: String,
    opt: ClientOptions,
}

impl TcpClient {
    pub fn new(id: &str, endpoint: &str, opt: ClientOptions) -> TcpClient {
        TcpClient {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            opt,
        }
    }
}

/// Open the upstream connection, going through the SOCKS5 proxy when a
/// dialer is supplied.
pub(crate) async fn connect_stream(
    endpoint: &str,
    opt: &ClientOptions,
    dialer: Option<&Socks5Dialer>,
) -> Result<TcpStream> {
    match dialer {
        Some(dialer) => {
            let (host, port) = host_port(endpoint)?;
            let host = if opt.bootstrap_addr.is_empty() {
                host
            } else {
                opt.bootstrap_addr.clone()
            };
            Ok(dialer.connect(&host, port).await?)
        }
        None => {
            let addr = dial_addr(endpoint, opt).await?;
            Ok(TcpStream::connect(addr).await?)
        }
    }
}

#[async_trait]
impl Resolver for TcpClient {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        log::debug!(
            "id={} client={} qname={} resolver={} protocol=tcp querying upstream",
            self.id,
            ci,
            query.qname(),
            self.endpoint
        );

        let msg = query.to_bytes(MAX_MSG_SIZE)?;
        let response = timeout(self.opt.query_timeout, async {
            let mut stream = connect_stream(&self.endpoint, &self.opt, dialer).await?;
            write_message(&mut stream, &msg).await?;
            loop {
                let raw = read_message(&mut stream).await?;
                let packet = DnsPacket::from_bytes(&raw)?;
                if packet.header.id == query.header.id {
                    return Ok::<DnsPacket, crate::resolver::ResolveError>(packet);
                }
            }
        })
        .await??;

        Ok(Some(response))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::{DnsRecord, RecordData, RecordType};
    use tokio::net::TcpListener;

    async fn tcp_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let raw = read_message(&mut stream).await.unwrap();
            let query = DnsPacket::from_bytes(&raw).unwrap();
            let mut answer = query.reply();
            answer.answers.push(DnsRecord::new(
                query.qname(),
                60,
                RecordData::A("192.0.2.2".parse().unwrap()),
            ));
            let out = answer.to_bytes(MAX_MSG_SIZE).unwrap();
            write_message(&mut stream, &out).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_query() {
        let addr = tcp_server().await;
        let client = TcpClient::new("test-tcp", &addr.to_string(), Default::default());

        let query = DnsPacket::query("example.com.", RecordType::A);
        let response = client
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(1, response.answers.len());
    }

    #[tokio::test]
    async fn test_tcp_connection_refused() {
        let client = TcpClient::new("test-tcp", "127.0.0.1:1", Default::default());
        let query = DnsPacket::query("example.com.", RecordType::A);
        assert!(client.resolve(&query, &Default::default(), None).await.is_err());
    }
}
