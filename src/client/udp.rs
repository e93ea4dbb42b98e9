//! Plain DNS over UDP upstream client.

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::{dial_addr, ClientOptions};
use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, MAX_MSG_SIZE};
use crate::resolver::{ClientInfo, Resolver, Result};

pub struct UdpClient {
    id: String,
    endpoint: String,
    opt: ClientOptions,
}

impl UdpClient {
    pub fn new(id: &str, endpoint: &str, opt: ClientOptions) -> UdpClient {
        UdpClient {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            opt,
        }
    }
}

#[async_trait]
impl Resolver for UdpClient {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        _dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let addr = dial_addr(&self.endpoint, &self.opt).await?;
        log::debug!(
            "id={} client={} qname={} resolver={} protocol=udp querying upstream",
            self.id,
            ci,
            query.qname(),
            self.endpoint
        );

        let msg = query.to_bytes(MAX_MSG_SIZE)?;
        let response = timeout(self.opt.query_timeout, async {
            let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            socket.send(&msg).await?;

            // Responses not matching our query id are not ours, keep reading
            let mut buf = [0u8; MAX_MSG_SIZE];
            loop {
                let len = socket.recv(&mut buf).await?;
                if let Ok(packet) = DnsPacket::from_bytes(&buf[..len]) {
                    if packet.header.id == query.header.id && packet.header.response {
                        return Ok::<DnsPacket, std::io::Error>(packet);
                    }
                }
            }
        })
        .await?;

        Ok(Some(response?))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::{DnsRecord, RecordData, RecordType};

    /// One-shot UDP server echoing a fixed A record.
    async fn udp_server() -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_MSG_SIZE];
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let query = DnsPacket::from_bytes(&buf[..len]).unwrap();
            let mut answer = query.reply();
            answer.answers.push(DnsRecord::new(
                query.qname(),
                60,
                RecordData::A("192.0.2.1".parse().unwrap()),
            ));
            let out = answer.to_bytes(MAX_MSG_SIZE).unwrap();
            socket.send_to(&out, peer).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_udp_query() {
        let addr = udp_server().await;
        let client = UdpClient::new("test-udp", &addr.to_string(), Default::default());

        let query = DnsPacket::query("example.com.", RecordType::A);
        let response = client
            .resolve(&query, &Default::default(), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(query.header.id, response.header.id);
        assert_eq!(1, response.answers.len());
    }

    #[tokio::test]
    async fn test_udp_timeout() {
        // Nothing listening; rely on the timeout rather than an error
        let client = UdpClient::new(
            "test-udp",
            "127.0.0.1:1",
            ClientOptions {
                query_timeout: std::time::Duration::from_millis(100),
                ..Default::default()
            },
        );

        let query = DnsPacket::query("example.com.", RecordType::A);
        assert!(client.resolve(&query, &Default::default(), None).await.is_err());
    }
}
