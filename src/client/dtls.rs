//! DNS-over-DTLS upstream client. Built on OpenSSL since rustls carries no
//! DTLS support; the handshake and query run on a blocking worker thread
//! over a connected UDP socket.

use std::io::{Read, Write};
use std::net::UdpSocket;

use async_trait::async_trait;

use super::{dial_addr, host_port, ClientOptions};
use crate::client::Socks5Dialer;
use crate::dns::edns0::pad_query;
use crate::dns::protocol::{DnsPacket, MAX_MSG_SIZE};
use crate::resolver::{ClientInfo, ResolveError, Resolver, Result};

pub struct DtlsClient {
    id: String,
    endpoint: String,
    server_name: String,
    opt: DtlsClientOptions,
    connector: openssl::ssl::SslConnector,
}

#[derive(Clone, Default)]
pub struct DtlsClientOptions {
    pub common: ClientOptions,
    /// Additional trusted CA in PEM form.
    pub ca: Option<Vec<u8>>,
    pub server_name: String,
}

/// Adapter turning a connected UDP socket into the `Read`/`Write` pair the
/// OpenSSL stream wants. Each datagram is one DTLS record; a small buffer
/// carries leftover bytes between the short reads of the DNS decoder.
#[derive(Debug)]
struct UdpChannel {
    socket: UdpSocket,
    buffer: Vec<u8>,
}

impl Read for UdpChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.buffer.is_empty() {
            let mut datagram = [0u8; MAX_MSG_SIZE];
            let len = self.socket.recv(&mut datagram)?;
            self.buffer.extend_from_slice(&datagram[..len]);
        }
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        Ok(n)
    }
}

impl Write for UdpChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.send(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl DtlsClient {
    pub fn new(id: &str, endpoint: &str, opt: DtlsClientOptions) -> Result<DtlsClient> {
        let (host, _) = host_port(endpoint)?;
        let server_name = if opt.server_name.is_empty() {
            host
        } else {
            opt.server_name.clone()
        };
        let connector = crate::tls::dtls_client_config(opt.ca.as_deref())
            .map_err(|e| ResolveError::Config(e.to_string()))?;

        Ok(DtlsClient {
            id: id.to_string(),
            endpoint: endpoint.to_string(),
            server_name,
            opt,
            connector,
        })
    }
}

#[async_trait]
impl Resolver for DtlsClient {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        _dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        log::debug!(
            "id={} client={} qname={} resolver={} protocol=dtls querying upstream",
            self.id,
            ci,
            query.qname(),
            self.endpoint
        );

        let addr = dial_addr(&self.endpoint, &self.opt.common).await?;

        let mut padded = query.clone();
        pad_query(&mut padded);
        let msg = padded.to_bytes(MAX_MSG_SIZE)?;

        let connector = self.connector.clone();
        let server_name = self.server_name.clone();
        let timeout = self.opt.common.query_timeout;
        let query_id = query.header.id;

        let response = tokio::task::spawn_blocking(move || {
            let socket = if addr.is_ipv4() {
                UdpSocket::bind("0.0.0.0:0")?
            } else {
                UdpSocket::bind("[::]:0")?
            };
            socket.connect(addr)?;
            socket.set_read_timeout(Some(timeout))?;
            socket.set_write_timeout(Some(timeout))?;

            let channel = UdpChannel {
                socket,
                buffer: Vec::new(),
            };
            let mut stream = connector
                .connect(&server_name, channel)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

            // Same two-byte framing as the stream transports
            let mut out = Vec::with_capacity(2 + msg.len());
            out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
            out.extend_from_slice(&msg);
            stream.write_all(&out)?;

            loop {
                let mut len_buf = [0u8; 2];
                stream.read_exact(&mut len_buf)?;
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut body = vec![0u8; len];
                stream.read_exact(&mut body)?;

                if let Ok(packet) = DnsPacket::from_bytes(&body) {
                    if packet.header.id == query_id {
                        return Ok(packet);
                    }
                }
            }
        })
        .await
        .map_err(|e| ResolveError::Config(format!("dtls worker failed: {}", e)))?;

        Ok(Some(response.map_err(ResolveError::Io)?))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}
