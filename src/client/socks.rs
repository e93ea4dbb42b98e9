//! Minimal SOCKS5 CONNECT dialer (RFC 1928/1929) used to direct upstream
//! DNS traffic through a proxy supplied by the panel.

use std::io::{Error, ErrorKind, Result};
use std::net::IpAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

/// Dialer configuration; cloning is cheap so the current dialer can be
/// passed down the pipeline per query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Socks5Dialer {
    pub address: String,
    pub username: String,
    pub password: String,
    /// Resolve the target hostname locally instead of on the proxy.
    pub resolve_local: bool,
}

impl Socks5Dialer {
    pub fn new(address: &str) -> Socks5Dialer {
        Socks5Dialer {
            address: address.to_string(),
            ..Default::default()
        }
    }

    /// Open a TCP connection to `host:port` through the proxy.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.address).await?;

        // Method negotiation
        let with_auth = !self.username.is_empty();
        if with_auth {
            stream
                .write_all(&[SOCKS_VERSION, 2, AUTH_NONE, AUTH_USERPASS])
                .await?;
        } else {
            stream.write_all(&[SOCKS_VERSION, 1, AUTH_NONE]).await?;
        }

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[0] != SOCKS_VERSION {
            return Err(Error::new(ErrorKind::InvalidData, "not a SOCKS5 proxy"));
        }
        match reply[1] {
            AUTH_NONE => {}
            AUTH_USERPASS if with_auth => self.authenticate(&mut stream).await?,
            _ => {
                return Err(Error::new(
                    ErrorKind::PermissionDenied,
                    "proxy rejected authentication methods",
                ))
            }
        }

        // CONNECT request
        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(ATYP_V4);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(ATYP_V6);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) if host.len() <= 255 => {
                request.push(ATYP_DOMAIN);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
            Err(_) => return Err(Error::new(ErrorKind::InvalidInput, "hostname too long")),
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            return Err(Error::new(
                ErrorKind::ConnectionRefused,
                format!("proxy connect failed with code {}", head[1]),
            ));
        }
        let addr_len = match head[3] {
            ATYP_V4 => 4,
            ATYP_V6 => 16,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            _ => return Err(Error::new(ErrorKind::InvalidData, "bad address type")),
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;

        Ok(stream)
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        if self.username.len() > 255 || self.password.len() > 255 {
            return Err(Error::new(ErrorKind::InvalidInput, "credentials too long"));
        }
        let mut msg = vec![0x01, self.username.len() as u8];
        msg.extend_from_slice(self.username.as_bytes());
        msg.push(self.password.len() as u8);
        msg.extend_from_slice(self.password.as_bytes());
        stream.write_all(&msg).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "proxy rejected credentials",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use tokio::net::TcpListener;

    /// Speaks just enough SOCKS5 to accept one CONNECT.
    async fn fake_proxy(listener: TcpListener) {
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        stream.write_all(&[0x05, 0x00]).await.unwrap();

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        let len = match head[3] {
            ATYP_V4 => 4,
            ATYP_DOMAIN => {
                let mut l = [0u8; 1];
                stream.read_exact(&mut l).await.unwrap();
                l[0] as usize
            }
            _ => 16,
        };
        let mut rest = vec![0u8; len + 2];
        stream.read_exact(&mut rest).await.unwrap();

        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_through_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(fake_proxy(listener));

        let dialer = Socks5Dialer::new(&addr.to_string());
        let stream = dialer.connect("dns.example.com", 853).await;
        assert!(stream.is_ok());
    }
}
