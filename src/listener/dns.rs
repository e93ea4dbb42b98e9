//! Plain DNS listener for UDP or TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;

use super::{handle_query, ListenOptions, Listener, Transport};
use crate::dns::netutil::{read_message, write_message};
use crate::dns::protocol::MAX_MSG_SIZE;
use crate::metrics::ListenerMetrics;
use crate::resolver::{ClientInfo, DynResolver, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum DnsProtocol {
    Udp,
    Tcp,
}

pub struct DnsListener {
    id: String,
    addr: String,
    protocol: DnsProtocol,
    opt: ListenOptions,
    resolver: DynResolver,
    metrics: Arc<ListenerMetrics>,
    shutdown: watch::Sender<bool>,
}

impl DnsListener {
    pub fn new(
        id: &str,
        addr: &str,
        protocol: DnsProtocol,
        opt: ListenOptions,
        resolver: DynResolver,
    ) -> DnsListener {
        let (shutdown, _) = watch::channel(false);
        DnsListener {
            id: id.to_string(),
            addr: addr.to_string(),
            protocol,
            opt,
            resolver,
            metrics: Arc::new(ListenerMetrics::new("listener", id)),
            shutdown,
        }
    }

    async fn serve_udp(&self, mut stopped: watch::Receiver<bool>) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(&self.addr).await?);
        let mut buf = [0u8; MAX_MSG_SIZE];
        loop {
            tokio::select! {
                _ = stopped.changed() => return Ok(()),
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(r) => r,
                        Err(err) => {
                            log::warn!("id={} receive failed: {}", self.id, err);
                            continue;
                        }
                    };
                    let raw = buf[..len].to_vec();
                    let socket = socket.clone();
                    let resolver = self.resolver.clone();
                    let metrics = self.metrics.clone();
                    let allowed = self.opt.allowed_nets.clone();
                    let id = self.id.clone();
                    tokio::spawn(async move {
                        let ci = ClientInfo {
                            source_ip: Some(peer.ip()),
                            listener: id.clone(),
                            ..Default::default()
                        };
                        if let Some(response) =
                            handle_query(&id, Transport::Udp, &raw, ci, &resolver, &allowed, &metrics)
                                .await
                        {
                            let _ = socket.send_to(&response, peer).await;
                        }
                    });
                }
            }
        }
    }

    async fn serve_tcp(&self, mut stopped: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        loop {
            tokio::select! {
                _ = stopped.changed() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(err) => {
                            log::warn!("id={} accept failed: {}", self.id, err);
                            continue;
                        }
                    };
                    let resolver = self.resolver.clone();
                    let metrics = self.metrics.clone();
                    let allowed = self.opt.allowed_nets.clone();
                    let id = self.id.clone();
                    tokio::spawn(serve_tcp_conn(id, stream, peer, resolver, allowed, metrics));
                }
            }
        }
    }
}

async fn serve_tcp_conn(
    id: String,
    mut stream: tokio::net::TcpStream,
    peer: SocketAddr,
    resolver: DynResolver,
    allowed: Vec<(std::net::IpAddr, u8)>,
    metrics: Arc<ListenerMetrics>,
) {
    loop {
        let raw = match read_message(&mut stream).await {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let ci = ClientInfo {
            source_ip: Some(peer.ip()),
            listener: id.clone(),
            ..Default::default()
        };
        match handle_query(&id, Transport::Tcp, &raw, ci, &resolver, &allowed, &metrics).await {
            Some(response) => {
                if write_message(&mut stream, &response).await.is_err() {
                    return;
                }
            }
            // Drop means closing the connection
            None => return,
        }
    }
}

#[async_trait]
impl Listener for DnsListener {
    async fn start(&self) -> Result<()> {
        log::info!(
            "id={} protocol={} addr={} starting listener",
            self.id,
            match self.protocol {
                DnsProtocol::Udp => "udp",
                DnsProtocol::Tcp => "tcp",
            },
            self.addr
        );

        self.shutdown.send_replace(false);
        let stopped = self.shutdown.subscribe();
        match self.protocol {
            DnsProtocol::Udp => self.serve_udp(stopped).await,
            DnsProtocol::Tcp => self.serve_tcp(stopped).await,
        }
    }

    async fn stop(&self) -> Result<()> {
        log::info!("id={} addr={} stopping listener", self.id, self.addr);
        let _ = self.shutdown.send(true);
        Ok(())
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::{DnsPacket, RecordType, ResultCode};
    use crate::resolver::test_util::TestResolver;
    use std::time::Duration;

    async fn start_udp(resolver: DynResolver, opt: ListenOptions) -> SocketAddr {
        // Bind to an ephemeral port by probing with a scratch socket
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let listener = Arc::new(DnsListener::new(
            "test-udp-listener",
            &addr.to_string(),
            DnsProtocol::Udp,
            opt,
            resolver,
        ));
        tokio::spawn(async move { listener.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        addr
    }

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let resolver = Arc::new(TestResolver::with_ip("192.0.2.1")) as DynResolver;
        let addr = start_udp(resolver, Default::default()).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = DnsPacket::query("example.com.", RecordType::A);
        socket
            .send_to(&query.to_bytes(MAX_MSG_SIZE).unwrap(), addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_MSG_SIZE];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let response = DnsPacket::from_bytes(&buf[..len]).unwrap();
        assert_eq!(query.header.id, response.header.id);
        assert_eq!(1, response.answers.len());
    }

    #[tokio::test]
    async fn test_acl_refuses() {
        let resolver = Arc::new(TestResolver::with_ip("192.0.2.1")) as DynResolver;
        let opt = ListenOptions {
            allowed_nets: vec![("192.0.2.0".parse().unwrap(), 24)],
        };
        let addr = start_udp(resolver, opt).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = DnsPacket::query("example.com.", RecordType::A);
        socket
            .send_to(&query.to_bytes(MAX_MSG_SIZE).unwrap(), addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_MSG_SIZE];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let response = DnsPacket::from_bytes(&buf[..len]).unwrap();
        assert_eq!(ResultCode::REFUSED, response.header.rescode);
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let resolver = Arc::new(TestResolver::with_ip("192.0.2.1")) as DynResolver;
        let listener = Arc::new(DnsListener::new(
            "test-tcp-listener",
            &addr.to_string(),
            DnsProtocol::Tcp,
            Default::default(),
            resolver,
        ));
        tokio::spawn(async move { listener.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let query = DnsPacket::query("example.com.", RecordType::A);
        write_message(&mut stream, &query.to_bytes(MAX_MSG_SIZE).unwrap())
            .await
            .unwrap();
        let raw = read_message(&mut stream).await.unwrap();
        let response = DnsPacket::from_bytes(&raw).unwrap();
        assert_eq!(1, response.answers.len());
    }
}
