//! DNS-over-QUIC listener (RFC 9250). One bidirectional stream per query
//! with two-byte length framing; a query carrying the edns-tcp-keepalive
//! option aborts its stream without a response.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::watch;
use tokio::time::timeout;

use super::{handle_query, is_allowed, ListenOptions, Listener, Transport};
use crate::dns::edns0::has_tcp_keepalive;
use crate::dns::protocol::{DnsPacket, MAX_MSG_SIZE};
use crate::metrics::{get_var_int, Counter, ListenerMetrics};
use crate::resolver::{ClientInfo, DynResolver, ResolveError, Result};
use crate::tls::CertConfig;

/// Per-operation deadline on stream reads and writes.
const STREAM_IO_TIMEOUT: Duration = Duration::from_secs(1);

/// Deadline for a connection to open its next stream.
const ACCEPT_STREAM_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DoqListener {
    id: String,
    addr: String,
    opt: DoqListenerOptions,
    resolver: DynResolver,
    tls_config: RwLock<Arc<rustls::ServerConfig>>,
    metrics: Arc<DoqMetrics>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DoqListenerOptions {
    pub listen: ListenOptions,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub mutual_tls: bool,
    pub cert: CertConfig,
}

pub struct DoqMetrics {
    listener: ListenerMetrics,
    connection: Counter,
    stream: Counter,
}

impl DoqMetrics {
    fn new(id: &str) -> DoqMetrics {
        DoqMetrics {
            listener: ListenerMetrics::new("listener", id),
            connection: get_var_int("listener", id, "session"),
            stream: get_var_int("listener", id, "stream"),
        }
    }
}

impl DoqListener {
    pub fn new(id: &str, addr: &str, opt: DoqListenerOptions, resolver: DynResolver) -> DoqListener {
        let (shutdown, _) = watch::channel(false);
        DoqListener {
            id: id.to_string(),
            addr: addr.to_string(),
            tls_config: RwLock::new(opt.tls_config.clone()),
            opt,
            resolver,
            metrics: Arc::new(DoqMetrics::new(id)),
            shutdown,
        }
    }

    fn server_config(&self) -> quinn::ServerConfig {
        let mut tls = (*(*self.tls_config.read()).clone()).clone();
        tls.alpn_protocols = vec![b"doq".to_vec()];
        quinn::ServerConfig::with_crypto(Arc::new(tls))
    }
}

async fn serve_connection(
    id: String,
    connection: Connection,
    resolver: DynResolver,
    allowed: Vec<(std::net::IpAddr, u8)>,
    metrics: Arc<DoqMetrics>,
) {
    let peer = connection.remote_address();
    let tls_server_name = connection
        .handshake_data()
        .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
        .and_then(|data| data.server_name)
        .unwrap_or_default();

    let ci = ClientInfo {
        source_ip: Some(peer.ip()),
        listener: id.clone(),
        tls_server_name,
        ..Default::default()
    };

    if !is_allowed(&allowed, ci.source_ip) {
        log::debug!("id={} client={} rejecting incoming connection", id, peer);
        metrics.listener.drop.add(1);
        return;
    }
    log::debug!("id={} client={} accepting incoming connection", id, peer);
    metrics.connection.add(1);

    loop {
        let stream = match timeout(ACCEPT_STREAM_TIMEOUT, connection.accept_bi()).await {
            Ok(Ok(stream)) => stream,
            _ => break,
        };
        let id = id.clone();
        let ci = ci.clone();
        let resolver = resolver.clone();
        let allowed = allowed.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            serve_stream(id, stream, ci, resolver, allowed, metrics).await;
        });
    }
}

async fn serve_stream(
    id: String,
    (mut send, mut recv): (SendStream, RecvStream),
    ci: ClientInfo,
    resolver: DynResolver,
    allowed: Vec<(std::net::IpAddr, u8)>,
    metrics: Arc<DoqMetrics>,
) {
    metrics.stream.add(1);

    // Length prefix, then the query
    let mut len_buf = [0u8; 2];
    if timeout(STREAM_IO_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .map_or(true, |r| r.is_err())
    {
        metrics.listener.err.add("read", 1);
        return;
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    if len > MAX_MSG_SIZE {
        metrics.listener.err.add("read", 1);
        return;
    }
    let mut raw = vec![0u8; len];
    if timeout(STREAM_IO_TIMEOUT, recv.read_exact(&mut raw))
        .await
        .map_or(true, |r| r.is_err())
    {
        metrics.listener.err.add("read", 1);
        return;
    }

    // Receiving tcp-keepalive over DoQ is a fatal error for the stream
    if let Ok(query) = DnsPacket::from_bytes(&raw) {
        if has_tcp_keepalive(&query) {
            log::error!("id={} client={} received edns-tcp-keepalive, aborting", id, ci);
            metrics.listener.err.add("keepalive", 1);
            let _ = send.reset(quinn::VarInt::from_u32(2)); // DOQ_PROTOCOL_ERROR
            return;
        }
    }

    let response = match handle_query(&id, Transport::Doq, &raw, ci, &resolver, &allowed, &metrics.listener).await
    {
        Some(response) => response,
        None => return,
    };

    let mut out = Vec::with_capacity(2 + response.len());
    out.extend_from_slice(&(response.len() as u16).to_be_bytes());
    out.extend_from_slice(&response);
    if timeout(STREAM_IO_TIMEOUT, send.write_all(&out))
        .await
        .map_or(true, |r| r.is_err())
    {
        metrics.listener.err.add("send", 1);
        return;
    }
    let _ = send.finish().await;
}

#[async_trait]
impl Listener for DoqListener {
    async fn start(&self) -> Result<()> {
        log::info!("id={} protocol=doq addr={} starting listener", self.id, self.addr);

        self.shutdown.send_replace(false);
        let mut stopped = self.shutdown.subscribe();

        let addr: std::net::SocketAddr = self
            .addr
            .parse()
            .map_err(|_| ResolveError::Config(format!("invalid listen address '{}'", self.addr)))?;
        let endpoint = Endpoint::server(self.server_config(), addr).map_err(ResolveError::Io)?;

        loop {
            tokio::select! {
                _ = stopped.changed() => {
                    endpoint.close(quinn::VarInt::from_u32(0), b"");
                    return Ok(());
                }
                incoming = endpoint.accept() => {
                    let connecting = match incoming {
                        Some(connecting) => connecting,
                        None => return Ok(()),
                    };
                    let id = self.id.clone();
                    let resolver = self.resolver.clone();
                    let allowed = self.opt.listen.allowed_nets.clone();
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        match connecting.await {
                            Ok(connection) => {
                                serve_connection(id, connection, resolver, allowed, metrics).await;
                            }
                            Err(err) => {
                                log::debug!("id={} connection failed: {}", id, err);
                            }
                        }
                    });
                }
            }
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

    async fn cert_renew(&self) -> Result<()> {
        if !self.opt.cert.monitored() {
            return Ok(());
        }
        let material = self
            .opt
            .cert
            .renew()
            .map_err(|e| ResolveError::Config(e.to_string()))?;
        let config = crate::tls::tls_server_config(&material, self.opt.mutual_tls)
            .map_err(|e| ResolveError::Config(e.to_string()))?;

        *self.tls_config.write() = config;
        self.stop().await?;
        log::info!("id={} reloaded server certificate", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::client::{DoqClient, DoqClientOptions};
    use crate::dns::edns0::{Edns, EdnsOption};
    use crate::dns::protocol::RecordType;
    use crate::resolver::test_util::TestResolver;
    use crate::resolver::Resolver as _;
    use crate::tls::{insecure_client_config, self_signed, tls_server_config};

    async fn start_listener() -> std::net::SocketAddr {
        let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let material = self_signed(&["localhost".to_string()]).unwrap();
        let opt = DoqListenerOptions {
            listen: Default::default(),
            tls_config: tls_server_config(&material, false).unwrap(),
            mutual_tls: false,
            cert: Default::default(),
        };
        let resolver = Arc::new(TestResolver::with_ip("192.0.2.1")) as DynResolver;
        let listener = Arc::new(DoqListener::new(
            "test-doq-listener",
            &addr.to_string(),
            opt,
            resolver,
        ));
        tokio::spawn(async move { listener.start().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        addr
    }

    #[tokio::test]
    async fn test_doq_roundtrip() {
        let addr = start_listener().await;

        let opt = DoqClientOptions {
            common: Default::default(),
            tls_config: insecure_client_config(),
            server_name: "localhost".to_string(),
        };
        let client = DoqClient::new("doq-test-client", &addr.to_string(), opt).unwrap();

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
    async fn test_keepalive_aborts_stream() {
        let addr = start_listener().await;

        let opt = DoqClientOptions {
            common: crate::client::ClientOptions {
                query_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            tls_config: insecure_client_config(),
            server_name: "localhost".to_string(),
        };
        let client = DoqClient::new("doq-test-client", &addr.to_string(), opt).unwrap();

        let mut query = DnsPacket::query("example.com.", RecordType::A);
        let mut edns = Edns::default();
        edns.options.push(EdnsOption::TcpKeepalive(Vec::new()));
        query.set_edns(&edns);

        // The stream is aborted with no response
        assert!(client.resolve(&query, &Default::default(), None).await.is_err());
    }
}
