//! DNS-over-TLS listener (RFC 7858). Stream framing as on TCP, responses
//! padded per RFC 8467. The TLS config can be swapped by the cert-monitor
//! through a stop-rebuild-start cycle.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use super::{handle_query, ListenOptions, Listener, Transport};
use crate::dns::netutil::{read_message, write_message};
use crate::metrics::ListenerMetrics;
use crate::resolver::{ClientInfo, DynResolver, ResolveError, Result};
use crate::tls::CertConfig;

pub struct DotListener {
    id: String,
    addr: String,
    opt: DotListenerOptions,
    resolver: DynResolver,
    tls_config: RwLock<Arc<rustls::ServerConfig>>,
    metrics: Arc<ListenerMetrics>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct DotListenerOptions {
    pub listen: ListenOptions,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub mutual_tls: bool,
    pub cert: CertConfig,
}

impl DotListener {
    pub fn new(id: &str, addr: &str, opt: DotListenerOptions, resolver: DynResolver) -> DotListener {
        let (shutdown, _) = watch::channel(false);
        DotListener {
            id: id.to_string(),
            addr: addr.to_string(),
            tls_config: RwLock::new(opt.tls_config.clone()),
            opt,
            resolver,
            metrics: Arc::new(ListenerMetrics::new("listener", id)),
            shutdown,
        }
    }
}

async fn serve_conn(
    id: String,
    acceptor: TlsAcceptor,
    stream: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    resolver: DynResolver,
    allowed: Vec<(std::net::IpAddr, u8)>,
    metrics: Arc<ListenerMetrics>,
) {
    let mut stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(err) => {
            log::debug!("id={} client={} handshake failed: {}", id, peer, err);
            return;
        }
    };

    let tls_server_name = stream
        .get_ref()
        .1
        .server_name()
        .unwrap_or_default()
        .to_string();

    loop {
        let raw = match read_message(&mut stream).await {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let ci = ClientInfo {
            source_ip: Some(peer.ip()),
            listener: id.clone(),
            tls_server_name: tls_server_name.clone(),
            ..Default::default()
        };
        match handle_query(&id, Transport::Dot, &raw, ci, &resolver, &allowed, &metrics).await {
            Some(response) => {
                if write_message(&mut stream, &response).await.is_err() {
                    return;
                }
            }
            None => return,
        }
    }
}

#[async_trait]
impl Listener for DotListener {
    async fn start(&self) -> Result<()> {
        log::info!("id={} protocol=dot addr={} starting listener", self.id, self.addr);

        self.shutdown.send_replace(false);
        let mut stopped = self.shutdown.subscribe();

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
                    let acceptor = TlsAcceptor::from(self.tls_config.read().clone());
                    tokio::spawn(serve_conn(
                        self.id.clone(),
                        acceptor,
                        stream,
                        peer,
                        self.resolver.clone(),
                        self.opt.listen.allowed_nets.clone(),
                        self.metrics.clone(),
                    ));
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

        // In-flight connections finish against the old config; the restart
        // after stop() picks up the new one
        *self.tls_config.write() = config;
        self.stop().await?;
        log::info!("id={} reloaded server certificate", self.id);
        Ok(())
    }
}
