//! DNS-over-DTLS listener. OpenSSL drives the DTLS handshake; incoming
//! datagrams are demultiplexed by peer address onto per-session channels,
//! and each session wraps its channel in a small buffered reader so the
//! short framing reads (size, then body) work against whole datagrams.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{handle_query, ListenOptions, Listener, Transport};
use crate::dns::protocol::MAX_MSG_SIZE;
use crate::metrics::ListenerMetrics;
use crate::resolver::{ClientInfo, DynResolver, ResolveError, Result};
use crate::tls::CertConfig;

/// Sessions are torn down after this long without traffic.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct DtlsListener {
    id: String,
    addr: String,
    opt: DtlsListenerOptions,
    resolver: DynResolver,
    acceptor: RwLock<Arc<openssl::ssl::SslAcceptor>>,
    metrics: Arc<ListenerMetrics>,
    stop_flag: Arc<std::sync::atomic::AtomicBool>,
}

#[derive(Clone)]
pub struct DtlsListenerOptions {
    pub listen: ListenOptions,
    pub acceptor: Arc<openssl::ssl::SslAcceptor>,
    pub mutual_tls: bool,
    pub cert: CertConfig,
}

/// One peer's view of the shared socket: reads come from the demux channel,
/// writes go straight out. Leftover bytes of a datagram are buffered for
/// the next short read.
struct SessionChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    incoming: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("peer", &self.peer)
            .finish()
    }
}

impl Read for SessionChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.buffer.is_empty() {
            let datagram = self
                .incoming
                .recv_timeout(SESSION_IDLE_TIMEOUT)
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "session idle timeout")
                })?;
            self.buffer = datagram;
        }
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.drain(..n);
        Ok(n)
    }
}

impl Write for SessionChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(buf, self.peer)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct SessionParams {
    id: String,
    resolver: DynResolver,
    allowed: Vec<(std::net::IpAddr, u8)>,
    metrics: Arc<ListenerMetrics>,
    handle: tokio::runtime::Handle,
}

/// Run one DTLS session: handshake, then framed query/response exchanges.
fn serve_session(
    params: Arc<SessionParams>,
    acceptor: Arc<openssl::ssl::SslAcceptor>,
    channel: SessionChannel,
    peer: SocketAddr,
) {
    let mut stream = match acceptor.accept(channel) {
        Ok(stream) => stream,
        Err(err) => {
            log::debug!("id={} client={} handshake failed: {}", params.id, peer, err);
            return;
        }
    };

    let tls_server_name = stream
        .ssl()
        .servername(openssl::ssl::NameType::HOST_NAME)
        .unwrap_or_default()
        .to_string();

    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).is_err() {
            return;
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len > MAX_MSG_SIZE {
            return;
        }
        let mut raw = vec![0u8; len];
        if stream.read_exact(&mut raw).is_err() {
            return;
        }

        let ci = ClientInfo {
            source_ip: Some(peer.ip()),
            listener: params.id.clone(),
            tls_server_name: tls_server_name.clone(),
            ..Default::default()
        };
        let response = params.handle.block_on(handle_query(
            &params.id,
            Transport::Dtls,
            &raw,
            ci,
            &params.resolver,
            &params.allowed,
            &params.metrics,
        ));

        match response {
            Some(response) => {
                let mut out = Vec::with_capacity(2 + response.len());
                out.extend_from_slice(&(response.len() as u16).to_be_bytes());
                out.extend_from_slice(&response);
                if stream.write_all(&out).is_err() {
                    return;
                }
            }
            None => return,
        }
    }
}

impl DtlsListener {
    pub fn new(id: &str, addr: &str, opt: DtlsListenerOptions, resolver: DynResolver) -> DtlsListener {
        DtlsListener {
            id: id.to_string(),
            addr: addr.to_string(),
            acceptor: RwLock::new(opt.acceptor.clone()),
            opt,
            resolver,
            metrics: Arc::new(ListenerMetrics::new("listener", id)),
            stop_flag: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Listener for DtlsListener {
    async fn start(&self) -> Result<()> {
        log::info!("id={} protocol=dtls addr={} starting listener", self.id, self.addr);

        let socket = Arc::new(UdpSocket::bind(&self.addr)?);
        // The demux loop wakes up periodically to notice a stop request
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        let params = Arc::new(SessionParams {
            id: self.id.clone(),
            resolver: self.resolver.clone(),
            allowed: self.opt.listen.allowed_nets.clone(),
            metrics: self.metrics.clone(),
            handle: tokio::runtime::Handle::current(),
        });
        let acceptor = self.acceptor.read().clone();
        self.stop_flag
            .store(false, std::sync::atomic::Ordering::Relaxed);
        let stop_flag = self.stop_flag.clone();
        let listener_socket = socket.clone();

        let demux = tokio::task::spawn_blocking(move || {
            let sessions: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>> =
                Arc::new(Mutex::new(HashMap::new()));
            let mut buf = [0u8; MAX_MSG_SIZE];

            loop {
                if stop_flag.load(std::sync::atomic::Ordering::Relaxed) {
                    return;
                }
                let (len, peer) = match listener_socket.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(ref e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(_) => return,
                };
                let datagram = buf[..len].to_vec();

                let mut sessions_guard = sessions.lock();
                let stale = sessions_guard
                    .get(&peer)
                    .map(|tx| tx.send(datagram.clone()).is_err())
                    .unwrap_or(true);
                if stale {
                    // New peer (or a finished session): start a session
                    // thread fed by its own channel
                    let (tx, rx) = mpsc::channel();
                    let _ = tx.send(datagram);
                    sessions_guard.insert(peer, tx);

                    let channel = SessionChannel {
                        socket: listener_socket.clone(),
                        peer,
                        incoming: rx,
                        buffer: Vec::new(),
                    };
                    let params = params.clone();
                    let acceptor = acceptor.clone();
                    let sessions = sessions.clone();
                    std::thread::spawn(move || {
                        serve_session(params, acceptor, channel, peer);
                        sessions.lock().remove(&peer);
                    });
                }
            }
        });

        demux
            .await
            .map_err(|e| ResolveError::Config(format!("DTLS worker failed: {}", e)))?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        log::info!("id={} addr={} stopping listener", self.id, self.addr);
        // The demux loop observes the flag on its next read timeout
        self.stop_flag
            .store(true, std::sync::atomic::Ordering::Relaxed);
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
        let acceptor = crate::tls::dtls_server_config(&material, self.opt.mutual_tls)
            .map_err(|e| ResolveError::Config(e.to_string()))?;

        *self.acceptor.write() = Arc::new(acceptor);
        self.stop().await?;
        log::info!("id={} reloaded server certificate", self.id);
        Ok(())
    }
}
