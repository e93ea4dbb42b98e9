//! DNS-over-HTTPS listener (RFC 8484): GET with the base64url `dns`
//! parameter or POST with an `application/dns-message` body. The request
//! path and the CDN-resolved client address feed the router predicates.

use std::io::Read;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::RwLock;
use tiny_http::{Header, Method, Response, Server};

use super::{handle_query, ListenOptions, Listener, Transport};
use crate::metrics::ListenerMetrics;
use crate::resolver::{ClientInfo, DynResolver, ResolveError, Result};
use crate::tls::{CertConfig, CertMaterial};

const DOH_CONTENT_TYPE: &str = "application/dns-message";

/// CDN headers consulted for the original client address, in order of
/// preference.
const CLIENT_IP_HEADERS: [&str; 5] = [
    "x-real-ip",
    "CF-Connecting-IP",
    "X-Forwarded-For",
    "True-Client-IP",
    "X-Original-Forwarded-For",
];

pub struct DohListener {
    id: String,
    addr: String,
    opt: DohListenerOptions,
    resolver: DynResolver,
    metrics: Arc<ListenerMetrics>,
    tls: RwLock<Option<Arc<CertMaterial>>>,
    server: RwLock<Option<Arc<Server>>>,
}

#[derive(Clone, Default)]
pub struct DohListenerOptions {
    pub listen: ListenOptions,
    /// Serve plain HTTP when unset (behind a TLS-terminating frontend).
    pub tls: Option<Arc<CertMaterial>>,
    /// When set, CDN headers are only trusted for requests arriving from
    /// this network.
    pub http_proxy_net: Option<(IpAddr, u8)>,
    pub cert: CertConfig,
}

/// The original client address: CDN headers first, peer address otherwise.
fn client_ip(
    request: &tiny_http::Request,
    http_proxy_net: &Option<(IpAddr, u8)>,
) -> Option<IpAddr> {
    let peer = request.remote_addr().map(|addr| addr.ip());

    let headers_trusted = match http_proxy_net {
        Some(net) => super::is_allowed(std::slice::from_ref(net), peer),
        None => true,
    };
    if headers_trusted {
        for name in CLIENT_IP_HEADERS {
            let value = request
                .headers()
                .iter()
                .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
                .map(|h| h.value.as_str());
            if let Some(value) = value {
                let first = value.split(',').next().unwrap_or("").trim();
                if let Ok(ip) = first.parse() {
                    return Some(ip);
                }
            }
        }
    }
    peer
}

/// Extract the wire-format query from a GET or POST request.
fn query_from_request(request: &mut tiny_http::Request) -> Option<Vec<u8>> {
    match request.method() {
        Method::Get => {
            let url = request.url().to_string();
            let (_, params) = url.split_once('?')?;
            let dns = params
                .split('&')
                .find_map(|p| p.strip_prefix("dns="))?
                .to_string();
            URL_SAFE_NO_PAD.decode(dns).ok()
        }
        Method::Post => {
            let mut body = Vec::new();
            request.as_reader().read_to_end(&mut body).ok()?;
            Some(body)
        }
        _ => None,
    }
}

/// Everything the worker thread needs to serve requests.
#[derive(Clone)]
struct RequestContext {
    id: String,
    resolver: DynResolver,
    allowed_nets: Vec<(IpAddr, u8)>,
    http_proxy_net: Option<(IpAddr, u8)>,
    metrics: Arc<ListenerMetrics>,
    handle: tokio::runtime::Handle,
}

fn serve_request(ctx: &RequestContext, mut request: tiny_http::Request) {
    let path = request
        .url()
        .split('?')
        .next()
        .unwrap_or_default()
        .to_string();
    let ci = ClientInfo {
        source_ip: client_ip(&request, &ctx.http_proxy_net),
        listener: ctx.id.clone(),
        doh_path: path,
        ..Default::default()
    };

    let raw = match query_from_request(&mut request) {
        Some(raw) => raw,
        None => {
            ctx.metrics.err.add("request", 1);
            let _ = request.respond(Response::empty(400));
            return;
        }
    };

    let response = ctx.handle.block_on(handle_query(
        &ctx.id,
        Transport::Doh,
        &raw,
        ci,
        &ctx.resolver,
        &ctx.allowed_nets,
        &ctx.metrics,
    ));

    match response {
        Some(bytes) => {
            let header = match Header::from_bytes("Content-Type", DOH_CONTENT_TYPE) {
                Ok(header) => header,
                Err(_) => {
                    let _ = request.respond(Response::empty(500));
                    return;
                }
            };
            let _ = request.respond(Response::from_data(bytes).with_header(header));
        }
        None => {
            let _ = request.respond(Response::empty(500));
        }
    }
}

impl DohListener {
    pub fn new(id: &str, addr: &str, opt: DohListenerOptions, resolver: DynResolver) -> DohListener {
        DohListener {
            id: id.to_string(),
            addr: addr.to_string(),
            tls: RwLock::new(opt.tls.clone()),
            opt,
            resolver,
            metrics: Arc::new(ListenerMetrics::new("listener", id)),
            server: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Listener for DohListener {
    async fn start(&self) -> Result<()> {
        log::info!("id={} protocol=doh addr={} starting listener", self.id, self.addr);

        let tls = self.tls.read().clone();
        let server = match tls {
            Some(material) => Server::https(
                &self.addr,
                tiny_http::SslConfig {
                    certificate: material.cert.clone(),
                    private_key: material.key.clone(),
                },
            ),
            None => Server::http(&self.addr),
        }
        .map_err(|e| ResolveError::Config(format!("failed to start DoH server: {}", e)))?;

        let server = Arc::new(server);
        *self.server.write() = Some(server.clone());

        // tiny_http is synchronous; requests are served on a worker thread
        // which calls back into the runtime for resolution
        let ctx = RequestContext {
            id: self.id.clone(),
            resolver: self.resolver.clone(),
            allowed_nets: self.opt.listen.allowed_nets.clone(),
            http_proxy_net: self.opt.http_proxy_net,
            metrics: self.metrics.clone(),
            handle: tokio::runtime::Handle::current(),
        };
        tokio::task::spawn_blocking(move || {
            while let Ok(request) = server.recv() {
                serve_request(&ctx, request);
            }
        })
        .await
        .map_err(|e| ResolveError::Config(format!("DoH worker failed: {}", e)))?;

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        log::info!("id={} addr={} stopping listener", self.id, self.addr);
        if let Some(server) = self.server.read().as_ref() {
            server.unblock();
        }
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
        *self.tls.write() = Some(Arc::new(material));
        self.stop().await?;
        log::info!("id={} reloaded server certificate", self.id);
        Ok(())
    }
}
