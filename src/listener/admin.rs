//! Admin listener serving the process metrics registry as JSON under
//! `/routedns/vars`. The only listener allowed to run without a resolver.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tiny_http::{Header, Response, Server};

use super::{is_allowed, ListenOptions, Listener};
use crate::metrics;
use crate::resolver::{ResolveError, Result};
use crate::tls::{CertConfig, CertMaterial};

const VARS_PATH: &str = "/routedns/vars";

pub struct AdminListener {
    id: String,
    addr: String,
    opt: AdminListenerOptions,
    tls: RwLock<Option<Arc<CertMaterial>>>,
    server: RwLock<Option<Arc<Server>>>,
}

#[derive(Clone, Default)]
pub struct AdminListenerOptions {
    pub listen: ListenOptions,
    pub tls: Option<Arc<CertMaterial>>,
    pub cert: CertConfig,
}

impl AdminListener {
    pub fn new(id: &str, addr: &str, opt: AdminListenerOptions) -> AdminListener {
        AdminListener {
            id: id.to_string(),
            addr: addr.to_string(),
            tls: RwLock::new(opt.tls.clone()),
            opt,
            server: RwLock::new(None),
        }
    }
}

fn serve_request(request: tiny_http::Request, allowed: &[(std::net::IpAddr, u8)]) {
    let peer_ip = request.remote_addr().map(|addr| addr.ip());
    if !is_allowed(allowed, peer_ip) {
        let _ = request.respond(Response::empty(403));
        return;
    }

    let path = request.url().split('?').next().unwrap_or_default();
    if path != VARS_PATH {
        let _ = request.respond(Response::empty(404));
        return;
    }

    let body = metrics::snapshot().to_string();
    match Header::from_bytes("Content-Type", "application/json") {
        Ok(header) => {
            let _ = request.respond(Response::from_string(body).with_header(header));
        }
        Err(_) => {
            let _ = request.respond(Response::empty(500));
        }
    }
}

#[async_trait]
impl Listener for AdminListener {
    async fn start(&self) -> Result<()> {
        log::info!("id={} protocol=admin addr={} starting listener", self.id, self.addr);

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
        .map_err(|e| ResolveError::Config(format!("failed to start admin server: {}", e)))?;

        let server = Arc::new(server);
        *self.server.write() = Some(server.clone());

        let allowed = self.opt.listen.allowed_nets.clone();
        tokio::task::spawn_blocking(move || {
            while let Ok(request) = server.recv() {
                serve_request(request, &allowed);
            }
        })
        .await
        .map_err(|e| ResolveError::Config(format!("admin worker failed: {}", e)))?;

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
