//! DNS-over-HTTPS upstream client (RFC 8484). POST with
//! `application/dns-message` by default, GET with the base64url `dns`
//! parameter when configured.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use super::ClientOptions;
use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, MAX_MSG_SIZE};
use crate::resolver::{ClientInfo, ResolveError, Resolver, Result};

const DOH_CONTENT_TYPE: &str = "application/dns-message";

pub struct DohClient {
    id: String,
    url: String,
    opt: DohClientOptions,
    client: reqwest::Client,
}

#[derive(Clone, Default)]
pub struct DohClientOptions {
    pub common: ClientOptions,
    /// "POST" (default) or "GET".
    pub method: String,
    /// Additional trusted CA in PEM form.
    pub ca: Option<Vec<u8>>,
}

impl DohClient {
    pub fn new(id: &str, url: &str, opt: DohClientOptions) -> Result<DohClient> {
        let client = build_client(url, &opt, None)?;
        Ok(DohClient {
            id: id.to_string(),
            url: url.to_string(),
            opt,
            client,
        })
    }
}

fn build_client(
    url: &str,
    opt: &DohClientOptions,
    dialer: Option<&Socks5Dialer>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(opt.common.query_timeout);

    if let Some(ca) = &opt.ca {
        let cert = reqwest::Certificate::from_pem(ca)?;
        builder = builder.add_root_certificate(cert);
    }
    if let Some(dialer) = dialer {
        let mut proxy_url = format!("socks5h://{}", dialer.address);
        if dialer.resolve_local {
            proxy_url = format!("socks5://{}", dialer.address);
        }
        let mut proxy = reqwest::Proxy::all(proxy_url)?;
        if !dialer.username.is_empty() {
            proxy = proxy.basic_auth(&dialer.username, &dialer.password);
        }
        builder = builder.proxy(proxy);
    }
    if !opt.common.bootstrap_addr.is_empty() {
        // Pin the URL's hostname to the bootstrap address; TLS still
        // verifies against the hostname
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| ResolveError::Config(format!("invalid DoH URL '{}': {}", url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ResolveError::Config(format!("invalid DoH URL '{}'", url)))?;
        let port = parsed.port_or_known_default().unwrap_or(443);
        let ip: std::net::IpAddr = opt
            .common
            .bootstrap_addr
            .parse()
            .map_err(|_| ResolveError::Config("bootstrap-address must be an IP".to_string()))?;
        builder = builder.resolve(host, std::net::SocketAddr::new(ip, port));
    }

    Ok(builder.build()?)
}

#[async_trait]
impl Resolver for DohClient {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        log::debug!(
            "id={} client={} qname={} resolver={} protocol=doh querying upstream",
            self.id,
            ci,
            query.qname(),
            self.url
        );

        // The id on the wire is 0 for cache friendliness, restored below
        let mut outgoing = query.clone();
        outgoing.header.id = 0;
        let msg = outgoing.to_bytes(MAX_MSG_SIZE)?;

        // A panel-supplied proxy needs its own connection pool
        let client = match dialer {
            Some(dialer) => build_client(&self.url, &self.opt, Some(dialer))?,
            None => self.client.clone(),
        };

        let response = if self.opt.method.eq_ignore_ascii_case("GET") {
            let url = format!("{}?dns={}", self.url, URL_SAFE_NO_PAD.encode(&msg));
            client.get(url).header("Accept", DOH_CONTENT_TYPE).send().await?
        } else {
            client
                .post(&self.url)
                .header("Content-Type", DOH_CONTENT_TYPE)
                .header("Accept", DOH_CONTENT_TYPE)
                .body(msg)
                .send()
                .await?
        };

        let response = response.error_for_status()?;
        let body = response.bytes().await?;
        let mut packet = DnsPacket::from_bytes(&body)?;
        packet.header.id = query.header.id;

        Ok(Some(packet))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}

/// Validate a DoH endpoint URL at build time.
pub fn valid_doh_endpoint(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ResolveError::Config(format!("invalid DoH URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "https" | "http" => Ok(()),
        scheme => Err(ResolveError::Config(format!(
            "unsupported DoH scheme '{}'",
            scheme
        ))),
    }
}
