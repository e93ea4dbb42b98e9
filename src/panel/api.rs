//! HTTP client for the panel API. Both endpoints support a "not modified"
//! sentinel: the server may answer 304 to a conditional request, and as a
//! fallback an unchanged body hash is treated the same way, so the refresh
//! loop can skip work.

use std::fmt;

use derive_more::{Display, Error, From};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{NodeInfo, UserInfo};

#[derive(Debug, Display, From, Error)]
pub enum PanelError {
    /// The remote document is unchanged since the last fetch.
    NotModified,
    Http(reqwest::Error),
    Decode(serde_json::Error),
}

type Result<T> = std::result::Result<T, PanelError>;

#[derive(Clone, Default)]
pub struct PanelApiOptions {
    /// Base URL of the panel, e.g. `https://panel.example.com`.
    pub url: String,
    pub key: String,
    pub node_id: u64,
}

struct EndpointState {
    etag: Option<String>,
    body_hash: Option<[u8; 32]>,
}

pub struct PanelApi {
    opt: PanelApiOptions,
    client: reqwest::Client,
    node_info_state: Mutex<EndpointState>,
    user_list_state: Mutex<EndpointState>,
}

impl fmt::Debug for PanelApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PanelApi(node={})", self.opt.node_id)
    }
}

impl PanelApi {
    pub fn new(opt: PanelApiOptions) -> PanelApi {
        PanelApi {
            opt,
            client: reqwest::Client::new(),
            node_info_state: Mutex::new(EndpointState {
                etag: None,
                body_hash: None,
            }),
            user_list_state: Mutex::new(EndpointState {
                etag: None,
                body_hash: None,
            }),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.opt.node_id
    }

    async fn fetch(&self, path: &str, state: &Mutex<EndpointState>) -> Result<Vec<u8>> {
        let url = format!(
            "{}/{}?node_id={}&token={}",
            self.opt.url.trim_end_matches('/'),
            path,
            self.opt.node_id,
            self.opt.key
        );

        let mut request = self.client.get(&url);
        if let Some(etag) = state.lock().etag.clone() {
            request = request.header("If-None-Match", etag);
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Err(PanelError::NotModified);
        }
        let response = response.error_for_status()?;
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();

        // Some panels never send conditional-request headers; fall back to
        // comparing a digest of the body
        let hash: [u8; 32] = Sha256::digest(&body).into();
        let mut state = state.lock();
        if state.body_hash == Some(hash) {
            return Err(PanelError::NotModified);
        }
        state.etag = etag;
        state.body_hash = Some(hash);

        Ok(body)
    }

    /// Routing rules, spoof addresses and proxy settings for this node.
    pub async fn get_node_info(&self) -> Result<NodeInfo> {
        let body = self.fetch("api/v1/server/route-dns", &self.node_info_state).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// The node's user list; identity keys feed the IP allowlist.
    pub async fn get_user_list(&self) -> Result<Vec<UserInfo>> {
        let body = self.fetch("api/v1/server/users", &self.user_list_state).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_node_info_decoding() {
        let body = br#"{
            "route_dns": {
                "allow": {"domains": ["full:good.test"]},
                "block": {"domains": ["domain:ads.test", "geosite:category-ads"]},
                "spoof4": "192.0.2.1",
                "socks5": {"socks5_address": "127.0.0.1:1080", "username": "u", "password": "p"}
            }
        }"#;
        let info: NodeInfo = serde_json::from_slice(body).unwrap();
        assert_eq!(vec!["full:good.test"], info.route_dns.allow.domains);
        assert_eq!(2, info.route_dns.block.domains.len());
        assert_eq!("192.0.2.1", info.route_dns.spoof4);
        assert_eq!("127.0.0.1:1080", info.route_dns.socks5.socks5_address);
        // Missing fields default
        assert_eq!("", info.route_dns.spoof6);
    }

    #[test]
    fn test_user_list_decoding() {
        let body = br#"[{"id": 1, "passwd": "10.0.0.1"}, {"id": 2, "passwd": "10.0.0.0/24"}]"#;
        let users: Vec<UserInfo> = serde_json::from_slice(body).unwrap();
        assert_eq!(2, users.len());
        assert_eq!("10.0.0.0/24", users[1].passwd);
    }
}
