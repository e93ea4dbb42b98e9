//! Loads rules from a server via HTTP(S), with an optional on-disk cache
//! that serves as a fallback when the network is unavailable.

use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{clean_rules, Result, RuleLoader};

pub struct HttpLoader {
    url: String,
    opt: HttpLoaderOptions,
}

#[derive(Default, Clone)]
pub struct HttpLoaderOptions {
    /// Directory for the cache file. Caching is disabled when empty.
    pub cache_dir: String,
}

impl HttpLoader {
    pub fn new(url: &str, opt: HttpLoaderOptions) -> HttpLoader {
        HttpLoader {
            url: url.to_string(),
            opt,
        }
    }

    fn from_disk(&self) -> bool {
        !self.opt.cache_dir.is_empty()
    }

    /// The cache file is the SHA256 of the URL in the cache directory.
    fn cache_filename(&self) -> PathBuf {
        let digest = Sha256::digest(self.url.as_bytes());
        PathBuf::from(&self.opt.cache_dir).join(format!("{:x}", digest))
    }

    async fn load_from_disk(&self) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(self.cache_filename()).await?;
        Ok(clean_rules(content.lines().map(str::to_string)))
    }

    async fn write_to_disk(&self, body: &str) -> std::io::Result<()> {
        // Write to a temp file first so a concurrent reader never sees a
        // partial list
        let target = self.cache_filename();
        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &target).await
    }
}

#[async_trait]
impl RuleLoader for HttpLoader {
    async fn load(&self) -> Result<Vec<String>> {
        log::debug!("loading rules from {}", self.url);

        let response = match reqwest::get(&self.url).await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => resp.text().await,
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match response {
            Ok(body) => {
                if self.from_disk() {
                    if let Err(err) = self.write_to_disk(&body).await {
                        log::warn!("failed to write rule cache for {}: {}", self.url, err);
                    }
                }
                Ok(clean_rules(body.lines().map(str::to_string)))
            }
            Err(err) if self.from_disk() => {
                log::warn!(
                    "failed to load rules from {}, falling back to cache: {}",
                    self.url,
                    err
                );
                self.load_from_disk().await
            }
            Err(err) => Err(err.into()),
        }
    }
}
