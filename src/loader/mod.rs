//! Rule loaders
//!
//! A loader produces the plain rule lines a matcher database is built from.
//! Sources: a static list fixed at build time, a local file, or an HTTP(S)
//! URL with an optional on-disk cache. The remote panel has its own loader
//! in the `panel` module since it produces structured state rather than
//! plain rules.

use async_trait::async_trait;
use derive_more::{Display, Error, From};

pub mod file;
pub mod http;

pub use file::{FileLoader, FileLoaderOptions};
pub use http::{HttpLoader, HttpLoaderOptions};

#[derive(Debug, Display, From, Error)]
pub enum LoaderError {
    Io(std::io::Error),
    Http(reqwest::Error),
}

type Result<T> = std::result::Result<T, LoaderError>;

/// Source of rule lines for a matcher database.
#[async_trait]
pub trait RuleLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<String>>;
}

/// Rules fixed at build time; reloading returns the same list.
pub struct StaticLoader {
    rules: Vec<String>,
}

impl StaticLoader {
    pub fn new(rules: Vec<String>) -> StaticLoader {
        StaticLoader { rules }
    }
}

#[async_trait]
impl RuleLoader for StaticLoader {
    async fn load(&self) -> Result<Vec<String>> {
        Ok(self.rules.clone())
    }
}

/// Drop comments and blank lines; rule files commonly carry both.
pub(crate) fn clean_rules(lines: impl Iterator<Item = String>) -> Vec<String> {
    lines
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect()
}
