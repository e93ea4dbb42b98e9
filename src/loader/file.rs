//! Loads rules from a local file, rereading it on every reload.

use async_trait::async_trait;

use super::{clean_rules, Result, RuleLoader};

pub struct FileLoader {
    path: String,
    opt: FileLoaderOptions,
}

#[derive(Default, Clone)]
pub struct FileLoaderOptions {
    /// Keep the previously loaded list if reading the file fails.
    pub allow_failure: bool,
}

impl FileLoader {
    pub fn new(path: &str, opt: FileLoaderOptions) -> FileLoader {
        FileLoader {
            path: path.to_string(),
            opt,
        }
    }
}

#[async_trait]
impl RuleLoader for FileLoader {
    async fn load(&self) -> Result<Vec<String>> {
        log::debug!("loading rules from file {}", self.path);
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(clean_rules(content.lines().map(str::to_string))),
            Err(err) if self.opt.allow_failure => {
                log::warn!("failed to load rules from {}: {}", self.path, err);
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }
}
