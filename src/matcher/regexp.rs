//! Name database holding a plain list of regular expressions.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use super::{BlocklistMatch, NameDb, NameMatch, Result};
use crate::dns::protocol::DnsQuestion;
use crate::loader::RuleLoader;

pub struct RegexpDb {
    name: String,
    loader: Arc<dyn RuleLoader>,
    rules: Vec<(String, Regex)>,
}

impl RegexpDb {
    pub async fn load(name: &str, loader: Arc<dyn RuleLoader>) -> Result<RegexpDb> {
        let rules = loader.load().await?;
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            compiled.push((rule.clone(), Regex::new(&rule)?));
        }
        Ok(RegexpDb {
            name: name.to_string(),
            loader,
            rules: compiled,
        })
    }
}

#[async_trait]
impl NameDb for RegexpDb {
    fn matches(&self, question: &DnsQuestion) -> Option<NameMatch> {
        let name = question.name.trim_end_matches('.').to_lowercase();
        for (rule, regex) in &self.rules {
            if regex.is_match(&name) {
                return Some(NameMatch {
                    descriptor: Some(BlocklistMatch {
                        list: self.name.clone(),
                        rule: rule.clone(),
                    }),
                    ..Default::default()
                });
            }
        }
        None
    }

    async fn reload(&self) -> Result<Arc<dyn NameDb>> {
        Ok(Arc::new(
            RegexpDb::load(&self.name, self.loader.clone()).await?,
        ))
    }

    fn describe(&self) -> String {
        "Regexp".to_string()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::protocol::RecordType;
    use crate::loader::StaticLoader;
    use crate::matcher::tests::question;

    #[tokio::test]
    async fn test_regexp_match() {
        let loader = Arc::new(StaticLoader::new(vec![r"(^|\.)evil\.test$".to_string()]));
        let db = RegexpDb::load("re", loader).await.unwrap();

        assert!(db.matches(&question("evil.test.", RecordType::A)).is_some());
        assert!(db
            .matches(&question("sub.evil.test.", RecordType::A))
            .is_some());
        assert!(db
            .matches(&question("notevil.test.", RecordType::A))
            .is_none());
    }

    #[tokio::test]
    async fn test_invalid_pattern_fails_build() {
        let loader = Arc::new(StaticLoader::new(vec!["(unclosed".to_string()]));
        assert!(RegexpDb::load("re", loader).await.is_err());
    }
}
