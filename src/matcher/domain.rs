//! Domain name database supporting the common rule grammar: exact names,
//! subdomain trees, keywords, regular expressions and site-database
//! references.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use super::geosite::{self, DomainKind};
use super::{BlocklistMatch, MatcherError, NameDb, NameMatch, Result};
use crate::dns::protocol::DnsQuestion;
use crate::loader::RuleLoader;

/// Default site database consulted for `geosite:` rules.
const DEFAULT_SITE_FILE: &str = "geosite.dat";

pub struct DomainDb {
    name: String,
    loader: Arc<dyn RuleLoader>,
    opt: DomainDbOptions,

    full: HashSet<String>,
    domains: HashSet<String>,
    keywords: Vec<String>,
    regexes: Vec<(String, Regex)>,
}

#[derive(Clone)]
pub struct DomainDbOptions {
    /// Directory holding site database files referenced by `geosite:` and
    /// `ext:` rules.
    pub asset_dir: PathBuf,
}

impl Default for DomainDbOptions {
    fn default() -> Self {
        DomainDbOptions {
            asset_dir: PathBuf::from("."),
        }
    }
}

impl DomainDb {
    /// Build the database from the loader's current rules.
    pub async fn load(
        name: &str,
        loader: Arc<dyn RuleLoader>,
        opt: DomainDbOptions,
    ) -> Result<DomainDb> {
        let rules = loader.load().await?;
        let mut db = DomainDb {
            name: name.to_string(),
            loader,
            opt,
            full: HashSet::new(),
            domains: HashSet::new(),
            keywords: Vec::new(),
            regexes: Vec::new(),
        };

        for rule in rules {
            db.add_rule(&rule)?;
        }
        Ok(db)
    }

    fn add_rule(&mut self, rule: &str) -> Result<()> {
        if let Some(name) = rule.strip_prefix("full:") {
            self.full.insert(name.trim_end_matches('.').to_lowercase());
        } else if let Some(name) = rule.strip_prefix("domain:") {
            self.domains
                .insert(name.trim_end_matches('.').to_lowercase());
        } else if let Some(keyword) = rule.strip_prefix("keyword:") {
            self.keywords.push(keyword.to_lowercase());
        } else if let Some(pattern) = rule.strip_prefix("regexp:") {
            self.regexes
                .push((rule.to_string(), Regex::new(pattern)?));
        } else if let Some(substr) = rule.strip_prefix("dotless:") {
            let pattern = match substr {
                "" => "^[^.]*$".to_string(),
                s if !s.contains('.') => format!("^[^.]*{}[^.]*$", s),
                _ => return Err(MatcherError::InvalidRule(rule.to_string())),
            };
            self.regexes.push((rule.to_string(), Regex::new(&pattern)?));
        } else if let Some(site) = rule.strip_prefix("geosite:") {
            let file = self.opt.asset_dir.join(DEFAULT_SITE_FILE);
            for domain in geosite::load_site_with_attrs(&file, site)? {
                self.add_site_domain(domain)?;
            }
        } else if let Some(spec) = rule.strip_prefix("ext:") {
            let (file, site) = spec
                .split_once(':')
                .ok_or_else(|| MatcherError::InvalidRule(rule.to_string()))?;
            let file = self.opt.asset_dir.join(file);
            for domain in geosite::load_site_with_attrs(&file, site)? {
                self.add_site_domain(domain)?;
            }
        } else {
            // Bare names behave like domain: rules
            self.domains
                .insert(rule.trim_end_matches('.').to_lowercase());
        }
        Ok(())
    }

    fn add_site_domain(&mut self, domain: geosite::SiteDomain) -> Result<()> {
        match domain.kind {
            DomainKind::Full => {
                self.full.insert(domain.value);
            }
            DomainKind::Domain => {
                self.domains.insert(domain.value);
            }
            DomainKind::Plain => self.keywords.push(domain.value),
            DomainKind::Regex => {
                let regex = Regex::new(&domain.value)?;
                self.regexes.push((format!("regexp:{}", domain.value), regex));
            }
        }
        Ok(())
    }

    fn match_name(&self, name: &str) -> Option<String> {
        if self.full.contains(name) {
            return Some(format!("full:{}", name));
        }

        // Walk the suffixes of the name for subdomain rules
        let mut suffix = name;
        loop {
            if self.domains.contains(suffix) {
                return Some(format!("domain:{}", suffix));
            }
            match suffix.split_once('.') {
                Some((_, rest)) => suffix = rest,
                None => break,
            }
        }

        for keyword in &self.keywords {
            if name.contains(keyword.as_str()) {
                return Some(format!("keyword:{}", keyword));
            }
        }

        for (rule, regex) in &self.regexes {
            if regex.is_match(name) {
                return Some(rule.clone());
            }
        }

        None
    }
}

#[async_trait]
impl NameDb for DomainDb {
    fn matches(&self, question: &DnsQuestion) -> Option<NameMatch> {
        let name = question.name.trim_end_matches('.').to_lowercase();
        if name.is_empty() {
            return None;
        }

        let rule = self.match_name(&name)?;
        Some(NameMatch {
            descriptor: Some(BlocklistMatch {
                list: self.name.clone(),
                rule,
            }),
            ..Default::default()
        })
    }

    async fn reload(&self) -> Result<Arc<dyn NameDb>> {
        let db = DomainDb::load(&self.name, self.loader.clone(), self.opt.clone()).await?;
        Ok(Arc::new(db))
    }

    fn describe(&self) -> String {
        "Domain".to_string()
    }
}
