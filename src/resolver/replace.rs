//! Rewrites question names by a sequence of pattern replacements before
//! forwarding, and restores the original name in the response.

use async_trait::async_trait;
use regex::Regex;

use super::{ClientInfo, DynResolver, ResolveError, Resolver, Result};
use crate::client::Socks5Dialer;
use crate::dns::protocol::DnsPacket;

pub struct Replace {
    id: String,
    resolver: DynResolver,
    rules: Vec<CompiledRule>,
}

#[derive(Clone)]
pub struct ReplaceRule {
    pub from: String,
    pub to: String,
}

struct CompiledRule {
    from: Regex,
    to: String,
}

impl Replace {
    pub fn new(id: &str, resolver: DynResolver, rules: Vec<ReplaceRule>) -> Result<Replace> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            compiled.push(CompiledRule {
                from: Regex::new(&rule.from)
                    .map_err(|e| ResolveError::Config(format!("invalid pattern '{}': {}", rule.from, e)))?,
                to: rule.to,
            });
        }
        Ok(Replace {
            id: id.to_string(),
            resolver,
            rules: compiled,
        })
    }

    fn apply(&self, name: &str) -> String {
        let mut out = name.to_string();
        for rule in &self.rules {
            out = rule.from.replace(&out, rule.to.as_str()).to_string();
        }
        out
    }
}

#[async_trait]
impl Resolver for Replace {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        let question = match query.first_question() {
            Some(q) => q.clone(),
            None => return Err(ResolveError::NoQuestion),
        };

        let new_name = self.apply(&question.name);
        if new_name == question.name {
            return self.resolver.resolve(query, ci, dialer).await;
        }

        log::debug!(
            "id={} client={} qname={} new-qname={} replacing query name",
            self.id,
            ci,
            question.name,
            new_name
        );

        let mut modified = query.clone();
        modified.questions[0].name = new_name.clone();

        let mut answer = match self.resolver.resolve(&modified, ci, dialer).await? {
            Some(answer) => answer,
            None => return Ok(None),
        };

        // Swap the rewritten name back so the client sees what it asked for
        answer.questions = query.questions.clone();
        for record in answer.answers.iter_mut() {
            if record.name == new_name {
                record.name = question.name.clone();
            }
        }

        Ok(Some(answer))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}
