//! Routes queries to one of several resolvers based on predicates over the
//! question and the client: type, class, name pattern, source network,
//! weekday and time of day, DoH path, listener id and TLS server name. The
//! first matching route wins; the builder requires a trailing catch-all
//! route so every query has somewhere to go.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveTime, Timelike, Weekday};
use regex::Regex;

use crate::client::Socks5Dialer;
use crate::dns::protocol::{DnsPacket, RecordType};
use crate::resolver::ecs_modifier::mask_ip;
use crate::resolver::{ClientInfo, DynResolver, ResolveError, Resolver, Result};

pub struct Route {
    /// Record types this route applies to; empty means any.
    pub types: Vec<RecordType>,
    pub class: Option<u16>,
    pub qname: Option<Regex>,
    /// Source networks as (address, prefix length) pairs.
    pub source: Vec<(IpAddr, u8)>,
    pub weekdays: Vec<Weekday>,
    /// Match only before this time of day.
    pub before: Option<NaiveTime>,
    /// Match only after this time of day.
    pub after: Option<NaiveTime>,
    pub doh_path: Option<Regex>,
    pub listener: Option<String>,
    pub tls_server_name: Option<Regex>,
    /// Invert the outcome of the predicate evaluation.
    pub invert: bool,
    pub resolver: DynResolver,
}

impl Route {
    /// A route matching everything, routing to `resolver`.
    pub fn catch_all(resolver: DynResolver) -> Route {
        Route {
            types: Vec::new(),
            class: None,
            qname: None,
            source: Vec::new(),
            weekdays: Vec::new(),
            before: None,
            after: None,
            doh_path: None,
            listener: None,
            tls_server_name: None,
            invert: false,
            resolver,
        }
    }

    pub fn is_catch_all(&self) -> bool {
        self.types.is_empty()
            && self.class.is_none()
            && self.qname.is_none()
            && self.source.is_empty()
            && self.weekdays.is_empty()
            && self.before.is_none()
            && self.after.is_none()
            && self.doh_path.is_none()
            && self.listener.is_none()
            && self.tls_server_name.is_none()
            && !self.invert
    }

    fn matches(&self, query: &DnsPacket, ci: &ClientInfo) -> bool {
        let result = self.matches_inner(query, ci);
        result != self.invert
    }

    fn matches_inner(&self, query: &DnsPacket, ci: &ClientInfo) -> bool {
        let question = match query.first_question() {
            Some(q) => q,
            None => return false,
        };

        if !self.types.is_empty() && !self.types.contains(&question.qtype) {
            return false;
        }
        if let Some(class) = self.class {
            if question.qclass != class {
                return false;
            }
        }
        if let Some(qname) = &self.qname {
            if !qname.is_match(&question.name) {
                return false;
            }
        }
        if !self.source.is_empty() {
            let ip = match ci.source_ip {
                Some(ip) => ip,
                None => return false,
            };
            let contained = self.source.iter().any(|(net, prefix)| {
                // Families must agree for the mask comparison to hold
                ip.is_ipv4() == net.is_ipv4() && mask_ip(ip, *prefix) == mask_ip(*net, *prefix)
            });
            if !contained {
                return false;
            }
        }
        if !self.weekdays.is_empty() || self.before.is_some() || self.after.is_some() {
            let now = Local::now();
            if !self.weekdays.is_empty() && !self.weekdays.contains(&now.weekday()) {
                return false;
            }
            let time = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
                .unwrap_or(NaiveTime::MIN);
            if let Some(before) = self.before {
                if time >= before {
                    return false;
                }
            }
            if let Some(after) = self.after {
                if time < after {
                    return false;
                }
            }
        }
        if let Some(doh_path) = &self.doh_path {
            if !doh_path.is_match(&ci.doh_path) {
                return false;
            }
        }
        if let Some(listener) = &self.listener {
            if &ci.listener != listener {
                return false;
            }
        }
        if let Some(tls_server_name) = &self.tls_server_name {
            if !tls_server_name.is_match(&ci.tls_server_name) {
                return false;
            }
        }

        true
    }
}

pub struct Router {
    id: String,
    routes: Vec<Route>,
}

impl Router {
    /// Build a router; the final route must be a catch-all so no query can
    /// fall off the end.
    pub fn new(id: &str, routes: Vec<Route>) -> Result<Router> {
        match routes.last() {
            Some(route) if route.is_catch_all() => {}
            _ => {
                return Err(ResolveError::Config(format!(
                    "router '{}' must end with a catch-all route",
                    id
                )))
            }
        }
        Ok(Router {
            id: id.to_string(),
            routes,
        })
    }
}

#[async_trait]
impl Resolver for Router {
    async fn resolve(
        &self,
        query: &DnsPacket,
        ci: &ClientInfo,
        dialer: Option<&Socks5Dialer>,
    ) -> Result<Option<DnsPacket>> {
        for route in &self.routes {
            if route.matches(query, ci) {
                log::debug!(
                    "id={} client={} qname={} resolver={} routing query",
                    self.id,
                    ci,
                    query.qname(),
                    route.resolver.describe()
                );
                return route.resolver.resolve(query, ci, dialer).await;
            }
        }
        // The catch-all requirement makes this unreachable
        Err(ResolveError::Config(format!(
            "router '{}' matched no route",
            self.id
        )))
    }

    fn describe(&self) -> String {
        self.id.clone()
    }
}
