//! RouteDNS - DNS stub resolver, proxy and router
//!
//! Listens for DNS queries on multiple transports (UDP, TCP, DoT, DoH, DoQ,
//! DTLS), passes every query through a user-defined pipeline of resolver
//! nodes and forwards what remains to upstream servers.
//!
//! The pipeline is assembled at start-up from a declarative TOML
//! configuration describing listeners, resolvers, groups (combinators such
//! as round-robin, fail-over, blocklists, caches) and routers (conditional
//! dispatchers). The configuration forms a DAG which is instantiated
//! leaf-first; cycles, duplicate ids and dangling references fail the build.
//!
//! # Architecture
//!
//! * `dns` - wire format: packet buffers, message model, EDNS(0)
//! * `matcher` - name and IP rule databases, hot-reloadable
//! * `loader` - rule sources (static, file, HTTP)
//! * `client` - upstream clients, one per transport
//! * `resolver` - pipeline nodes implementing the [`resolver::Resolver`] trait
//! * `group` - combinators over N child resolvers
//! * `listener` - transport terminations
//! * `panel` - remote panel API reconciliation
//! * `builder` - configuration model and DAG construction

pub mod builder;
pub mod client;
pub mod dns;
pub mod group;
pub mod listener;
pub mod loader;
pub mod matcher;
pub mod metrics;
pub mod panel;
pub mod resolver;
pub mod router;
pub mod tls;
