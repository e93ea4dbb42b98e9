//! Constructors turning configuration entries into live pipeline nodes.
//! Invoked leaf-first by the builder, so child lookups always succeed for
//! well-formed configurations.

use std::sync::Arc;
use std::time::Duration;

use super::config::{parse_cidr_list, GroupConfig, ListenerConfig, ResolverConfig, RouteConfig, RouterConfig};
use super::{BuildContext, BuildError, CertTarget, PeriodicTask};
use crate::client::{
    ClientOptions, DohClient, DohClientOptions, DoqClient, DoqClientOptions, DotClient,
    DotClientOptions, DtlsClient, DtlsClientOptions, TcpClient, UdpClient,
    DEFAULT_QUERY_TIMEOUT,
};
use crate::group::{
    FailBack, FailRotate, FailRotateOptions, Fastest, FastestTcp, FastestTcpOptions, PanelRotate,
    RandomGroup, RoundRobin,
};
use crate::listener::{
    address_with_default, AdminListener, AdminListenerOptions, DnsListener, DnsProtocol,
    DohListener, DohListenerOptions, DoqListener, DoqListenerOptions, DotListener,
    DotListenerOptions, DtlsListener, DtlsListenerOptions, DynListener, ListenOptions,
    DOH_PORT, DOQ_PORT, DOT_PORT, DTLS_PORT, PLAIN_DNS_PORT,
};
use crate::loader::{FileLoader, FileLoaderOptions, HttpLoader, HttpLoaderOptions, RuleLoader, StaticLoader};
use crate::matcher::{
    CidrDb, DomainDb, DomainDbOptions, GeoIpDb, HostsDb, IpDb, MultiIpDb, MultiNameDb, NameDb,
    RegexpDb,
};
use crate::panel::{PanelApi, PanelApiOptions, PanelLoader, PanelLoaderOptions};
use crate::resolver::cache::CacheShuffle;
use crate::resolver::static_responder::parse_record;
use crate::resolver::{
    Blocklist, BlocklistOptions, Cache, CacheOptions, ClientBlocklist, ClientBlocklistOptions,
    DropResolver, DynResolver, EcsModifier, EcsModifierMode, Edns0Modifier, Edns0ModifierMode,
    PanelBlocklist, PanelBlocklistOptions, RateLimiter, RateLimiterOptions, Replace, ReplaceRule,
    RequestDedup, ResponseBlocklistIp, ResponseBlocklistIpOptions, ResponseBlocklistName,
    ResponseBlocklistNameOptions, ResponseCollapse, ResponseMinimize, StaticResolver,
    StaticResolverOptions, TruncateRetry, TtlModifier, TtlSelect,
};
use crate::router::{Route, Router};
use crate::tls::{tls_client_config, tls_server_config, CertMaterial};
use crate::dns::protocol::{RecordType, ResultCode};

fn query_timeout(seconds: u64) -> Duration {
    if seconds == 0 {
        DEFAULT_QUERY_TIMEOUT
    } else {
        Duration::from_secs(seconds)
    }
}

fn read_optional(path: &str) -> Result<Option<Vec<u8>>, BuildError> {
    if path.is_empty() {
        return Ok(None);
    }
    Ok(Some(std::fs::read(path)?))
}

fn client_cert_task(id: &str, cfg: &ResolverConfig, resolver: &DynResolver) -> Option<PeriodicTask> {
    if !cfg.cert.monitored() {
        return None;
    }
    Some(PeriodicTask {
        tag: format!("cert monitor {}", id),
        interval: Duration::from_secs(cfg.cert.update_periodic.max(1) * 60),
        target: CertTarget::Resolver(resolver.clone()),
    })
}

/// Build an upstream client from a resolver entry and add it to the map.
pub(super) async fn instantiate_resolver(
    id: &str,
    cfg: &ResolverConfig,
    ctx: &mut BuildContext,
) -> Result<(), BuildError> {
    let common = ClientOptions {
        bootstrap_addr: cfg.bootstrap_address.clone(),
        query_timeout: query_timeout(cfg.query_timeout),
    };

    let resolver: DynResolver = match cfg.protocol.as_str() {
        "udp" => Arc::new(UdpClient::new(
            id,
            &address_with_default(&cfg.address, PLAIN_DNS_PORT),
            common,
        )),
        "tcp" => Arc::new(TcpClient::new(
            id,
            &address_with_default(&cfg.address, PLAIN_DNS_PORT),
            common,
        )),
        "dot" => {
            let ca = read_optional(&cfg.ca)?;
            let client_cert = match (
                read_optional(&cfg.client_crt)?,
                read_optional(&cfg.client_key)?,
            ) {
                (Some(cert), Some(key)) => Some((cert, key)),
                _ => None,
            };
            let tls = tls_client_config(
                ca.as_deref(),
                client_cert.as_ref().map(|(c, k)| (c.as_slice(), k.as_slice())),
            )?;
            Arc::new(DotClient::new(
                id,
                &address_with_default(&cfg.address, DOT_PORT),
                DotClientOptions {
                    common,
                    tls_config: tls,
                    server_name: cfg.server_name.clone(),
                    cert: cfg.cert.clone(),
                },
            )?)
        }
        "doh" => {
            crate::client::doh::valid_doh_endpoint(&cfg.address)?;
            Arc::new(DohClient::new(
                id,
                &cfg.address,
                DohClientOptions {
                    common,
                    method: cfg.doh_method.clone(),
                    ca: read_optional(&cfg.ca)?,
                },
            )?)
        }
        "doq" => {
            let ca = read_optional(&cfg.ca)?;
            let tls = tls_client_config(ca.as_deref(), None)?;
            Arc::new(DoqClient::new(
                id,
                &address_with_default(&cfg.address, DOQ_PORT),
                DoqClientOptions {
                    common,
                    tls_config: tls,
                    server_name: cfg.server_name.clone(),
                },
            )?)
        }
        "dtls" => Arc::new(DtlsClient::new(
            id,
            &address_with_default(&cfg.address, DTLS_PORT),
            DtlsClientOptions {
                common,
                ca: read_optional(&cfg.ca)?,
                server_name: cfg.server_name.clone(),
            },
        )?),
        protocol => {
            return Err(BuildError::UnsupportedType(format!(
                "unsupported protocol '{}' for resolver '{}'",
                protocol, id
            )))
        }
    };

    if let Some(task) = client_cert_task(id, cfg, &resolver) {
        ctx.tasks.push(task);
    }
    ctx.resolvers.insert(id.to_string(), resolver);
    Ok(())
}

fn child(ctx: &BuildContext, group: &str, id: &str) -> Result<DynResolver, BuildError> {
    ctx.resolvers.get(id).cloned().ok_or_else(|| {
        BuildError::UnknownReference(format!(
            "group '{}' references non-existent resolver or group '{}'",
            group, id
        ))
    })
}

fn children(ctx: &BuildContext, group: &str, cfg: &GroupConfig) -> Result<Vec<DynResolver>, BuildError> {
    if cfg.resolvers.is_empty() {
        return Err(BuildError::InvalidValue(format!(
            "group '{}' needs at least one resolver",
            group
        )));
    }
    cfg.resolvers
        .iter()
        .map(|id| child(ctx, group, id))
        .collect()
}

fn single_child(ctx: &BuildContext, group: &str, cfg: &GroupConfig) -> Result<DynResolver, BuildError> {
    let mut list = children(ctx, group, cfg)?;
    if list.len() != 1 {
        return Err(BuildError::InvalidValue(format!(
            "group '{}' takes exactly one resolver",
            group
        )));
    }
    Ok(list.remove(0))
}

fn optional_ref(ctx: &BuildContext, group: &str, id: &str) -> Result<Option<DynResolver>, BuildError> {
    if id.is_empty() {
        return Ok(None);
    }
    Ok(Some(child(ctx, group, id)?))
}

/// Rule loaders for one list: inline rules plus file/URL sources.
fn rule_loaders(rules: &[String], sources: &[String], cache_dir: &str) -> Vec<Arc<dyn RuleLoader>> {
    let mut loaders: Vec<Arc<dyn RuleLoader>> = Vec::new();
    if !rules.is_empty() {
        loaders.push(Arc::new(StaticLoader::new(rules.to_vec())));
    }
    for source in sources {
        if source.starts_with("http://") || source.starts_with("https://") {
            loaders.push(Arc::new(HttpLoader::new(
                source,
                HttpLoaderOptions {
                    cache_dir: cache_dir.to_string(),
                },
            )));
        } else {
            loaders.push(Arc::new(FileLoader::new(source, FileLoaderOptions::default())));
        }
    }
    loaders
}

async fn build_name_db(
    list_name: &str,
    format: &str,
    rules: &[String],
    sources: &[String],
    cfg: &GroupConfig,
) -> Result<Option<Arc<dyn NameDb>>, BuildError> {
    let loaders = rule_loaders(rules, sources, &cfg.cache_dir);
    if loaders.is_empty() {
        return Ok(None);
    }

    let mut dbs: Vec<Arc<dyn NameDb>> = Vec::with_capacity(loaders.len());
    for loader in loaders {
        let db: Arc<dyn NameDb> = match format {
            "domain" | "" => {
                let opt = DomainDbOptions {
                    asset_dir: if cfg.asset_dir.is_empty() {
                        ".".into()
                    } else {
                        cfg.asset_dir.clone().into()
                    },
                };
                Arc::new(DomainDb::load(list_name, loader, opt).await?)
            }
            "regexp" => Arc::new(RegexpDb::load(list_name, loader).await?),
            "hosts" => Arc::new(HostsDb::load(list_name, loader).await?),
            format => {
                return Err(BuildError::UnsupportedType(format!(
                    "unsupported format '{}'",
                    format
                )))
            }
        };
        dbs.push(db);
    }

    if dbs.len() == 1 {
        Ok(Some(dbs.remove(0)))
    } else {
        Ok(Some(Arc::new(MultiNameDb::new(list_name, dbs))))
    }
}

async fn build_ip_db(
    list_name: &str,
    format: &str,
    rules: &[String],
    sources: &[String],
    cfg: &GroupConfig,
) -> Result<Option<Arc<dyn IpDb>>, BuildError> {
    match format {
        "cidr" | "" => {
            let loaders = rule_loaders(rules, sources, &cfg.cache_dir);
            if loaders.is_empty() {
                return Ok(None);
            }
            let mut dbs: Vec<Arc<dyn IpDb>> = Vec::with_capacity(loaders.len());
            for loader in loaders {
                dbs.push(Arc::new(CidrDb::load(list_name, loader).await?));
            }
            if dbs.len() == 1 {
                Ok(Some(dbs.remove(0)))
            } else {
                Ok(Some(Arc::new(MultiIpDb::new(list_name, dbs))))
            }
        }
        "location" => {
            if cfg.geodb.is_empty() {
                return Err(BuildError::InvalidValue(
                    "location lists need a geodb file".to_string(),
                ));
            }
            let db = GeoIpDb::load(list_name, std::path::Path::new(&cfg.geodb), rules)?;
            Ok(Some(Arc::new(db)))
        }
        format => Err(BuildError::UnsupportedType(format!(
            "unsupported format '{}'",
            format
        ))),
    }
}

fn refresh_period(seconds: u64) -> Option<Duration> {
    if seconds == 0 {
        None
    } else {
        Some(Duration::from_secs(seconds))
    }
}

fn reset_after(seconds: u64) -> Duration {
    if seconds == 0 {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(seconds)
    }
}

fn parse_hex(data: &str) -> Result<Vec<u8>, BuildError> {
    let data = data.trim();
    if data.len() % 2 != 0 {
        return Err(BuildError::InvalidValue(format!("invalid hex data '{}'", data)));
    }
    (0..data.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&data[i..i + 2], 16)
                .map_err(|_| BuildError::InvalidValue(format!("invalid hex data '{}'", data)))
        })
        .collect()
}

fn parse_records(list: &[String]) -> Result<Vec<crate::dns::protocol::DnsRecord>, BuildError> {
    list.iter().map(|text| Ok(parse_record(text)?)).collect()
}

/// Build a group node from its configuration and add it to the map.
pub(super) async fn instantiate_group(
    id: &str,
    cfg: &GroupConfig,
    ctx: &mut BuildContext,
) -> Result<(), BuildError> {
    let resolver: DynResolver = match cfg.group_type.as_str() {
        "round-robin" => Arc::new(RoundRobin::new(id, children(ctx, id, cfg)?)),
        "fail-rotate" => Arc::new(FailRotate::new(
            id,
            FailRotateOptions {
                servfail_error: cfg.servfail_error,
            },
            children(ctx, id, cfg)?,
        )),
        "fail-back" => Arc::new(FailBack::new(
            id,
            cfg.servfail_error,
            reset_after(cfg.reset_after),
            children(ctx, id, cfg)?,
        )),
        "random" => Arc::new(RandomGroup::new(
            id,
            cfg.servfail_error,
            reset_after(cfg.reset_after),
            children(ctx, id, cfg)?,
        )),
        "fastest" => Arc::new(Fastest::new(id, children(ctx, id, cfg)?)),
        "fastest-tcp" => Arc::new(FastestTcp::new(
            id,
            single_child(ctx, id, cfg)?,
            FastestTcpOptions {
                port: if cfg.port == 0 { 443 } else { cfg.port },
                wait_all: cfg.wait_all,
                success_ttl_min: cfg.success_ttl_min,
                ..Default::default()
            },
        )),
        "panel-rotate" => {
            let rotate = Arc::new(PanelRotate::new(id, single_child(ctx, id, cfg)?));
            ctx.panel_rotates.insert(id.to_string(), rotate.clone());
            rotate
        }
        "truncate-retry" => {
            let retry = optional_ref(ctx, id, &cfg.retry_resolver)?.ok_or_else(|| {
                BuildError::InvalidValue(format!("group '{}' needs a retry-resolver", id))
            })?;
            Arc::new(TruncateRetry::new(id, single_child(ctx, id, cfg)?, retry))
        }
        "cache" => {
            let cache = Cache::new(
                id,
                single_child(ctx, id, cfg)?,
                CacheOptions {
                    capacity: if cfg.cache_size == 0 { 4096 } else { cfg.cache_size },
                    gc_period: if cfg.cache_gc_period == 0 {
                        Duration::from_secs(60)
                    } else {
                        Duration::from_secs(cfg.cache_gc_period)
                    },
                    negative_ttl: cfg.cache_negative_ttl,
                    max_ttl: cfg.cache_max_ttl,
                    harden_below_nxdomain: cfg.cache_harden_below_nxdomain,
                    shuffle: CacheShuffle::from_name(&cfg.cache_answer_shuffle).ok_or_else(
                        || {
                            BuildError::InvalidValue(format!(
                                "invalid cache-answer-shuffle '{}'",
                                cfg.cache_answer_shuffle
                            ))
                        },
                    )?,
                    prefetch_trigger: cfg.cache_prefetch_trigger,
                    prefetch_eligible: cfg.cache_prefetch_eligible,
                    snapshot_file: cfg.cache_snapshot_file.clone(),
                    save_interval: if cfg.cache_save_interval == 0 {
                        Duration::from_secs(300)
                    } else {
                        Duration::from_secs(cfg.cache_save_interval)
                    },
                },
            );
            ctx.caches.push(cache.clone());
            cache
        }
        "ttl-modifier" => {
            let select = TtlSelect::from_name(&cfg.ttl_select).ok_or_else(|| {
                BuildError::InvalidValue(format!("invalid ttl-select '{}'", cfg.ttl_select))
            })?;
            Arc::new(TtlModifier::new(
                id,
                single_child(ctx, id, cfg)?,
                select,
                cfg.ttl_min,
                cfg.ttl_max,
            ))
        }
        "ecs-modifier" => {
            let mode = match cfg.ecs_op.as_str() {
                "add" | "" => EcsModifierMode::Add {
                    address: if cfg.ecs_address.is_empty() {
                        None
                    } else {
                        Some(cfg.ecs_address.parse().map_err(|_| {
                            BuildError::InvalidValue(format!(
                                "invalid ecs-address '{}'",
                                cfg.ecs_address
                            ))
                        })?)
                    },
                    prefix4: if cfg.ecs_prefix4 == 0 { 24 } else { cfg.ecs_prefix4 },
                    prefix6: if cfg.ecs_prefix6 == 0 { 64 } else { cfg.ecs_prefix6 },
                },
                "delete" => EcsModifierMode::Delete,
                "privacy" => EcsModifierMode::Privacy {
                    prefix4: cfg.ecs_prefix4,
                    prefix6: cfg.ecs_prefix6,
                },
                op => {
                    return Err(BuildError::InvalidValue(format!(
                        "invalid ecs-op '{}'",
                        op
                    )))
                }
            };
            Arc::new(EcsModifier::new(id, single_child(ctx, id, cfg)?, mode))
        }
        "edns0-modifier" => {
            let mode = match cfg.edns0_op.as_str() {
                "add" => Edns0ModifierMode::Add {
                    code: cfg.edns0_code,
                    data: parse_hex(&cfg.edns0_data)?,
                },
                "delete" => Edns0ModifierMode::Delete {
                    code: cfg.edns0_code,
                },
                op => {
                    return Err(BuildError::InvalidValue(format!(
                        "invalid edns0-op '{}'",
                        op
                    )))
                }
            };
            Arc::new(Edns0Modifier::new(id, single_child(ctx, id, cfg)?, mode))
        }
        "replace" => {
            let rules = cfg
                .replace
                .iter()
                .map(|r| ReplaceRule {
                    from: r.from.clone(),
                    to: r.to.clone(),
                })
                .collect();
            Arc::new(Replace::new(id, single_child(ctx, id, cfg)?, rules)?)
        }
        "static-responder" => Arc::new(StaticResolver::new(
            id,
            StaticResolverOptions {
                answers: parse_records(&cfg.answer)?,
                authorities: parse_records(&cfg.ns)?,
                resources: parse_records(&cfg.extra)?,
                rcode: ResultCode::from_num(cfg.rcode),
                truncate: cfg.truncate,
                ede: cfg
                    .edns0_ede
                    .as_ref()
                    .map(|e| (e.code, e.text.clone())),
            },
        )),
        "drop" => Arc::new(DropResolver::new(id)),
        "response-minimize" => Arc::new(ResponseMinimize::new(id, single_child(ctx, id, cfg)?)),
        "response-collapse" => Arc::new(ResponseCollapse::new(id, single_child(ctx, id, cfg)?)),
        "response-blocklist-name" => {
            let db = build_name_db(id, &cfg.blocklist_format, &cfg.blocklist, &cfg.blocklist_source, cfg)
                .await?
                .ok_or_else(|| {
                    BuildError::InvalidValue(format!("group '{}' has no blocklist rules", id))
                })?;
            ResponseBlocklistName::new(
                id,
                single_child(ctx, id, cfg)?,
                ResponseBlocklistNameOptions {
                    db,
                    blocklist_resolver: optional_ref(ctx, id, &cfg.blocklist_resolver)?,
                    filter: cfg.filter,
                    inverted: cfg.inverted,
                    refresh: refresh_period(cfg.blocklist_refresh),
                },
            )
        }
        "response-blocklist-ip" => {
            let db = build_ip_db(id, &cfg.blocklist_format, &cfg.blocklist, &cfg.blocklist_source, cfg)
                .await?
                .ok_or_else(|| {
                    BuildError::InvalidValue(format!("group '{}' has no blocklist rules", id))
                })?;
            ResponseBlocklistIp::new(
                id,
                single_child(ctx, id, cfg)?,
                ResponseBlocklistIpOptions {
                    db,
                    blocklist_resolver: optional_ref(ctx, id, &cfg.blocklist_resolver)?,
                    filter: cfg.filter,
                    inverted: cfg.inverted,
                    refresh: refresh_period(cfg.blocklist_refresh),
                },
            )
        }
        "client-blocklist" | "client-allowlist" => {
            let inverted = cfg.group_type == "client-allowlist";
            let db = build_ip_db(id, &cfg.blocklist_format, &cfg.blocklist, &cfg.blocklist_source, cfg)
                .await?
                .ok_or_else(|| {
                    BuildError::InvalidValue(format!("group '{}' has no client rules", id))
                })?;
            ClientBlocklist::new(
                id,
                single_child(ctx, id, cfg)?,
                ClientBlocklistOptions {
                    db,
                    inverted,
                    blocklist_resolver: optional_ref(ctx, id, &cfg.blocklist_resolver)?,
                    refresh: refresh_period(cfg.blocklist_refresh),
                },
            )
        }
        "rate-limiter" => Arc::new(RateLimiter::new(
            id,
            single_child(ctx, id, cfg)?,
            RateLimiterOptions {
                requests: cfg.requests,
                window: if cfg.window == 0 { 60 } else { cfg.window },
                prefix4: if cfg.prefix4 == 0 { 24 } else { cfg.prefix4 },
                prefix6: if cfg.prefix6 == 0 { 56 } else { cfg.prefix6 },
                limit_resolver: optional_ref(ctx, id, &cfg.limit_resolver)?,
            },
        )),
        "request-dedup" => Arc::new(RequestDedup::new(id, single_child(ctx, id, cfg)?)),
        "blocklist" => {
            let blocklist_db = build_name_db(
                id,
                &cfg.blocklist_format,
                &cfg.blocklist,
                &cfg.blocklist_source,
                cfg,
            )
            .await?
            .ok_or_else(|| {
                BuildError::InvalidValue(format!("group '{}' has no blocklist rules", id))
            })?;
            let allowlist_db = build_name_db(
                id,
                &cfg.allowlist_format,
                &cfg.allowlist,
                &cfg.allowlist_source,
                cfg,
            )
            .await?;
            Blocklist::new(
                id,
                single_child(ctx, id, cfg)?,
                BlocklistOptions {
                    blocklist_db,
                    allowlist_db,
                    blocklist_resolver: optional_ref(ctx, id, &cfg.blocklist_resolver)?,
                    allowlist_resolver: optional_ref(ctx, id, &cfg.allowlist_resolver)?,
                    blocklist_refresh: refresh_period(cfg.blocklist_refresh),
                    allowlist_refresh: refresh_period(cfg.allowlist_refresh),
                },
            )
        }
        "blocklist-panel" => {
            if cfg.panel_url.is_empty() {
                return Err(BuildError::InvalidValue(format!(
                    "group '{}' needs a panel-url",
                    id
                )));
            }
            let api = Arc::new(PanelApi::new(PanelApiOptions {
                url: cfg.panel_url.clone(),
                key: cfg.panel_key.clone(),
                node_id: cfg.panel_node_id,
            }));
            let loader = Arc::new(PanelLoader::new(
                api,
                PanelLoaderOptions {
                    blocklist_format: cfg.blocklist_format.clone(),
                    allowlist_format: cfg.allowlist_format.clone(),
                    asset_dir: cfg.asset_dir.clone(),
                },
            ));
            let db = loader.get().await?;
            PanelBlocklist::new(
                id,
                single_child(ctx, id, cfg)?,
                loader,
                db,
                PanelBlocklistOptions {
                    allowlist_resolver: optional_ref(ctx, id, &cfg.allowlist_resolver)?,
                    blocklist_resolver: optional_ref(ctx, id, &cfg.blocklist_resolver)?,
                    ip_allowlist_resolver: optional_ref(ctx, id, &cfg.ip_allowlist_resolver)?,
                    refresh: refresh_period(cfg.refresh),
                },
            )
        }
        group_type => {
            return Err(BuildError::UnsupportedType(format!(
                "unsupported group type '{}' for '{}'",
                group_type, id
            )))
        }
    };

    ctx.resolvers.insert(id.to_string(), resolver);
    Ok(())
}

fn parse_record_type(name: &str) -> Result<RecordType, BuildError> {
    let rtype = match name.to_uppercase().as_str() {
        "A" => RecordType::A,
        "AAAA" => RecordType::Aaaa,
        "NS" => RecordType::Ns,
        "CNAME" => RecordType::Cname,
        "SOA" => RecordType::Soa,
        "PTR" => RecordType::Ptr,
        "MX" => RecordType::Mx,
        "TXT" => RecordType::Txt,
        "SRV" => RecordType::Srv,
        _ => {
            return Err(BuildError::InvalidValue(format!(
                "unknown record type '{}'",
                name
            )))
        }
    };
    Ok(rtype)
}

fn parse_weekday(name: &str) -> Result<chrono::Weekday, BuildError> {
    let day = match name.to_lowercase().as_str() {
        "mon" => chrono::Weekday::Mon,
        "tue" => chrono::Weekday::Tue,
        "wed" => chrono::Weekday::Wed,
        "thu" => chrono::Weekday::Thu,
        "fri" => chrono::Weekday::Fri,
        "sat" => chrono::Weekday::Sat,
        "sun" => chrono::Weekday::Sun,
        _ => {
            return Err(BuildError::InvalidValue(format!(
                "unknown weekday '{}'",
                name
            )))
        }
    };
    Ok(day)
}

fn parse_time(value: &str) -> Result<Option<chrono::NaiveTime>, BuildError> {
    if value.is_empty() {
        return Ok(None);
    }
    chrono::NaiveTime::parse_from_str(value, "%H:%M")
        .map(Some)
        .map_err(|_| BuildError::InvalidValue(format!("invalid time of day '{}'", value)))
}

fn parse_regex(value: &str) -> Result<Option<regex::Regex>, BuildError> {
    if value.is_empty() {
        return Ok(None);
    }
    regex::Regex::new(value)
        .map(Some)
        .map_err(|e| BuildError::InvalidValue(format!("invalid pattern '{}': {}", value, e)))
}

fn build_route(router: &str, cfg: &RouteConfig, ctx: &BuildContext) -> Result<Route, BuildError> {
    let resolver = ctx.resolvers.get(&cfg.resolver).cloned().ok_or_else(|| {
        BuildError::UnknownReference(format!(
            "router '{}' references non-existent resolver '{}'",
            router, cfg.resolver
        ))
    })?;

    Ok(Route {
        types: cfg
            .types
            .iter()
            .map(|t| parse_record_type(t))
            .collect::<Result<_, _>>()?,
        class: cfg.class,
        qname: parse_regex(&cfg.name)?,
        source: parse_cidr_list(&cfg.source)?,
        weekdays: cfg
            .weekdays
            .iter()
            .map(|d| parse_weekday(d))
            .collect::<Result<_, _>>()?,
        before: parse_time(&cfg.before)?,
        after: parse_time(&cfg.after)?,
        doh_path: parse_regex(&cfg.doh_path)?,
        listener: if cfg.listener.is_empty() {
            None
        } else {
            Some(cfg.listener.clone())
        },
        tls_server_name: parse_regex(&cfg.tls_server_name)?,
        invert: cfg.invert,
        resolver,
    })
}

pub(super) fn instantiate_router(
    id: &str,
    cfg: &RouterConfig,
    ctx: &mut BuildContext,
) -> Result<(), BuildError> {
    let routes = cfg
        .routes
        .iter()
        .map(|r| build_route(id, r, ctx))
        .collect::<Result<Vec<_>, _>>()?;
    let router = Router::new(id, routes)?;
    ctx.resolvers.insert(id.to_string(), Arc::new(router));
    Ok(())
}

/// TLS material for a listener: explicit files first, the certificate
/// provider's files otherwise.
fn listener_material(cfg: &ListenerConfig) -> Result<Option<CertMaterial>, BuildError> {
    if !cfg.server_crt.is_empty() {
        if cfg.server_key.is_empty() {
            return Err(BuildError::InvalidValue(
                "server-crt without server-key".to_string(),
            ));
        }
        return Ok(Some(CertMaterial {
            cert: std::fs::read(&cfg.server_crt)?,
            key: std::fs::read(&cfg.server_key)?,
            ca: read_optional(&cfg.ca)?,
        }));
    }
    if !cfg.cert.cert_file.is_empty() {
        return Ok(Some(cfg.cert.load()?));
    }
    Ok(None)
}

fn require_material(id: &str, cfg: &ListenerConfig) -> Result<CertMaterial, BuildError> {
    listener_material(cfg)?.ok_or_else(|| {
        BuildError::InvalidValue(format!(
            "listener '{}' needs certificate material",
            id
        ))
    })
}

fn listener_cert_task(id: &str, cfg: &ListenerConfig, listener: &DynListener) -> Option<PeriodicTask> {
    if !cfg.cert.monitored() {
        return None;
    }
    Some(PeriodicTask {
        tag: format!("cert monitor {}", id),
        interval: Duration::from_secs(cfg.cert.update_periodic.max(1) * 60),
        target: CertTarget::Listener(listener.clone()),
    })
}

/// Build one listener. Called after all resolvers exist since listeners
/// reference them directly.
pub(super) fn instantiate_listener(
    id: &str,
    cfg: &ListenerConfig,
    ctx: &mut BuildContext,
) -> Result<DynListener, BuildError> {
    let listen = ListenOptions {
        allowed_nets: parse_cidr_list(&cfg.allowed_net)?,
    };

    // The admin listener is the only one that routes no queries
    if cfg.protocol == "admin" {
        let tls = listener_material(cfg)?.map(Arc::new);
        let listener: DynListener = Arc::new(AdminListener::new(
            id,
            &address_with_default(&cfg.address, DOH_PORT),
            AdminListenerOptions {
                listen,
                tls,
                cert: cfg.cert.clone(),
            },
        ));
        if let Some(task) = listener_cert_task(id, cfg, &listener) {
            ctx.tasks.push(task);
        }
        return Ok(listener);
    }

    let resolver = ctx.resolvers.get(&cfg.resolver).cloned().ok_or_else(|| {
        BuildError::UnknownReference(format!(
            "listener '{}' references non-existent resolver, group or router '{}'",
            id, cfg.resolver
        ))
    })?;

    let listener: DynListener = match cfg.protocol.as_str() {
        "udp" => Arc::new(DnsListener::new(
            id,
            &address_with_default(&cfg.address, PLAIN_DNS_PORT),
            DnsProtocol::Udp,
            listen,
            resolver.clone(),
        )),
        "tcp" => Arc::new(DnsListener::new(
            id,
            &address_with_default(&cfg.address, PLAIN_DNS_PORT),
            DnsProtocol::Tcp,
            listen,
            resolver.clone(),
        )),
        "dot" => {
            let material = require_material(id, cfg)?;
            Arc::new(DotListener::new(
                id,
                &address_with_default(&cfg.address, DOT_PORT),
                DotListenerOptions {
                    listen,
                    tls_config: tls_server_config(&material, cfg.mutual_tls)?,
                    mutual_tls: cfg.mutual_tls,
                    cert: cfg.cert.clone(),
                },
                resolver.clone(),
            ))
        }
        "doq" => {
            let material = require_material(id, cfg)?;
            Arc::new(DoqListener::new(
                id,
                &address_with_default(&cfg.address, DOQ_PORT),
                DoqListenerOptions {
                    listen,
                    tls_config: tls_server_config(&material, cfg.mutual_tls)?,
                    mutual_tls: cfg.mutual_tls,
                    cert: cfg.cert.clone(),
                },
                resolver.clone(),
            ))
        }
        "dtls" => {
            let material = require_material(id, cfg)?;
            Arc::new(DtlsListener::new(
                id,
                &address_with_default(&cfg.address, DTLS_PORT),
                DtlsListenerOptions {
                    listen,
                    acceptor: Arc::new(crate::tls::dtls_server_config(&material, cfg.mutual_tls)?),
                    mutual_tls: cfg.mutual_tls,
                    cert: cfg.cert.clone(),
                },
                resolver.clone(),
            ))
        }
        "doh" => {
            let tls = if cfg.no_tls {
                None
            } else {
                Some(Arc::new(require_material(id, cfg)?))
            };
            let http_proxy_net = if cfg.frontend.http_proxy_net.is_empty() {
                None
            } else {
                parse_cidr_list(std::slice::from_ref(&cfg.frontend.http_proxy_net))?
                    .into_iter()
                    .next()
            };
            Arc::new(DohListener::new(
                id,
                &address_with_default(&cfg.address, DOH_PORT),
                DohListenerOptions {
                    listen,
                    tls,
                    http_proxy_net,
                    cert: cfg.cert.clone(),
                },
                resolver.clone(),
            ))
        }
        protocol => {
            return Err(BuildError::UnsupportedType(format!(
                "unsupported protocol '{}' for listener '{}'",
                protocol, id
            )))
        }
    };

    if let Some(task) = listener_cert_task(id, cfg, &listener) {
        ctx.tasks.push(task);
    }
    Ok(listener)
}
