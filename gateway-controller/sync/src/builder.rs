use crate::consolidate::consolidate;
use mesh_gateway_controller_core::{
    resolved::{
        ResolvedGateway, ResolvedHttpRule, ResolvedListener, ResolvedRoute, ResolvedTls,
        DEFAULT_CIPHER_SUITES, SDS_CLUSTER,
    },
    route::RouteKind,
    routes::{HeaderFilter, HeaderMatch, HttpMatch, PathMatch, QueryParamMatch},
    gateway::TlsMinVersion,
};
use mesh_gateway_controller_mesh::{
    config_entry::{
        ConfigEntry, GatewayTls, GatewayTlsSds, HttpHeaderModifiers, IngressGateway,
        IngressListener, IngressService, ServiceDefaults, ServiceRoute, ServiceRouteDestination,
        ServiceRouteHttpMatch, ServiceRouteHttpMatchHeader, ServiceRouteHttpMatchQueryParam,
        ServiceRouteMatch, ServiceRouter, ServiceSplit, ServiceSplitter,
    },
    ConfigEntryIndex, Namespace,
};

/// The mesh translation of one resolved gateway: the ingress entry plus the
/// supporting router, splitter, and defaults indexes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GatewayEntries {
    pub ingress: IngressGateway,
    pub routers: ConfigEntryIndex,
    pub splitters: ConfigEntryIndex,
    pub defaults: ConfigEntryIndex,
}

/// Maps a gateway-id namespace onto the mesh's namespace model.
pub fn mesh_namespace(namespace: &str) -> Namespace {
    if namespace.is_empty() {
        None
    } else {
        Some(namespace.to_string())
    }
}

/// Translates a resolved gateway into mesh config entries.
pub fn build(gateway: &ResolvedGateway) -> GatewayEntries {
    let namespace = mesh_namespace(&gateway.id.namespace);
    let mut entries = GatewayEntries {
        ingress: IngressGateway {
            name: gateway.id.service.clone(),
            namespace: namespace.clone(),
            meta: gateway.meta.clone(),
            listeners: Vec::new(),
        },
        ..Default::default()
    };

    for listener in &gateway.listeners {
        if listener.routes.is_empty() {
            continue;
        }
        let services = match listener.protocol.route_kind() {
            Some(RouteKind::Http) => {
                build_http_listener(gateway, listener, &namespace, &mut entries)
            }
            Some(RouteKind::Tcp) => build_tcp_listener(listener),
            None => continue,
        };
        if services.is_empty() {
            continue;
        }
        entries.ingress.listeners.push(IngressListener {
            port: listener.port,
            protocol: listener.protocol.as_str().to_string(),
            services,
            tls: listener.tls.as_ref().map(gateway_tls),
        });
    }

    entries
}

fn build_http_listener(
    gateway: &ResolvedGateway,
    listener: &ResolvedListener,
    namespace: &Namespace,
    entries: &mut GatewayEntries,
) -> Vec<IngressService> {
    let http_routes: Vec<_> = listener
        .routes
        .iter()
        .filter_map(|route| match route {
            ResolvedRoute::Http(http) => Some(http.clone()),
            ResolvedRoute::Tcp(_) => None,
        })
        .collect();

    let mut services = Vec::new();
    for synthetic in consolidate(&gateway.id.service, &http_routes) {
        let mut routes = Vec::new();
        for (index, rule) in synthetic.rules.iter().enumerate() {
            let destination = rule_destination(&synthetic.name, index, rule, namespace, entries);
            if rule.matches.is_empty() {
                routes.push(ServiceRoute {
                    matches: None,
                    destination: Some(destination.clone()),
                });
            }
            for matches in &rule.matches {
                routes.push(ServiceRoute {
                    matches: Some(ServiceRouteMatch {
                        http: Some(http_match(matches)),
                    }),
                    destination: Some(destination.clone()),
                });
            }
        }

        entries.routers.add(ConfigEntry::ServiceRouter(ServiceRouter {
            name: synthetic.name.clone(),
            namespace: namespace.clone(),
            meta: gateway.meta.clone(),
            routes,
        }));
        entries.defaults.add(http_defaults(&synthetic.name, namespace));

        services.push(IngressService {
            name: synthetic.name.clone(),
            namespace: namespace.clone(),
            hosts: synthetic.hostnames.clone(),
        });
    }
    services
}

fn build_tcp_listener(listener: &ResolvedListener) -> Vec<IngressService> {
    listener
        .routes
        .iter()
        .filter_map(|route| match route {
            ResolvedRoute::Tcp(tcp) => Some(IngressService {
                name: tcp.service.name.clone(),
                namespace: tcp.service.namespace.clone(),
                hosts: Vec::new(),
            }),
            ResolvedRoute::Http(_) => None,
        })
        .collect()
}

/// The router destination for a rule: the sole back-end directly, or a
/// virtual splitter service when the rule fans out.
fn rule_destination(
    route_name: &str,
    rule_index: usize,
    rule: &ResolvedHttpRule,
    namespace: &Namespace,
    entries: &mut GatewayEntries,
) -> ServiceRouteDestination {
    if let [only] = rule.services.as_slice() {
        let merged = HeaderFilter::merged(rule.filters.iter().chain(only.filters.iter()));
        return ServiceRouteDestination {
            service: only.service.name.clone(),
            namespace: only.service.namespace.clone(),
            request_headers: modifiers(merged),
        };
    }

    let splitter_name = format!("{route_name}-{rule_index}");
    let total: u64 = rule.services.iter().map(|s| u64::from(s.weight)).sum();
    let splits: Vec<ServiceSplit> = rule
        .services
        .iter()
        .filter(|service| service.weight > 0)
        .map(|service| ServiceSplit {
            weight: service.weight as f32 / total as f32 * 100.0,
            service: service.service.name.clone(),
            namespace: service.service.namespace.clone(),
            request_headers: modifiers(HeaderFilter::merged(service.filters.iter())),
        })
        .collect();
    if !splits.is_empty() {
        entries
            .splitters
            .add(ConfigEntry::ServiceSplitter(ServiceSplitter {
                name: splitter_name.clone(),
                namespace: namespace.clone(),
                splits,
            }));
        entries.defaults.add(http_defaults(&splitter_name, namespace));
    }

    ServiceRouteDestination {
        service: splitter_name,
        namespace: namespace.clone(),
        request_headers: modifiers(HeaderFilter::merged(rule.filters.iter())),
    }
}

fn http_defaults(name: &str, namespace: &Namespace) -> ConfigEntry {
    ConfigEntry::ServiceDefaults(ServiceDefaults {
        name: name.to_string(),
        namespace: namespace.clone(),
        protocol: "http".to_string(),
    })
}

fn modifiers(filter: HeaderFilter) -> Option<HttpHeaderModifiers> {
    if filter.is_empty() {
        return None;
    }
    Some(HttpHeaderModifiers {
        add: filter.add,
        set: filter.set,
        remove: filter.remove,
    })
}

fn gateway_tls(tls: &ResolvedTls) -> GatewayTls {
    GatewayTls {
        enabled: true,
        min_version: Some(
            tls.min_version
                .unwrap_or(TlsMinVersion::V1_2)
                .as_str()
                .to_string(),
        ),
        cipher_suites: Some(tls.cipher_suites.clone().unwrap_or_else(|| {
            DEFAULT_CIPHER_SUITES
                .iter()
                .map(ToString::to_string)
                .collect()
        })),
        sds: tls.certificates.first().map(|certificate| GatewayTlsSds {
            cluster_name: SDS_CLUSTER.to_string(),
            cert_resource: certificate.clone(),
        }),
    }
}

fn http_match(matches: &HttpMatch) -> ServiceRouteHttpMatch {
    let mut out = ServiceRouteHttpMatch::default();
    match &matches.path {
        Some(PathMatch::Exact(value)) => out.path_exact = Some(value.clone()),
        Some(PathMatch::Prefix(value)) => out.path_prefix = Some(value.clone()),
        Some(PathMatch::Regex(value)) => out.path_regex = Some(value.as_str().to_string()),
        None => {}
    }
    for header in &matches.headers {
        out.header.push(match header {
            HeaderMatch::Exact { name, value } => ServiceRouteHttpMatchHeader {
                name: name.clone(),
                exact: Some(value.clone()),
                ..Default::default()
            },
            HeaderMatch::Prefix { name, value } => ServiceRouteHttpMatchHeader {
                name: name.clone(),
                prefix: Some(value.clone()),
                ..Default::default()
            },
            HeaderMatch::Suffix { name, value } => ServiceRouteHttpMatchHeader {
                name: name.clone(),
                suffix: Some(value.clone()),
                ..Default::default()
            },
            HeaderMatch::Regex { name, value } => ServiceRouteHttpMatchHeader {
                name: name.clone(),
                regex: Some(value.as_str().to_string()),
                ..Default::default()
            },
            HeaderMatch::Present { name } => ServiceRouteHttpMatchHeader {
                name: name.clone(),
                present: true,
                ..Default::default()
            },
        });
    }
    for query in &matches.query_params {
        out.query_param.push(match query {
            QueryParamMatch::Exact { name, value } => ServiceRouteHttpMatchQueryParam {
                name: name.clone(),
                exact: Some(value.clone()),
                ..Default::default()
            },
            QueryParamMatch::Regex { name, value } => ServiceRouteHttpMatchQueryParam {
                name: name.clone(),
                regex: Some(value.as_str().to_string()),
                ..Default::default()
            },
            QueryParamMatch::Present { name } => ServiceRouteHttpMatchQueryParam {
                name: name.clone(),
                present: true,
                ..Default::default()
            },
        });
    }
    if let Some(method) = &matches.method {
        out.methods.push(method.as_str().to_string());
    }
    out
}
