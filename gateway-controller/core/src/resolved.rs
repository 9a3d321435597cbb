use crate::{
    bind,
    gateway::{Gateway, Listener, Protocol, TlsMinVersion},
    resolve::ResolvedService,
    route::{BackendState, HttpRouteRule, Route},
    routes::{HeaderFilter, HttpMatch},
    GatewayId, RouteId,
};
use std::collections::BTreeMap;

/// Cipher suites offered when a listener does not pin its own: the modern
/// AEAD set, with RSA key exchange and SHA-1 constructions excluded.
pub const DEFAULT_CIPHER_SUITES: &[&str] = &[
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305",
];

/// The SDS cluster Envoy fetches listener certificates from.
pub const SDS_CLUSTER: &str = "sds-cluster";

/// The snapshot handed to the sync adapter: every listener that passed
/// validation, carrying only routes that were bound and whose back-ends
/// resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedGateway {
    pub id: GatewayId,
    pub meta: BTreeMap<String, String>,
    pub listeners: Vec<ResolvedListener>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedListener {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    pub hostname: Option<String>,
    pub tls: Option<ResolvedTls>,
    pub routes: Vec<ResolvedRoute>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedTls {
    pub min_version: Option<TlsMinVersion>,
    pub cipher_suites: Option<Vec<String>>,
    pub certificates: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvedRoute {
    Http(ResolvedHttpRoute),
    Tcp(ResolvedTcpRoute),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedHttpRoute {
    pub id: RouteId,
    pub name: String,
    pub hostnames: Vec<String>,
    pub rules: Vec<ResolvedHttpRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedHttpRule {
    pub matches: Vec<HttpMatch>,
    pub filters: Vec<HeaderFilter>,
    pub services: Vec<ResolvedHttpService>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedHttpService {
    pub service: ResolvedService,
    pub weight: u32,
    pub filters: Vec<HeaderFilter>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedTcpRoute {
    pub id: RouteId,
    pub name: String,
    pub service: ResolvedService,
}

// === impl Gateway ===

impl Gateway {
    /// Materializes the gateway snapshot from its admitted routes. Listeners
    /// that failed validation and routes with unresolved back-ends are left
    /// out.
    pub fn resolve(&self, routes: &BTreeMap<RouteId, Route>) -> ResolvedGateway {
        let listeners = self
            .valid_listeners()
            .map(|listener| self.resolve_listener(listener, routes))
            .collect();
        ResolvedGateway {
            id: self.id.clone(),
            meta: self.meta.clone(),
            listeners,
        }
    }

    fn resolve_listener(
        &self,
        listener: &Listener,
        routes: &BTreeMap<RouteId, Route>,
    ) -> ResolvedListener {
        let resolved_routes = listener
            .routes
            .iter()
            .filter_map(|id| routes.get(id))
            .filter_map(|route| resolve_route(listener, route))
            .collect();
        ResolvedListener {
            name: listener.name.clone(),
            port: listener.port,
            protocol: listener.protocol,
            hostname: listener.hostname.clone(),
            tls: listener.protocol.requires_tls().then(|| {
                let tls = listener.tls.as_ref();
                ResolvedTls {
                    min_version: tls.and_then(|t| t.min_version),
                    cipher_suites: tls.and_then(|t| t.cipher_suites.clone()),
                    certificates: tls.map(|t| t.certificates.clone()).unwrap_or_default(),
                }
            }),
            routes: resolved_routes,
        }
    }
}

fn resolve_route(listener: &Listener, route: &Route) -> Option<ResolvedRoute> {
    match route {
        Route::Http(http) => {
            let hostnames = bind::intersection(listener.hostname.as_deref(), &http.hostnames);
            let rules: Vec<_> = http.rules.iter().filter_map(resolve_rule).collect();
            if rules.is_empty() {
                return None;
            }
            Some(ResolvedRoute::Http(ResolvedHttpRoute {
                id: http.id.clone(),
                name: http.name.clone(),
                hostnames,
                rules,
            }))
        }
        Route::Tcp(tcp) => match &tcp.service.state {
            BackendState::Resolved(service) => Some(ResolvedRoute::Tcp(ResolvedTcpRoute {
                id: tcp.id.clone(),
                name: tcp.name.clone(),
                service: service.clone(),
            })),
            _ => None,
        },
    }
}

fn resolve_rule(rule: &HttpRouteRule) -> Option<ResolvedHttpRule> {
    let services: Vec<_> = rule
        .backends
        .iter()
        .filter_map(|backend| match &backend.state {
            BackendState::Resolved(service) => Some(ResolvedHttpService {
                service: service.clone(),
                weight: backend.weight,
                filters: backend.filters.clone(),
            }),
            _ => None,
        })
        .collect();
    if services.is_empty() {
        return None;
    }
    Some(ResolvedHttpRule {
        matches: rule.matches.clone(),
        filters: rule.filters.clone(),
        services,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gateway::ListenerTls,
        resolve::ResolutionError,
        route::{BackendRef, HttpBackend, HttpRoute, ParentRef, RouteState, TcpBackend, TcpRoute},
    };
    use pretty_assertions::assert_eq;

    fn resolved(name: &str) -> BackendState {
        BackendState::Resolved(ResolvedService {
            namespace: None,
            name: name.to_string(),
        })
    }

    fn http_route(id: &str, gateway: &Gateway, backends: Vec<HttpBackend>) -> Route {
        Route::Http(HttpRoute {
            id: RouteId::new(id),
            name: id.to_string(),
            namespace: "default".to_string(),
            hostnames: vec!["example.com".to_string()],
            parent_refs: vec![ParentRef::new(gateway.id.clone())],
            rules: vec![crate::route::HttpRouteRule {
                matches: vec![],
                filters: vec![],
                backends,
            }],
            state: RouteState::default(),
        })
    }

    fn backend(name: &str, state: BackendState) -> HttpBackend {
        HttpBackend {
            backend: BackendRef::service(name, None, 8080),
            weight: 1,
            filters: vec![],
            state,
        }
    }

    #[test]
    fn only_resolved_backends_are_materialized() {
        let mut gateway = Gateway::new(
            crate::GatewayId::new("default", "gw"),
            vec![Listener::new("http", 80, Protocol::Http)],
        );
        let route = http_route(
            "route-1",
            &gateway,
            vec![
                backend("web", resolved("web")),
                backend(
                    "api",
                    BackendState::Failed(ResolutionError::BackendNotFound("api".to_string())),
                ),
            ],
        );
        gateway.listeners[0].routes.insert(route.id().clone());

        let snapshot = gateway.resolve(&BTreeMap::from([(route.id().clone(), route)]));
        assert_eq!(snapshot.listeners.len(), 1);
        let routes = &snapshot.listeners[0].routes;
        assert_eq!(routes.len(), 1);
        match &routes[0] {
            ResolvedRoute::Http(http) => {
                assert_eq!(http.rules.len(), 1);
                assert_eq!(http.rules[0].services.len(), 1);
                assert_eq!(http.rules[0].services[0].service.name, "web");
            }
            other => panic!("expected http route, got {other:?}"),
        }
    }

    #[test]
    fn rules_with_no_resolved_backends_drop_the_route() {
        let mut gateway = Gateway::new(
            crate::GatewayId::new("default", "gw"),
            vec![Listener::new("http", 80, Protocol::Http)],
        );
        let route = http_route(
            "route-1",
            &gateway,
            vec![backend("api", BackendState::Unresolved)],
        );
        gateway.listeners[0].routes.insert(route.id().clone());

        let snapshot = gateway.resolve(&BTreeMap::from([(route.id().clone(), route)]));
        assert!(snapshot.listeners[0].routes.is_empty());
    }

    #[test]
    fn invalid_listeners_never_reach_the_snapshot() {
        let gateway = Gateway::new(
            crate::GatewayId::new("default", "gw"),
            vec![
                Listener::new("http", 80, Protocol::Http),
                // No certificates, so validation rejects the listener.
                Listener::new("https", 443, Protocol::Https),
            ],
        );
        let snapshot = gateway.resolve(&BTreeMap::new());
        let names: Vec<_> = snapshot.listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["http"]);
    }

    #[test]
    fn tcp_routes_resolve_to_their_single_service() {
        let mut listener = Listener::new("db", 5432, Protocol::Tls);
        listener.tls = Some(ListenerTls {
            min_version: None,
            cipher_suites: None,
            certificates: vec!["secret/db-cert".to_string()],
        });
        let mut gateway = Gateway::new(crate::GatewayId::new("default", "gw"), vec![listener]);
        let route = Route::Tcp(TcpRoute {
            id: RouteId::new("tcp-1"),
            name: "tcp-1".to_string(),
            namespace: "default".to_string(),
            parent_refs: vec![ParentRef::new(gateway.id.clone())],
            service: TcpBackend {
                backend: BackendRef::service("postgres", None, 5432),
                state: resolved("postgres"),
            },
            state: RouteState::default(),
        });
        gateway.listeners[0].routes.insert(route.id().clone());

        let snapshot = gateway.resolve(&BTreeMap::from([(route.id().clone(), route)]));
        let listener = &snapshot.listeners[0];
        assert!(listener.tls.is_some());
        match &listener.routes[0] {
            ResolvedRoute::Tcp(tcp) => assert_eq!(tcp.service.name, "postgres"),
            other => panic!("expected tcp route, got {other:?}"),
        }
    }
}
