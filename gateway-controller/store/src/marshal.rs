use mesh_gateway_controller_core::{Gateway, Route};

#[derive(Debug, thiserror::Error)]
#[error("marshaling failed: {0}")]
pub struct MarshalError(#[from] serde_json::Error);

/// Byte-level serialization of gateways and routes for opaque storage by the
/// backend. `unmarshal(marshal(x)) == x` for every well-formed value.
pub fn marshal_gateway(gateway: &Gateway) -> Result<Vec<u8>, MarshalError> {
    Ok(serde_json::to_vec(gateway)?)
}

pub fn unmarshal_gateway(data: &[u8]) -> Result<Gateway, MarshalError> {
    Ok(serde_json::from_slice(data)?)
}

pub fn marshal_route(route: &Route) -> Result<Vec<u8>, MarshalError> {
    Ok(serde_json::to_vec(route)?)
}

pub fn unmarshal_route(data: &[u8]) -> Result<Route, MarshalError> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use mesh_gateway_controller_core::{
        gateway::{BindScope, Listener, ListenerTls, PodState, Protocol, SyncStatus, TlsMinVersion},
        resolve::{ResolutionError, ResolvedService},
        route::{
            BackendRef, BackendState, HttpBackend, HttpRoute, HttpRouteRule, ParentRef, RouteState,
            TcpBackend, TcpRoute,
        },
        routes::{HeaderFilter, HeaderMatch, HttpMatch, Method, PathMatch},
        GatewayId, RouteId,
    };

    #[test]
    fn gateways_round_trip() {
        let mut listener = Listener::new("https", 443, Protocol::Https);
        listener.hostname = Some("*.example.com".to_string());
        listener.tls = Some(ListenerTls {
            min_version: Some(TlsMinVersion::V1_3),
            cipher_suites: Some(vec!["TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256".to_string()]),
            certificates: vec!["secret/ns/cert".to_string()],
        });
        listener.routes.insert(RouteId::new("route-1"));

        let mut gateway = Gateway::new(GatewayId::new("team-a", "gw"), vec![listener]);
        gateway.meta = btreemap! {"external-source".to_string() => "controller".to_string()};
        gateway.bind_scope = BindScope::SameNamespace;
        gateway.pod_state = PodState::Running;
        gateway.addresses = vec!["10.1.2.3".to_string()];
        gateway.sync = Some(SyncStatus {
            synced: true,
            last_error: None,
        });

        let bytes = marshal_gateway(&gateway).expect("marshals");
        let decoded = unmarshal_gateway(&bytes).expect("unmarshals");
        assert_eq!(gateway, decoded);
    }

    #[test]
    fn http_routes_round_trip() {
        let gateway = GatewayId::new("team-a", "gw");
        let mut state = RouteState::default();
        state
            .bound
            .entry(gateway.clone())
            .or_default()
            .insert("https".to_string());
        state
            .resolution_errors
            .add(ResolutionError::BackendNotFound("team-b/api".to_string()));

        let route = Route::Http(HttpRoute {
            id: RouteId::new("route-1"),
            name: "route-1".to_string(),
            namespace: "team-a".to_string(),
            hostnames: vec!["example.com".to_string()],
            parent_refs: vec![ParentRef {
                gateway,
                section_name: Some("https".to_string()),
                port: Some(443),
            }],
            rules: vec![HttpRouteRule {
                matches: vec![HttpMatch {
                    path: Some(PathMatch::regex("/v[12]/.*").expect("valid regex")),
                    headers: vec![HeaderMatch::Present {
                        name: "x-debug".to_string(),
                    }],
                    query_params: vec![],
                    method: Some(Method::POST),
                }],
                filters: vec![HeaderFilter {
                    add: btreemap! {"x-added".to_string() => "1".to_string()},
                    set: Default::default(),
                    remove: vec!["x-internal".to_string()],
                }],
                backends: vec![HttpBackend {
                    backend: BackendRef::service("api", Some("team-b".to_string()), 8080),
                    weight: 10,
                    filters: vec![],
                    state: BackendState::Resolved(ResolvedService {
                        namespace: None,
                        name: "api-mesh".to_string(),
                    }),
                }],
            }],
            state,
        });

        let bytes = marshal_route(&route).expect("marshals");
        let decoded = unmarshal_route(&bytes).expect("unmarshals");
        assert_eq!(route, decoded);
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        assert!(unmarshal_gateway(b"not json").is_err());
        assert!(unmarshal_route(b"{\"Unknown\":{}}").is_err());
    }

    #[test]
    fn tcp_routes_round_trip() {
        let route = Route::Tcp(TcpRoute {
            id: RouteId::new("tcp-1"),
            name: "tcp-1".to_string(),
            namespace: "default".to_string(),
            parent_refs: vec![ParentRef::new(GatewayId::new("default", "gw"))],
            service: TcpBackend {
                backend: BackendRef::service("postgres", None, 5432),
                state: BackendState::Unresolved,
            },
            state: RouteState::default(),
        });

        let bytes = marshal_route(&route).expect("marshals");
        let decoded = unmarshal_route(&bytes).expect("unmarshals");
        assert_eq!(route, decoded);
    }
}
