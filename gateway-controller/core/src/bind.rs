use crate::{
    gateway::Gateway,
    route::{BindError, ParentRef, Route},
};
use std::collections::BTreeSet;

/// Decides whether a route is admissible to a gateway's listeners and
/// applies or undoes bindings.
///
/// Binding is pure over the (gateway, route) pair: it mutates only the
/// route's recorded state and the listeners' admitted-route sets, and is
/// idempotent.
#[derive(Copy, Clone, Debug, Default)]
pub struct Binder;

impl Binder {
    /// Recomputes the route's binding against the gateway, returning whether
    /// any recorded state changed on either side.
    pub fn bind(&self, gateway: &mut Gateway, route: &mut Route) -> bool {
        let id = gateway.id.clone();
        let refs: Vec<ParentRef> = route
            .parent_refs()
            .iter()
            .filter(|parent| parent.gateway == id)
            .cloned()
            .collect();

        let listener_errors = gateway.listener_errors();
        let mut bound = BTreeSet::new();
        let mut error: Option<BindError> = None;
        let mut conflicted = false;

        for parent in &refs {
            let mut any_candidate = false;
            for listener in &gateway.listeners {
                if !parent.selects(&listener.name, listener.port) {
                    continue;
                }
                any_candidate = true;

                if let Some(listener_error) = listener_errors.get(&listener.name) {
                    if listener_error.is_conflict() {
                        conflicted = true;
                    }
                    continue;
                }
                if !listener.allows_kind(route.kind()) {
                    record(&mut error, BindError::InvalidRouteKind);
                    continue;
                }
                if matches!(route, Route::Http(_))
                    && intersection(listener.hostname.as_deref(), route.hostnames()).is_empty()
                {
                    record(&mut error, BindError::NoMatchingListenerHostname);
                    continue;
                }
                if !gateway.should_bind(route) {
                    record(&mut error, BindError::NotAllowed);
                    continue;
                }
                bound.insert(listener.name.clone());
            }
            if !any_candidate {
                record(&mut error, BindError::NoMatchingParent);
            }
        }

        tracing::trace!(
            gateway = %id,
            route = %route.id(),
            listeners = bound.len(),
            "computed route binding"
        );
        let mut changed = false;

        // Route side: the bound set, the bind error, and the conflict marker.
        let state = route.state_mut();
        if bound.is_empty() {
            changed |= state.bound.remove(&id).is_some();
        } else if state.bound.get(&id) != Some(&bound) {
            state.bound.insert(id.clone(), bound.clone());
            changed = true;
        }
        let error = error.filter(|_| bound.is_empty() && !refs.is_empty());
        match error {
            Some(error) => {
                if state.bind_errors.get(&id) != Some(&error) {
                    state.bind_errors.insert(id.clone(), error);
                    changed = true;
                }
            }
            None => changed |= state.bind_errors.remove(&id).is_some(),
        }
        if conflicted {
            changed |= state.conflicted.insert(id.clone());
        } else {
            changed |= state.conflicted.remove(&id);
        }

        // Gateway side: each listener's admitted-route set.
        let route_id = route.id().clone();
        for listener in &mut gateway.listeners {
            if bound.contains(&listener.name) {
                changed |= listener.routes.insert(route_id.clone());
            } else {
                changed |= listener.routes.remove(&route_id);
            }
        }

        changed
    }

    /// Removes the route from every listener of the gateway. Returns true iff
    /// the route was previously bound to any of them.
    pub fn unbind(&self, gateway: &mut Gateway, route: &mut Route) -> bool {
        let id = gateway.id.clone();
        let route_id = route.id().clone();

        let mut removed = false;
        for listener in &mut gateway.listeners {
            removed |= listener.routes.remove(&route_id);
        }
        let was_bound = route
            .state()
            .bound
            .get(&id)
            .map(|listeners| !listeners.is_empty())
            .unwrap_or(false);
        route.state_mut().forget(&id);

        removed || was_bound
    }
}

fn record(slot: &mut Option<BindError>, error: BindError) {
    let rank = |e: &BindError| match e {
        BindError::NotAllowed => 3,
        BindError::NoMatchingListenerHostname => 2,
        BindError::InvalidRouteKind => 1,
        BindError::NoMatchingParent => 0,
    };
    if slot.as_ref().map(|held| rank(held) < rank(&error)).unwrap_or(true) {
        *slot = Some(error);
    }
}

/// Intersects a listener hostname with a route's hostname set, producing the
/// hostnames the pairing actually serves. Wildcards narrow toward the more
/// specific side.
pub fn intersection(listener: Option<&str>, route_hostnames: &[String]) -> Vec<String> {
    let listener = match listener {
        None | Some("") | Some("*") => {
            return if route_hostnames.is_empty() {
                vec!["*".to_string()]
            } else {
                route_hostnames.to_vec()
            };
        }
        Some(hostname) => hostname,
    };
    if route_hostnames.is_empty() {
        return vec![listener.to_string()];
    }
    route_hostnames
        .iter()
        .filter_map(|hostname| intersect_one(listener, hostname))
        .collect()
}

fn intersect_one(listener: &str, hostname: &str) -> Option<String> {
    if listener == hostname || hostname == "*" {
        return Some(listener.to_string());
    }
    if let Some(suffix) = listener.strip_prefix("*.") {
        if hostname.ends_with(suffix)
            && hostname.len() > suffix.len() + 1
            && hostname.as_bytes()[hostname.len() - suffix.len() - 1] == b'.'
            && !hostname.starts_with("*.")
        {
            return Some(hostname.to_string());
        }
    }
    if let Some(suffix) = hostname.strip_prefix("*.") {
        if listener.ends_with(suffix)
            && listener.len() > suffix.len() + 1
            && listener.as_bytes()[listener.len() - suffix.len() - 1] == b'.'
        {
            return Some(listener.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gateway::{BindScope, Listener, ListenerTls, Protocol},
        route::{HttpRoute, RouteState, TcpBackend, TcpRoute},
        GatewayId, RouteId,
    };
    use pretty_assertions::assert_eq;

    fn http_route(id: &str, hostnames: &[&str], parent: ParentRef) -> Route {
        Route::Http(HttpRoute {
            id: RouteId::new(id),
            name: id.to_string(),
            namespace: "default".to_string(),
            hostnames: hostnames.iter().map(ToString::to_string).collect(),
            parent_refs: vec![parent],
            rules: vec![],
            state: RouteState::default(),
        })
    }

    fn gateway(listeners: Vec<Listener>) -> Gateway {
        Gateway::new(GatewayId::new("default", "gw"), listeners)
    }

    #[test]
    fn binds_http_route_to_matching_listener() {
        let mut gw = gateway(vec![Listener::new("http", 80, Protocol::Http)]);
        let mut route = http_route("route-1", &["example.com"], ParentRef::new(gw.id.clone()));

        let binder = Binder;
        assert!(binder.bind(&mut gw, &mut route));
        assert!(route.is_bound_to(&gw.id));
        assert!(gw.listeners[0].routes.contains(route.id()));

        // Idempotent.
        assert!(!binder.bind(&mut gw, &mut route));
    }

    #[test]
    fn hostname_mismatch_is_recorded() {
        let mut listener = Listener::new("http", 80, Protocol::Http);
        listener.hostname = Some("other.net".to_string());
        let mut gw = gateway(vec![listener]);
        let mut route = http_route("route-1", &["example.com"], ParentRef::new(gw.id.clone()));

        assert!(Binder.bind(&mut gw, &mut route));
        assert!(!route.is_bound_to(&gw.id));
        assert_eq!(
            route.state().bind_errors.get(&gw.id),
            Some(&BindError::NoMatchingListenerHostname)
        );
    }

    #[test]
    fn tcp_routes_do_not_bind_to_http_listeners() {
        let mut gw = gateway(vec![Listener::new("http", 80, Protocol::Http)]);
        let mut route = Route::Tcp(TcpRoute {
            id: RouteId::new("tcp-1"),
            name: "tcp-1".to_string(),
            namespace: "default".to_string(),
            parent_refs: vec![ParentRef::new(gw.id.clone())],
            service: TcpBackend {
                backend: crate::route::BackendRef::service("db", None, 5432),
                state: Default::default(),
            },
            state: RouteState::default(),
        });

        assert!(Binder.bind(&mut gw, &mut route));
        assert!(!route.is_bound_to(&gw.id));
        assert_eq!(
            route.state().bind_errors.get(&gw.id),
            Some(&BindError::InvalidRouteKind)
        );
    }

    #[test]
    fn same_namespace_scope_rejects_foreign_routes() {
        let mut gw = gateway(vec![Listener::new("http", 80, Protocol::Http)]);
        gw.bind_scope = BindScope::SameNamespace;
        let mut route = http_route("route-1", &[], ParentRef::new(gw.id.clone()));
        if let Route::Http(http) = &mut route {
            http.namespace = "other".to_string();
        }

        assert!(Binder.bind(&mut gw, &mut route));
        assert_eq!(
            route.state().bind_errors.get(&gw.id),
            Some(&BindError::NotAllowed)
        );
    }

    #[test]
    fn section_name_narrows_the_listener_set() {
        let mut https = Listener::new("https", 443, Protocol::Https);
        https.tls = Some(ListenerTls {
            min_version: None,
            cipher_suites: None,
            certificates: vec!["secret/cert".to_string()],
        });
        let mut gw = gateway(vec![Listener::new("http", 80, Protocol::Http), https]);
        let parent = ParentRef {
            gateway: gw.id.clone(),
            section_name: Some("https".to_string()),
            port: None,
        };
        let mut route = http_route("route-1", &["example.com"], parent);

        assert!(Binder.bind(&mut gw, &mut route));
        assert_eq!(
            route.state().bound.get(&gw.id).map(|set| set.len()),
            Some(1)
        );
        assert!(gw.listener("https").expect("listener").routes.contains(route.id()));
        assert!(gw.listener("http").expect("listener").routes.is_empty());
    }

    #[test]
    fn port_scoped_parents_bind_every_listener_on_the_port() {
        let mut first = Listener::new("a", 8080, Protocol::Http);
        first.hostname = Some("a.example.com".to_string());
        let mut second = Listener::new("b", 8080, Protocol::Http);
        second.hostname = Some("b.example.com".to_string());
        let mut gw = gateway(vec![first, second, Listener::new("c", 9090, Protocol::Http)]);

        let parent = ParentRef {
            gateway: gw.id.clone(),
            section_name: None,
            port: Some(8080),
        };
        let mut route = http_route("route-1", &[], parent);

        assert!(Binder.bind(&mut gw, &mut route));
        let bound = route.state().bound.get(&gw.id).expect("bound listeners");
        assert_eq!(
            bound.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(gw.listener("c").expect("listener").routes.is_empty());
    }

    #[test]
    fn wildcard_listeners_accept_subdomain_routes() {
        let mut listener = Listener::new("http", 80, Protocol::Http);
        listener.hostname = Some("*.example.com".to_string());
        let mut gw = gateway(vec![listener]);
        let mut route = http_route("route-1", &["api.example.com"], ParentRef::new(gw.id.clone()));

        assert!(Binder.bind(&mut gw, &mut route));
        assert!(route.is_bound_to(&gw.id));

        // The apex does not match the wildcard.
        let mut apex = http_route("route-2", &["example.com"], ParentRef::new(gw.id.clone()));
        Binder.bind(&mut gw, &mut apex);
        assert!(!apex.is_bound_to(&gw.id));
    }

    #[test]
    fn conflicted_listeners_mark_the_route_without_admitting_it() {
        let mut gw = gateway(vec![
            Listener::new("a", 9000, Protocol::Tcp),
            Listener::new("b", 9000, Protocol::Tcp),
        ]);
        let mut route = Route::Tcp(TcpRoute {
            id: RouteId::new("tcp-1"),
            name: "tcp-1".to_string(),
            namespace: "default".to_string(),
            parent_refs: vec![ParentRef::new(gw.id.clone())],
            service: TcpBackend {
                backend: crate::route::BackendRef::service("db", None, 5432),
                state: Default::default(),
            },
            state: RouteState::default(),
        });

        assert!(Binder.bind(&mut gw, &mut route));
        assert!(!route.is_bound_to(&gw.id));
        assert!(route.state().conflicted.contains(&gw.id));
    }

    #[test]
    fn listener_route_kind_restrictions_are_enforced() {
        let mut listener = Listener::new("http", 80, Protocol::Http);
        listener.route_kinds = vec!["HTTPRoute".to_string()];
        let mut gw = gateway(vec![listener]);
        let mut route = http_route("route-1", &[], ParentRef::new(gw.id.clone()));

        assert!(Binder.bind(&mut gw, &mut route));
        assert!(route.is_bound_to(&gw.id));
    }

    #[test]
    fn unbind_reports_prior_binding() {
        let mut gw = gateway(vec![Listener::new("http", 80, Protocol::Http)]);
        let mut route = http_route("route-1", &[], ParentRef::new(gw.id.clone()));

        let binder = Binder;
        binder.bind(&mut gw, &mut route);
        assert!(binder.unbind(&mut gw, &mut route));
        assert!(!binder.unbind(&mut gw, &mut route));
        assert!(gw.listeners[0].routes.is_empty());
    }

    #[test]
    fn removing_the_parent_ref_unbinds_on_rebind() {
        let mut gw = gateway(vec![Listener::new("http", 80, Protocol::Http)]);
        let mut route = http_route("route-1", &[], ParentRef::new(gw.id.clone()));

        let binder = Binder;
        binder.bind(&mut gw, &mut route);
        if let Route::Http(http) = &mut route {
            http.parent_refs.clear();
        }
        assert!(binder.bind(&mut gw, &mut route));
        assert!(!route.is_bound_to(&gw.id));
        assert!(route.state().bind_errors.is_empty());
        assert!(gw.listeners[0].routes.is_empty());
    }

    #[test]
    fn wildcard_listener_narrows_to_route_hostnames() {
        assert_eq!(
            intersection(Some("*.example.com"), &["api.example.com".to_string()]),
            vec!["api.example.com".to_string()]
        );
        assert_eq!(
            intersection(Some("api.example.com"), &["*.example.com".to_string()]),
            vec!["api.example.com".to_string()]
        );
        assert!(intersection(Some("*.example.com"), &["example.com".to_string()]).is_empty());
        assert_eq!(
            intersection(None, &["example.com".to_string()]),
            vec!["example.com".to_string()]
        );
        assert_eq!(intersection(Some("example.com"), &[]), vec!["example.com".to_string()]);
    }
}
