use crate::{
    resolve::{ResolutionErrors, ResolvedService},
    routes::{HeaderFilter, HttpMatch},
    GatewayId, RouteId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const GROUP_CORE: &str = "";
pub const KIND_SERVICE: &str = "Service";
pub const KIND_MESH_SERVICE: &str = "MeshService";

/// A declarative route, tagged by protocol family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    Http(HttpRoute),
    Tcp(TcpRoute),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteKind {
    Http,
    Tcp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRoute {
    pub id: RouteId,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_refs: Vec<ParentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<HttpRouteRule>,
    #[serde(default)]
    pub state: RouteState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRouteRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<HttpMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<HeaderFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backends: Vec<HttpBackend>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpBackend {
    pub backend: BackendRef,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<HeaderFilter>,
    #[serde(default)]
    pub state: BackendState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRoute {
    pub id: RouteId,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parent_refs: Vec<ParentRef>,
    pub service: TcpBackend,
    #[serde(default)]
    pub state: RouteState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpBackend {
    pub backend: BackendRef,
    #[serde(default)]
    pub state: BackendState,
}

/// A route's declared attachment point on a gateway, optionally narrowed to a
/// listener name and port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub gateway: GatewayId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A `(group, kind, name)` reference to a back-end, optionally qualified by
/// namespace, port, and peer cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
}

/// The resolver's verdict for one back-end reference. Immutable once
/// `Resolved`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    #[default]
    Unresolved,
    Resolved(ResolvedService),
    Failed(crate::resolve::ResolutionError),
}

/// Binding outcomes accumulated on the route by the Binder and the resolver.
/// Persisted with the route so statuses survive restarts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteState {
    /// Listener names the route is admitted to, per gateway.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bound: BTreeMap<GatewayId, BTreeSet<String>>,
    /// Why binding failed, for parents the route selected but was not
    /// admitted to.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bind_errors: BTreeMap<GatewayId, BindError>,
    /// Parents whose matched listener was in a conflicted state.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub conflicted: BTreeSet<GatewayId>,
    /// Back-end resolution failures, keyed by error kind.
    #[serde(default, skip_serializing_if = "ResolutionErrors::is_empty")]
    pub resolution_errors: ResolutionErrors,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum BindError {
    #[error("no listener matched the parent reference")]
    NoMatchingParent,
    #[error("route kind is not allowed on the matched listeners")]
    InvalidRouteKind,
    #[error("listener hostnames do not intersect the route hostnames")]
    NoMatchingListenerHostname,
    #[error("the gateway does not allow binding routes from this namespace")]
    NotAllowed,
}

fn default_weight() -> u32 {
    1
}

// === impl Route ===

impl Route {
    pub fn id(&self) -> &RouteId {
        match self {
            Route::Http(route) => &route.id,
            Route::Tcp(route) => &route.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Route::Http(route) => &route.name,
            Route::Tcp(route) => &route.name,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Route::Http(route) => &route.namespace,
            Route::Tcp(route) => &route.namespace,
        }
    }

    pub fn kind(&self) -> RouteKind {
        match self {
            Route::Http(_) => RouteKind::Http,
            Route::Tcp(_) => RouteKind::Tcp,
        }
    }

    pub fn hostnames(&self) -> &[String] {
        match self {
            Route::Http(route) => &route.hostnames,
            Route::Tcp(_) => &[],
        }
    }

    pub fn parent_refs(&self) -> &[ParentRef] {
        match self {
            Route::Http(route) => &route.parent_refs,
            Route::Tcp(route) => &route.parent_refs,
        }
    }

    pub fn state(&self) -> &RouteState {
        match self {
            Route::Http(route) => &route.state,
            Route::Tcp(route) => &route.state,
        }
    }

    pub fn state_mut(&mut self) -> &mut RouteState {
        match self {
            Route::Http(route) => &mut route.state,
            Route::Tcp(route) => &mut route.state,
        }
    }

    /// Every back-end reference on the route, with its mutable resolution
    /// state.
    pub fn backends_mut(&mut self) -> Vec<(BackendRef, &mut BackendState)> {
        match self {
            Route::Http(route) => route
                .rules
                .iter_mut()
                .flat_map(|rule| rule.backends.iter_mut())
                .map(|b| (b.backend.clone(), &mut b.state))
                .collect(),
            Route::Tcp(route) => vec![(route.service.backend.clone(), &mut route.service.state)],
        }
    }

    /// Whether the route is bound to any listener of the given gateway.
    pub fn is_bound_to(&self, id: &GatewayId) -> bool {
        self.state()
            .bound
            .get(id)
            .map(|listeners| !listeners.is_empty())
            .unwrap_or(false)
    }
}

// === impl RouteKind ===

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Http => "HTTPRoute",
            RouteKind::Tcp => "TCPRoute",
        }
    }
}

// === impl ParentRef ===

impl ParentRef {
    pub fn new(gateway: GatewayId) -> Self {
        Self {
            gateway,
            section_name: None,
            port: None,
        }
    }

    /// Whether the parent ref selects the given listener.
    pub fn selects(&self, listener_name: &str, listener_port: u16) -> bool {
        if let Some(section) = &self.section_name {
            if section != listener_name {
                return false;
            }
        }
        if let Some(port) = self.port {
            if port != listener_port {
                return false;
            }
        }
        true
    }
}

// === impl BackendRef ===

impl BackendRef {
    pub fn service(name: impl ToString, namespace: Option<String>, port: u16) -> Self {
        Self {
            group: GROUP_CORE.to_string(),
            kind: KIND_SERVICE.to_string(),
            name: name.to_string(),
            namespace,
            port: Some(port),
            peer: None,
        }
    }

    pub fn is_core_service(&self) -> bool {
        (self.group.is_empty() || self.group.eq_ignore_ascii_case("core"))
            && self.kind.eq_ignore_ascii_case(KIND_SERVICE)
    }

    pub fn is_mesh_service(&self) -> bool {
        self.kind.eq_ignore_ascii_case(KIND_MESH_SERVICE)
    }

    /// The namespace the reference points into, defaulting to the parent's.
    pub fn target_namespace<'a>(&'a self, parent: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(parent)
    }
}

// === impl RouteState ===

impl RouteState {
    /// Forgets everything recorded against the given gateway. Returns true if
    /// any state was removed.
    pub fn forget(&mut self, id: &GatewayId) -> bool {
        let bound = self.bound.remove(id).is_some();
        let errored = self.bind_errors.remove(id).is_some();
        let conflicted = self.conflicted.remove(id);
        bound || errored || conflicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parent_refs_select_by_section_and_port() {
        let gateway = GatewayId::new("default", "gw");
        let by_name = ParentRef {
            gateway: gateway.clone(),
            section_name: Some("https".to_string()),
            port: None,
        };
        assert!(by_name.selects("https", 443));
        assert!(!by_name.selects("http", 443));

        let by_port = ParentRef {
            gateway: gateway.clone(),
            section_name: None,
            port: Some(443),
        };
        assert!(by_port.selects("anything", 443));
        assert!(!by_port.selects("anything", 80));

        assert!(ParentRef::new(gateway).selects("anything", 8080));
    }

    #[test]
    fn backend_kind_probes_ignore_case_and_default_group() {
        let service = BackendRef::service("web", None, 80);
        assert!(service.is_core_service());
        assert!(!service.is_mesh_service());

        let mesh = BackendRef {
            group: "gateway.consul.hashicorp.com".to_string(),
            kind: "meshservice".to_string(),
            name: "billing".to_string(),
            namespace: None,
            port: None,
            peer: None,
        };
        assert!(mesh.is_mesh_service());
        assert!(!mesh.is_core_service());
    }

    #[test]
    fn forgetting_a_gateway_clears_every_trace() {
        let gateway = GatewayId::new("default", "gw");
        let mut state = RouteState::default();
        assert!(!state.forget(&gateway));

        state
            .bound
            .entry(gateway.clone())
            .or_default()
            .insert("http".to_string());
        state
            .bind_errors
            .insert(gateway.clone(), BindError::NoMatchingParent);
        state.conflicted.insert(gateway.clone());
        assert!(state.forget(&gateway));
        assert_eq!(state, RouteState::default());
    }
}
