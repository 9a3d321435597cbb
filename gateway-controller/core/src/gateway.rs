use crate::{
    route::{Route, RouteKind},
    status::ListenerError,
    GatewayId, RouteId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A declarative gateway: an identity, opaque metadata, and a set of
/// listeners. Mutated only by the Binder between upsert and delete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub id: GatewayId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<Listener>,
    /// Which routes the gateway is willing to bind.
    #[serde(default)]
    pub bind_scope: BindScope,
    /// Observed state of the gateway's deployment; the controller only reads
    /// it.
    #[serde(default)]
    pub pod_state: PodState,
    /// Addresses assigned to the deployed gateway.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
    /// Addresses the gateway asked for. Assigning specific addresses is
    /// unsupported, so any entry detaches every listener.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_addresses: Vec<String>,
    /// Present only on gateways that track the outcome of their last mesh
    /// sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ListenerTls>,
    /// Route kinds the listener accepts; empty means every kind the protocol
    /// supports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route_kinds: Vec<String>,
    /// Routes admitted by the Binder, by id.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub routes: BTreeSet<RouteId>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Tls,
    Udp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerTls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<TlsMinVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_suites: Option<Vec<String>>,
    /// Certificate references served over SDS; the first one names the
    /// listener certificate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsMinVersion {
    #[serde(rename = "TLSv1_0")]
    V1_0,
    #[serde(rename = "TLSv1_1")]
    V1_1,
    #[serde(rename = "TLSv1_2")]
    V1_2,
    #[serde(rename = "TLSv1_3")]
    V1_3,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindScope {
    #[default]
    All,
    SameNamespace,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodState {
    #[default]
    Unknown,
    PendingNoResources,
    PendingNotReconciled,
    Running,
    Failed,
}

/// Sync-tracking capability state, present only on gateways that opt in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// === impl Gateway ===

impl Gateway {
    pub fn new(id: GatewayId, listeners: Vec<Listener>) -> Self {
        Self {
            id,
            meta: Default::default(),
            listeners,
            bind_scope: Default::default(),
            pod_state: Default::default(),
            addresses: Default::default(),
            requested_addresses: Default::default(),
            sync: None,
        }
    }

    pub fn listener(&self, name: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.name == name)
    }

    /// The gateway's policy predicate for route admission.
    pub fn should_bind(&self, route: &Route) -> bool {
        match self.bind_scope {
            BindScope::All => true,
            BindScope::SameNamespace => route.namespace() == self.id.namespace,
        }
    }

    /// Probes the optional sync-tracking capability.
    pub fn track_sync_mut(&mut self) -> Option<&mut SyncStatus> {
        self.sync.as_mut()
    }

    /// Whether the gateway may fetch all of the given certificate secrets:
    /// only secrets referenced by its own listeners are fetchable.
    pub fn can_fetch_secrets(&self, secrets: &[String]) -> bool {
        secrets.iter().all(|secret| {
            self.listeners.iter().any(|listener| {
                listener
                    .tls
                    .as_ref()
                    .map(|tls| tls.certificates.contains(secret))
                    .unwrap_or(false)
            })
        })
    }

    /// Computes the validation verdict for each listener: protocol support,
    /// TLS requirements, and cross-listener conflicts.
    pub fn listener_errors(&self) -> BTreeMap<String, ListenerError> {
        let mut errors = BTreeMap::new();

        for listener in &self.listeners {
            if !self.requested_addresses.is_empty() {
                errors.insert(listener.name.clone(), ListenerError::UnsupportedAddress);
                continue;
            }
            if listener.protocol == Protocol::Udp {
                errors.insert(listener.name.clone(), ListenerError::UnsupportedProtocol);
                continue;
            }
            if listener.protocol.requires_tls()
                && listener
                    .tls
                    .as_ref()
                    .map(|tls| tls.certificates.is_empty())
                    .unwrap_or(true)
            {
                errors.insert(listener.name.clone(), ListenerError::InvalidCertificateRef);
                continue;
            }
            if !listener.route_kinds.is_empty()
                && listener.route_kinds.iter().any(|kind| {
                    listener
                        .protocol
                        .route_kind()
                        .map(|supported| supported.as_str() != kind)
                        .unwrap_or(true)
                })
            {
                errors.insert(listener.name.clone(), ListenerError::InvalidRouteKinds);
            }
        }

        for (i, listener) in self.listeners.iter().enumerate() {
            if errors.contains_key(&listener.name) {
                continue;
            }
            for (j, other) in self.listeners.iter().enumerate() {
                if i == j || other.port != listener.port {
                    continue;
                }
                let error = if other.protocol != listener.protocol {
                    ListenerError::ProtocolConflict
                } else if listener.protocol.route_kind() == Some(RouteKind::Tcp) {
                    // Raw TCP listeners cannot share a port at all.
                    ListenerError::PortConflicted
                } else if other.hostname == listener.hostname {
                    ListenerError::HostnameConflict
                } else {
                    continue;
                };
                errors.insert(listener.name.clone(), error);
                break;
            }
        }

        errors
    }

    /// Listeners that passed validation, in declaration order.
    pub fn valid_listeners(&self) -> impl Iterator<Item = &Listener> {
        let errors = self.listener_errors();
        self.listeners
            .iter()
            .filter(move |l| !errors.contains_key(&l.name))
    }
}

// === impl Listener ===

impl Listener {
    pub fn new(name: impl ToString, port: u16, protocol: Protocol) -> Self {
        Self {
            name: name.to_string(),
            hostname: None,
            port,
            protocol,
            tls: None,
            route_kinds: Default::default(),
            routes: Default::default(),
        }
    }

    /// Whether the listener can carry routes of the given kind.
    pub fn allows_kind(&self, kind: RouteKind) -> bool {
        if self.protocol.route_kind() != Some(kind) {
            return false;
        }
        self.route_kinds.is_empty() || self.route_kinds.iter().any(|k| k == kind.as_str())
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "http",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// The route family the protocol carries, if any.
    pub fn route_kind(&self) -> Option<RouteKind> {
        match self {
            Protocol::Http | Protocol::Https => Some(RouteKind::Http),
            Protocol::Tcp | Protocol::Tls => Some(RouteKind::Tcp),
            Protocol::Udp => None,
        }
    }

    pub fn requires_tls(&self) -> bool {
        matches!(self, Protocol::Https | Protocol::Tls)
    }
}

// === impl TlsMinVersion ===

impl TlsMinVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMinVersion::V1_0 => "TLSv1_0",
            TlsMinVersion::V1_1 => "TLSv1_1",
            TlsMinVersion::V1_2 => "TLSv1_2",
            TlsMinVersion::V1_3 => "TLSv1_3",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn gateway(listeners: Vec<Listener>) -> Gateway {
        Gateway::new(GatewayId::new("default", "gw"), listeners)
    }

    #[test]
    fn https_listener_without_certificates_is_invalid() {
        let gw = gateway(vec![Listener::new("https", 443, Protocol::Https)]);
        assert_eq!(
            gw.listener_errors().get("https"),
            Some(&ListenerError::InvalidCertificateRef)
        );
        assert_eq!(gw.valid_listeners().count(), 0);
    }

    #[test]
    fn udp_listeners_are_unsupported() {
        let gw = gateway(vec![Listener::new("udp", 53, Protocol::Udp)]);
        assert_eq!(
            gw.listener_errors().get("udp"),
            Some(&ListenerError::UnsupportedProtocol)
        );
    }

    #[test]
    fn protocol_conflicts_on_a_shared_port() {
        let gw = gateway(vec![
            Listener::new("http", 8080, Protocol::Http),
            Listener::new("tcp", 8080, Protocol::Tcp),
        ]);
        let errors = gw.listener_errors();
        assert_eq!(errors.get("http"), Some(&ListenerError::ProtocolConflict));
        assert_eq!(errors.get("tcp"), Some(&ListenerError::ProtocolConflict));
    }

    #[test]
    fn http_listeners_may_share_a_port_with_distinct_hostnames() {
        let mut first = Listener::new("a", 8080, Protocol::Http);
        first.hostname = Some("a.example.com".to_string());
        let mut second = Listener::new("b", 8080, Protocol::Http);
        second.hostname = Some("b.example.com".to_string());
        let gw = gateway(vec![first, second]);
        assert!(gw.listener_errors().is_empty());
    }

    #[test]
    fn http_listeners_conflict_on_a_shared_hostname() {
        let mut first = Listener::new("a", 8080, Protocol::Http);
        first.hostname = Some("example.com".to_string());
        let mut second = Listener::new("b", 8080, Protocol::Http);
        second.hostname = Some("example.com".to_string());
        let gw = gateway(vec![first, second]);
        let errors = gw.listener_errors();
        assert_eq!(errors.get("a"), Some(&ListenerError::HostnameConflict));
        assert_eq!(errors.get("b"), Some(&ListenerError::HostnameConflict));
    }

    #[test]
    fn tcp_listeners_conflict_on_any_shared_port() {
        let gw = gateway(vec![
            Listener::new("a", 9000, Protocol::Tcp),
            Listener::new("b", 9000, Protocol::Tcp),
        ]);
        let errors = gw.listener_errors();
        assert_eq!(errors.get("a"), Some(&ListenerError::PortConflicted));
        assert_eq!(errors.get("b"), Some(&ListenerError::PortConflicted));
    }

    #[test]
    fn requested_addresses_detach_listeners() {
        let mut gw = gateway(vec![Listener::new("http", 80, Protocol::Http)]);
        gw.requested_addresses = vec!["10.0.0.1".to_string()];
        assert_eq!(
            gw.listener_errors().get("http"),
            Some(&ListenerError::UnsupportedAddress)
        );
    }

    #[test]
    fn secrets_outside_listener_config_are_not_fetchable() {
        let mut listener = Listener::new("https", 443, Protocol::Https);
        listener.tls = Some(ListenerTls {
            min_version: None,
            cipher_suites: None,
            certificates: vec!["secret/cert".to_string()],
        });
        let gw = gateway(vec![listener]);
        assert!(gw.can_fetch_secrets(&["secret/cert".to_string()]));
        assert!(!gw.can_fetch_secrets(&["secret/other".to_string()]));
    }
}
