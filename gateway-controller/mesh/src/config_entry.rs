use crate::Namespace;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// A named, kinded, namespaced record in the mesh backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Kind")]
pub enum ConfigEntry {
    #[serde(rename = "ingress-gateway")]
    IngressGateway(IngressGateway),
    #[serde(rename = "service-router")]
    ServiceRouter(ServiceRouter),
    #[serde(rename = "service-splitter")]
    ServiceSplitter(ServiceSplitter),
    #[serde(rename = "service-defaults")]
    ServiceDefaults(ServiceDefaults),
    #[serde(rename = "service-intentions")]
    ServiceIntentions(ServiceIntentions),
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigEntryKind {
    IngressGateway,
    ServiceRouter,
    ServiceSplitter,
    ServiceDefaults,
    ServiceIntentions,
}

/// Identifies a config entry within the backend.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigEntryKey {
    pub kind: ConfigEntryKind,
    pub namespace: Namespace,
    pub name: String,
}

/// A set of config entries keyed by (kind, namespace, name), used to compute
/// add/remove deltas against a previously synced set.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigEntryIndex {
    entries: BTreeMap<ConfigEntryKey, ConfigEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IngressGateway {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<IngressListener>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IngressListener {
    pub port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<IngressService>,
    #[serde(rename = "TLS", default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<GatewayTls>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IngressService {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GatewayTls {
    pub enabled: bool,
    #[serde(rename = "TLSMinVersion", default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_suites: Option<Vec<String>>,
    #[serde(rename = "SDS", default, skip_serializing_if = "Option::is_none")]
    pub sds: Option<GatewayTlsSds>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GatewayTlsSds {
    pub cluster_name: String,
    pub cert_resource: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRouter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<ServiceRoute>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRoute {
    #[serde(rename = "Match", default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<ServiceRouteMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<ServiceRouteDestination>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRouteMatch {
    #[serde(rename = "HTTP", default, skip_serializing_if = "Option::is_none")]
    pub http: Option<ServiceRouteHttpMatch>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRouteHttpMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_exact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header: Vec<ServiceRouteHttpMatchHeader>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_param: Vec<ServiceRouteHttpMatchQueryParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRouteHttpMatchHeader {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub present: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRouteHttpMatchQueryParam {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub present: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRouteDestination {
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HttpHeaderModifiers>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpHeaderModifiers {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSplitter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub splits: Vec<ServiceSplit>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSplit {
    pub weight: f32,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HttpHeaderModifiers>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceDefaults {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Namespace,
    pub protocol: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceIntentions {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Namespace,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceIntention>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SourceIntention {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Namespace,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// === impl ConfigEntry ===

impl ConfigEntry {
    pub fn kind(&self) -> ConfigEntryKind {
        match self {
            ConfigEntry::IngressGateway(_) => ConfigEntryKind::IngressGateway,
            ConfigEntry::ServiceRouter(_) => ConfigEntryKind::ServiceRouter,
            ConfigEntry::ServiceSplitter(_) => ConfigEntryKind::ServiceSplitter,
            ConfigEntry::ServiceDefaults(_) => ConfigEntryKind::ServiceDefaults,
            ConfigEntry::ServiceIntentions(_) => ConfigEntryKind::ServiceIntentions,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ConfigEntry::IngressGateway(entry) => &entry.name,
            ConfigEntry::ServiceRouter(entry) => &entry.name,
            ConfigEntry::ServiceSplitter(entry) => &entry.name,
            ConfigEntry::ServiceDefaults(entry) => &entry.name,
            ConfigEntry::ServiceIntentions(entry) => &entry.name,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        match self {
            ConfigEntry::IngressGateway(entry) => &entry.namespace,
            ConfigEntry::ServiceRouter(entry) => &entry.namespace,
            ConfigEntry::ServiceSplitter(entry) => &entry.namespace,
            ConfigEntry::ServiceDefaults(entry) => &entry.namespace,
            ConfigEntry::ServiceIntentions(entry) => &entry.namespace,
        }
    }

    pub fn key(&self) -> ConfigEntryKey {
        ConfigEntryKey {
            kind: self.kind(),
            namespace: self.namespace().clone(),
            name: self.name().to_string(),
        }
    }
}

// === impl ConfigEntryKind ===

impl ConfigEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigEntryKind::IngressGateway => "ingress-gateway",
            ConfigEntryKind::ServiceRouter => "service-router",
            ConfigEntryKind::ServiceSplitter => "service-splitter",
            ConfigEntryKind::ServiceDefaults => "service-defaults",
            ConfigEntryKind::ServiceIntentions => "service-intentions",
        }
    }
}

impl fmt::Display for ConfigEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ConfigEntryIndex ===

impl ConfigEntryIndex {
    pub fn add(&mut self, entry: ConfigEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Absorbs every entry of `other`, overwriting shared keys.
    pub fn merge(&mut self, other: ConfigEntryIndex) {
        self.entries.extend(other.entries);
    }

    /// The entries of `self` whose keys are absent from `other`.
    pub fn difference(&self, other: &ConfigEntryIndex) -> ConfigEntryIndex {
        ConfigEntryIndex {
            entries: self
                .entries
                .iter()
                .filter(|(key, _)| !other.entries.contains_key(key))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect(),
        }
    }

    pub fn contains(&self, key: &ConfigEntryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConfigEntryKey> {
        self.entries.keys()
    }

    pub fn to_vec(&self) -> Vec<ConfigEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<ConfigEntry> for ConfigEntryIndex {
    fn from_iter<I: IntoIterator<Item = ConfigEntry>>(iter: I) -> Self {
        let mut index = ConfigEntryIndex::default();
        for entry in iter {
            index.add(entry);
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn defaults(name: &str) -> ConfigEntry {
        ConfigEntry::ServiceDefaults(ServiceDefaults {
            name: name.to_string(),
            namespace: None,
            protocol: "http".to_string(),
        })
    }

    #[test]
    fn difference_is_keyed_not_valued() {
        let old: ConfigEntryIndex = [defaults("a"), defaults("b")].into_iter().collect();
        let new: ConfigEntryIndex = [defaults("b"), defaults("c")].into_iter().collect();

        let removed = old.difference(&new);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed.to_vec()[0].name(), "a");
    }

    #[test]
    fn merge_overwrites_shared_keys() {
        let mut old: ConfigEntryIndex = [defaults("a")].into_iter().collect();
        let new: ConfigEntryIndex = [
            ConfigEntry::ServiceDefaults(ServiceDefaults {
                name: "a".to_string(),
                namespace: None,
                protocol: "tcp".to_string(),
            }),
            defaults("b"),
        ]
        .into_iter()
        .collect();

        old.merge(new);
        assert_eq!(old.len(), 2);
        let merged = old
            .iter()
            .find(|entry| entry.name() == "a")
            .expect("entry kept");
        match merged {
            ConfigEntry::ServiceDefaults(defaults) => assert_eq!(defaults.protocol, "tcp"),
            other => panic!("expected defaults, got {other:?}"),
        }
    }

    #[test]
    fn entries_serialize_with_mesh_wire_casing() {
        let entry = defaults("api");
        let json = serde_json::to_value(&entry).expect("serializes");
        assert_eq!(json["Kind"], "service-defaults");
        assert_eq!(json["Name"], "api");
        assert_eq!(json["Protocol"], "http");
    }

    #[test]
    fn entries_round_trip() {
        let entry = ConfigEntry::ServiceRouter(ServiceRouter {
            name: "web".to_string(),
            namespace: Some("team-a".to_string()),
            meta: Default::default(),
            routes: vec![ServiceRoute {
                matches: Some(ServiceRouteMatch {
                    http: Some(ServiceRouteHttpMatch {
                        path_prefix: Some("/".to_string()),
                        ..Default::default()
                    }),
                }),
                destination: Some(ServiceRouteDestination {
                    service: "web".to_string(),
                    namespace: None,
                    request_headers: None,
                }),
            }],
        });
        let bytes = serde_json::to_vec(&entry).expect("serializes");
        let decoded: ConfigEntry = serde_json::from_slice(&bytes).expect("deserializes");
        assert_eq!(entry, decoded);
    }
}
