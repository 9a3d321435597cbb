#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config_entry;
pub mod local;
pub mod resolver;

pub use self::{
    config_entry::{ConfigEntry, ConfigEntryIndex, ConfigEntryKey, ConfigEntryKind, IngressGateway},
    local::LocalClient,
    resolver::CatalogResolver,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tokio_util::sync::CancellationToken;

/// A mesh namespace; `None` addresses the unnamespaced (OSS) default.
pub type Namespace = Option<String>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum MeshError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("mesh API error: {0}")]
    Api(String),
}

/// Options for a blocking query against the mesh backend.
#[derive(Copy, Clone, Debug)]
pub struct QueryOptions {
    /// Block until the result's index exceeds this value; 0 returns
    /// immediately.
    pub wait_index: u64,
    /// Upper bound on how long the server may hold the query.
    pub wait_time: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueryMeta {
    pub last_index: u64,
}

/// A service known to the mesh catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogService {
    pub name: String,
    pub namespace: Namespace,
    /// The registration kind; proxies register as `connect-proxy`.
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// A peering connection to another cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peering {
    pub name: String,
    #[serde(default)]
    pub imported_services: Vec<String>,
}

/// The compiled graph resolving a service name to its downstream targets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledDiscoveryChain {
    pub service_name: String,
    pub namespace: Namespace,
    #[serde(default)]
    pub targets: BTreeMap<String, DiscoveryTarget>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryTarget {
    pub service: String,
    pub namespace: Namespace,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// The mesh backend surface the controller consumes. Implementations are
/// replaceable; every call is cancellable through the provided token.
#[async_trait::async_trait]
pub trait Client: Send + Sync + 'static {
    async fn set_config_entry(
        &self,
        token: &CancellationToken,
        entry: ConfigEntry,
    ) -> Result<(), MeshError>;

    async fn delete_config_entry(
        &self,
        token: &CancellationToken,
        kind: ConfigEntryKind,
        namespace: &Namespace,
        name: &str,
    ) -> Result<(), MeshError>;

    async fn get_config_entry(
        &self,
        token: &CancellationToken,
        kind: ConfigEntryKind,
        namespace: &Namespace,
        name: &str,
    ) -> Result<Option<ConfigEntry>, MeshError>;

    /// The namespaces known to the mesh.
    async fn namespaces(&self, token: &CancellationToken) -> Result<Vec<Namespace>, MeshError>;

    /// Services registered in the given namespace, across every node.
    async fn catalog_services(
        &self,
        token: &CancellationToken,
        namespace: &Namespace,
    ) -> Result<Vec<CatalogService>, MeshError>;

    async fn read_peering(
        &self,
        token: &CancellationToken,
        name: &str,
    ) -> Result<Option<Peering>, MeshError>;

    /// Blocking query for a service's compiled discovery chain.
    async fn discovery_chain(
        &self,
        token: &CancellationToken,
        service: &str,
        namespace: &Namespace,
        options: QueryOptions,
    ) -> Result<(CompiledDiscoveryChain, QueryMeta), MeshError>;

    async fn kv_get(
        &self,
        token: &CancellationToken,
        key: &str,
    ) -> Result<Option<Vec<u8>>, MeshError>;

    async fn kv_list(
        &self,
        token: &CancellationToken,
        prefix: &str,
    ) -> Result<Vec<KvPair>, MeshError>;

    /// Transactionally sets every pair, or none of them.
    async fn kv_txn_set(
        &self,
        token: &CancellationToken,
        pairs: Vec<KvPair>,
    ) -> Result<(), MeshError>;

    async fn kv_delete(&self, token: &CancellationToken, key: &str) -> Result<(), MeshError>;
}
