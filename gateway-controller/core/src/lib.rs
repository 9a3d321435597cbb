#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bind;
pub mod gateway;
pub mod resolve;
pub mod resolved;
pub mod route;
pub mod routes;
pub mod status;

pub use self::{
    bind::Binder,
    gateway::{Gateway, Listener},
    resolved::ResolvedGateway,
    route::Route,
};
use anyhow::Result;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Identifies a deployed gateway instance by its mesh namespace and service
/// name. Serializes as `namespace/service` so it can key JSON maps.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct GatewayId {
    pub namespace: String,
    pub service: String,
}

/// An opaque, stable route identifier.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteId(pub String);

/// Pushes a resolved gateway snapshot into the mesh backend.
///
/// Implementations must serialize `sync` and `clear` for the same gateway and
/// may not advance any internal bookkeeping for a sync that failed partway.
#[async_trait::async_trait]
pub trait Syncer: Send + Sync + 'static {
    /// Applies the gateway's config entries, returning whether anything
    /// changed in the backend.
    async fn sync(&self, token: &CancellationToken, gateway: ResolvedGateway) -> Result<bool>;

    /// Removes every config entry owned by the gateway.
    async fn clear(&self, token: &CancellationToken, id: &GatewayId) -> Result<()>;
}

// === impl GatewayId ===

impl GatewayId {
    pub fn new(namespace: impl ToString, service: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            service: service.to_string(),
        }
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.service)
    }
}

impl Serialize for GatewayId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GatewayId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let (namespace, service) = raw
            .split_once('/')
            .ok_or_else(|| D::Error::custom(format!("malformed gateway id {raw:?}")))?;
        Ok(GatewayId::new(namespace, service))
    }
}

// === impl RouteId ===

impl RouteId {
    pub fn new(id: impl ToString) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
