use mesh_gateway_controller_core::{GatewayId, RouteId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    /// A benign sentinel: the record does not exist.
    #[error("record not found")]
    NotFound,
    #[error("operation cancelled")]
    Cancelled,
    #[error("backend I/O failed: {0}")]
    Io(String),
}

#[derive(Clone, Debug)]
pub struct GatewayRecord {
    pub id: GatewayId,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct RouteRecord {
    pub id: RouteId,
    pub data: Vec<u8>,
}

/// Pluggable persistence for marshaled gateways and routes. List results are
/// unordered.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn get_gateway(
        &self,
        token: &CancellationToken,
        id: &GatewayId,
    ) -> Result<Vec<u8>, BackendError>;

    async fn upsert_gateways(
        &self,
        token: &CancellationToken,
        records: Vec<GatewayRecord>,
    ) -> Result<(), BackendError>;

    async fn list_gateways(&self, token: &CancellationToken) -> Result<Vec<Vec<u8>>, BackendError>;

    async fn delete_gateway(
        &self,
        token: &CancellationToken,
        id: &GatewayId,
    ) -> Result<(), BackendError>;

    async fn get_route(
        &self,
        token: &CancellationToken,
        id: &RouteId,
    ) -> Result<Vec<u8>, BackendError>;

    async fn upsert_routes(
        &self,
        token: &CancellationToken,
        records: Vec<RouteRecord>,
    ) -> Result<(), BackendError>;

    async fn list_routes(&self, token: &CancellationToken) -> Result<Vec<Vec<u8>>, BackendError>;

    async fn delete_route(
        &self,
        token: &CancellationToken,
        id: &RouteId,
    ) -> Result<(), BackendError>;
}

/// Process-local persistence: a pair of maps.
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    gateways: BTreeMap<GatewayId, Vec<u8>>,
    routes: BTreeMap<RouteId, Vec<u8>>,
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn get_gateway(
        &self,
        _token: &CancellationToken,
        id: &GatewayId,
    ) -> Result<Vec<u8>, BackendError> {
        self.state
            .read()
            .gateways
            .get(id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn upsert_gateways(
        &self,
        _token: &CancellationToken,
        records: Vec<GatewayRecord>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.write();
        for record in records {
            state.gateways.insert(record.id, record.data);
        }
        Ok(())
    }

    async fn list_gateways(
        &self,
        _token: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>, BackendError> {
        Ok(self.state.read().gateways.values().cloned().collect())
    }

    async fn delete_gateway(
        &self,
        _token: &CancellationToken,
        id: &GatewayId,
    ) -> Result<(), BackendError> {
        self.state.write().gateways.remove(id);
        Ok(())
    }

    async fn get_route(
        &self,
        _token: &CancellationToken,
        id: &RouteId,
    ) -> Result<Vec<u8>, BackendError> {
        self.state
            .read()
            .routes
            .get(id)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn upsert_routes(
        &self,
        _token: &CancellationToken,
        records: Vec<RouteRecord>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.write();
        for record in records {
            state.routes.insert(record.id, record.data);
        }
        Ok(())
    }

    async fn list_routes(&self, _token: &CancellationToken) -> Result<Vec<Vec<u8>>, BackendError> {
        Ok(self.state.read().routes.values().cloned().collect())
    }

    async fn delete_route(
        &self,
        _token: &CancellationToken,
        id: &RouteId,
    ) -> Result<(), BackendError> {
        self.state.write().routes.remove(id);
        Ok(())
    }
}
