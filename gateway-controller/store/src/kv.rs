use crate::backend::{Backend, BackendError, GatewayRecord, RouteRecord};
use mesh_gateway_controller_core::{GatewayId, RouteId};
use mesh_gateway_controller_mesh::{Client, KvPair, MeshError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Replicated persistence over the mesh KV store, laid out as
/// `<prefix>/v1/{gateways|routes}/ns/<ns>/<id>`. Upserts are transactional
/// multi-key sets; lists are prefix scans.
pub struct KvBackend<C> {
    client: Arc<C>,
    prefix: String,
}

impl<C> KvBackend<C> {
    pub fn new(client: Arc<C>, prefix: impl ToString) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
        }
    }

    fn gateway_key(&self, id: &GatewayId) -> String {
        let namespace = if id.namespace.is_empty() {
            "default"
        } else {
            id.namespace.as_str()
        };
        format!("{}/v1/gateways/ns/{}/{}", self.prefix, namespace, id.service)
    }

    fn gateway_prefix(&self) -> String {
        format!("{}/v1/gateways/", self.prefix)
    }

    fn route_key(&self, id: &RouteId) -> String {
        format!("{}/v1/routes/ns/default/{}", self.prefix, id)
    }

    fn route_prefix(&self) -> String {
        format!("{}/v1/routes/", self.prefix)
    }
}

fn io_error(error: MeshError) -> BackendError {
    match error {
        MeshError::Cancelled => BackendError::Cancelled,
        MeshError::Api(message) => BackendError::Io(message),
    }
}

#[async_trait::async_trait]
impl<C: Client> Backend for KvBackend<C> {
    async fn get_gateway(
        &self,
        token: &CancellationToken,
        id: &GatewayId,
    ) -> Result<Vec<u8>, BackendError> {
        self.client
            .kv_get(token, &self.gateway_key(id))
            .await
            .map_err(io_error)?
            .ok_or(BackendError::NotFound)
    }

    async fn upsert_gateways(
        &self,
        token: &CancellationToken,
        records: Vec<GatewayRecord>,
    ) -> Result<(), BackendError> {
        if records.is_empty() {
            return Ok(());
        }
        let pairs = records
            .into_iter()
            .map(|record| KvPair {
                key: self.gateway_key(&record.id),
                value: record.data,
            })
            .collect();
        self.client.kv_txn_set(token, pairs).await.map_err(io_error)
    }

    async fn list_gateways(&self, token: &CancellationToken) -> Result<Vec<Vec<u8>>, BackendError> {
        Ok(self
            .client
            .kv_list(token, &self.gateway_prefix())
            .await
            .map_err(io_error)?
            .into_iter()
            .map(|pair| pair.value)
            .collect())
    }

    async fn delete_gateway(
        &self,
        token: &CancellationToken,
        id: &GatewayId,
    ) -> Result<(), BackendError> {
        self.client
            .kv_delete(token, &self.gateway_key(id))
            .await
            .map_err(io_error)
    }

    async fn get_route(
        &self,
        token: &CancellationToken,
        id: &RouteId,
    ) -> Result<Vec<u8>, BackendError> {
        self.client
            .kv_get(token, &self.route_key(id))
            .await
            .map_err(io_error)?
            .ok_or(BackendError::NotFound)
    }

    async fn upsert_routes(
        &self,
        token: &CancellationToken,
        records: Vec<RouteRecord>,
    ) -> Result<(), BackendError> {
        if records.is_empty() {
            return Ok(());
        }
        let pairs = records
            .into_iter()
            .map(|record| KvPair {
                key: self.route_key(&record.id),
                value: record.data,
            })
            .collect();
        self.client.kv_txn_set(token, pairs).await.map_err(io_error)
    }

    async fn list_routes(&self, token: &CancellationToken) -> Result<Vec<Vec<u8>>, BackendError> {
        Ok(self
            .client
            .kv_list(token, &self.route_prefix())
            .await
            .map_err(io_error)?
            .into_iter()
            .map(|pair| pair.value)
            .collect())
    }

    async fn delete_route(
        &self,
        token: &CancellationToken,
        id: &RouteId,
    ) -> Result<(), BackendError> {
        self.client
            .kv_delete(token, &self.route_key(id))
            .await
            .map_err(io_error)
    }
}
