use crate::{Client, MeshError, Namespace};
use mesh_gateway_controller_core::{
    resolve::{BackendResolver, ResolutionError, ResolvedService},
    route::BackendRef,
};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Meta keys stamped onto catalog registrations by the connect injector,
/// linking a mesh service back to its Kubernetes service.
pub const META_SERVICE_NAME: &str = "k8s-service-name";
pub const META_NAMESPACE: &str = "k8s-namespace";

const KIND_CONNECT_PROXY: &str = "connect-proxy";

const RESOLUTION_ATTEMPTS: u32 = 30;
const RESOLUTION_INTERVAL: Duration = Duration::from_secs(1);

/// Resolves back-end references against the mesh catalog, retrying transient
/// misses before giving up.
pub struct CatalogResolver<C> {
    client: Arc<C>,
}

impl<C> CatalogResolver<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl<C: Client> BackendResolver for CatalogResolver<C> {
    async fn resolve(
        &self,
        token: &CancellationToken,
        parent_namespace: &str,
        backend: &BackendRef,
    ) -> Result<ResolvedService, ResolutionError> {
        if backend.is_mesh_service() {
            return self.resolve_mesh_service(token, backend).await;
        }
        if backend.is_core_service() {
            if backend.port.is_none() {
                return Err(ResolutionError::Generic(format!(
                    "Service {} must specify a port",
                    backend.name,
                )));
            }
            return self.resolve_service(token, parent_namespace, backend).await;
        }
        Err(ResolutionError::InvalidKind(backend.kind.clone()))
    }
}

impl<C: Client> CatalogResolver<C> {
    /// A reference that directly names a mesh service, optionally imported
    /// from a peer cluster.
    async fn resolve_mesh_service(
        &self,
        token: &CancellationToken,
        backend: &BackendRef,
    ) -> Result<ResolvedService, ResolutionError> {
        if let Some(peer) = &backend.peer {
            let peering = self
                .client
                .read_peering(token, peer)
                .await
                .map_err(mesh_error)?
                .ok_or_else(|| {
                    ResolutionError::Consul(format!("no peering named {peer} exists"))
                })?;
            if !peering.imported_services.iter().any(|s| s == &backend.name) {
                return Err(ResolutionError::Consul(format!(
                    "service {} is not imported from peer {peer}",
                    backend.name,
                )));
            }
        }
        Ok(ResolvedService {
            namespace: backend.namespace.clone(),
            name: backend.name.clone(),
        })
    }

    /// A core Service reference: probe the catalog globally for registrations
    /// carrying the service's Kubernetes identity.
    async fn resolve_service(
        &self,
        token: &CancellationToken,
        parent_namespace: &str,
        backend: &BackendRef,
    ) -> Result<ResolvedService, ResolutionError> {
        let target_namespace = backend.target_namespace(parent_namespace);

        for attempt in 0..RESOLUTION_ATTEMPTS {
            match self.probe(token, &backend.name, target_namespace).await {
                Ok(matches) if matches.len() > 1 => {
                    return Err(ResolutionError::Consul(format!(
                        "{}/{} resolves to more than one mesh service",
                        target_namespace, backend.name,
                    )));
                }
                Ok(matches) => {
                    if let Some((namespace, name)) = matches.into_iter().next() {
                        return Ok(ResolvedService { namespace, name });
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, backend = %backend.name, "catalog probe failed");
                    if matches!(error, MeshError::Cancelled) {
                        return Err(ResolutionError::Generic("resolution cancelled".to_string()));
                    }
                }
            }

            if attempt + 1 < RESOLUTION_ATTEMPTS {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(ResolutionError::Generic("resolution cancelled".to_string()));
                    }
                    _ = tokio::time::sleep(RESOLUTION_INTERVAL) => {}
                }
            }
        }

        Err(ResolutionError::BackendNotFound(format!(
            "{}/{}",
            target_namespace, backend.name,
        )))
    }

    /// Iterates every mesh namespace, collecting the distinct services that
    /// carry the Kubernetes meta tags and are not sidecar proxies.
    async fn probe(
        &self,
        token: &CancellationToken,
        service: &str,
        namespace: &str,
    ) -> Result<BTreeSet<(Namespace, String)>, MeshError> {
        let mut matches = BTreeSet::new();
        for mesh_namespace in self.client.namespaces(token).await? {
            let services = self.client.catalog_services(token, &mesh_namespace).await?;
            for registration in services {
                if registration.kind == KIND_CONNECT_PROXY {
                    continue;
                }
                let tagged = registration.meta.get(META_SERVICE_NAME).map(String::as_str)
                    == Some(service)
                    && registration.meta.get(META_NAMESPACE).map(String::as_str)
                        == Some(namespace);
                if tagged {
                    matches.insert((registration.namespace, registration.name));
                }
            }
        }
        Ok(matches)
    }
}

fn mesh_error(error: MeshError) -> ResolutionError {
    ResolutionError::Consul(error.to_string())
}
