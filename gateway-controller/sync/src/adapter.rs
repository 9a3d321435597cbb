use crate::{
    builder::{self, GatewayEntries},
    intentions::IntentionsReconciler,
    metrics::SyncMetrics,
};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use mesh_gateway_controller_core::{GatewayId, ResolvedGateway, Syncer};
use mesh_gateway_controller_mesh::{
    config_entry::ConfigEntry, Client, ConfigEntryIndex, ConfigEntryKind,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Drives mesh config-entry transitions for resolved gateways, remembering
/// the last successfully applied set per gateway.
///
/// One adapter-wide mutex serializes `sync` and `clear`, which also keeps at
/// most one in-flight sync per gateway. The per-gateway state only advances
/// once every mutation of a sync has been accepted by the backend, so a
/// failed sync is retried in full on the next call.
pub struct SyncAdapter<C> {
    client: Arc<C>,
    state: Mutex<HashMap<GatewayId, GatewayState<C>>>,
    metrics: SyncMetrics,
}

struct GatewayState<C> {
    entries: GatewayEntries,
    /// Set when a sync failed partway: the stored indexes then over-count
    /// what the backend holds, and the no-op shortcut must not be taken.
    dirty: bool,
    intentions: Arc<IntentionsReconciler<C>>,
}

impl<C: Client> SyncAdapter<C> {
    pub fn new(client: Arc<C>, metrics: SyncMetrics) -> Self {
        Self {
            client,
            state: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    async fn apply(&self, token: &CancellationToken, index: &ConfigEntryIndex) -> Result<()> {
        for entry in index.iter() {
            self.client
                .set_config_entry(token, entry.clone())
                .await
                .with_context(|| format!("failed to set {} {}", entry.kind(), entry.name()))?;
        }
        Ok(())
    }

    async fn remove(&self, token: &CancellationToken, index: &ConfigEntryIndex) -> Result<()> {
        for entry in index.iter() {
            self.client
                .delete_config_entry(token, entry.kind(), entry.namespace(), entry.name())
                .await
                .with_context(|| format!("failed to delete {} {}", entry.kind(), entry.name()))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<C: Client> Syncer for SyncAdapter<C> {
    async fn sync(&self, token: &CancellationToken, gateway: ResolvedGateway) -> Result<bool> {
        let mut state = self.state.lock().await;
        let id = gateway.id.clone();
        let entries = builder::build(&gateway);

        if let Some(existing) = state.get(&id) {
            if !existing.dirty && existing.entries == entries {
                tracing::debug!(gateway = %id, "mesh state already up to date");
                self.metrics.sync_recorded("noop");
                return Ok(false);
            }
        }

        let empty = GatewayEntries::default();
        let old = state.get(&id).map(|s| &s.entries).unwrap_or(&empty);
        let removed_routers = old.routers.difference(&entries.routers);
        let removed_splitters = old.splitters.difference(&entries.splitters);
        let removed_defaults = old.defaults.difference(&entries.defaults);

        tracing::debug!(
            gateway = %id,
            routers = entries.routers.len(),
            splitters = entries.splitters.len(),
            defaults = entries.defaults.len(),
            "syncing gateway to the mesh"
        );

        // Additions flow before removals so references never dangle, and
        // defaults precede routers so the backend accepts routers with
        // protocol context already established.
        let result: Result<()> = async {
            self.apply(token, &entries.defaults).await?;
            self.apply(token, &entries.routers).await?;
            self.apply(token, &entries.splitters).await?;
            self.client
                .set_config_entry(token, ConfigEntry::IngressGateway(entries.ingress.clone()))
                .await
                .with_context(|| format!("failed to set ingress for {id}"))?;
            self.remove(token, &removed_routers).await?;
            self.remove(token, &removed_splitters).await?;
            self.remove(token, &removed_defaults).await?;
            Ok(())
        }
        .await;

        if let Err(error) = result {
            // The last-synced set is not advanced, but the attempted entries
            // are folded into the removal-tracking indexes so a later sync or
            // clear can delete whatever did land before the failure.
            match state.get_mut(&id) {
                Some(existing) => {
                    existing.dirty = true;
                    existing.entries.routers.merge(entries.routers);
                    existing.entries.splitters.merge(entries.splitters);
                    existing.entries.defaults.merge(entries.defaults);
                }
                None => {
                    state.insert(
                        id.clone(),
                        GatewayState {
                            entries,
                            dirty: true,
                            intentions: Arc::new(IntentionsReconciler::new(
                                self.client.clone(),
                                &id,
                                self.metrics.clone(),
                            )),
                        },
                    );
                }
            }
            self.metrics.sync_recorded("error");
            return Err(error);
        }

        let intentions = match state.remove(&id) {
            Some(previous) => previous.intentions,
            None => Arc::new(IntentionsReconciler::new(
                self.client.clone(),
                &id,
                self.metrics.clone(),
            )),
        };
        intentions.reconcile(&entries.ingress);
        state.insert(
            id,
            GatewayState {
                entries,
                dirty: false,
                intentions,
            },
        );
        self.metrics.sync_recorded("success");
        Ok(true)
    }

    async fn clear(&self, token: &CancellationToken, id: &GatewayId) -> Result<()> {
        let mut state = self.state.lock().await;
        let namespace = builder::mesh_namespace(&id.namespace);

        // Ingress goes first so defaults can be dropped afterwards without
        // protocol-mismatch rejections from the backend.
        self.client
            .delete_config_entry(token, ConfigEntryKind::IngressGateway, &namespace, &id.service)
            .await
            .with_context(|| format!("failed to delete ingress for {id}"))?;

        if let Some(gateway) = state.get(id) {
            self.remove(token, &gateway.entries.routers).await?;
            self.remove(token, &gateway.entries.splitters).await?;
            self.remove(token, &gateway.entries.defaults).await?;
        }
        if let Some(gateway) = state.remove(id) {
            gateway.intentions.shutdown().await;
        }
        tracing::info!(gateway = %id, "cleared gateway mesh state");
        Ok(())
    }
}
