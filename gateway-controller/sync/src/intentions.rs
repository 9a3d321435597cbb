use crate::metrics::SyncMetrics;
use ahash::AHashMap as HashMap;
use mesh_gateway_controller_core::GatewayId;
use mesh_gateway_controller_mesh::{
    config_entry::{ConfigEntry, ServiceIntentions, SourceIntention},
    Client, ConfigEntryKind, IngressGateway, MeshError, Namespace, QueryOptions,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INTENTION_DESCRIPTION: &str = "generated by mesh-gateway-controller; do not edit";

/// How long the backend may hold a chain blocking query.
const CHAIN_WAIT: Duration = Duration::from_secs(300);

/// Delay before re-querying after an error, so a failing backend is not
/// hot-looped.
const ERROR_GUARD: Duration = Duration::from_secs(1);

/// Watches the discovery chains of a gateway's ingress services and keeps
/// service intentions permitting the gateway as a source on every downstream
/// target.
pub struct IntentionsReconciler<C> {
    context: Arc<WatchContext<C>>,
    token: CancellationToken,
    watchers: parking_lot::Mutex<HashMap<ServiceKey, Watcher>>,
}

type ServiceKey = (Namespace, String);

struct WatchContext<C> {
    client: Arc<C>,
    source_name: String,
    source_namespace: Namespace,
    targets: tokio::sync::Mutex<TargetIndex>,
    metrics: SyncMetrics,
}

struct Watcher {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Reference counts of chain targets across watchers: an intention source is
/// kept as long as any chain still names the target.
#[derive(Default)]
struct TargetIndex {
    by_watcher: BTreeMap<ServiceKey, BTreeSet<ServiceKey>>,
}

impl<C: Client> IntentionsReconciler<C> {
    pub fn new(client: Arc<C>, gateway: &GatewayId, metrics: SyncMetrics) -> Self {
        let source_namespace = crate::builder::mesh_namespace(&gateway.namespace);
        Self {
            context: Arc::new(WatchContext {
                client,
                source_name: gateway.service.clone(),
                source_namespace,
                targets: Default::default(),
                metrics,
            }),
            token: CancellationToken::new(),
            watchers: Default::default(),
        }
    }

    /// Aligns the watcher set with the ingress entry's services: new services
    /// gain a chain watcher, dropped services have theirs cancelled (which
    /// removes the intentions their chains contributed).
    pub fn reconcile(&self, ingress: &IngressGateway) {
        let desired: BTreeSet<ServiceKey> = ingress
            .listeners
            .iter()
            .flat_map(|listener| listener.services.iter())
            .map(|service| (service.namespace.clone(), service.name.clone()))
            .collect();

        let mut watchers = self.watchers.lock();
        let stale: Vec<ServiceKey> = watchers
            .keys()
            .filter(|key| !desired.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            if let Some(watcher) = watchers.remove(&key) {
                tracing::debug!(service = %key.1, "stopping chain watcher");
                watcher.token.cancel();
            }
        }
        for key in desired {
            if watchers.contains_key(&key) {
                continue;
            }
            tracing::debug!(service = %key.1, "starting chain watcher");
            let token = self.token.child_token();
            let task = tokio::spawn(watch_chain(self.context.clone(), key.clone(), token.clone()));
            watchers.insert(key, Watcher { token, task });
        }
    }

    /// Cancels every watcher and waits for their cleanup, which removes all
    /// intention sources the reconciler inserted.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let watchers: Vec<Watcher> = {
            let mut lock = self.watchers.lock();
            lock.drain().map(|(_, watcher)| watcher).collect()
        };
        for watcher in watchers {
            watcher.token.cancel();
            if let Err(error) = watcher.task.await {
                tracing::warn!(%error, "chain watcher panicked");
            }
        }
    }
}

/// One long-poll loop per ingress service. The wait index resets to zero when
/// the server answers with a smaller one, and intention updates that fail
/// leave the index untouched so the next (immediate) response retries them.
async fn watch_chain<C: Client>(
    context: Arc<WatchContext<C>>,
    key: ServiceKey,
    token: CancellationToken,
) {
    let mut index = 0u64;
    loop {
        if token.is_cancelled() {
            break;
        }
        let options = QueryOptions {
            wait_index: index,
            wait_time: CHAIN_WAIT,
        };
        match context
            .client
            .discovery_chain(&token, &key.1, &key.0, options)
            .await
        {
            Ok((chain, meta)) => {
                let targets: BTreeSet<ServiceKey> = chain
                    .targets
                    .values()
                    .map(|target| (target.namespace.clone(), target.service.clone()))
                    .collect();
                match reconcile_targets(&context, &token, &key, targets).await {
                    Ok(()) => {
                        index = if meta.last_index < index {
                            0
                        } else {
                            meta.last_index
                        };
                    }
                    Err(error) => {
                        tracing::warn!(service = %key.1, %error, "failed to reconcile intentions");
                        if pause(&token, ERROR_GUARD).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(MeshError::Cancelled) => break,
            Err(error) => {
                tracing::warn!(service = %key.1, %error, "discovery chain query failed");
                if pause(&token, ERROR_GUARD).await.is_err() {
                    break;
                }
            }
        }
    }

    // Cancellation cleanup runs under a fresh token so the intention removals
    // still reach the backend.
    let cleanup = CancellationToken::new();
    if let Err(error) = reconcile_targets(&context, &cleanup, &key, BTreeSet::new()).await {
        tracing::warn!(service = %key.1, %error, "failed to clean up intentions");
    }
}

async fn pause(token: &CancellationToken, duration: Duration) -> Result<(), ()> {
    tokio::select! {
        _ = token.cancelled() => Err(()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Applies a watcher's new target set: refcount-added targets gain the
/// gateway source, refcount-dropped targets lose it. The index is committed
/// only after every write succeeded.
async fn reconcile_targets<C: Client>(
    context: &WatchContext<C>,
    token: &CancellationToken,
    watcher: &ServiceKey,
    new_targets: BTreeSet<ServiceKey>,
) -> Result<(), MeshError> {
    let mut targets = context.targets.lock().await;
    let (added, removed) = targets.diff(watcher, &new_targets);

    for target in &added {
        add_source(context, token, target).await?;
        context.metrics.intention_changed("add");
    }
    for target in &removed {
        remove_source(context, token, target).await?;
        context.metrics.intention_changed("remove");
    }

    targets.commit(watcher, new_targets);
    Ok(())
}

async fn add_source<C: Client>(
    context: &WatchContext<C>,
    token: &CancellationToken,
    target: &ServiceKey,
) -> Result<(), MeshError> {
    let current = context
        .client
        .get_config_entry(token, ConfigEntryKind::ServiceIntentions, &target.0, &target.1)
        .await?;
    let mut intentions = match current {
        Some(ConfigEntry::ServiceIntentions(intentions)) => intentions,
        _ => ServiceIntentions {
            name: target.1.clone(),
            namespace: target.0.clone(),
            sources: Vec::new(),
        },
    };
    if intentions
        .sources
        .iter()
        .any(|source| context.is_own_source(source))
    {
        return Ok(());
    }
    tracing::info!(target = %target.1, source = %context.source_name, "adding intention source");
    intentions.sources.push(SourceIntention {
        name: context.source_name.clone(),
        namespace: context.source_namespace.clone(),
        action: "allow".to_string(),
        description: Some(INTENTION_DESCRIPTION.to_string()),
    });
    intentions
        .sources
        .sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    context
        .client
        .set_config_entry(token, ConfigEntry::ServiceIntentions(intentions))
        .await
}

async fn remove_source<C: Client>(
    context: &WatchContext<C>,
    token: &CancellationToken,
    target: &ServiceKey,
) -> Result<(), MeshError> {
    let current = context
        .client
        .get_config_entry(token, ConfigEntryKind::ServiceIntentions, &target.0, &target.1)
        .await?;
    let Some(ConfigEntry::ServiceIntentions(mut intentions)) = current else {
        return Ok(());
    };
    let before = intentions.sources.len();
    intentions
        .sources
        .retain(|source| !context.is_own_source(source));
    if intentions.sources.len() == before {
        return Ok(());
    }
    tracing::info!(target = %target.1, source = %context.source_name, "removing intention source");
    if intentions.sources.is_empty() {
        context
            .client
            .delete_config_entry(
                token,
                ConfigEntryKind::ServiceIntentions,
                &target.0,
                &target.1,
            )
            .await
    } else {
        context
            .client
            .set_config_entry(token, ConfigEntry::ServiceIntentions(intentions))
            .await
    }
}

impl<C> WatchContext<C> {
    fn is_own_source(&self, source: &SourceIntention) -> bool {
        source.name == self.source_name && source.namespace == self.source_namespace
    }
}

// === impl TargetIndex ===

impl TargetIndex {
    /// Targets that would gain or lose their last reference if the watcher
    /// moved to `new`.
    fn diff(
        &self,
        watcher: &ServiceKey,
        new: &BTreeSet<ServiceKey>,
    ) -> (Vec<ServiceKey>, Vec<ServiceKey>) {
        let empty = BTreeSet::new();
        let old = self.by_watcher.get(watcher).unwrap_or(&empty);
        let added = new
            .iter()
            .filter(|target| !old.contains(*target) && self.references(target, watcher) == 0)
            .cloned()
            .collect();
        let removed = old
            .iter()
            .filter(|target| !new.contains(*target) && self.references(target, watcher) == 0)
            .cloned()
            .collect();
        (added, removed)
    }

    fn commit(&mut self, watcher: &ServiceKey, new: BTreeSet<ServiceKey>) {
        if new.is_empty() {
            self.by_watcher.remove(watcher);
        } else {
            self.by_watcher.insert(watcher.clone(), new);
        }
    }

    /// References to `target` held by watchers other than `except`.
    fn references(&self, target: &ServiceKey, except: &ServiceKey) -> usize {
        self.by_watcher
            .iter()
            .filter(|(watcher, targets)| *watcher != except && targets.contains(target))
            .count()
    }
}
