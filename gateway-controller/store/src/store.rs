use crate::{
    backend::{Backend, BackendError, GatewayRecord, RouteRecord},
    marshal,
    metrics::StoreMetrics,
};
use anyhow::{Context, Result};
use mesh_gateway_controller_core::{
    bind::Binder,
    gateway::SyncStatus,
    resolve::{resolve_route_backends, BackendResolver, ReferenceGrants},
    status::StatusUpdater,
    Gateway, GatewayId, Route, RouteId, Syncer,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(60);

/// An optional guard for upserts: the operation is skipped when the callback
/// rejects the current record.
pub type UpsertCondition<T> = Box<dyn FnOnce(Option<&T>) -> bool + Send>;

pub struct Config<B> {
    pub backend: B,
    pub adapter: Arc<dyn Syncer>,
    pub updater: Arc<dyn StatusUpdater>,
    pub resolver: Arc<dyn BackendResolver>,
    pub grants: Arc<dyn ReferenceGrants>,
    pub sync_period: Duration,
    pub metrics: StoreMetrics,
}

/// The orchestration nucleus: owns gateways and routes through the backend,
/// fans binding out on every upsert, and drives mesh sync and status updates.
///
/// A single read/write lock totals the order of operations; within one
/// operation the observable order is persistence, then mesh sync, then status
/// updates.
pub struct Store<B> {
    state: RwLock<Inner<B>>,
    adapter: Arc<dyn Syncer>,
    updater: Arc<dyn StatusUpdater>,
    resolver: Arc<dyn BackendResolver>,
    grants: Arc<dyn ReferenceGrants>,
    binder: Binder,
    metrics: StoreMetrics,
    sync_period: Duration,
    periodic_running: AtomicBool,
}

struct Inner<B> {
    backend: B,
}

impl<B: Backend> Store<B> {
    pub fn new(config: Config<B>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(Inner {
                backend: config.backend,
            }),
            adapter: config.adapter,
            updater: config.updater,
            resolver: config.resolver,
            grants: config.grants,
            binder: Binder,
            metrics: config.metrics,
            sync_period: config.sync_period,
            periodic_running: AtomicBool::new(false),
        })
    }

    pub async fn get_gateway(
        &self,
        token: &CancellationToken,
        id: &GatewayId,
    ) -> Result<Option<Gateway>> {
        let inner = self.state.read().await;
        self.metrics.fetched("gateway");
        fetch_gateway(&inner.backend, token, id).await
    }

    pub async fn list_gateways(&self, token: &CancellationToken) -> Result<Vec<Gateway>> {
        let inner = self.state.read().await;
        self.metrics.fetched("gateway");
        list_gateways(&inner.backend, token).await
    }

    pub async fn get_route(
        &self,
        token: &CancellationToken,
        id: &RouteId,
    ) -> Result<Option<Route>> {
        let inner = self.state.read().await;
        self.metrics.fetched("route");
        fetch_route(&inner.backend, token, id).await
    }

    pub async fn list_routes(&self, token: &CancellationToken) -> Result<Vec<Route>> {
        let inner = self.state.read().await;
        self.metrics.fetched("route");
        list_routes(&inner.backend, token).await
    }

    /// Inserts or replaces a gateway, rebinding every known route against it,
    /// then syncs the gateway and publishes statuses.
    pub async fn upsert_gateway(
        &self,
        token: &CancellationToken,
        gateway: Gateway,
        condition: Option<UpsertCondition<Gateway>>,
    ) -> Result<()> {
        let inner = self.state.write().await;
        let current = fetch_gateway(&inner.backend, token, &gateway.id).await?;
        if let Some(condition) = condition {
            if !condition(current.as_ref()) {
                tracing::debug!(gateway = %gateway.id, "gateway upsert rejected by condition");
                return Ok(());
            }
        }

        let mut gateway = gateway;
        let mut routes = list_routes(&inner.backend, token).await?;
        let mut changed_ids = Vec::new();
        let mut route_records = Vec::new();
        for route in routes.iter_mut() {
            if self.binder.bind(&mut gateway, route) {
                changed_ids.push(route.id().clone());
                route_records.push(route_record(route)?);
            }
        }

        inner
            .backend
            .upsert_gateways(token, vec![gateway_record(&gateway)?])
            .await?;
        inner.backend.upsert_routes(token, route_records).await?;

        let routes_by_id = by_id(routes);
        let mut errors = Vec::new();
        if let Err(error) = self
            .sync_gateways(&inner, token, vec![gateway], &routes_by_id)
            .await
        {
            errors.push(error);
        }
        self.publish_route_statuses(token, &changed_ids, &routes_by_id, &mut errors)
            .await;
        first_error(errors)
    }

    /// Removes a gateway: its mesh state is cleared first, then every route
    /// is unbound and the record deleted.
    pub async fn delete_gateway(&self, token: &CancellationToken, id: &GatewayId) -> Result<()> {
        let inner = self.state.write().await;
        let Some(mut gateway) = fetch_gateway(&inner.backend, token, id).await? else {
            return Ok(());
        };

        self.adapter
            .clear(token, id)
            .await
            .with_context(|| format!("failed to clear mesh state for {id}"))?;

        let mut routes = list_routes(&inner.backend, token).await?;
        let mut changed_ids = Vec::new();
        let mut route_records = Vec::new();
        for route in routes.iter_mut() {
            if self.binder.unbind(&mut gateway, route) {
                changed_ids.push(route.id().clone());
                route_records.push(route_record(route)?);
            }
        }
        inner.backend.upsert_routes(token, route_records).await?;
        inner.backend.delete_gateway(token, id).await?;

        let routes_by_id = by_id(routes);
        let mut errors = Vec::new();
        self.publish_route_statuses(token, &changed_ids, &routes_by_id, &mut errors)
            .await;
        first_error(errors)
    }

    /// Inserts or replaces a route: its back-ends are resolved, then it is
    /// offered to every known gateway, and the changed gateways re-synced.
    pub async fn upsert_route(
        &self,
        token: &CancellationToken,
        route: Route,
        condition: Option<UpsertCondition<Route>>,
    ) -> Result<()> {
        let inner = self.state.write().await;
        let current = fetch_route(&inner.backend, token, route.id()).await?;
        if let Some(condition) = condition {
            if !condition(current.as_ref()) {
                tracing::debug!(route = %route.id(), "route upsert rejected by condition");
                return Ok(());
            }
        }

        let mut route = route;
        resolve_route_backends(
            token,
            self.resolver.as_ref(),
            self.grants.as_ref(),
            &mut route,
        )
        .await;

        let mut gateways = list_gateways(&inner.backend, token).await?;
        let mut changed = BTreeSet::new();
        for gateway in gateways.iter_mut() {
            if self.binder.bind(gateway, &mut route) {
                changed.insert(gateway.id.clone());
            }
        }

        inner
            .backend
            .upsert_routes(token, vec![route_record(&route)?])
            .await?;
        let gateway_records = gateways
            .iter()
            .filter(|gateway| changed.contains(&gateway.id))
            .map(|gateway| gateway_record(gateway))
            .collect::<Result<Vec<_>, _>>()?;
        inner.backend.upsert_gateways(token, gateway_records).await?;

        let routes_by_id = by_id(list_routes(&inner.backend, token).await?);
        let changed_gateways: Vec<Gateway> = gateways
            .into_iter()
            .filter(|gateway| changed.contains(&gateway.id))
            .collect();

        let mut errors = Vec::new();
        if let Err(error) = self
            .sync_gateways(&inner, token, changed_gateways, &routes_by_id)
            .await
        {
            errors.push(error);
        }
        if let Err(error) = self.updater.update_route_status(token, &route).await {
            errors.push(error.context("failed to update route status"));
        }
        first_error(errors)
    }

    /// Removes a route, unbinding it from every gateway and re-syncing the
    /// gateways it was attached to.
    pub async fn delete_route(&self, token: &CancellationToken, id: &RouteId) -> Result<()> {
        let inner = self.state.write().await;
        let Some(mut route) = fetch_route(&inner.backend, token, id).await? else {
            return Ok(());
        };

        let mut gateways = list_gateways(&inner.backend, token).await?;
        let mut changed = BTreeSet::new();
        for gateway in gateways.iter_mut() {
            if self.binder.unbind(gateway, &mut route) {
                changed.insert(gateway.id.clone());
            }
        }

        let gateway_records = gateways
            .iter()
            .filter(|gateway| changed.contains(&gateway.id))
            .map(|gateway| gateway_record(gateway))
            .collect::<Result<Vec<_>, _>>()?;
        inner.backend.upsert_gateways(token, gateway_records).await?;
        inner.backend.delete_route(token, id).await?;

        let routes_by_id = by_id(list_routes(&inner.backend, token).await?);
        let changed_gateways: Vec<Gateway> = gateways
            .into_iter()
            .filter(|gateway| changed.contains(&gateway.id))
            .collect();
        self.sync_gateways(&inner, token, changed_gateways, &routes_by_id)
            .await
    }

    /// Re-syncs every known gateway and republishes every route status.
    /// Per-gateway failures are logged, not propagated, so one bad gateway
    /// cannot starve the rest.
    pub async fn sync_all(&self, token: &CancellationToken) -> Result<()> {
        let inner = self.state.write().await;
        let gateways = list_gateways(&inner.backend, token).await?;
        let routes_by_id = by_id(list_routes(&inner.backend, token).await?);

        if let Err(error) = self
            .sync_gateways(&inner, token, gateways, &routes_by_id)
            .await
        {
            tracing::error!(%error, "full sync failed for at least one gateway");
        }
        for route in routes_by_id.values() {
            if let Err(error) = self.updater.update_route_status(token, route).await {
                tracing::error!(route = %route.id(), %error, "failed to update route status");
            }
        }
        Ok(())
    }

    /// Runs a full re-sync on a fixed period until cancelled. Idempotent: a
    /// second concurrent call returns immediately.
    pub async fn sync_all_at_interval(&self, token: &CancellationToken) {
        if self.periodic_running.swap(true, Ordering::SeqCst) {
            tracing::warn!("periodic sync is already running");
            return;
        }
        let mut interval = tokio::time::interval(self.sync_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(error) = self.sync_all(token).await {
                        tracing::error!(%error, "periodic sync failed");
                    }
                }
            }
        }
        self.periodic_running.store(false, Ordering::SeqCst);
    }

    /// Resolves and syncs each gateway concurrently, wrapping every sync in
    /// the status updater and stamping the sync-tracking capability where a
    /// gateway carries it. The first failure is returned once all complete.
    async fn sync_gateways(
        &self,
        inner: &Inner<B>,
        token: &CancellationToken,
        gateways: Vec<Gateway>,
        routes: &BTreeMap<RouteId, Route>,
    ) -> Result<()> {
        let results = futures::future::join_all(gateways.into_iter().map(|mut gateway| async move {
            self.metrics.sync_requested();
            let resolved = gateway.resolve(routes);
            let adapter = self.adapter.clone();
            let sync = Box::pin(async move { adapter.sync(token, resolved).await });
            let outcome = self
                .updater
                .update_gateway_status_on_sync(token, &gateway, sync)
                .await;

            let stamp = match &outcome {
                Ok(_) => SyncStatus {
                    synced: true,
                    last_error: None,
                },
                Err(error) => SyncStatus {
                    synced: false,
                    last_error: Some(error.to_string()),
                },
            };
            if let Some(status) = gateway.track_sync_mut() {
                if *status != stamp {
                    *status = stamp;
                    inner
                        .backend
                        .upsert_gateways(token, vec![gateway_record(&gateway)?])
                        .await?;
                }
            }
            outcome
                .map(|_| ())
                .with_context(|| format!("failed to sync gateway {}", gateway.id))
        }))
        .await;

        let mut first = None;
        for result in results {
            if let Err(error) = result {
                tracing::error!(%error, "gateway sync failed");
                if first.is_none() {
                    first = Some(error);
                }
            }
        }
        match first {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn publish_route_statuses(
        &self,
        token: &CancellationToken,
        changed: &[RouteId],
        routes: &BTreeMap<RouteId, Route>,
        errors: &mut Vec<anyhow::Error>,
    ) {
        for id in changed {
            let Some(route) = routes.get(id) else { continue };
            if let Err(error) = self.updater.update_route_status(token, route).await {
                errors.push(error.context(format!("failed to update status for route {id}")));
            }
        }
    }
}

fn gateway_record(gateway: &Gateway) -> Result<GatewayRecord, marshal::MarshalError> {
    Ok(GatewayRecord {
        id: gateway.id.clone(),
        data: marshal::marshal_gateway(gateway)?,
    })
}

fn route_record(route: &Route) -> Result<RouteRecord, marshal::MarshalError> {
    Ok(RouteRecord {
        id: route.id().clone(),
        data: marshal::marshal_route(route)?,
    })
}

fn by_id(routes: Vec<Route>) -> BTreeMap<RouteId, Route> {
    routes
        .into_iter()
        .map(|route| (route.id().clone(), route))
        .collect()
}

fn first_error(errors: Vec<anyhow::Error>) -> Result<()> {
    match errors.into_iter().next() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

async fn fetch_gateway<B: Backend>(
    backend: &B,
    token: &CancellationToken,
    id: &GatewayId,
) -> Result<Option<Gateway>> {
    match backend.get_gateway(token, id).await {
        Ok(data) => Ok(Some(marshal::unmarshal_gateway(&data)?)),
        Err(BackendError::NotFound) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

async fn fetch_route<B: Backend>(
    backend: &B,
    token: &CancellationToken,
    id: &RouteId,
) -> Result<Option<Route>> {
    match backend.get_route(token, id).await {
        Ok(data) => Ok(Some(marshal::unmarshal_route(&data)?)),
        Err(BackendError::NotFound) => Ok(None),
        Err(error) => Err(error.into()),
    }
}

async fn list_gateways<B: Backend>(
    backend: &B,
    token: &CancellationToken,
) -> Result<Vec<Gateway>> {
    backend
        .list_gateways(token)
        .await?
        .iter()
        .map(|data| marshal::unmarshal_gateway(data).map_err(Into::into))
        .collect()
}

async fn list_routes<B: Backend>(backend: &B, token: &CancellationToken) -> Result<Vec<Route>> {
    backend
        .list_routes(token)
        .await?
        .iter()
        .map(|data| marshal::unmarshal_route(data).map_err(Into::into))
        .collect()
}
