#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod args;
pub mod status;

pub use self::{
    args::{Args, BackendKind, LogFormat},
    status::TracingStatusUpdater,
};
use anyhow::{Context, Result};
use clap::Parser;
use mesh_gateway_controller_mesh::{CatalogResolver, Client, LocalClient};
use mesh_gateway_controller_store::{
    Backend, Config, KvBackend, MemoryBackend, Store, StoreMetrics,
};
use mesh_gateway_controller_sync::{SyncAdapter, SyncMetrics};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        self.init_tracing()?;
        // Without a cluster attachment the controller hosts the in-process
        // mesh; deployments embed `run_with_client` with a real client.
        let client = Arc::new(LocalClient::default());
        run_with_client(self, client).await
    }

    fn init_tracing(&self) -> Result<()> {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.log_level)
            .with_context(|| format!("invalid log level {:?}", self.log_level))?;
        match self.log_format {
            LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init(),
        }
        Ok(())
    }
}

/// Assembles the store, adapter, and resolver around the given mesh client
/// and runs the reconciliation loop until interrupted.
pub async fn run_with_client<C: Client>(args: Args, client: Arc<C>) -> Result<()> {
    let mut registry = Registry::with_prefix("gateway_controller");
    let store_metrics = StoreMetrics::register(&mut registry);
    let sync_metrics = SyncMetrics::register(&mut registry);

    let token = CancellationToken::new();
    let adapter = Arc::new(SyncAdapter::new(client.clone(), sync_metrics));
    let resolver = Arc::new(CatalogResolver::new(client.clone()));
    let updater = Arc::new(TracingStatusUpdater);
    let grants = Arc::new(mesh_gateway_controller_core::resolve::AllowAll);

    match args.backend {
        BackendKind::Memory => {
            let store = Store::new(Config {
                backend: MemoryBackend::default(),
                adapter,
                updater,
                resolver,
                grants,
                sync_period: args.sync_period(),
                metrics: store_metrics,
            });
            serve(store, token).await
        }
        BackendKind::Kv => {
            let store = Store::new(Config {
                backend: KvBackend::new(client.clone(), &args.kv_prefix),
                adapter,
                updater,
                resolver,
                grants,
                sync_period: args.sync_period(),
                metrics: store_metrics,
            });
            serve(store, token).await
        }
    }
}

async fn serve<B: Backend>(store: Arc<Store<B>>, token: CancellationToken) -> Result<()> {
    let (signal, watch) = drain::channel();

    let periodic = tokio::spawn({
        let store = store.clone();
        let token = token.clone();
        async move {
            tokio::select! {
                _ = store.sync_all_at_interval(&token) => {}
                release = watch.signaled() => {
                    token.cancel();
                    drop(release);
                }
            }
        }
    });

    tracing::info!("controller running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    signal.drain().await;
    periodic.await.context("periodic sync task panicked")?;
    Ok(())
}
