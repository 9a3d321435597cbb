use anyhow::Result;
use futures::future::BoxFuture;
use mesh_gateway_controller_core::{
    status::{gateway_conditions, listener_states, retry_status, route_conditions, StatusUpdater},
    Gateway, Route,
};
use tokio_util::sync::CancellationToken;

/// Publishes conditions as structured log records. Stands in for the
/// Kubernetes status writer when the controller runs detached from a cluster.
///
/// Publication goes through the shared status retry policy, so a sink that
/// fails transiently inherits the exponential backoff behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingStatusUpdater;

impl TracingStatusUpdater {
    fn publish_gateway(&self, gateway: &Gateway) -> Result<()> {
        for condition in gateway_conditions(gateway) {
            tracing::info!(
                gateway = %gateway.id,
                r#type = %condition.type_,
                status = %condition.status,
                reason = %condition.reason,
                "gateway condition"
            );
        }
        for (listener, state) in listener_states(gateway) {
            for condition in state.conditions() {
                tracing::debug!(
                    gateway = %gateway.id,
                    %listener,
                    r#type = %condition.type_,
                    status = %condition.status,
                    reason = %condition.reason,
                    "listener condition"
                );
            }
        }
        Ok(())
    }

    fn publish_route(&self, route: &Route) -> Result<()> {
        for (gateway, conditions) in route_conditions(route) {
            for condition in conditions {
                tracing::info!(
                    route = %route.id(),
                    %gateway,
                    r#type = %condition.type_,
                    status = %condition.status,
                    reason = %condition.reason,
                    "route condition"
                );
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StatusUpdater for TracingStatusUpdater {
    async fn update_gateway_status_on_sync(
        &self,
        token: &CancellationToken,
        gateway: &Gateway,
        sync: BoxFuture<'_, Result<bool>>,
    ) -> Result<bool> {
        let outcome = sync.await;
        match &outcome {
            Ok(changed) => tracing::info!(gateway = %gateway.id, %changed, "gateway synced"),
            Err(error) => tracing::warn!(gateway = %gateway.id, %error, "gateway sync failed"),
        }
        // Publication failures are retried with backoff and never abort the
        // sync itself.
        if let Err(error) = retry_status(token, || async move { self.publish_gateway(gateway) }).await
        {
            tracing::warn!(gateway = %gateway.id, %error, "failed to publish gateway status");
        }
        outcome
    }

    async fn update_route_status(&self, token: &CancellationToken, route: &Route) -> Result<()> {
        retry_status(token, || async move { self.publish_route(route) }).await
    }
}
