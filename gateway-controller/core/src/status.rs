use crate::{
    gateway::{Gateway, PodState},
    resolve::ResolutionErrorKind,
    route::{BindError, Route},
    GatewayId,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::{collections::BTreeMap, time::Duration};
use tokio_util::sync::CancellationToken;

pub const STATUS_UPDATE_ATTEMPTS: u32 = 5;
pub const STATUS_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// A single outcome surfaced onto an upstream record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Why a listener failed validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenerError {
    UnsupportedProtocol,
    InvalidCertificateRef,
    UnsupportedAddress,
    InvalidRouteKinds,
    PortConflicted,
    HostnameConflict,
    ProtocolConflict,
}

/// The listener verdict state machine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListenerState {
    Pending,
    Ready,
    Invalid(ListenerError),
    Detached(ListenerError),
    Conflicted(ListenerError),
}

/// Surfaces per-gateway and per-route outcomes to the source of truth.
///
/// Implementations must never let a status failure abort the wrapped sync:
/// the sync outcome is returned even when publication fails.
#[async_trait::async_trait]
pub trait StatusUpdater: Send + Sync + 'static {
    /// Runs the sync future and publishes the gateway's resulting
    /// conditions, propagating whether the mesh state changed.
    async fn update_gateway_status_on_sync(
        &self,
        token: &CancellationToken,
        gateway: &Gateway,
        sync: BoxFuture<'_, Result<bool>>,
    ) -> Result<bool>;

    /// Publishes the per-parent-ref conditions computed from the route's
    /// recorded state.
    async fn update_route_status(&self, token: &CancellationToken, route: &Route) -> Result<()>;
}

// === impl Condition ===

impl Condition {
    pub fn new(
        type_: impl ToString,
        status: bool,
        reason: impl ToString,
        message: impl ToString,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

// === impl ListenerError ===

impl ListenerError {
    pub fn reason(&self) -> &'static str {
        match self {
            ListenerError::UnsupportedProtocol => "UnsupportedProtocol",
            ListenerError::InvalidCertificateRef => "InvalidCertificateRef",
            ListenerError::UnsupportedAddress => "UnsupportedAddress",
            ListenerError::InvalidRouteKinds => "InvalidRouteKinds",
            ListenerError::PortConflicted => "PortConflicted",
            ListenerError::HostnameConflict => "HostnameConflict",
            ListenerError::ProtocolConflict => "ProtocolConflict",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ListenerError::PortConflicted
                | ListenerError::HostnameConflict
                | ListenerError::ProtocolConflict
        )
    }
}

// === impl ListenerState ===

impl ListenerState {
    pub fn of(error: Option<ListenerError>) -> Self {
        match error {
            None => ListenerState::Ready,
            Some(error) if error.is_conflict() => ListenerState::Conflicted(error),
            Some(ListenerError::UnsupportedAddress) => {
                ListenerState::Detached(ListenerError::UnsupportedAddress)
            }
            Some(error) => ListenerState::Invalid(error),
        }
    }

    pub fn conditions(&self) -> Vec<Condition> {
        let conflicted = match self {
            ListenerState::Conflicted(error) => {
                Condition::new("Conflicted", true, error.reason(), error_message(error))
            }
            _ => Condition::new("Conflicted", false, "NoConflicts", ""),
        };
        let ready = match self {
            ListenerState::Ready => Condition::new("Ready", true, "Ready", ""),
            ListenerState::Pending => Condition::new("Ready", false, "Pending", ""),
            ListenerState::Invalid(error)
            | ListenerState::Detached(error)
            | ListenerState::Conflicted(error) => {
                Condition::new("Ready", false, error.reason(), error_message(error))
            }
        };
        vec![conflicted, ready]
    }
}

fn error_message(error: &ListenerError) -> String {
    format!("listener is {}", error.reason())
}

/// Computes the verdict for each listener on the gateway.
pub fn listener_states(gateway: &Gateway) -> BTreeMap<String, ListenerState> {
    let errors = gateway.listener_errors();
    gateway
        .listeners
        .iter()
        .map(|listener| {
            let state = ListenerState::of(errors.get(&listener.name).copied());
            (listener.name.clone(), state)
        })
        .collect()
}

/// The gateway-level `Scheduled` and `Ready` conditions.
pub fn gateway_conditions(gateway: &Gateway) -> Vec<Condition> {
    let scheduled = match gateway.pod_state {
        PodState::Running => Condition::new("Scheduled", true, "Scheduled", ""),
        PodState::PendingNoResources => {
            Condition::new("Scheduled", false, "NoResources", "insufficient resources")
        }
        PodState::PendingNotReconciled => {
            Condition::new("Scheduled", false, "NotReconciled", "deployment not yet reconciled")
        }
        PodState::Failed => Condition::new("Scheduled", false, "PodFailed", "gateway pod failed"),
        PodState::Unknown => Condition::new("Scheduled", false, "Unknown", ""),
    };

    let ready = if !gateway.listener_errors().is_empty() {
        Condition::new("Ready", false, "ListenersNotValid", "one or more listeners are invalid")
    } else if gateway.pod_state != PodState::Running {
        Condition::new("Ready", false, "ListenersNotReady", "gateway deployment is not running")
    } else if gateway.addresses.is_empty() {
        Condition::new("Ready", false, "AddressNotAssigned", "no gateway address assigned")
    } else {
        Condition::new("Ready", true, "Ready", "")
    };

    vec![scheduled, ready]
}

/// The per-parent-ref `Accepted`, `ResolvedRefs`, `Bound`, and `Conflicted`
/// conditions, keyed by parent gateway.
pub fn route_conditions(route: &Route) -> BTreeMap<GatewayId, Vec<Condition>> {
    let state = route.state();
    route
        .parent_refs()
        .iter()
        .map(|parent| {
            let id = parent.gateway.clone();
            let bound = route.is_bound_to(&id);
            let bind_error = state.bind_errors.get(&id);
            let conflicted = state.conflicted.contains(&id);

            let accepted = match bind_error {
                _ if bound => Condition::new("Accepted", true, "Accepted", ""),
                Some(error) => Condition::new("Accepted", false, bind_reason(error), error),
                None => Condition::new("Accepted", false, "NotBound", ""),
            };
            let bound_condition = if bound {
                Condition::new("Bound", true, "Bound", "")
            } else {
                Condition::new("Bound", false, "NotBound", "")
            };
            let resolved = match state.resolution_errors.flatten() {
                None => Condition::new("ResolvedRefs", true, "ResolvedRefs", ""),
                Some(error) => {
                    Condition::new("ResolvedRefs", false, resolution_reason(error.kind()), error)
                }
            };
            let conflict_condition = if conflicted {
                Condition::new("Conflicted", true, "ListenerConflict", "matched listener is conflicted")
            } else {
                Condition::new("Conflicted", false, "NoConflicts", "")
            };

            (id, vec![accepted, resolved, bound_condition, conflict_condition])
        })
        .collect()
}

fn bind_reason(error: &BindError) -> &'static str {
    match error {
        BindError::NoMatchingParent => "NoMatchingParent",
        BindError::InvalidRouteKind => "InvalidRouteKinds",
        BindError::NoMatchingListenerHostname => "NoMatchingListenerHostname",
        BindError::NotAllowed => "NotAllowedByListeners",
    }
}

fn resolution_reason(kind: ResolutionErrorKind) -> &'static str {
    match kind {
        ResolutionErrorKind::K8s => "ServiceError",
        ResolutionErrorKind::Consul => "ConsulServiceError",
        ResolutionErrorKind::BackendNotFound => "BackendNotFound",
        ResolutionErrorKind::Generic => "ResolutionError",
        ResolutionErrorKind::InvalidKind => "InvalidKind",
        ResolutionErrorKind::NoResolution => "NoResolution",
        ResolutionErrorKind::RefNotPermitted => "RefNotPermitted",
    }
}

/// Retries a status publication with exponential backoff, bounded by
/// [`STATUS_UPDATE_ATTEMPTS`] attempts of [`STATUS_UPDATE_TIMEOUT`] each.
pub async fn retry_status<T, F, Fut>(token: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 0..STATUS_UPDATE_ATTEMPTS {
        match tokio::time::timeout(STATUS_UPDATE_TIMEOUT, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(error)) => last = Some(error),
            Err(_) => last = Some(anyhow::anyhow!("status update timed out")),
        }
        if attempt + 1 < STATUS_UPDATE_ATTEMPTS {
            let delay = Duration::from_secs(1) * 2u32.pow(attempt);
            tokio::select! {
                _ = token.cancelled() => return Err(anyhow::anyhow!("status update cancelled")),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("status update failed")))
}
