use crate::route::{BackendRef, BackendState, Route};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// A concrete mesh service, the terminal result of back-end resolution.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedService {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// A typed resolution failure, tagged by kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ResolutionError {
    #[error("kubernetes error: {0}")]
    K8s(String),
    #[error("consul error: {0}")]
    Consul(String),
    #[error("backend was not found: {0}")]
    BackendNotFound(String),
    #[error("{0}")]
    Generic(String),
    #[error("invalid reference kind: {0}")]
    InvalidKind(String),
    #[error("no resolution")]
    NoResolution,
    #[error("reference not permitted: {0}")]
    RefNotPermitted(String),
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResolutionErrorKind {
    K8s,
    Consul,
    BackendNotFound,
    Generic,
    InvalidKind,
    NoResolution,
    RefNotPermitted,
}

/// A multiset of resolution failures keyed by kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionErrors {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    by_kind: BTreeMap<ResolutionErrorKind, Vec<ResolutionError>>,
}

/// Resolves a back-end reference to a concrete mesh service.
///
/// Implementations retry transient catalog misses internally and surface
/// permanent failures as typed errors.
#[async_trait::async_trait]
pub trait BackendResolver: Send + Sync + 'static {
    async fn resolve(
        &self,
        token: &CancellationToken,
        parent_namespace: &str,
        backend: &BackendRef,
    ) -> Result<ResolvedService, ResolutionError>;
}

/// Answers whether a cross-namespace reference is authorized by a reference
/// policy in the target namespace.
pub trait ReferenceGrants: Send + Sync + 'static {
    fn permits(&self, from: ReferenceSource<'_>, to: ReferenceTarget<'_>) -> bool;
}

#[derive(Copy, Clone, Debug)]
pub struct ReferenceSource<'a> {
    pub group: &'a str,
    pub kind: &'a str,
    pub namespace: &'a str,
}

#[derive(Copy, Clone, Debug)]
pub struct ReferenceTarget<'a> {
    pub group: &'a str,
    pub kind: &'a str,
    pub namespace: &'a str,
    pub name: &'a str,
}

/// Grants every reference; for backends that do not enforce policies.
#[derive(Copy, Clone, Debug, Default)]
pub struct AllowAll;

impl ReferenceGrants for AllowAll {
    fn permits(&self, _: ReferenceSource<'_>, _: ReferenceTarget<'_>) -> bool {
        true
    }
}

// === impl ResolutionError ===

impl ResolutionError {
    pub fn kind(&self) -> ResolutionErrorKind {
        match self {
            ResolutionError::K8s(_) => ResolutionErrorKind::K8s,
            ResolutionError::Consul(_) => ResolutionErrorKind::Consul,
            ResolutionError::BackendNotFound(_) => ResolutionErrorKind::BackendNotFound,
            ResolutionError::Generic(_) => ResolutionErrorKind::Generic,
            ResolutionError::InvalidKind(_) => ResolutionErrorKind::InvalidKind,
            ResolutionError::NoResolution => ResolutionErrorKind::NoResolution,
            ResolutionError::RefNotPermitted(_) => ResolutionErrorKind::RefNotPermitted,
        }
    }

    /// Whether retrying the same resolution could ever succeed without a
    /// change to the referenced objects.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, ResolutionError::Consul(_) | ResolutionError::K8s(_))
    }
}

// === impl ResolutionErrors ===

impl ResolutionErrors {
    pub fn add(&mut self, error: ResolutionError) {
        self.by_kind.entry(error.kind()).or_default().push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.values().all(|errors| errors.is_empty())
    }

    pub fn clear(&mut self) {
        self.by_kind.clear();
    }

    /// Collapses the multiset to a single representative error: `None` when
    /// empty, the first error when only one kind is present, and a `Generic`
    /// aggregation otherwise.
    pub fn flatten(&self) -> Option<ResolutionError> {
        let mut kinds = self
            .by_kind
            .iter()
            .filter(|(_, errors)| !errors.is_empty());
        let (_, first) = kinds.next()?;
        if kinds.next().is_none() {
            return first.first().cloned();
        }
        let message = self
            .by_kind
            .values()
            .flatten()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Some(ResolutionError::Generic(message))
    }
}

/// Resolves every back-end reference on a route, recording per-backend
/// verdicts and the aggregate error multiset on the route state.
///
/// Cross-namespace references are checked against reference policies before
/// any catalog traffic; unauthorized references fail with `RefNotPermitted`
/// and are never retried. Returns true if any recorded state changed.
pub async fn resolve_route_backends(
    token: &CancellationToken,
    resolver: &dyn BackendResolver,
    grants: &dyn ReferenceGrants,
    route: &mut Route,
) -> bool {
    let namespace = route.namespace().to_string();
    let route_kind = route.kind();
    let mut errors = ResolutionErrors::default();
    let mut changed = false;

    for (backend, state) in route.backends_mut() {
        let target_namespace = backend.target_namespace(&namespace);
        let permitted = target_namespace == namespace
            || grants.permits(
                ReferenceSource {
                    group: "gateway.networking.k8s.io",
                    kind: route_kind.as_str(),
                    namespace: &namespace,
                },
                ReferenceTarget {
                    group: &backend.group,
                    kind: &backend.kind,
                    namespace: target_namespace,
                    name: &backend.name,
                },
            );

        let next = if !permitted {
            BackendState::Failed(ResolutionError::RefNotPermitted(format!(
                "no reference policy in {} permits {} {}",
                target_namespace, backend.kind, backend.name,
            )))
        } else {
            match resolver.resolve(token, &namespace, &backend).await {
                Ok(service) => BackendState::Resolved(service),
                Err(error) => BackendState::Failed(error),
            }
        };

        if let BackendState::Failed(error) = &next {
            errors.add(error.clone());
        }
        if *state != next {
            *state = next;
            changed = true;
        }
    }

    let state = route.state_mut();
    if state.resolution_errors != errors {
        state.resolution_errors = errors;
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flatten_empty_is_none() {
        assert_eq!(ResolutionErrors::default().flatten(), None);
    }

    #[test]
    fn flatten_single_kind_keeps_the_kind() {
        let mut errors = ResolutionErrors::default();
        errors.add(ResolutionError::BackendNotFound("api".to_string()));
        errors.add(ResolutionError::BackendNotFound("web".to_string()));
        assert_eq!(
            errors.flatten(),
            Some(ResolutionError::BackendNotFound("api".to_string()))
        );
    }

    #[test]
    fn flatten_mixed_kinds_collapses_to_generic() {
        let mut errors = ResolutionErrors::default();
        errors.add(ResolutionError::InvalidKind("ConfigMap".to_string()));
        errors.add(ResolutionError::BackendNotFound("api".to_string()));
        match errors.flatten() {
            Some(ResolutionError::Generic(_)) => {}
            other => panic!("expected a generic error, got {other:?}"),
        }
    }
}
