use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counters for mesh synchronization, labeled by outcome.
#[derive(Clone, Debug, Default)]
pub struct SyncMetrics {
    syncs: Family<OutcomeLabels, Counter>,
    intention_changes: Family<IntentionLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IntentionLabels {
    op: String,
}

impl SyncMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "gateway_syncs",
            "Count of gateway sync attempts by outcome",
            metrics.syncs.clone(),
        );
        prom.register(
            "intention_changes",
            "Count of intention source insertions and removals",
            metrics.intention_changes.clone(),
        );
        metrics
    }

    pub fn sync_recorded(&self, outcome: &str) {
        self.syncs
            .get_or_create(&OutcomeLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub fn intention_changed(&self, op: &str) {
        self.intention_changes
            .get_or_create(&IntentionLabels { op: op.to_string() })
            .inc();
    }
}
