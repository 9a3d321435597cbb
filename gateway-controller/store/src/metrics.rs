use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Counters for store activity.
#[derive(Clone, Debug, Default)]
pub struct StoreMetrics {
    fetches: Family<KindLabels, Counter>,
    syncs: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: String,
}

impl StoreMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();
        prom.register(
            "store_fetches",
            "Count of record fetches from the backend by kind",
            metrics.fetches.clone(),
        );
        prom.register(
            "store_gateway_syncs",
            "Count of gateway syncs requested by the store",
            metrics.syncs.clone(),
        );
        metrics
    }

    pub fn fetched(&self, kind: &str) {
        self.fetches
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn sync_requested(&self) {
        self.syncs.inc();
    }
}
