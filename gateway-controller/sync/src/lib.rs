#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod adapter;
pub mod builder;
pub mod consolidate;
pub mod intentions;
pub mod metrics;

pub use self::{
    adapter::SyncAdapter,
    builder::{build, GatewayEntries},
    intentions::IntentionsReconciler,
    metrics::SyncMetrics,
};
