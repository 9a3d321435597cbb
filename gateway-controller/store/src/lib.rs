#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod kv;
pub mod marshal;
pub mod metrics;
pub mod store;


pub use self::{
    backend::{Backend, BackendError, MemoryBackend},
    kv::KvBackend,
    metrics::StoreMetrics,
    store::{Config, Store, DEFAULT_SYNC_PERIOD},
};
