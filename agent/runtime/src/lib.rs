#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use flowtag_core as core;
pub use flowtag_enricher as enricher;
pub use flowtag_k8s_api as k8s;
pub use flowtag_k8s_cache as cache;
pub use flowtag_pubsub as pubsub;

mod args;
mod export;
mod ingest;

pub use self::args::{Args, EnrichmentMode, Mode};
