//! Kubernetes identity cache
//!
//! The [`Cache`] maps IP addresses to the Kubernetes object that currently owns them. Three kinds
//! of objects may own an address:
//!
//! - An endpoint, translated from a `Pod`, indexed by its primary IP.
//! - A `Service`, indexed by its cluster IP.
//! - A `Node`, indexed by its (preferably internal) address.
//!
//! At most one object owns a given address at any time. When an update claims an address owned by
//! a different object, that object is removed first and its deletion is published on the bus.
//!
//! The [`Index`] adapts watch events from the API server into cache updates, and the
//! [`apiserver::Watcher`] keeps the API server's own addresses attributed to a synthetic endpoint.
//!
//! ```text
//! [ watches ] -> [ Index ] -> [ Cache ] -> [ PubSub ] -> subscribers
//!                                ^
//!                 [ apiserver::Watcher ] (via PubSub)
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod apiserver;
mod cache;
pub mod metrics;
mod namespace;
mod node;
mod pod;
mod service;


pub use self::cache::{Cache, SharedCache, Sizes};
use parking_lot::RwLock;
use std::{net::IpAddr, sync::Arc};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} has no primary IP")]
    NoPrimaryIp(String),

    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("{kind} {key} is indexed by {ip} but missing from the cache")]
    MissingOwner {
        ip: IpAddr,
        kind: &'static str,
        key: String,
    },
}

pub type SharedIndex = Arc<RwLock<Index>>;

/// Translates watched `Pod`, `Service`, `Node`, and `Namespace` resources into cache updates.
///
/// Translation failures and rejected updates are logged; retrying is left to the watch.
#[derive(Debug)]
pub struct Index {
    cache: SharedCache,
}

// === impl Index ===

impl Index {
    pub fn shared(cache: SharedCache) -> SharedIndex {
        Arc::new(RwLock::new(Self { cache }))
    }
}
