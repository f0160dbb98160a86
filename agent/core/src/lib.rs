//! Shared data model for the flowtag agent.
//!
//! Identity records ([`Endpoint`], [`Service`], [`Node`]) are immutable values. A cache update
//! replaces the whole record, and every [`CacheEvent`] owns its own copy of the affected object so
//! subscribers never observe a record that is later changed in place.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod endpoint;
pub mod flow;
mod ips;

pub use self::{
    endpoint::{Container, Endpoint, Node, OwnerReference, Service},
    ips::IpAddresses,
};
use std::{fmt, net::IpAddr};

/// The only pod annotation retained on an [`Endpoint`]. The same key marks a namespace as observed.
pub const OBSERVE_ANNOTATION: &str = "flowtag.io/observe";

/// Name and namespace of the synthetic endpoint representing the Kubernetes API server.
pub const API_SERVER_NAME: &str = "kubernetes-apiserver";

/// Zone reported when an address has no known owner.
pub const UNKNOWN_ZONE: &str = "unknown";

/// Channels on the publish/subscribe bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Pods,
    Services,
    Nodes,
    Namespaces,
    ApiServer,
}

/// An object that may own an IP address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Object {
    Endpoint(Endpoint),
    Service(Service),
    Node(Node),
    Namespace(String),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    PodAdded,
    PodDeleted,
    ServiceAdded,
    ServiceDeleted,
    NodeAdded,
    NodeDeleted,
    NamespaceAdded,
    NamespaceDeleted,
    ApiServerIpsAdded,
    ApiServerIpsRemoved,
}

/// A lifecycle notification carrying its own copy of the affected object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEvent {
    pub kind: EventKind,
    pub object: Object,
}

/// Read-only identity resolution by address.
pub trait Lookup: Send + Sync {
    /// Returns the object owning `ip`, if any. A miss is not an error.
    fn lookup(&self, ip: IpAddr) -> Option<Object>;
}

// === impl Topic ===

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pods => "pods".fmt(f),
            Self::Services => "services".fmt(f),
            Self::Nodes => "nodes".fmt(f),
            Self::Namespaces => "namespaces".fmt(f),
            Self::ApiServer => "apiserver".fmt(f),
        }
    }
}

// === impl Object ===

impl Object {
    /// The cache key of the object: `namespace/name` for endpoints and services, the name for
    /// nodes and namespaces.
    pub fn key(&self) -> String {
        match self {
            Self::Endpoint(ep) => ep.key(),
            Self::Service(svc) => svc.key(),
            Self::Node(node) => node.name.clone(),
            Self::Namespace(ns) => ns.clone(),
        }
    }

    pub fn primary_ip(&self) -> Option<IpAddr> {
        match self {
            Self::Endpoint(ep) => ep.primary_ip(),
            Self::Service(svc) => svc.primary_ip(),
            Self::Node(node) => Some(node.ip),
            Self::Namespace(_) => None,
        }
    }
}

// === impl CacheEvent ===

impl CacheEvent {
    pub fn new(kind: EventKind, object: Object) -> Self {
        Self { kind, object }
    }

    /// The bus topic an event of this kind is published on.
    pub fn topic(&self) -> Topic {
        match self.kind {
            EventKind::PodAdded | EventKind::PodDeleted => Topic::Pods,
            EventKind::ServiceAdded | EventKind::ServiceDeleted => Topic::Services,
            EventKind::NodeAdded | EventKind::NodeDeleted => Topic::Nodes,
            EventKind::NamespaceAdded | EventKind::NamespaceDeleted => Topic::Namespaces,
            EventKind::ApiServerIpsAdded | EventKind::ApiServerIpsRemoved => Topic::ApiServer,
        }
    }
}
