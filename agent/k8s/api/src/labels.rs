//! Well-known label and annotation keys.

pub use flowtag_core::OBSERVE_ANNOTATION;

/// Node label carrying the node's availability zone.
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

/// Value of [`OBSERVE_ANNOTATION`] that opts a namespace into observation.
pub const OBSERVE_ENABLED: &str = "true";

/// Node address type preferred when picking a node's IP.
pub const INTERNAL_IP: &str = "InternalIP";

/// Returns true if the annotations opt the object into observation.
pub fn is_observed(annotations: &std::collections::BTreeMap<String, String>) -> bool {
    annotations
        .get(OBSERVE_ANNOTATION)
        .is_some_and(|v| v == OBSERVE_ENABLED)
}
