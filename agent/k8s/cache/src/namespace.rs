use crate::Index;
use flowtag_k8s_api::{self as k8s, labels, ResourceExt};
use tracing::trace;

impl kubert::index::IndexClusterResource<k8s::Namespace> for Index {
    fn apply(&mut self, ns: k8s::Namespace) {
        let name = ns.name_unchecked();
        if labels::is_observed(ns.annotations()) {
            self.cache.add_annotated_namespace(&name);
        } else {
            trace!(%name, "Namespace not observed");
            self.cache.delete_annotated_namespace(&name);
        }
    }

    fn delete(&mut self, name: String) {
        self.cache.delete_annotated_namespace(&name);
    }
}
