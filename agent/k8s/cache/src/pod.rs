use crate::Index;
use anyhow::{Context, Result};
use flowtag_core::{Container, Endpoint, IpAddresses, OwnerReference, UNKNOWN_ZONE};
use flowtag_k8s_api::{self as k8s, ResourceExt};
use std::net::IpAddr;
use tracing::{debug, trace, warn};

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_unchecked();

        if pod.metadata.deletion_timestamp.is_some() {
            trace!(%namespace, %name, "Pod is terminating");
            <Self as kubert::index::IndexNamespacedResource<k8s::Pod>>::delete(
                self, namespace, name,
            );
            return;
        }

        if is_host_network(&pod) {
            trace!(%namespace, %name, "Skipping host network pod");
            return;
        }

        let zone = |node: &str| self.cache.get_node_by_name(node).map(|n| n.zone);
        let ep = match endpoint(&pod, zone) {
            Ok(Some(ep)) => ep,
            Ok(None) => {
                trace!(%namespace, %name, "Pod has no IP yet");
                return;
            }
            Err(error) => {
                warn!(%namespace, %name, %error, "Invalid pod");
                return;
            }
        };

        if let Err(error) = self.cache.update_endpoint(ep) {
            warn!(%namespace, %name, %error, "Failed to cache pod");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = format!("{namespace}/{name}");
        if let Err(error) = self.cache.delete_endpoint(&key) {
            debug!(%key, %error, "Failed to delete pod");
        }
    }
}

fn is_host_network(pod: &k8s::Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
}

/// Translates a pod into an endpoint record, or `None` if no IP has been assigned yet.
///
/// `zone` looks up the zone of the pod's node by name.
pub(crate) fn endpoint(
    pod: &k8s::Pod,
    zone: impl Fn(&str) -> Option<String>,
) -> Result<Option<Endpoint>> {
    let ips = pod_ips(pod)?;
    if ips.is_empty() {
        return Ok(None);
    }

    let owner_refs = pod
        .owner_references()
        .iter()
        .map(|owner| OwnerReference {
            api_version: owner.api_version.clone(),
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
            controller: owner.controller.unwrap_or(false),
        })
        .collect();

    let containers = pod
        .status
        .iter()
        .flat_map(|status| status.container_statuses.iter().flatten())
        .map(|cs| Container {
            name: cs.name.clone(),
            id: cs.container_id.clone().unwrap_or_default(),
        })
        .collect();

    let zone = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .and_then(zone)
        .unwrap_or_else(|| UNKNOWN_ZONE.to_string());

    let ep = Endpoint::new(pod.name_unchecked(), pod.namespace().unwrap_or_default(), ips)
        .with_owner_refs(owner_refs)
        .with_containers(containers)
        .with_labels(pod.labels().clone())
        .with_annotations(pod.annotations().clone())
        .with_zone(zone);
    Ok(Some(ep))
}

fn pod_ips(pod: &k8s::Pod) -> Result<IpAddresses> {
    let Some(status) = pod.status.as_ref() else {
        return Ok(IpAddresses::default());
    };

    let mut ips = status
        .pod_ips
        .iter()
        .flatten()
        .map(|pod_ip| pod_ip.ip.as_str())
        .filter(|ip| !ip.is_empty())
        .map(|ip| {
            ip.parse::<IpAddr>()
                .with_context(|| format!("invalid pod IP {ip:?}"))
        })
        .collect::<Result<IpAddresses>>()?;

    if ips.is_empty() {
        if let Some(ip) = status.pod_ip.as_deref().filter(|ip| !ip.is_empty()) {
            ips.push(
                ip.parse()
                    .with_context(|| format!("invalid pod IP {ip:?}"))?,
            );
        }
    }

    Ok(ips)
}
