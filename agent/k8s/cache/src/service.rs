use crate::Index;
use anyhow::{Context, Result};
use flowtag_core::{IpAddresses, Service};
use flowtag_k8s_api::{self as k8s, ResourceExt};
use std::net::IpAddr;
use tracing::{debug, trace, warn};

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, svc: k8s::Service) {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_unchecked();

        let svc = match service(&svc) {
            Ok(Some(svc)) => svc,
            Ok(None) => {
                trace!(%namespace, %name, "Skipping headless service");
                return;
            }
            Err(error) => {
                warn!(%namespace, %name, %error, "Invalid service");
                return;
            }
        };

        if let Err(error) = self.cache.update_service(svc) {
            warn!(%namespace, %name, %error, "Failed to cache service");
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = format!("{namespace}/{name}");
        // Headless services are never cached, so a missing key is expected here.
        if let Err(error) = self.cache.delete_service(&key) {
            debug!(%key, %error, "Service not deleted");
        }
    }
}

/// Translates a service into a cache record, or `None` if it has no cluster IP.
pub(crate) fn service(svc: &k8s::Service) -> Result<Option<Service>> {
    let Some(spec) = svc.spec.as_ref() else {
        return Ok(None);
    };

    let cluster_ips = spec
        .cluster_ips
        .iter()
        .flatten()
        .chain(spec.cluster_ip.iter())
        .map(String::as_str)
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .map(|ip| {
            ip.parse::<IpAddr>()
                .with_context(|| format!("invalid cluster IP {ip:?}"))
        })
        .collect::<Result<IpAddresses>>()?;
    if cluster_ips.is_empty() {
        return Ok(None);
    }

    let lb_ip = svc
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|ingress| ingress.ip.as_deref())
        .map(|ip| {
            ip.parse::<IpAddr>()
                .with_context(|| format!("invalid load balancer IP {ip:?}"))
        })
        .transpose()?;

    let mut record = Service::new(
        svc.name_unchecked(),
        svc.namespace().unwrap_or_default(),
        cluster_ips,
    );
    record.lb_ip = lb_ip;
    record.selector = spec.selector.clone().unwrap_or_default();
    Ok(Some(record))
}
