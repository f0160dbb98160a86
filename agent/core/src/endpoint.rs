use crate::{IpAddresses, API_SERVER_NAME, OBSERVE_ANNOTATION, UNKNOWN_ZONE};
use std::{collections::BTreeMap, net::IpAddr};

/// A pod, as seen by the ownership cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub namespace: String,
    pub ips: IpAddresses,
    pub owner_refs: Vec<OwnerReference>,
    pub containers: Vec<Container>,
    pub labels: BTreeMap<String, String>,
    /// Only [`OBSERVE_ANNOTATION`] is retained.
    pub annotations: BTreeMap<String, String>,
    /// Zone of the node that reported the pod, resolved once when the record is built.
    pub zone: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    pub ips: IpAddresses,
    pub lb_ip: Option<IpAddr>,
    pub selector: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub ip: IpAddr,
    pub zone: String,
}

fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

// === impl Endpoint ===

impl Endpoint {
    pub fn new(name: impl ToString, namespace: impl ToString, ips: IpAddresses) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ips,
            owner_refs: Vec::new(),
            containers: Vec::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            zone: UNKNOWN_ZONE.to_string(),
        }
    }

    /// Builds the synthetic endpoint for the API server from a flat list of addresses.
    ///
    /// Strings that do not parse as an IP address are skipped.
    pub fn api_server<S: AsRef<str>>(ips: &[S]) -> Self {
        let ips = ips
            .iter()
            .filter_map(|ip| ip.as_ref().parse::<IpAddr>().ok())
            .collect();
        Self::new(API_SERVER_NAME, API_SERVER_NAME, ips)
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Sets annotations, dropping every key except [`OBSERVE_ANNOTATION`].
    pub fn with_annotations<I>(mut self, annotations: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.annotations = annotations
            .into_iter()
            .filter(|(k, _)| k == OBSERVE_ANNOTATION)
            .collect();
        self
    }

    pub fn with_owner_refs(mut self, owner_refs: Vec<OwnerReference>) -> Self {
        self.owner_refs = owner_refs;
        self
    }

    pub fn with_containers(mut self, containers: Vec<Container>) -> Self {
        self.containers = containers;
        self
    }

    pub fn with_zone(mut self, zone: impl ToString) -> Self {
        self.zone = zone.to_string();
        self
    }

    pub fn key(&self) -> String {
        key(&self.namespace, &self.name)
    }

    pub fn primary_ip(&self) -> Option<IpAddr> {
        self.ips.primary_ip()
    }

    /// Labels rendered as `key=value`, ordered by key.
    pub fn formatted_labels(&self) -> Vec<String> {
        self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

// === impl Service ===

impl Service {
    pub fn new(name: impl ToString, namespace: impl ToString, ips: IpAddresses) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ips,
            lb_ip: None,
            selector: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> String {
        key(&self.namespace, &self.name)
    }

    pub fn primary_ip(&self) -> Option<IpAddr> {
        self.ips.primary_ip()
    }
}

// === impl Node ===

impl Node {
    pub fn new(name: impl ToString, ip: IpAddr, zone: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ip,
            zone: zone.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn endpoint_keeps_only_observe_annotation() {
        let ep = Endpoint::new("pod-0", "ns-0", IpAddresses::default()).with_annotations(btreemap! {
            OBSERVE_ANNOTATION.to_string() => "true".to_string(),
            "kubectl.kubernetes.io/last-applied-configuration".to_string() => "{}".to_string(),
        });
        assert_eq!(ep.key(), "ns-0/pod-0");
        assert_eq!(ep.zone, UNKNOWN_ZONE);
        assert_eq!(
            ep.annotations,
            btreemap! { OBSERVE_ANNOTATION.to_string() => "true".to_string() }
        );
    }

    #[test]
    fn api_server_endpoint() {
        let ep = Endpoint::api_server(&["10.0.0.1", "bogus", "10.0.0.2", "fd00::1"]);
        assert_eq!(ep.name, API_SERVER_NAME);
        assert_eq!(ep.namespace, API_SERVER_NAME);
        assert_eq!(ep.primary_ip(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(ep.ips.other_ipv4s, vec!["10.0.0.2".parse::<std::net::Ipv4Addr>().unwrap()]);
        assert_eq!(ep.ips.ipv6, Some("fd00::1".parse().unwrap()));
    }

    #[test]
    fn labels_are_formatted_in_key_order() {
        let ep = Endpoint::new("pod-0", "ns-0", IpAddresses::default()).with_labels(btreemap! {
            "tier".to_string() => "web".to_string(),
            "app".to_string() => "app1".to_string(),
        });
        assert_eq!(ep.formatted_labels(), vec!["app=app1", "tier=web"]);
    }
}
