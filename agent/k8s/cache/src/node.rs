use crate::Index;
use anyhow::{bail, Context, Result};
use flowtag_core::{Node, UNKNOWN_ZONE};
use flowtag_k8s_api::{self as k8s, labels, ResourceExt};
use std::net::IpAddr;
use tracing::{debug, warn};

impl kubert::index::IndexClusterResource<k8s::Node> for Index {
    fn apply(&mut self, node: k8s::Node) {
        let name = node.name_unchecked();
        let node = match self::node(&node) {
            Ok(node) => node,
            Err(error) => {
                warn!(%name, %error, "Invalid node");
                return;
            }
        };

        if let Err(error) = self.cache.update_node(node) {
            warn!(%name, %error, "Failed to cache node");
        }
    }

    fn delete(&mut self, name: String) {
        if let Err(error) = self.cache.delete_node(&name) {
            debug!(%name, %error, "Node not deleted");
        }
    }
}

/// Translates a node, preferring its internal address and falling back to the first one listed.
pub(crate) fn node(node: &k8s::Node) -> Result<Node> {
    let addresses = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.as_deref())
        .unwrap_or_default();
    let Some(addr) = addresses
        .iter()
        .find(|addr| addr.type_ == labels::INTERNAL_IP)
        .or_else(|| addresses.first())
    else {
        bail!("node has no addresses");
    };
    let ip = addr
        .address
        .parse::<IpAddr>()
        .with_context(|| format!("invalid node address {:?}", addr.address))?;

    let zone = node
        .labels()
        .get(labels::ZONE_LABEL)
        .cloned()
        .unwrap_or_else(|| UNKNOWN_ZONE.to_string());

    Ok(Node::new(node.name_unchecked(), ip, zone))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s::api::core::v1::{NodeAddress, NodeStatus};
    use maplit::{btreemap, convert_args};

    fn mk_node(addresses: &[(&str, &str)]) -> k8s::Node {
        k8s::Node {
            metadata: k8s::ObjectMeta {
                name: Some("node-0".to_string()),
                labels: Some(convert_args!(btreemap!(
                    "topology.kubernetes.io/zone" => "zone-a"
                ))),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(type_, address)| NodeAddress {
                            type_: type_.to_string(),
                            address: address.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn prefers_internal_ip() {
        let n = mk_node(&[("Hostname", "node-0"), ("InternalIP", "192.0.2.10")]);
        let n = node(&n).expect("node must translate");
        assert_eq!(n.name, "node-0");
        assert_eq!(n.ip, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(n.zone, "zone-a");
    }

    #[test]
    fn falls_back_to_first_address() {
        let n = mk_node(&[("ExternalIP", "203.0.113.5")]);
        assert_eq!(
            node(&n).unwrap().ip,
            "203.0.113.5".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn node_without_addresses() {
        assert!(node(&mk_node(&[])).is_err());
    }
}
