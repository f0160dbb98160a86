//! Flow records as produced by the decoder and republished by the enricher.
//!
//! These types are serialized as JSON for line-oriented ingest and export.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Flow(Flow),
    Lost(LostEvent),
    Agent(AgentEvent),
}

/// Reports events dropped by a producer before they reached the agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostEvent {
    pub source: String,
    pub num_events_lost: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ip>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l4: Option<Layer4>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service: Option<ServiceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_service: Option<ServiceRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ip {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub ip_version: IpVersion,
}

/// Encoded numerically: 0 unknown, 1 IPv4, 2 IPv6.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IpVersion {
    #[default]
    Unknown,
    Ipv4,
    Ipv6,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer4 {
    pub protocol: Protocol,
    #[serde(default)]
    pub source_port: u16,
    #[serde(default)]
    pub destination_port: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// Identity attached to one side of a flow.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub namespace: String,
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workloads: Vec<Workload>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    pub kind: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

// === impl Event ===

impl Event {
    pub fn now(payload: Payload) -> Self {
        Self {
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn flow(flow: Flow) -> Self {
        Self::now(Payload::Flow(flow))
    }
}

// === impl Flow ===

impl Flow {
    /// A flow with only its address pair set.
    pub fn between(source: impl ToString, destination: impl ToString, ip_version: IpVersion) -> Self {
        Self {
            ip: Some(Ip {
                source: source.to_string(),
                destination: destination.to_string(),
                ip_version,
            }),
            ..Default::default()
        }
    }
}

// === impl IpVersion ===

impl TryFrom<u8> for IpVersion {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Ipv4),
            2 => Ok(Self::Ipv6),
            v => Err(format!("invalid IP version: {v}")),
        }
    }
}

impl From<IpVersion> for u8 {
    fn from(v: IpVersion) -> Self {
        match v {
            IpVersion::Unknown => 0,
            IpVersion::Ipv4 => 1,
            IpVersion::Ipv6 => 2,
        }
    }
}

// === impl Endpoint ===

impl From<&crate::Endpoint> for Endpoint {
    fn from(ep: &crate::Endpoint) -> Self {
        Self {
            namespace: ep.namespace.clone(),
            pod_name: ep.name.clone(),
            labels: ep.formatted_labels(),
            workloads: ep
                .owner_refs
                .iter()
                .map(|owner| Workload {
                    name: owner.name.clone(),
                    kind: owner.kind.clone(),
                })
                .collect(),
        }
    }
}

impl From<&crate::Service> for ServiceRef {
    fn from(svc: &crate::Service) -> Self {
        Self {
            namespace: svc.namespace.clone(),
            name: svc.name.clone(),
        }
    }
}
