use super::{Error, Source};
use flowtag_core::{Endpoint, IpAddresses};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    net::IpAddr,
    path::{Path, PathBuf},
};
use tracing::{debug, trace};

/// Reads endpoints from the CNI plugin's state file.
#[derive(Clone, Debug)]
pub struct StateFile {
    path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct State {
    #[serde(default)]
    network: Network,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Network {
    #[serde(default)]
    external_interfaces: BTreeMap<String, Interface>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Interface {
    #[serde(default)]
    networks: BTreeMap<String, Container>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Container {
    #[serde(default)]
    ip_addresses: Vec<Address>,
    #[serde(default)]
    pod_name: String,
    #[serde(default)]
    pod_namespace: String,
}

#[derive(Debug, Deserialize)]
struct Address {
    #[serde(rename = "IP")]
    ip: String,
}

// === impl StateFile ===

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, contents: &str) -> Result<Vec<Endpoint>, Error> {
        if contents.trim().is_empty() {
            debug!(path = %self.path.display(), "State file is empty");
            return Ok(vec![]);
        }

        let state = serde_json::from_str::<State>(contents).map_err(|source| Error::Json {
            path: self.path.clone(),
            source,
        })?;

        let mut endpoints = vec![];
        for (ifname, iface) in state.network.external_interfaces {
            for (id, container) in iface.networks {
                if container.pod_name.is_empty() {
                    trace!(%ifname, %id, "Skipping network without a pod");
                    continue;
                }
                let ips = container
                    .ip_addresses
                    .iter()
                    .filter_map(|addr| addr.ip.parse::<IpAddr>().ok())
                    .collect::<IpAddresses>();
                endpoints.push(Endpoint::new(
                    container.pod_name,
                    container.pod_namespace,
                    ips,
                ));
            }
        }
        Ok(endpoints)
    }
}

#[async_trait::async_trait]
impl Source for StateFile {
    async fn endpoints(&self) -> Result<Vec<Endpoint>, Error> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| Error::Io {
                path: self.path.clone(),
                source,
            })?;
        self.parse(&contents)
    }
}
