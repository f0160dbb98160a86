use super::{Error, Source};
use flowtag_core::{Endpoint, IpAddresses};
use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};
use tokio::process::Command;
use tracing::{debug, trace};

/// Runs `crictl` with the given arguments, returning its standard output.
#[async_trait::async_trait]
pub trait Crictl: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<String, Error>;
}

/// Invokes the `crictl` binary. Invocations that outlive `timeout` are killed.
#[derive(Clone, Debug)]
pub struct CrictlCommand {
    program: PathBuf,
    timeout: Duration,
}

/// Reads endpoints from the container runtime's ready pod sandboxes.
#[derive(Clone, Debug)]
pub struct Ctrinfo<C = CrictlCommand> {
    crictl: C,
}

#[derive(Debug, Deserialize)]
struct Inspect {
    status: Status,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    network: Network,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Network {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    additional_ips: Vec<AdditionalIp>,
}

#[derive(Debug, Deserialize)]
struct AdditionalIp {
    ip: String,
}

// === impl CrictlCommand ===

impl CrictlCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait::async_trait]
impl Crictl for CrictlCommand {
    async fn run(&self, args: &[&str]) -> Result<String, Error> {
        let command = format!("{} {}", self.program.display(), args.join(" "));
        let mut cmd = Command::new(&self.program);
        cmd.args(args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(res) => res.map_err(|source| Error::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                return Err(Error::Timeout {
                    command,
                    timeout: self.timeout,
                })
            }
        };
        if !output.status.success() {
            return Err(Error::Exit {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// === impl Ctrinfo ===

impl<C: Crictl> Ctrinfo<C> {
    pub fn new(crictl: C) -> Self {
        Self { crictl }
    }

    async fn inspect(&self, id: &str) -> Result<Option<Endpoint>, Error> {
        let out = self.crictl.run(&["inspectp", id]).await?;
        let Inspect {
            status: Status { metadata, network },
        } = serde_json::from_str(&out).map_err(|source| Error::Sandbox {
            id: id.to_string(),
            source,
        })?;
        if metadata.name.is_empty() {
            trace!(%id, "Skipping sandbox without a pod name");
            return Ok(None);
        }

        let ips = std::iter::once(network.ip)
            .chain(network.additional_ips.into_iter().map(|addr| addr.ip))
            .filter_map(|ip| ip.parse::<IpAddr>().ok())
            .collect::<IpAddresses>();
        Ok(Some(Endpoint::new(metadata.name, metadata.namespace, ips)))
    }
}

#[async_trait::async_trait]
impl<C: Crictl> Source for Ctrinfo<C> {
    async fn endpoints(&self) -> Result<Vec<Endpoint>, Error> {
        let ids = self
            .crictl
            .run(&["pods", "--quiet", "--state", "ready"])
            .await?;

        let mut endpoints = vec![];
        for id in ids.lines().map(str::trim).filter(|id| !id.is_empty()) {
            if let Some(ep) = self.inspect(id).await? {
                endpoints.push(ep);
            }
        }
        debug!(count = endpoints.len(), "Listed pod sandboxes");
        Ok(endpoints)
    }
}
