//! Sources of running pod endpoints for standalone mode.

use flowtag_core::Endpoint;
use std::{path::PathBuf, time::Duration};

mod ctrinfo;
mod statefile;

pub use self::{
    ctrinfo::{Crictl, CrictlCommand, Ctrinfo},
    statefile::StateFile,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Exit {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("failed to parse sandbox {id}: {source}")]
    Sandbox {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Lists the endpoints currently running on this node.
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    async fn endpoints(&self) -> Result<Vec<Endpoint>, Error>;
}
