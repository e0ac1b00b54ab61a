//! Container backends
//!
//! A backend resolves a container name into a [`ContainerHandle`] and runs
//! commands inside it, either to completion ([`ContainerBackend::exec_buffered`])
//! or handing out a live [`Transport`] ([`ContainerBackend::exec_streaming`]).
//! Container lifecycle is managed elsewhere; backends only exec into
//! containers that already run.

pub mod local;
pub mod mock;

#[cfg(feature = "docker")]
pub mod docker;

#[cfg(feature = "kubernetes")]
pub mod kubernetes;

use crate::config::BackendConfig;
use crate::error::{ExecError, Result};
use crate::execution::types::CommandSpec;
use crate::transport::Transport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use local::LocalBackend;
pub use mock::MockBackend;

#[cfg(feature = "docker")]
pub use docker::DockerBackend;

#[cfg(feature = "kubernetes")]
pub use kubernetes::KubernetesBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Docker,
    Kubernetes,
    Mock,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Local => "local",
            BackendKind::Docker => "docker",
            BackendKind::Kubernetes => "kubernetes",
            BackendKind::Mock => "mock",
        };
        f.write_str(name)
    }
}

/// A running container commands can be executed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub backend: BackendKind,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            backend,
        }
    }
}

/// What a backend's transport can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Output can be read incrementally while the command runs
    pub streaming: bool,
}

impl Default for BackendCapabilities {
    fn default() -> Self {
        Self { streaming: true }
    }
}

/// One command to run inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    pub workdir: Option<String>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: None,
        }
    }

    /// The command as a single shell line, prefixed with a `cd` into the
    /// working directory when one is set
    pub fn shell_line(&self) -> String {
        match &self.workdir {
            Some(dir) => format!("cd {} && {}", shell_words::quote(dir), self.command),
            None => self.command.clone(),
        }
    }

    /// `sh -c <line>` argv
    pub fn shell_argv(&self) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), self.shell_line()]
    }
}

impl From<&CommandSpec> for ExecRequest {
    fn from(spec: &CommandSpec) -> Self {
        Self {
            command: spec.command.clone(),
            workdir: spec.workdir.clone(),
        }
    }
}

/// Complete output of a command run to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferedOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    /// Look up a running container by name or id
    async fn resolve(&self, container: &str) -> Result<ContainerHandle>;

    /// Run a command and wait for its complete output
    async fn exec_buffered(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<BufferedOutput>;

    /// Start a command and return the transport carrying its output
    async fn exec_streaming(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<Transport>;
}

/// Connect to the backend described by `config`
pub async fn connect(config: &BackendConfig) -> Result<Arc<dyn ContainerBackend>> {
    match config {
        BackendConfig::Local { transport } => Ok(Arc::new(LocalBackend::new(*transport))),

        #[cfg(feature = "docker")]
        BackendConfig::Docker { socket } => {
            let backend = DockerBackend::connect(socket.as_deref()).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "docker"))]
        BackendConfig::Docker { .. } => Err(ExecError::Config(
            "docker backend requested but the `docker` feature is disabled".to_string(),
        )),

        #[cfg(feature = "kubernetes")]
        BackendConfig::Kubernetes { namespace, container } => {
            let backend = KubernetesBackend::connect(namespace.clone(), container.clone()).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "kubernetes"))]
        BackendConfig::Kubernetes { .. } => Err(ExecError::Config(
            "kubernetes backend requested but the `kubernetes` feature is disabled".to_string(),
        )),
    }
}
