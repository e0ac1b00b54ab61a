//! Docker exec backend; also serves Podman through its Docker-compatible
//! socket

use super::{BackendKind, BufferedOutput, ContainerBackend, ContainerHandle, ExecRequest};
use crate::error::{ExecError, Result};
use crate::execution::types::RawChunk;
use crate::transport::{MultiplexedExec, OutputPair, Transport, TransportError};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, LogOutput};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use std::time::Duration;

/// How often the exit code is re-read while Docker still reports the exec
/// as running after its output closed
const EXIT_CODE_RETRIES: usize = 20;
const EXIT_CODE_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect to the daemon at `socket`, or the local default when unset
    pub async fn connect(socket: Option<&str>) -> Result<Self> {
        let docker = match socket {
            Some(socket) => Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| ExecError::Backend(format!("failed to connect to Docker daemon: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| ExecError::Backend(format!("failed to ping Docker daemon: {e}")))?;

        tracing::info!(socket = socket.unwrap_or("default"), "Connected to Docker daemon");
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Create and attach to an exec instance, returning its id and output
    async fn start(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<(String, MultiplexedOutput)> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), request.command.clone()]),
            working_dir: request.workdir.clone(),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&handle.id, options)
            .await
            .map_err(|e| ExecError::Backend(format!("failed to create exec: {e}")))?;

        match self.docker.start_exec(&exec.id, None).await {
            Ok(StartExecResults::Attached { output, .. }) => Ok((exec.id, output)),
            Ok(StartExecResults::Detached) => Err(ExecError::Backend(
                "exec started detached; no output to read".to_string(),
            )),
            Err(e) => Err(ExecError::Backend(format!("failed to start exec: {e}"))),
        }
    }
}

type MultiplexedOutput = std::pin::Pin<
    Box<dyn futures::Stream<Item = std::result::Result<LogOutput, DockerError>> + Send>,
>;

fn split(output: LogOutput) -> Option<OutputPair> {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => {
            Some((Some(RawChunk::Bytes(message)), None))
        }
        LogOutput::StdErr { message } => Some((None, Some(RawChunk::Bytes(message)))),
        LogOutput::StdIn { .. } => None,
    }
}

fn exit_code_from(code: i64) -> std::result::Result<i32, TransportError> {
    i32::try_from(code)
        .map_err(|_| TransportError::Backend(format!("exit code {code} out of range")))
}

async fn exit_code(docker: &Docker, exec_id: &str) -> std::result::Result<i32, TransportError> {
    for _ in 0..EXIT_CODE_RETRIES {
        let inspect = docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| TransportError::Backend(format!("failed to inspect exec: {e}")))?;

        if inspect.running != Some(true) {
            if let Some(code) = inspect.exit_code {
                return exit_code_from(code);
            }
        }
        tokio::time::sleep(EXIT_CODE_RETRY_DELAY).await;
    }
    Err(TransportError::MissingStatus)
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn resolve(&self, container: &str) -> Result<ContainerHandle> {
        let info = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => ExecError::ContainerNotFound(container.to_string()),
                other => ExecError::Backend(format!("failed to inspect container: {other}")),
            })?;

        let running = info
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);
        if !running {
            return Err(ExecError::ContainerNotRunning(container.to_string()));
        }

        let id = info.id.unwrap_or_else(|| container.to_string());
        let name = info
            .name
            .map(|name| name.trim_start_matches('/').to_string())
            .unwrap_or_else(|| container.to_string());

        tracing::debug!(%id, %name, "Resolved Docker container");
        Ok(ContainerHandle::new(id, name, BackendKind::Docker))
    }

    async fn exec_buffered(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<BufferedOutput> {
        let (exec_id, mut output) = self.start(handle, request).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while let Some(item) = output.next().await {
            let item = item.map_err(|e| {
                ExecError::transport(TransportError::Backend(format!("exec stream failed: {e}")))
            })?;
            match split(item) {
                Some((Some(RawChunk::Bytes(out)), _)) => stdout.extend_from_slice(&out),
                Some((_, Some(RawChunk::Bytes(err)))) => stderr.extend_from_slice(&err),
                _ => {}
            }
        }

        let exit_code = exit_code(&self.docker, &exec_id)
            .await
            .map_err(ExecError::transport)?;
        Ok(BufferedOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn exec_streaming(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<Transport> {
        let (exec_id, output) = self.start(handle, request).await?;

        let pairs = output.filter_map(|item| async move {
            match item {
                Ok(output) => split(output).map(Ok),
                Err(e) => Some(Err(TransportError::Backend(format!(
                    "exec stream failed: {e}"
                )))),
            }
        });

        let docker = self.docker.clone();
        let exit_status = Box::pin(async move { exit_code(&docker, &exec_id).await });

        Ok(Transport::Multiplexed(MultiplexedExec::new(
            Box::pin(pairs),
            exit_status,
        )))
    }
}
