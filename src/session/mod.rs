//! Command batches against one container
//!
//! [`SandboxSession`] is the entry point for callers: it validates a batch,
//! resolves the container once, and runs the commands one after another
//! through the [`ExecutionCoordinator`], handing the same callbacks to every
//! command.

use crate::backend::{self, ContainerBackend, ContainerHandle};
use crate::config::SessionConfig;
use crate::error::{ExecError, Result, TIMEOUT_EXIT_CODE};
use crate::execution::{
    CommandResult, CommandSpec, DecodePolicy, ExecutionCoordinator, OutputCallbacks,
    StreamCallback,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

#[cfg(test)]
mod tests;

/// Container name used when the local backend runs without one
pub const LOCAL_CONTAINER: &str = "localhost";

pub struct SandboxSession {
    coordinator: ExecutionCoordinator,
    config: SessionConfig,
    container: String,
    handle: OnceCell<ContainerHandle>,
}

impl SandboxSession {
    pub fn builder() -> SandboxSessionBuilder {
        SandboxSessionBuilder::default()
    }

    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        config: SessionConfig,
        container: impl Into<String>,
    ) -> Self {
        Self {
            coordinator: ExecutionCoordinator::new(backend),
            config,
            container: container.into(),
            handle: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// The resolved container, looked up on first use
    pub async fn handle(&self) -> Result<&ContainerHandle> {
        self.handle
            .get_or_try_init(|| async {
                let handle = self.coordinator.backend().resolve(&self.container).await?;
                tracing::debug!(
                    container = %handle.name,
                    id = %handle.id,
                    backend = %handle.backend,
                    "Resolved container"
                );
                Ok::<_, ExecError>(handle)
            })
            .await
    }

    /// Run `commands` in order and return one result per executed command.
    ///
    /// A timed-out command becomes a failed result with exit code
    /// [`TIMEOUT_EXIT_CODE`] and the output collected before the deadline.
    /// Decode and transport failures abort the batch and are returned as
    /// errors. With `stop_on_error`, the batch ends after the first result
    /// with a non-zero exit code.
    pub async fn run<I, C>(
        &self,
        commands: I,
        on_stdout: Option<StreamCallback>,
        on_stderr: Option<StreamCallback>,
    ) -> Result<Vec<CommandResult>>
    where
        I: IntoIterator<Item = C>,
        C: Into<CommandSpec>,
    {
        let commands: Vec<CommandSpec> = commands.into_iter().map(Into::into).collect();
        validate(&commands)?;

        let handle = self.handle().await?;
        let callbacks = OutputCallbacks::new(on_stdout, on_stderr);
        let mut results = Vec::with_capacity(commands.len());

        for (index, command) in commands.iter().enumerate() {
            let result = match self
                .coordinator
                .execute(handle, command, &self.config, &callbacks)
                .await
            {
                Ok(result) => result,
                Err(ExecError::Timeout { timeout, partial }) => {
                    tracing::warn!(
                        command = %command.command,
                        ?timeout,
                        "Command timed out; keeping partial output"
                    );
                    partial.into_result(TIMEOUT_EXIT_CODE)
                }
                Err(err) => {
                    tracing::error!(
                        command = %command.command,
                        index,
                        error = %err,
                        "Command failed; aborting batch"
                    );
                    return Err(err);
                }
            };

            let failed = !result.success();
            results.push(result);
            if failed && self.config.stop_on_error {
                tracing::info!(
                    command = %command.command,
                    skipped = commands.len() - index - 1,
                    "Stopping batch after failed command"
                );
                break;
            }
        }

        Ok(results)
    }

    /// Run a single command, surfacing timeouts as errors
    pub async fn execute_command(
        &self,
        command: impl Into<CommandSpec>,
        on_stdout: Option<StreamCallback>,
        on_stderr: Option<StreamCallback>,
    ) -> Result<CommandResult> {
        let command = command.into();
        validate(std::slice::from_ref(&command))?;

        let handle = self.handle().await?;
        self.coordinator
            .execute(
                handle,
                &command,
                &self.config,
                &OutputCallbacks::new(on_stdout, on_stderr),
            )
            .await
    }
}

fn validate(commands: &[CommandSpec]) -> Result<()> {
    if commands.is_empty() {
        return Err(ExecError::InvalidArgument(
            "at least one command is required".to_string(),
        ));
    }
    for (index, command) in commands.iter().enumerate() {
        if command.command.trim().is_empty() {
            return Err(ExecError::InvalidArgument(format!(
                "command {index} is empty"
            )));
        }
        if matches!(&command.workdir, Some(dir) if dir.trim().is_empty()) {
            return Err(ExecError::InvalidArgument(format!(
                "command {index} has an empty working directory"
            )));
        }
    }
    Ok(())
}

#[derive(Default)]
pub struct SandboxSessionBuilder {
    backend: Option<Arc<dyn ContainerBackend>>,
    config: SessionConfig,
    container: Option<String>,
}

impl SandboxSessionBuilder {
    /// Use this backend instead of connecting to the configured one
    pub fn backend(mut self, backend: Arc<dyn ContainerBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.config.stream = stream;
        self
    }

    pub fn encoding_errors(mut self, policy: DecodePolicy) -> Self {
        self.config.encoding_errors = policy;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.config.execution_timeout = Some(timeout);
        self
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.config.stop_on_error = stop;
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.config.workdir = Some(workdir.into());
        self
    }

    /// Connect to the backend if none was given and build the session
    pub async fn build(self) -> Result<SandboxSession> {
        self.config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => backend::connect(&self.config.backend).await?,
        };

        let container = match self.container.or_else(|| self.config.container.clone()) {
            Some(container) => container,
            None if backend.kind() == backend::BackendKind::Local => LOCAL_CONTAINER.to_string(),
            None => {
                return Err(ExecError::InvalidArgument(format!(
                    "a container name is required for the {} backend",
                    backend.kind()
                )))
            }
        };

        Ok(SandboxSession::new(backend, self.config, container))
    }
}
