use super::callback::OutputCallbacks;
use super::deadline::{Deadline, Expired};
use super::decoder::DecodePolicy;
use super::multiplexed::MultiplexedProcessor;
use super::pipeline::OutputPipeline;
use super::polling::PollingProcessor;
use super::sink::{ExecutionContext, StreamSink};
use super::types::{CommandResult, CommandSpec, ExecutionMode, StreamSource};
use crate::backend::{ContainerBackend, ContainerHandle, ExecRequest};
use crate::config::SessionConfig;
use crate::error::{ExecError, PartialOutput, Result};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Runs single commands against a backend, choosing buffered or streaming
/// execution per call
#[derive(Clone)]
pub struct ExecutionCoordinator {
    backend: Arc<dyn ContainerBackend>,
}

/// Aborts the worker when the caller stops waiting for it
struct WorkerGuard(JoinHandle<Result<CommandResult>>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ExecutionCoordinator {
    pub fn new(backend: Arc<dyn ContainerBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn ContainerBackend> {
        &self.backend
    }

    /// Mode a call with these callbacks would run in
    pub fn mode_for(&self, callbacks: &OutputCallbacks, config: &SessionConfig) -> ExecutionMode {
        ExecutionMode::select(
            callbacks.any(),
            config.stream,
            self.backend.capabilities().streaming,
        )
    }

    /// Execute one command and return its result.
    ///
    /// Any callback invocations happen before this returns. Timeouts, decode
    /// failures and transport failures are returned as errors carrying the
    /// output collected so far.
    pub async fn execute(
        &self,
        handle: &ContainerHandle,
        command: &CommandSpec,
        config: &SessionConfig,
        callbacks: &OutputCallbacks,
    ) -> Result<CommandResult> {
        let mut request = ExecRequest::from(command);
        if request.workdir.is_none() {
            request.workdir = config.workdir.clone();
        }

        let mode = self.mode_for(callbacks, config);
        let context = ExecutionContext::new(&command.command);
        let deadline = Deadline::after(config.execution_timeout);
        let started = Instant::now();

        tracing::debug!(
            execution_id = %context.execution_id,
            command = %context.command,
            container = %handle.name,
            backend = %handle.backend,
            ?mode,
            "Starting execution"
        );

        let outcome = match mode {
            ExecutionMode::Buffered => {
                self.execute_buffered(
                    handle,
                    &request,
                    config.encoding_errors,
                    deadline,
                    context.clone(),
                    callbacks,
                )
                .await
            }
            ExecutionMode::Streaming => {
                self.execute_streaming(
                    handle,
                    &request,
                    config.encoding_errors,
                    config.poll_interval,
                    deadline,
                    context.clone(),
                    callbacks,
                )
                .await
            }
        };

        match &outcome {
            Ok(result) => tracing::debug!(
                execution_id = %context.execution_id,
                exit_code = result.exit_code,
                elapsed = ?started.elapsed(),
                "Execution finished"
            ),
            Err(err) => tracing::debug!(
                execution_id = %context.execution_id,
                error = %err,
                elapsed = ?started.elapsed(),
                "Execution failed"
            ),
        }
        outcome
    }

    async fn execute_buffered(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
        policy: DecodePolicy,
        deadline: Deadline,
        context: ExecutionContext,
        callbacks: &OutputCallbacks,
    ) -> Result<CommandResult> {
        let output = match deadline.bound(self.backend.exec_buffered(handle, request)).await {
            Ok(output) => output?,
            Err(Expired) => return Err(timeout(deadline.timeout(), PartialOutput::default())),
        };

        let mut pipeline = OutputPipeline::new(policy, context.clone(), OutputCallbacks::none());
        pipeline.feed(StreamSource::Stdout, output.stdout.into())?;
        pipeline.feed(StreamSource::Stderr, output.stderr.into())?;
        let (stdout, stderr) = pipeline.finish()?;

        // one synthetic delivery of the full text per registered callback
        let mut sink = StreamSink::new(context, callbacks.clone());
        sink.consume(StreamSource::Stdout, &stdout);
        sink.consume(StreamSource::Stderr, &stderr);
        let (stdout, stderr) = sink.into_output();

        Ok(CommandResult::new(output.exit_code, stdout, stderr))
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_streaming(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
        policy: DecodePolicy,
        poll_interval: Duration,
        deadline: Deadline,
        context: ExecutionContext,
        callbacks: &OutputCallbacks,
    ) -> Result<CommandResult> {
        let transport = match deadline.bound(self.backend.exec_streaming(handle, request)).await {
            Ok(transport) => transport?,
            Err(Expired) => return Err(timeout(deadline.timeout(), PartialOutput::default())),
        };

        tracing::trace!(
            execution_id = %context.execution_id,
            transport = transport.kind(),
            "Transport attached"
        );

        let pipeline = OutputPipeline::new(policy, context, callbacks.clone());
        let mut worker = WorkerGuard(tokio::spawn(drive(
            transport,
            pipeline,
            deadline,
            poll_interval,
        )));

        match (&mut worker.0).await {
            Ok(outcome) => outcome,
            Err(join) => Err(ExecError::Worker(join.to_string())),
        }
    }
}

fn timeout(timeout: Duration, partial: PartialOutput) -> ExecError {
    ExecError::Timeout { timeout, partial }
}

/// Body of the worker task draining one transport
async fn drive(
    transport: Transport,
    pipeline: OutputPipeline,
    deadline: Deadline,
    poll_interval: Duration,
) -> Result<CommandResult> {
    match transport {
        Transport::Multiplexed(exec) => {
            let (stdout, stderr) = MultiplexedProcessor::new(deadline)
                .process(exec.output, pipeline)
                .await?;

            match deadline.bound(exec.exit_status).await {
                Ok(Ok(exit_code)) => Ok(CommandResult::new(exit_code, stdout, stderr)),
                Ok(Err(source)) => Err(ExecError::Transport {
                    source,
                    partial: PartialOutput::new(stdout, stderr),
                }),
                Err(Expired) => Err(timeout(
                    deadline.timeout(),
                    PartialOutput::new(stdout, stderr),
                )),
            }
        }
        Transport::Pollable(mut channel) => {
            PollingProcessor::new(deadline)
                .with_poll_interval(poll_interval)
                .process(channel.as_mut(), pipeline)
                .await
        }
    }
}
