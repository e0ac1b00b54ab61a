//! Scriptable backend for tests
//!
//! Expectations are matched by exact command string. Each expectation holds
//! a script of output pairs that is replayed through whichever transport the
//! expectation selects, or concatenated for buffered execution.

use super::{
    BackendCapabilities, BackendKind, BufferedOutput, ContainerBackend, ContainerHandle,
    ExecRequest,
};
use crate::error::{ExecError, Result};
use crate::execution::types::RawChunk;
use crate::transport::scripted::{failing_pair_stream, pair_stream, stalled_pair_stream, Tick};
use crate::transport::{
    ChannelStatus, MultiplexedExec, OutputPair, ScriptedChannel, Transport, TransportError,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Transport shape handed out by a streaming expectation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockTransport {
    #[default]
    Multiplexed,
    Pollable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStyle {
    Buffered,
    Streaming,
}

/// One recorded exec call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub container: String,
    pub command: String,
    pub workdir: Option<String>,
    pub style: ExecStyle,
}

#[derive(Debug, Clone)]
struct MockExpectation {
    command: String,
    pairs: Vec<OutputPair>,
    exit_code: i32,
    transport: MockTransport,
    hang: bool,
    failure: Option<String>,
}

#[derive(Clone, Default)]
pub struct MockBackend {
    expectations: Arc<Mutex<Vec<MockExpectation>>>,
    call_history: Arc<Mutex<Vec<MockCall>>>,
    resolved: Arc<Mutex<Vec<String>>>,
    missing: Arc<Mutex<HashSet<String>>>,
    stopped: Arc<Mutex<HashSet<String>>>,
    capabilities: BackendCapabilities,
}

pub struct MockCommandConfig {
    backend: MockBackend,
    expectation: MockExpectation,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn chunk_bytes(chunk: &RawChunk) -> &[u8] {
    match chunk {
        RawChunk::Bytes(bytes) => bytes,
        RawChunk::Text(text) => text.as_bytes(),
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose transport cannot read incrementally
    pub fn without_streaming() -> Self {
        Self {
            capabilities: BackendCapabilities { streaming: false },
            ..Self::default()
        }
    }

    pub fn expect_command(&self, command: &str) -> MockCommandConfig {
        MockCommandConfig {
            backend: self.clone(),
            expectation: MockExpectation {
                command: command.to_string(),
                pairs: Vec::new(),
                exit_code: 0,
                transport: MockTransport::default(),
                hang: false,
                failure: None,
            },
        }
    }

    /// Make `resolve` fail with not-found for `container`
    pub fn with_missing_container(self, container: &str) -> Self {
        lock(&self.missing).insert(container.to_string());
        self
    }

    /// Make `resolve` fail with not-running for `container`
    pub fn with_stopped_container(self, container: &str) -> Self {
        lock(&self.stopped).insert(container.to_string());
        self
    }

    pub fn get_call_history(&self) -> Vec<MockCall> {
        lock(&self.call_history).clone()
    }

    pub fn calls(&self, style: ExecStyle) -> usize {
        lock(&self.call_history)
            .iter()
            .filter(|call| call.style == style)
            .count()
    }

    pub fn verify_called(&self, command: &str, times: usize) -> bool {
        lock(&self.call_history)
            .iter()
            .filter(|call| call.command == command)
            .count()
            == times
    }

    /// Container names passed to `resolve`, in order
    pub fn resolve_calls(&self) -> Vec<String> {
        lock(&self.resolved).clone()
    }

    fn record(&self, handle: &ContainerHandle, request: &ExecRequest, style: ExecStyle) {
        lock(&self.call_history).push(MockCall {
            container: handle.name.clone(),
            command: request.command.clone(),
            workdir: request.workdir.clone(),
            style,
        });
    }

    fn expectation(&self, command: &str) -> Result<MockExpectation> {
        lock(&self.expectations)
            .iter()
            .find(|expectation| expectation.command == command)
            .cloned()
            .ok_or_else(|| {
                ExecError::Backend(format!("No expectation found for command: {command}"))
            })
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn resolve(&self, container: &str) -> Result<ContainerHandle> {
        lock(&self.resolved).push(container.to_string());
        if lock(&self.missing).contains(container) {
            return Err(ExecError::ContainerNotFound(container.to_string()));
        }
        if lock(&self.stopped).contains(container) {
            return Err(ExecError::ContainerNotRunning(container.to_string()));
        }
        Ok(ContainerHandle::new(
            format!("mock-{container}"),
            container,
            BackendKind::Mock,
        ))
    }

    async fn exec_buffered(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<BufferedOutput> {
        self.record(handle, request, ExecStyle::Buffered);
        let expectation = self.expectation(&request.command)?;

        if expectation.hang {
            futures::future::pending::<()>().await;
        }
        if let Some(message) = expectation.failure {
            return Err(ExecError::transport(TransportError::Backend(message)));
        }

        let mut output = BufferedOutput {
            exit_code: expectation.exit_code,
            ..Default::default()
        };
        for (stdout, stderr) in &expectation.pairs {
            if let Some(chunk) = stdout {
                output.stdout.extend_from_slice(chunk_bytes(chunk));
            }
            if let Some(chunk) = stderr {
                output.stderr.extend_from_slice(chunk_bytes(chunk));
            }
        }
        Ok(output)
    }

    async fn exec_streaming(
        &self,
        handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<Transport> {
        self.record(handle, request, ExecStyle::Streaming);
        let expectation = self.expectation(&request.command)?;
        let exit_code = expectation.exit_code;

        match expectation.transport {
            MockTransport::Multiplexed => {
                let output = match (&expectation.failure, expectation.hang) {
                    (Some(message), _) => failing_pair_stream(expectation.pairs, message),
                    (None, true) => stalled_pair_stream(expectation.pairs),
                    (None, false) => pair_stream(expectation.pairs),
                };
                Ok(Transport::Multiplexed(MultiplexedExec::new(
                    output,
                    Box::pin(async move { Ok(exit_code) }),
                )))
            }
            MockTransport::Pollable => {
                let ticks = expectation.pairs.into_iter().map(|(stdout, stderr)| Tick {
                    stdout,
                    stderr,
                });
                let status = match expectation.failure {
                    Some(message) => ChannelStatus::Failed(message),
                    None => ChannelStatus::Exited(exit_code),
                };
                let mut channel = ScriptedChannel::new(ticks, status);
                if expectation.hang {
                    channel = channel.stall_after_script();
                }
                Ok(Transport::Pollable(Box::new(channel)))
            }
        }
    }
}

impl MockCommandConfig {
    pub fn returns_stdout(mut self, chunk: impl Into<RawChunk>) -> Self {
        self.expectation.pairs.push((Some(chunk.into()), None));
        self
    }

    pub fn returns_stderr(mut self, chunk: impl Into<RawChunk>) -> Self {
        self.expectation.pairs.push((None, Some(chunk.into())));
        self
    }

    pub fn returns_pair(mut self, pair: OutputPair) -> Self {
        self.expectation.pairs.push(pair);
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.expectation.exit_code = code;
        self
    }

    pub fn via(mut self, transport: MockTransport) -> Self {
        self.expectation.transport = transport;
        self
    }

    /// Never finish after the scripted output
    pub fn hangs(mut self) -> Self {
        self.expectation.hang = true;
        self
    }

    /// Fail the transport after the scripted output
    pub fn fails_with(mut self, message: &str) -> Self {
        self.expectation.failure = Some(message.to_string());
        self
    }

    pub fn finish(self) {
        lock(&self.backend.expectations).push(self.expectation);
    }
}
