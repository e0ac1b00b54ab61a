//! Backend transport contracts
//!
//! Backends expose command output through one of two capabilities:
//!
//! - [`MultiplexedExec`]: a stream of `(stdout, stderr)` chunk pairs that is
//!   already demultiplexed by the backend (Docker, Podman, local processes),
//!   plus a separate future for the exit status.
//! - [`PollableChannel`]: a stateful channel driven by `update`, `peek` and
//!   `read` calls, with a terminal status once it closes (Kubernetes exec).
//!
//! [`Transport`] tags which one a backend handed out so the coordinator can
//! pick the matching processor.

pub mod reader;
pub mod scripted;

use crate::execution::types::{RawChunk, StreamSource};
use async_trait::async_trait;
use futures::{Future, Stream};
use std::pin::Pin;
use std::time::Duration;

pub use reader::ReaderChannel;
pub use scripted::{ScriptedChannel, ScriptedChannelStats};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("IO error on {stream}: {message}")]
    Io {
        stream: StreamSource,
        message: String,
    },

    #[error("Channel reported failure: {0}")]
    Status(String),

    #[error("Channel closed without a terminal status")]
    MissingStatus,

    #[error("{0}")]
    Backend(String),
}

/// One step of a multiplexed transport; either side may be absent
pub type OutputPair = (Option<RawChunk>, Option<RawChunk>);

pub type MultiplexedStream =
    Pin<Box<dyn Stream<Item = Result<OutputPair, TransportError>> + Send>>;

pub type ExitStatusFuture = Pin<Box<dyn Future<Output = Result<i32, TransportError>> + Send>>;

/// A running command on a multiplexed transport
pub struct MultiplexedExec {
    /// Output pairs until the process terminates
    pub output: MultiplexedStream,
    /// Resolves to the exit code; only awaited once `output` is exhausted
    pub exit_status: ExitStatusFuture,
}

impl MultiplexedExec {
    pub fn new(output: MultiplexedStream, exit_status: ExitStatusFuture) -> Self {
        Self {
            output,
            exit_status,
        }
    }
}

/// Terminal status of a [`PollableChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The command ran to completion with this exit code
    Exited(i32),
    /// The channel itself failed
    Failed(String),
}

/// A stateful output channel polled by the caller
#[async_trait]
pub trait PollableChannel: Send {
    /// False once the remote side finished and all output was received
    fn is_open(&self) -> bool;

    /// Wait up to `timeout` for new data or a state change
    async fn update(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Whether data is waiting on `source`
    fn peek(&self, source: StreamSource) -> bool;

    /// Take all data waiting on `source`
    fn read(&mut self, source: StreamSource) -> Option<RawChunk>;

    /// Terminal status, available once the channel closed
    fn status(&self) -> Option<ChannelStatus>;

    /// Force the channel closed, abandoning any pending output
    async fn close(&mut self);
}

/// Output capability handed out by a backend for one command
pub enum Transport {
    Multiplexed(MultiplexedExec),
    Pollable(Box<dyn PollableChannel>),
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Multiplexed(_) => "multiplexed",
            Transport::Pollable(_) => "pollable",
        }
    }
}
