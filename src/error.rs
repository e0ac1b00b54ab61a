use crate::execution::decoder::DecodeError;
use crate::execution::types::{CommandResult, StreamSource};
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Exit code reported for a command whose deadline expired
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Output collected before an execution failed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialOutput {
    pub stdout: String,
    pub stderr: String,
}

impl PartialOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// A failed result carrying this output
    pub fn into_result(self, exit_code: i32) -> CommandResult {
        CommandResult::new(exit_code, self.stdout, self.stderr)
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container is not running: {0}")]
    ContainerNotRunning(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Failed to decode {stream}: {source}")]
    Decode {
        stream: StreamSource,
        #[source]
        source: DecodeError,
        partial: PartialOutput,
    },

    #[error("Execution timed out after {timeout:?}")]
    Timeout {
        timeout: Duration,
        partial: PartialOutput,
    },

    #[error("Transport error: {source}")]
    Transport {
        #[source]
        source: TransportError,
        partial: PartialOutput,
    },

    #[error("Execution worker failed: {0}")]
    Worker(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ExecError {
    /// Output gathered before the failure, if the command got that far
    pub fn partial_output(&self) -> Option<&PartialOutput> {
        match self {
            ExecError::Decode { partial, .. }
            | ExecError::Timeout { partial, .. }
            | ExecError::Transport { partial, .. } => Some(partial),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }

    pub(crate) fn transport(source: TransportError) -> Self {
        ExecError::Transport {
            source,
            partial: PartialOutput::default(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
