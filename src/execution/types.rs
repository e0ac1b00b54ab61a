//! Core types shared by the streaming execution pipeline

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which output stream a chunk belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    /// Both streams in the order the processors visit them
    pub const ALL: [StreamSource; 2] = [StreamSource::Stdout, StreamSource::Stderr];

    pub(crate) fn index(self) -> usize {
        match self {
            StreamSource::Stdout => 0,
            StreamSource::Stderr => 1,
        }
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSource::Stdout => f.write_str("stdout"),
            StreamSource::Stderr => f.write_str("stderr"),
        }
    }
}

/// A unit of output as delivered by a backend transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChunk {
    /// Undecoded bytes, possibly ending in a partial UTF-8 sequence
    Bytes(Bytes),
    /// Text the transport already decoded
    Text(String),
}

impl RawChunk {
    pub fn is_empty(&self) -> bool {
        match self {
            RawChunk::Bytes(bytes) => bytes.is_empty(),
            RawChunk::Text(text) => text.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawChunk::Bytes(bytes) => bytes.len(),
            RawChunk::Text(text) => text.len(),
        }
    }
}

impl From<Bytes> for RawChunk {
    fn from(bytes: Bytes) -> Self {
        RawChunk::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RawChunk {
    fn from(bytes: Vec<u8>) -> Self {
        RawChunk::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for RawChunk {
    fn from(bytes: &'static [u8]) -> Self {
        RawChunk::Bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for RawChunk {
    fn from(text: String) -> Self {
        RawChunk::Text(text)
    }
}

impl From<&str> for RawChunk {
    fn from(text: &str) -> Self {
        RawChunk::Text(text.to_string())
    }
}

/// How a single command's output is collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// One blocking read of the complete output
    #[default]
    Buffered,
    /// Incremental reads as the command produces output
    Streaming,
}

impl ExecutionMode {
    /// Pick the mode for one invocation.
    ///
    /// A registered callback forces streaming regardless of the session
    /// default. A backend without incremental reads always runs buffered.
    pub fn select(has_callback: bool, stream_by_default: bool, backend_streams: bool) -> Self {
        if !backend_streams {
            return ExecutionMode::Buffered;
        }
        if has_callback || stream_by_default {
            ExecutionMode::Streaming
        } else {
            ExecutionMode::Buffered
        }
    }
}

/// Final outcome of one command
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One entry in a batch passed to [`crate::session::SandboxSession::run`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub workdir: Option<String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            workdir: None,
        }
    }

    pub fn in_dir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl From<&str> for CommandSpec {
    fn from(command: &str) -> Self {
        CommandSpec::new(command)
    }
}

impl From<String> for CommandSpec {
    fn from(command: String) -> Self {
        CommandSpec::new(command)
    }
}

impl<C: Into<String>> From<(C, Option<&str>)> for CommandSpec {
    fn from((command, workdir): (C, Option<&str>)) -> Self {
        CommandSpec {
            command: command.into(),
            workdir: workdir.map(str::to_string),
        }
    }
}

impl<C: Into<String>> From<(C, &str)> for CommandSpec {
    fn from((command, workdir): (C, &str)) -> Self {
        CommandSpec::new(command).in_dir(workdir)
    }
}
