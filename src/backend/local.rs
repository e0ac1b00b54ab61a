//! Host backend running commands through `sh -c`
//!
//! There is no container: every name resolves to the host. Useful for
//! development and as the reference implementation of both transports.

use super::{BackendKind, BufferedOutput, ContainerBackend, ContainerHandle, ExecRequest};
use crate::error::{ExecError, Result};
use crate::execution::types::{RawChunk, StreamSource};
use crate::transport::{
    ChannelStatus, MultiplexedExec, OutputPair, ReaderChannel, Transport, TransportError,
};
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

const READ_BUFFER_SIZE: usize = 8192;

/// Which transport shape the local backend hands out when streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalTransport {
    #[default]
    Multiplexed,
    Pollable,
}

#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    transport: LocalTransport,
}

impl LocalBackend {
    pub fn new(transport: LocalTransport) -> Self {
        Self { transport }
    }

    fn spawn(&self, request: &ExecRequest) -> Result<Child> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.workdir {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|e| {
            ExecError::Backend(format!("failed to spawn `{}`: {e}", request.command))
        })
    }
}

/// Exit code of a finished process; signals map to `128 + signal`
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

async fn pump<R>(
    mut reader: R,
    source: StreamSource,
    tx: mpsc::UnboundedSender<std::result::Result<OutputPair, TransportError>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        let item = match reader.read_buf(&mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                let chunk = Some(RawChunk::Bytes(buf.split().freeze()));
                Ok(match source {
                    StreamSource::Stdout => (chunk, None),
                    StreamSource::Stderr => (None, chunk),
                })
            }
            Err(e) => Err(TransportError::Io {
                stream: source,
                message: e.to_string(),
            }),
        };
        let failed = item.is_err();
        if tx.send(item).is_err() || failed {
            return;
        }
    }
}

#[async_trait]
impl ContainerBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn resolve(&self, container: &str) -> Result<ContainerHandle> {
        Ok(ContainerHandle::new("localhost", container, BackendKind::Local))
    }

    async fn exec_buffered(
        &self,
        _handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<BufferedOutput> {
        let output = self
            .spawn(request)?
            .wait_with_output()
            .await
            .map_err(|e| ExecError::Backend(format!("failed to wait for command: {e}")))?;

        Ok(BufferedOutput {
            exit_code: exit_code(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn exec_streaming(
        &self,
        _handle: &ContainerHandle,
        request: &ExecRequest,
    ) -> Result<Transport> {
        let mut child = self.spawn(request)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        match self.transport {
            LocalTransport::Multiplexed => {
                let (tx, rx) = mpsc::unbounded_channel();
                if let Some(reader) = stdout {
                    tokio::spawn(pump(reader, StreamSource::Stdout, tx.clone()));
                }
                if let Some(reader) = stderr {
                    tokio::spawn(pump(reader, StreamSource::Stderr, tx));
                }

                // dropping the future drops the child, which kills it
                let exit_status = Box::pin(async move {
                    child
                        .wait()
                        .await
                        .map(exit_code)
                        .map_err(|e| TransportError::Backend(e.to_string()))
                });
                Ok(Transport::Multiplexed(MultiplexedExec::new(
                    Box::pin(UnboundedReceiverStream::new(rx)),
                    exit_status,
                )))
            }
            LocalTransport::Pollable => {
                let status = async move {
                    match child.wait().await {
                        Ok(status) => ChannelStatus::Exited(exit_code(status)),
                        Err(e) => ChannelStatus::Failed(e.to_string()),
                    }
                };
                Ok(Transport::Pollable(Box::new(ReaderChannel::spawn(
                    stdout, stderr, status,
                ))))
            }
        }
    }
}
