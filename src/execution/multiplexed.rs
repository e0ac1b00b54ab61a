//! Processor for transports that deliver `(stdout, stderr)` chunk pairs

use super::deadline::Deadline;
use super::pipeline::OutputPipeline;
use super::types::StreamSource;
use crate::error::ExecError;
use crate::transport::MultiplexedStream;
use futures::StreamExt;

/// Drains a multiplexed pair stream into an [`OutputPipeline`].
///
/// Pairing comes from the transport; the processor only keeps the two
/// sides apart. The exit code is not part of the stream and is fetched by
/// the caller afterwards.
#[derive(Debug, Clone, Copy)]
pub struct MultiplexedProcessor {
    deadline: Deadline,
}

impl MultiplexedProcessor {
    pub fn new(deadline: Deadline) -> Self {
        Self { deadline }
    }

    /// Consume the stream until it ends or the deadline passes.
    ///
    /// Returns `(stdout, stderr)`. On timeout the error carries everything
    /// decoded before the deadline and no further chunk is read.
    pub async fn process(
        &self,
        mut output: MultiplexedStream,
        mut pipeline: OutputPipeline,
    ) -> Result<(String, String), ExecError> {
        let mut pairs = 0usize;
        loop {
            let next = match self.deadline.bound(output.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::warn!(
                        execution_id = %pipeline.context().execution_id,
                        command = %pipeline.context().command,
                        pairs,
                        "Execution deadline passed while streaming output"
                    );
                    return Err(ExecError::Timeout {
                        timeout: self.deadline.timeout(),
                        partial: pipeline.partial(),
                    });
                }
            };

            match next {
                None => break,
                Some(Ok((stdout, stderr))) => {
                    pairs += 1;
                    if let Some(chunk) = stdout {
                        pipeline.feed(StreamSource::Stdout, chunk)?;
                    }
                    if let Some(chunk) = stderr {
                        pipeline.feed(StreamSource::Stderr, chunk)?;
                    }
                }
                Some(Err(source)) => {
                    tracing::error!(
                        execution_id = %pipeline.context().execution_id,
                        error = %source,
                        "Multiplexed transport failed"
                    );
                    return Err(ExecError::Transport {
                        source,
                        partial: pipeline.partial(),
                    });
                }
            }
        }

        tracing::debug!(
            execution_id = %pipeline.context().execution_id,
            pairs,
            "Multiplexed stream exhausted"
        );
        pipeline.finish()
    }
}
