//! Processor for channels exposing an open/update/peek/read protocol

use super::deadline::Deadline;
use super::pipeline::OutputPipeline;
use super::types::{CommandResult, StreamSource};
use crate::error::ExecError;
use crate::transport::{ChannelStatus, PollableChannel, TransportError};
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest wait per update; a zero wait would spin
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Polls a [`PollableChannel`] until it closes or the deadline passes.
///
/// Both streams are checked on every iteration so a chatty stdout never
/// starves stderr (or the reverse).
#[derive(Debug, Clone, Copy)]
pub struct PollingProcessor {
    deadline: Deadline,
    poll_interval: Duration,
}

impl PollingProcessor {
    pub fn new(deadline: Deadline) -> Self {
        Self {
            deadline,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Drive the channel to completion.
    ///
    /// The exit code comes from the channel's terminal status. On timeout
    /// the channel is closed and the error carries everything read so far.
    pub async fn process(
        &self,
        channel: &mut dyn PollableChannel,
        mut pipeline: OutputPipeline,
    ) -> Result<CommandResult, ExecError> {
        let mut iterations = 0usize;

        while channel.is_open() {
            let wait = match self.deadline.remaining() {
                Some(left) if left.is_zero() => {
                    tracing::warn!(
                        execution_id = %pipeline.context().execution_id,
                        command = %pipeline.context().command,
                        iterations,
                        "Execution deadline passed while channel still open"
                    );
                    channel.close().await;
                    return Err(ExecError::Timeout {
                        timeout: self.deadline.timeout(),
                        partial: pipeline.partial(),
                    });
                }
                Some(left) => left.min(self.poll_interval),
                None => self.poll_interval,
            };

            iterations += 1;
            if let Err(source) = channel.update(wait).await {
                // whatever is still queued belongs to the partial output
                let drained = drain_ready(channel, &mut pipeline);
                channel.close().await;
                drained?;
                return Err(ExecError::Transport {
                    source,
                    partial: pipeline.partial(),
                });
            }

            if let Err(err) = drain_ready(channel, &mut pipeline) {
                channel.close().await;
                return Err(err);
            }
        }

        // data that arrived together with the close
        drain_ready(channel, &mut pipeline)?;

        let status = channel.status();
        tracing::debug!(
            execution_id = %pipeline.context().execution_id,
            iterations,
            ?status,
            "Channel closed"
        );

        let exit_code = match status {
            Some(ChannelStatus::Exited(code)) => code,
            Some(ChannelStatus::Failed(message)) => {
                return Err(ExecError::Transport {
                    source: TransportError::Status(message),
                    partial: pipeline.partial(),
                })
            }
            None => {
                return Err(ExecError::Transport {
                    source: TransportError::MissingStatus,
                    partial: pipeline.partial(),
                })
            }
        };

        let (stdout, stderr) = pipeline.finish()?;
        Ok(CommandResult::new(exit_code, stdout, stderr))
    }
}

fn drain_ready(
    channel: &mut dyn PollableChannel,
    pipeline: &mut OutputPipeline,
) -> Result<(), ExecError> {
    for source in StreamSource::ALL {
        if channel.peek(source) {
            if let Some(chunk) = channel.read(source) {
                pipeline.feed(source, chunk)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::callback::{OutputCallbacks, StreamCallback};
    use crate::execution::decoder::DecodePolicy;
    use crate::execution::sink::ExecutionContext;
    use crate::transport::reader::ReaderChannel;
    use crate::transport::scripted::{ScriptedChannel, Tick};
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    fn recorder() -> (StreamCallback, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = log.clone();
        (
            StreamCallback::new(move |chunk| inner.lock().unwrap().push(chunk.to_string())),
            log,
        )
    }

    struct ResetReader;

    impl AsyncRead for ResetReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    fn pipeline(callbacks: OutputCallbacks) -> OutputPipeline {
        OutputPipeline::new(
            DecodePolicy::Replace,
            ExecutionContext::new("poll-test"),
            callbacks,
        )
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let processor =
            PollingProcessor::new(Deadline::unbounded()).with_poll_interval(Duration::ZERO);
        assert_eq!(processor.poll_interval, MIN_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn test_reads_until_closed() {
        let (on_stdout, out_log) = recorder();
        let (on_stderr, err_log) = recorder();
        let mut channel = ScriptedChannel::new(
            vec![
                Tick::stdout("line1\n"),
                Tick::idle(),
                Tick::both("line2\n", "warn\n"),
            ],
            ChannelStatus::Exited(0),
        );

        let result = PollingProcessor::new(Deadline::unbounded())
            .process(
                &mut channel,
                pipeline(OutputCallbacks::new(Some(on_stdout), Some(on_stderr))),
            )
            .await
            .unwrap();

        assert_eq!(result, CommandResult::new(0, "line1\nline2\n", "warn\n"));
        assert_eq!(*out_log.lock().unwrap(), vec!["line1\n", "line2\n"]);
        assert_eq!(*err_log.lock().unwrap(), vec!["warn\n"]);
    }

    #[tokio::test]
    async fn test_exit_code_from_terminal_status() {
        let mut channel =
            ScriptedChannel::new(vec![Tick::stderr("boom\n")], ChannelStatus::Exited(2));

        let result = PollingProcessor::new(Deadline::unbounded())
            .process(&mut channel, pipeline(OutputCallbacks::none()))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 2);
        assert_eq!(result.stderr, "boom\n");
    }

    #[tokio::test]
    async fn test_failed_status_is_transport_error() {
        let mut channel = ScriptedChannel::new(
            vec![Tick::stdout("partial")],
            ChannelStatus::Failed("stream reset".into()),
        );

        let err = PollingProcessor::new(Deadline::unbounded())
            .process(&mut channel, pipeline(OutputCallbacks::none()))
            .await
            .unwrap_err();

        match err {
            ExecError::Transport { source, partial } => {
                assert_eq!(source, TransportError::Status("stream reset".into()));
                assert_eq!(partial.stdout, "partial");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_alternating_streams_are_not_starved() {
        let (on_stdout, out_log) = recorder();
        let (on_stderr, err_log) = recorder();
        let ticks = (0..1000).map(|i| {
            if i % 2 == 0 {
                Tick::stdout(format!("o{i}\n"))
            } else {
                Tick::stderr(format!("e{i}\n"))
            }
        });
        let mut channel = ScriptedChannel::new(ticks, ChannelStatus::Exited(0));

        let result = PollingProcessor::new(Deadline::unbounded())
            .process(
                &mut channel,
                pipeline(OutputCallbacks::new(Some(on_stdout), Some(on_stderr))),
            )
            .await
            .unwrap();

        let expected_out: String = (0..1000).step_by(2).map(|i| format!("o{i}\n")).collect();
        let expected_err: String = (1..1000).step_by(2).map(|i| format!("e{i}\n")).collect();
        assert_eq!(result.stdout, expected_out);
        assert_eq!(result.stderr, expected_err);
        assert_eq!(out_log.lock().unwrap().len(), 500);
        assert_eq!(err_log.lock().unwrap().len(), 500);
    }

    #[tokio::test]
    async fn test_verbose_stdout_does_not_delay_stderr() {
        let (on_stderr, err_log) = recorder();
        let ticks = (0..200).map(|i| {
            if i == 3 {
                Tick::both("noise\n", "rare\n")
            } else {
                Tick::stdout("noise\n")
            }
        });
        let mut channel = ScriptedChannel::new(ticks, ChannelStatus::Exited(0));
        let stats = channel.stats();

        let result = PollingProcessor::new(Deadline::unbounded())
            .process(
                &mut channel,
                pipeline(OutputCallbacks::new(None, Some(on_stderr))),
            )
            .await
            .unwrap();

        assert_eq!(result.stderr, "rare\n");
        assert_eq!(result.stdout.len(), 200 * "noise\n".len());
        assert_eq!(*err_log.lock().unwrap(), vec!["rare\n"]);
        assert_eq!(stats.updates(), 200);
        assert_eq!(stats.reads(), 201);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_closes_channel_and_keeps_partial_output() {
        let (on_stdout, log) = recorder();
        let mut channel = ScriptedChannel::new(
            vec![Tick::stdout("A\n"), Tick::stderr("E\n")],
            ChannelStatus::Exited(0),
        )
        .stall_after_script();
        let stats = channel.stats();

        let err = PollingProcessor::new(Deadline::after(Some(Duration::from_millis(250))))
            .with_poll_interval(Duration::from_millis(50))
            .process(
                &mut channel,
                pipeline(OutputCallbacks::new(Some(on_stdout), None)),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        let partial = err.partial_output().unwrap();
        assert_eq!(partial.stdout, "A\n");
        assert_eq!(partial.stderr, "E\n");
        assert_eq!(*log.lock().unwrap(), vec!["A\n"]);
        assert!(stats.was_closed());
    }

    #[tokio::test]
    async fn test_output_before_read_failure_is_kept() {
        let (on_stdout, log) = recorder();
        let mut channel = ReaderChannel::spawn(
            Some(&b"abc"[..]),
            Some(ResetReader),
            async { ChannelStatus::Exited(0) },
        );

        let err = PollingProcessor::new(Deadline::unbounded())
            .with_poll_interval(Duration::from_millis(20))
            .process(
                &mut channel,
                pipeline(OutputCallbacks::new(Some(on_stdout), None)),
            )
            .await
            .unwrap_err();

        match err {
            ExecError::Transport { source, partial } => {
                assert!(matches!(
                    source,
                    TransportError::Io {
                        stream: StreamSource::Stderr,
                        ..
                    }
                ));
                assert_eq!(partial.stdout, "abc");
            }
            other => panic!("expected transport error, got {other:?}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["abc"]);
    }

    #[tokio::test]
    async fn test_split_character_across_ticks() {
        let (on_stdout, log) = recorder();
        let smile = "😀".as_bytes();
        let mut channel = ScriptedChannel::new(
            vec![
                Tick::stdout(smile[..2].to_vec()),
                Tick::stdout(smile[2..].to_vec()),
            ],
            ChannelStatus::Exited(0),
        );

        let result = PollingProcessor::new(Deadline::unbounded())
            .process(
                &mut channel,
                pipeline(OutputCallbacks::new(Some(on_stdout), None)),
            )
            .await
            .unwrap();

        assert_eq!(result.stdout, "😀");
        assert_eq!(*log.lock().unwrap(), vec!["😀"]);
    }
}
