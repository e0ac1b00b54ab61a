//! Output accumulation with isolated callback delivery

use super::callback::{OutputCallbacks, StreamCallback};
use super::types::StreamSource;
use std::panic::{self, AssertUnwindSafe};
use uuid::Uuid;

/// Identity of the command whose output a sink collects, used to tag logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub command: String,
}

impl ExecutionContext {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            command: command.into(),
        }
    }
}

#[derive(Debug, Default)]
struct StreamSlot {
    buffer: String,
    callback: Option<StreamCallback>,
    callback_failures: usize,
}

/// Accumulates decoded text per stream and forwards each chunk to the
/// stream's callback.
///
/// The buffers are append-only and owned by the sink. Callbacks receive the
/// chunk, never a view into the buffer.
#[derive(Debug)]
pub struct StreamSink {
    context: ExecutionContext,
    slots: [StreamSlot; 2],
}

impl StreamSink {
    pub fn new(context: ExecutionContext, callbacks: OutputCallbacks) -> Self {
        Self {
            context,
            slots: [
                StreamSlot {
                    callback: callbacks.on_stdout,
                    ..Default::default()
                },
                StreamSlot {
                    callback: callbacks.on_stderr,
                    ..Default::default()
                },
            ],
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Append `text` to the stream's buffer, then hand it to the callback.
    ///
    /// Empty text is ignored. A callback that returns an error or panics is
    /// logged and does not interrupt accumulation.
    pub fn consume(&mut self, source: StreamSource, text: &str) {
        if text.is_empty() {
            return;
        }

        let slot = &mut self.slots[source.index()];
        slot.buffer.push_str(text);

        let Some(callback) = slot.callback.as_ref() else {
            return;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback.call(text)));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{err:#}"),
            Err(payload) => panic_message(payload.as_ref()),
        };

        slot.callback_failures += 1;
        tracing::warn!(
            execution_id = %self.context.execution_id,
            command = %self.context.command,
            stream = %source,
            error = %failure,
            "Output callback failed; continuing to collect output"
        );
    }

    /// Text accumulated so far for one stream
    pub fn output(&self, source: StreamSource) -> &str {
        &self.slots[source.index()].buffer
    }

    pub fn callback_failures(&self, source: StreamSource) -> usize {
        self.slots[source.index()].callback_failures
    }

    /// Consume the sink, returning `(stdout, stderr)`
    pub fn into_output(self) -> (String, String) {
        let [stdout, stderr] = self.slots;
        (stdout.buffer, stderr.buffer)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (StreamCallback, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = log.clone();
        let callback = StreamCallback::new(move |chunk| {
            sink_log.lock().unwrap().push(chunk.to_string());
        });
        (callback, log)
    }

    #[test]
    fn test_accumulates_in_order_and_notifies() {
        let (on_stdout, log) = recorder();
        let mut sink = StreamSink::new(
            ExecutionContext::new("echo"),
            OutputCallbacks::new(Some(on_stdout), None),
        );

        sink.consume(StreamSource::Stdout, "chunk1");
        sink.consume(StreamSource::Stderr, "err1");
        sink.consume(StreamSource::Stdout, "chunk2");

        assert_eq!(sink.output(StreamSource::Stdout), "chunk1chunk2");
        assert_eq!(sink.output(StreamSource::Stderr), "err1");
        assert_eq!(*log.lock().unwrap(), vec!["chunk1", "chunk2"]);
    }

    #[test]
    fn test_empty_chunks_never_reach_callback() {
        let (on_stdout, log) = recorder();
        let mut sink = StreamSink::new(
            ExecutionContext::new("true"),
            OutputCallbacks::new(Some(on_stdout), None),
        );

        sink.consume(StreamSource::Stdout, "");

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(sink.output(StreamSource::Stdout), "");
    }

    #[test]
    fn test_failing_callback_does_not_truncate_output() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let failing = StreamCallback::fallible(move |_| {
            *counter.lock().unwrap() += 1;
            anyhow::bail!("callback error")
        });
        let mut sink = StreamSink::new(
            ExecutionContext::new("cat"),
            OutputCallbacks::new(Some(failing.clone()), Some(failing)),
        );

        sink.consume(StreamSource::Stdout, "data");
        sink.consume(StreamSource::Stdout, " more");
        sink.consume(StreamSource::Stderr, "warn");

        assert_eq!(*calls.lock().unwrap(), 3);
        assert_eq!(sink.callback_failures(StreamSource::Stdout), 2);
        assert_eq!(sink.callback_failures(StreamSource::Stderr), 1);
        assert_eq!(
            sink.into_output(),
            ("data more".to_string(), "warn".to_string())
        );
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let panicking = StreamCallback::new(|_| panic!("boom"));
        let mut sink = StreamSink::new(
            ExecutionContext::new("cat"),
            OutputCallbacks::new(Some(panicking), None),
        );

        sink.consume(StreamSource::Stdout, "a");
        sink.consume(StreamSource::Stdout, "b");

        assert_eq!(sink.callback_failures(StreamSource::Stdout), 2);
        assert_eq!(sink.output(StreamSource::Stdout), "ab");
    }
}
