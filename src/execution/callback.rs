//! User callbacks for real-time output delivery

use std::fmt;
use std::sync::Arc;

type CallbackFn = dyn Fn(&str) -> anyhow::Result<()> + Send + Sync;

/// Receives decoded output chunks of one stream as they arrive.
///
/// Callbacks run on the worker task that drains the transport, not on the
/// caller's task. They must be safe to call from another thread and are
/// responsible for their own synchronization. A callback is invoked once per
/// non-empty decoded chunk, in arrival order for its stream; callers must not
/// rely on any particular chunking.
///
/// Cloning is cheap and yields a handle to the same function.
#[derive(Clone)]
pub struct StreamCallback {
    inner: Arc<CallbackFn>,
}

impl StreamCallback {
    /// Wrap an infallible closure
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(move |chunk: &str| {
                f(chunk);
                Ok(())
            }),
        }
    }

    /// Wrap a closure that may report failure.
    ///
    /// Failures are logged and otherwise ignored; they never affect the
    /// accumulated output or the command result.
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    pub(crate) fn call(&self, chunk: &str) -> anyhow::Result<()> {
        (self.inner)(chunk)
    }
}

impl fmt::Debug for StreamCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCallback").finish_non_exhaustive()
    }
}

/// Callbacks registered for one invocation
#[derive(Debug, Clone, Default)]
pub struct OutputCallbacks {
    pub on_stdout: Option<StreamCallback>,
    pub on_stderr: Option<StreamCallback>,
}

impl OutputCallbacks {
    pub fn new(on_stdout: Option<StreamCallback>, on_stderr: Option<StreamCallback>) -> Self {
        Self {
            on_stdout,
            on_stderr,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.on_stdout.is_some() || self.on_stderr.is_some()
    }
}
