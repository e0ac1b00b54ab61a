use futures::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Optional point in time after which an execution is abandoned
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    timeout: Option<Duration>,
    at: Option<Instant>,
}

/// The deadline passed before the bounded future completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired;

impl Deadline {
    /// Start counting `timeout` from now; `None` never expires.
    ///
    /// A timeout too large to represent as an instant is treated as
    /// unbounded.
    pub fn after(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            at: timeout.and_then(|t| Instant::now().checked_add(t)),
        }
    }

    pub fn unbounded() -> Self {
        Self::after(None)
    }

    /// Configured timeout, zero when unbounded
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or_default()
    }

    /// Time left, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    /// Await `future`, giving up once the deadline passes
    pub async fn bound<F: Future>(&self, future: F) -> Result<F::Output, Expired> {
        match self.at {
            Some(at) => tokio::time::timeout_at(at, future)
                .await
                .map_err(|_| Expired),
            None => Ok(future.await),
        }
    }
}
