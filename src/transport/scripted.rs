//! Deterministic transports for tests and dry runs
//!
//! [`ScriptedChannel`] replays a fixed sequence of ticks through the
//! [`PollableChannel`] protocol; [`pair_stream`] does the same for the
//! multiplexed protocol.

use super::{ChannelStatus, MultiplexedStream, OutputPair, PollableChannel, TransportError};
use crate::execution::types::{RawChunk, StreamSource};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Data that becomes available during one `update` call
#[derive(Debug, Clone, Default)]
pub struct Tick {
    pub stdout: Option<RawChunk>,
    pub stderr: Option<RawChunk>,
}

impl Tick {
    pub fn stdout(chunk: impl Into<RawChunk>) -> Self {
        Self {
            stdout: Some(chunk.into()),
            stderr: None,
        }
    }

    pub fn stderr(chunk: impl Into<RawChunk>) -> Self {
        Self {
            stdout: None,
            stderr: Some(chunk.into()),
        }
    }

    pub fn both(stdout: impl Into<RawChunk>, stderr: impl Into<RawChunk>) -> Self {
        Self {
            stdout: Some(stdout.into()),
            stderr: Some(stderr.into()),
        }
    }

    pub fn idle() -> Self {
        Self::default()
    }
}

/// Observes a [`ScriptedChannel`] after it was handed to a processor
#[derive(Debug, Clone, Default)]
pub struct ScriptedChannelStats {
    updates: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl ScriptedChannelStats {
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct ScriptedChannel {
    ticks: VecDeque<Tick>,
    queued: [VecDeque<RawChunk>; 2],
    final_status: ChannelStatus,
    stall: bool,
    closed: bool,
    stats: ScriptedChannelStats,
}

impl ScriptedChannel {
    pub fn new(ticks: impl IntoIterator<Item = Tick>, final_status: ChannelStatus) -> Self {
        Self {
            ticks: ticks.into_iter().collect(),
            queued: [VecDeque::new(), VecDeque::new()],
            final_status,
            stall: false,
            closed: false,
            stats: ScriptedChannelStats::default(),
        }
    }

    /// Keep the channel open with no new data once the ticks run out
    pub fn stall_after_script(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn stats(&self) -> ScriptedChannelStats {
        self.stats.clone()
    }
}

#[async_trait]
impl PollableChannel for ScriptedChannel {
    fn is_open(&self) -> bool {
        !self.closed && (self.stall || !self.ticks.is_empty())
    }

    async fn update(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.stats.updates.fetch_add(1, Ordering::SeqCst);
        match self.ticks.pop_front() {
            Some(tick) => {
                if let Some(chunk) = tick.stdout {
                    self.queued[StreamSource::Stdout.index()].push_back(chunk);
                }
                if let Some(chunk) = tick.stderr {
                    self.queued[StreamSource::Stderr.index()].push_back(chunk);
                }
            }
            None if self.stall => tokio::time::sleep(timeout).await,
            None => {}
        }
        Ok(())
    }

    fn peek(&self, source: StreamSource) -> bool {
        !self.queued[source.index()].is_empty()
    }

    fn read(&mut self, source: StreamSource) -> Option<RawChunk> {
        let queue = &mut self.queued[source.index()];
        let chunk = match queue.len() {
            0 => return None,
            1 => queue.pop_front()?,
            _ => join(queue.drain(..)),
        };
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        Some(chunk)
    }

    fn status(&self) -> Option<ChannelStatus> {
        if self.is_open() || self.stall {
            None
        } else {
            Some(self.final_status.clone())
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.stats.closed.store(true, Ordering::SeqCst);
    }
}

/// Text stays text unless a byte chunk is mixed in
fn join(chunks: impl Iterator<Item = RawChunk>) -> RawChunk {
    let chunks: Vec<RawChunk> = chunks.collect();
    if chunks.iter().all(|chunk| matches!(chunk, RawChunk::Text(_))) {
        let mut text = String::new();
        for chunk in &chunks {
            if let RawChunk::Text(part) = chunk {
                text.push_str(part);
            }
        }
        return RawChunk::Text(text);
    }

    let mut joined = BytesMut::new();
    for chunk in chunks {
        match chunk {
            RawChunk::Bytes(bytes) => joined.extend_from_slice(&bytes),
            RawChunk::Text(text) => joined.extend_from_slice(text.as_bytes()),
        }
    }
    RawChunk::Bytes(joined.freeze())
}

/// A multiplexed stream that yields `pairs` and then ends
pub fn pair_stream(pairs: Vec<OutputPair>) -> MultiplexedStream {
    Box::pin(stream::iter(pairs.into_iter().map(Ok)))
}

/// A multiplexed stream that yields `pairs` and then never produces again
pub fn stalled_pair_stream(pairs: Vec<OutputPair>) -> MultiplexedStream {
    Box::pin(stream::iter(pairs.into_iter().map(Ok)).chain(stream::pending()))
}

/// A multiplexed stream that yields `pairs` and then fails
pub fn failing_pair_stream(pairs: Vec<OutputPair>, message: &str) -> MultiplexedStream {
    let failure = TransportError::Backend(message.to_string());
    Box::pin(
        stream::iter(pairs.into_iter().map(Ok)).chain(stream::once(async move { Err(failure) })),
    )
}
