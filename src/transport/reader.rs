//! A [`PollableChannel`] fed by async byte readers
//!
//! Pump tasks read stdout and stderr as raw chunks and forward them over an
//! unbounded channel together with the terminal status. `update` moves
//! whatever arrived into per-stream queues for `peek`/`read`.

use super::{ChannelStatus, PollableChannel, TransportError};
use crate::execution::types::{RawChunk, StreamSource};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::Future;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const READ_BUFFER_SIZE: usize = 8192;

enum ChannelEvent {
    Data(StreamSource, Bytes),
    Eof(StreamSource),
    Failed(StreamSource, String),
    Status(ChannelStatus),
}

pub struct ReaderChannel {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    queued: [VecDeque<Bytes>; 2],
    streams_open: [bool; 2],
    status: Option<ChannelStatus>,
    failure: Option<TransportError>,
    disconnected: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl ReaderChannel {
    /// Start pumping the given readers.
    ///
    /// A missing reader counts as an already closed stream. `status` must
    /// resolve once the remote command terminated.
    pub fn spawn<O, E, S>(stdout: Option<O>, stderr: Option<E>, status: S) -> Self
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
        S: Future<Output = ChannelStatus> + Send + 'static,
    {
        let (tx, events) = mpsc::unbounded_channel();
        let mut tasks = Vec::with_capacity(3);
        let streams_open = [stdout.is_some(), stderr.is_some()];

        if let Some(reader) = stdout {
            tasks.push(tokio::spawn(pump(reader, StreamSource::Stdout, tx.clone())));
        }
        if let Some(reader) = stderr {
            tasks.push(tokio::spawn(pump(reader, StreamSource::Stderr, tx.clone())));
        }
        tasks.push(tokio::spawn(async move {
            let status = status.await;
            let _ = tx.send(ChannelEvent::Status(status));
        }));

        Self {
            events,
            queued: [VecDeque::new(), VecDeque::new()],
            streams_open,
            status: None,
            failure: None,
            disconnected: false,
            tasks,
        }
    }

    fn apply(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Data(source, bytes) => {
                self.queued[source.index()].push_back(bytes);
            }
            ChannelEvent::Eof(source) => {
                self.streams_open[source.index()] = false;
            }
            ChannelEvent::Failed(source, message) => {
                self.streams_open[source.index()] = false;
                // reported by the next update, after queued data was read
                if self.failure.is_none() {
                    self.failure = Some(TransportError::Io {
                        stream: source,
                        message,
                    });
                }
            }
            ChannelEvent::Status(status) => {
                tracing::trace!(?status, "Channel reported terminal status");
                self.status = Some(status);
            }
        }
    }
}

async fn pump<R>(mut reader: R, source: StreamSource, tx: mpsc::UnboundedSender<ChannelEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(ChannelEvent::Eof(source));
                return;
            }
            Ok(_) => {
                if tx
                    .send(ChannelEvent::Data(source, buf.split().freeze()))
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(ChannelEvent::Failed(source, e.to_string()));
                return;
            }
        }
    }
}

#[async_trait]
impl PollableChannel for ReaderChannel {
    fn is_open(&self) -> bool {
        if self.failure.is_some() {
            return true;
        }
        if self.disconnected {
            return false;
        }
        self.status.is_none() || self.streams_open.iter().any(|open| *open)
    }

    async fn update(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }
        if !self.is_open() {
            return Ok(());
        }

        match tokio::time::timeout(timeout, self.events.recv()).await {
            Err(_) => return Ok(()),
            Ok(None) => {
                self.disconnected = true;
                return Ok(());
            }
            Ok(Some(event)) => self.apply(event),
        }

        loop {
            match self.events.try_recv() {
                Ok(event) => self.apply(event),
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    return Ok(());
                }
            }
        }
    }

    fn peek(&self, source: StreamSource) -> bool {
        !self.queued[source.index()].is_empty()
    }

    fn read(&mut self, source: StreamSource) -> Option<RawChunk> {
        let queue = &mut self.queued[source.index()];
        match queue.len() {
            0 => None,
            1 => queue.pop_front().map(RawChunk::Bytes),
            _ => {
                let mut joined = BytesMut::new();
                for part in queue.drain(..) {
                    joined.extend_from_slice(&part);
                }
                Some(RawChunk::Bytes(joined.freeze()))
            }
        }
    }

    fn status(&self) -> Option<ChannelStatus> {
        self.status.clone()
    }

    async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.disconnected = true;
        self.failure = None;
        self.streams_open = [false, false];
    }
}

impl Drop for ReaderChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn drain(channel: &mut ReaderChannel) -> (Vec<u8>, Vec<u8>) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        while channel.is_open() {
            channel.update(Duration::from_millis(50)).await.unwrap();
            for source in StreamSource::ALL {
                if let Some(RawChunk::Bytes(bytes)) = channel.read(source) {
                    match source {
                        StreamSource::Stdout => out.extend_from_slice(&bytes),
                        StreamSource::Stderr => err.extend_from_slice(&bytes),
                    }
                }
            }
        }
        (out, err)
    }

    #[tokio::test]
    async fn test_reads_both_streams_and_status() {
        let mut channel = ReaderChannel::spawn(
            Some(&b"hello\n"[..]),
            Some(&b"oops\n"[..]),
            async { ChannelStatus::Exited(3) },
        );

        let (out, err) = drain(&mut channel).await;

        assert_eq!(out, b"hello\n");
        assert_eq!(err, b"oops\n");
        assert_eq!(channel.status(), Some(ChannelStatus::Exited(3)));
    }

    #[tokio::test]
    async fn test_stays_open_until_writer_finishes() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut channel = ReaderChannel::spawn(
            Some(reader),
            None::<&[u8]>,
            async { ChannelStatus::Exited(0) },
        );

        writer.write_all(b"part1").await.unwrap();
        for _ in 0..10 {
            if channel.peek(StreamSource::Stdout) {
                break;
            }
            channel.update(Duration::from_millis(200)).await.unwrap();
        }
        assert!(channel.is_open());
        assert!(channel.peek(StreamSource::Stdout));
        assert_eq!(
            channel.read(StreamSource::Stdout),
            Some(RawChunk::Bytes(Bytes::from_static(b"part1")))
        );

        drop(writer);
        let (out, _) = drain(&mut channel).await;
        assert!(out.is_empty());
        assert!(!channel.is_open());
    }

    struct ResetReader;

    impl AsyncRead for ResetReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }
    }

    #[tokio::test]
    async fn test_read_failure_reported_after_queued_data() {
        let mut channel = ReaderChannel::spawn(
            Some(&b"abc"[..]),
            Some(ResetReader),
            async { ChannelStatus::Exited(0) },
        );

        let mut failure = None;
        let mut out = Vec::new();
        for _ in 0..20 {
            if let Err(err) = channel.update(Duration::from_millis(50)).await {
                failure = Some(err);
                break;
            }
            if let Some(RawChunk::Bytes(bytes)) = channel.read(StreamSource::Stdout) {
                out.extend_from_slice(&bytes);
            }
        }

        assert_eq!(out, b"abc");
        assert!(matches!(
            failure,
            Some(TransportError::Io {
                stream: StreamSource::Stderr,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_close_abandons_channel() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut channel = ReaderChannel::spawn(
            Some(reader),
            None::<&[u8]>,
            futures::future::pending::<ChannelStatus>(),
        );

        assert!(channel.is_open());
        channel.close().await;
        assert!(!channel.is_open());
        assert_eq!(channel.status(), None);
    }
}
