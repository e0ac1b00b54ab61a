//! Output-streaming execution core
//!
//! A command's output flows leaf-first through:
//!
//! - [`ChunkDecoder`]: raw chunks to text, carrying split multi-byte
//!   sequences over to the next chunk. One decoder per stream.
//! - [`StreamSink`]: append-only accumulation plus isolated callback
//!   delivery.
//! - [`MultiplexedProcessor`] / [`PollingProcessor`]: drive the transport a
//!   backend handed out and feed both streams through decoder and sink.
//! - [`ExecutionCoordinator`]: picks buffered or streaming mode and produces
//!   the final [`CommandResult`].

pub mod callback;
pub mod coordinator;
pub mod deadline;
pub mod decoder;
pub mod multiplexed;
pub mod pipeline;
pub mod polling;
pub mod sink;
pub mod types;


pub use callback::{OutputCallbacks, StreamCallback};
pub use coordinator::ExecutionCoordinator;
pub use deadline::Deadline;
pub use decoder::{ChunkDecoder, DecodeError, DecodePolicy};
pub use multiplexed::MultiplexedProcessor;
pub use pipeline::OutputPipeline;
pub use polling::{PollingProcessor, DEFAULT_POLL_INTERVAL};
pub use sink::{ExecutionContext, StreamSink};
pub use types::{CommandResult, CommandSpec, ExecutionMode, RawChunk, StreamSource};
