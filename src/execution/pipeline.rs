//! Decoder + sink pair shared by both processor variants

use super::callback::OutputCallbacks;
use super::decoder::{ChunkDecoder, DecodePolicy};
use super::sink::{ExecutionContext, StreamSink};
use super::types::{RawChunk, StreamSource};
use crate::error::{ExecError, PartialOutput};

/// Routes raw chunks through the stream's own decoder into the sink
#[derive(Debug)]
pub struct OutputPipeline {
    decoders: [ChunkDecoder; 2],
    sink: StreamSink,
}

impl OutputPipeline {
    pub fn new(policy: DecodePolicy, context: ExecutionContext, callbacks: OutputCallbacks) -> Self {
        Self {
            decoders: [ChunkDecoder::new(policy), ChunkDecoder::new(policy)],
            sink: StreamSink::new(context, callbacks),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        self.sink.context()
    }

    /// Decode one chunk and hand the text to the sink
    pub fn feed(&mut self, source: StreamSource, chunk: RawChunk) -> Result<(), ExecError> {
        tracing::trace!(
            execution_id = %self.sink.context().execution_id,
            stream = %source,
            bytes = chunk.len(),
            "Received output chunk"
        );
        match self.decoders[source.index()].push(chunk) {
            Ok(text) => {
                self.sink.consume(source, &text);
                Ok(())
            }
            Err(err) => Err(ExecError::Decode {
                stream: source,
                source: err,
                partial: self.partial(),
            }),
        }
    }

    /// Output accumulated so far
    pub fn partial(&self) -> PartialOutput {
        PartialOutput::new(
            self.sink.output(StreamSource::Stdout),
            self.sink.output(StreamSource::Stderr),
        )
    }

    pub fn callback_failures(&self, source: StreamSource) -> usize {
        self.sink.callback_failures(source)
    }

    /// Flush both decoders and return `(stdout, stderr)`
    pub fn finish(mut self) -> Result<(String, String), ExecError> {
        for source in StreamSource::ALL {
            match self.decoders[source.index()].finish() {
                Ok(text) => self.sink.consume(source, &text),
                Err(err) => {
                    return Err(ExecError::Decode {
                        stream: source,
                        source: err,
                        partial: self.partial(),
                    })
                }
            }
        }
        Ok(self.sink.into_output())
    }
}
