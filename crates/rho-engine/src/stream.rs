//! Streaming output types and utilities

use std::pin::Pin;
use tokio_stream::Stream;

use crate::error::Result;
use crate::types::{GenerationMetrics, LoadProgress, OutputChunk};

/// A lazy, cancellable sequence of output chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<OutputChunk>> + Send>>;

/// A sequence of preload progress reports
pub type ProgressStream = Pin<Box<dyn Stream<Item = Result<LoadProgress>> + Send>>;

/// Accumulates streamed chunks into the full raw output
#[derive(Debug, Default)]
pub struct OutputAccumulator {
    text: String,
    metrics: Option<GenerationMetrics>,
    chunk_count: usize,
}

impl OutputAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one chunk into the accumulated output
    pub fn process_chunk(&mut self, chunk: &OutputChunk) {
        self.chunk_count += 1;
        match chunk {
            OutputChunk::Text { delta } => self.text.push_str(delta),
            OutputChunk::Metrics { metrics } => self.metrics = Some(metrics.clone()),
        }
    }

    /// Raw text produced so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Metrics, if the backend has reported them
    pub fn metrics(&self) -> Option<&GenerationMetrics> {
        self.metrics.as_ref()
    }

    /// Number of chunks processed
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Consume the accumulator, returning the raw text and metrics
    pub fn finish(self) -> (String, Option<GenerationMetrics>) {
        (self.text, self.metrics)
    }
}
