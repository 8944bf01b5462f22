//! Document sharding and span mapping.
//!
//! A document is cut into windows of `chunk_size` UTF-16 code units with a
//! stride of `chunk_size - overlap`. Windows overlap so that text straddling
//! a boundary is seen whole by at least one shard; the orchestrator removes
//! the resulting duplicates after mapping spans back to the document.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DocumentShard, OffsetMode, Span, Utf16Text};
use crate::evidence::hashing::hash_parts;

/// Parameters controlling how a document is sharded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOptions {
    pub document_id: String,
    pub chunk_size: usize,
    pub overlap: usize,
    #[serde(default)]
    pub offset_mode: OffsetMode,
}

impl ChunkOptions {
    pub fn new(document_id: impl Into<String>, chunk_size: usize, overlap: usize) -> Self {
        Self {
            document_id: document_id.into(),
            chunk_size,
            overlap,
            offset_mode: OffsetMode::Utf16CodeUnit,
        }
    }

    /// Reject parameters that could not produce a forward-moving stride
    pub fn validate(&self) -> Result<(), ShardingError> {
        if self.chunk_size == 0 {
            return Err(ShardingError::InvalidChunkSize);
        }
        if self.overlap >= self.chunk_size {
            return Err(ShardingError::InvalidOverlap {
                overlap: self.overlap,
                chunk_size: self.chunk_size,
            });
        }
        Ok(())
    }
}

/// Sharding and span-mapping errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardingError {
    #[error("Invalid chunk size: must be greater than zero")]
    InvalidChunkSize,

    #[error("Invalid overlap: {overlap} must be smaller than chunk size {chunk_size}")]
    InvalidOverlap { overlap: usize, chunk_size: usize },

    #[error("Invalid span: start {start} > end {end}")]
    InvalidSpan { start: i64, end: i64 },

    #[error("Out of range: [{start}, {end}) outside shard of length {shard_len}")]
    OutOfRange {
        start: i64,
        end: i64,
        shard_len: usize,
    },
}

/// Split `text` into overlapping shards.
///
/// Shards cover `[0, len)` without gaps; the last one is clipped to the
/// document length. An empty document yields exactly one empty shard.
pub fn chunk_document(
    text: &str,
    program_hash: &str,
    options: &ChunkOptions,
) -> Result<Vec<DocumentShard>, ShardingError> {
    options.validate()?;

    let document = Utf16Text::new(text);
    let total = document.len();
    let stride = options.chunk_size - options.overlap;

    let mut shards = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + options.chunk_size).min(total);
        let shard_text = document.slice(start, end).unwrap_or_default();
        shards.push(DocumentShard {
            shard_id: shard_id(program_hash, options, start, end, &shard_text),
            start,
            end,
            text: shard_text,
        });

        if end >= total {
            break;
        }
        start += stride;
    }

    Ok(shards)
}

/// Content address of a shard over every input that produced it
pub fn shard_id(
    program_hash: &str,
    options: &ChunkOptions,
    start: usize,
    end: usize,
    text: &str,
) -> String {
    hash_parts(&[
        program_hash,
        &options.document_id,
        &options.chunk_size.to_string(),
        &options.overlap.to_string(),
        options.offset_mode.as_str(),
        &start.to_string(),
        &end.to_string(),
        text,
    ])
}

/// Translate a shard-local span into a document-global span.
///
/// Bounds are signed because they usually come straight from model output.
pub fn map_shard_span_to_document(
    shard: &DocumentShard,
    local_start: i64,
    local_end: i64,
) -> Result<Span, ShardingError> {
    if local_start > local_end {
        return Err(ShardingError::InvalidSpan {
            start: local_start,
            end: local_end,
        });
    }
    let shard_len = shard.len();
    if local_start < 0 || local_end < 0 || local_end as u64 > shard_len as u64 {
        return Err(ShardingError::OutOfRange {
            start: local_start,
            end: local_end,
            shard_len,
        });
    }

    Ok(Span::new(
        shard.start + local_start as usize,
        shard.start + local_end as usize,
    ))
}
