//! JSONL persistence of evidence bundles.
//!
//! One canonical-JSON bundle per line, each newline-terminated. Decoding
//! accepts `\n` or `\r\n` line endings, skips empty lines, rejects lines
//! holding only whitespace, and accepts a final record without a trailing
//! newline. The incremental decoder buffers raw bytes, so chunks may split
//! lines and multi-byte characters anywhere.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::canonical::{to_canonical_json, CanonicalizationError};
use super::types::EvidenceBundle;

const READ_CHUNK: usize = 8 * 1024;

/// JSONL encode/decode errors
#[derive(Debug, Error)]
pub enum JsonlError {
    #[error("Malformed JSONL record at line {line}: {detail}")]
    Malformed { line: usize, detail: String },

    #[error("Blank JSONL record at line {line}")]
    BlankLine { line: usize },

    #[error("Invalid UTF-8 at line {line}")]
    InvalidUtf8 { line: usize },

    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),

    #[error("JSONL read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode records as canonical JSONL
pub fn encode_jsonl<T: Serialize>(records: &[T]) -> Result<String, JsonlError> {
    let mut out = String::new();
    for record in records {
        out.push_str(&to_canonical_json(record)?);
        out.push('\n');
    }
    Ok(out)
}

pub fn encode_evidence_bundles_to_jsonl(bundles: &[EvidenceBundle]) -> Result<String, JsonlError> {
    encode_jsonl(bundles)
}

pub fn decode_jsonl_to_evidence_bundles(text: &str) -> Result<Vec<EvidenceBundle>, JsonlError> {
    let mut decoder = JsonlDecoder::new();
    let mut bundles = decoder.push_bytes(text.as_bytes())?;
    bundles.extend(decoder.finish()?);
    Ok(bundles)
}

/// Decode bundles from any async byte stream
pub async fn decode_jsonl_reader<R>(mut reader: R) -> Result<Vec<EvidenceBundle>, JsonlError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = JsonlDecoder::new();
    let mut bundles = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        bundles.extend(decoder.push_bytes(&chunk[..n])?);
    }

    bundles.extend(decoder.finish()?);
    Ok(bundles)
}

/// Incremental JSONL decoder with carry-over buffering
#[derive(Debug)]
pub struct JsonlDecoder<T = EvidenceBundle> {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a newline
    scanned: usize,
    /// Lines consumed so far
    line: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T> Default for JsonlDecoder<T> {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            line: 0,
            _record: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> JsonlDecoder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every record completed by it
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Result<Vec<T>, JsonlError> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();

        let mut consumed = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buffer[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + offset;
            self.line += 1;
            if let Some(record) = parse_line(&self.buffer[consumed..end], self.line)? {
                records.push(record);
            }
            consumed = end + 1;
            search_from = consumed;
        }

        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();
        Ok(records)
    }

    pub fn push_str(&mut self, chunk: &str) -> Result<Vec<T>, JsonlError> {
        self.push_bytes(chunk.as_bytes())
    }

    /// Flush an unterminated final record
    pub fn finish(mut self) -> Result<Option<T>, JsonlError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        self.line += 1;
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest, self.line)
    }
}

fn parse_line<T: DeserializeOwned>(raw: &[u8], line: usize) -> Result<Option<T>, JsonlError> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.is_empty() {
        return Ok(None);
    }

    let text = std::str::from_utf8(raw).map_err(|_| JsonlError::InvalidUtf8 { line })?;
    if text.trim().is_empty() {
        return Err(JsonlError::BlankLine { line });
    }

    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| JsonlError::Malformed {
            line,
            detail: e.to_string(),
        })
}
