//! The quote/grounding invariant.
//!
//! Every extraction surfaced to a caller must satisfy
//! `document[char_start..char_end] == quote`, compared over UTF-16 code
//! units. Nothing else about an extraction is trusted.
//!
//! # Design Decisions
//!
//! - **Exact match only**: no whitespace or case normalization
//! - **Honest failure**: a mismatch reports both the claimed and the actual text
//! - **Hint, not repair**: the first place the claimed quote does occur is
//!   reported for diagnostics, never substituted

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::{Extraction, Utf16Text};

/// Stable error codes for invariant failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteInvariantCode {
    #[serde(rename = "INVALID_SPAN")]
    InvalidSpan,
    #[serde(rename = "SPAN_OUT_OF_RANGE")]
    SpanOutOfRange,
    #[serde(rename = "QUOTE_MISMATCH")]
    QuoteMismatch,
}

impl QuoteInvariantCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteInvariantCode::InvalidSpan => "INVALID_SPAN",
            QuoteInvariantCode::SpanOutOfRange => "SPAN_OUT_OF_RANGE",
            QuoteInvariantCode::QuoteMismatch => "QUOTE_MISMATCH",
        }
    }
}

/// Grounding invariant violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteInvariantError {
    #[error("INVALID_SPAN: {detail}")]
    InvalidSpan { detail: String },

    #[error("SPAN_OUT_OF_RANGE: [{start}, {end}) outside document of length {document_len}")]
    SpanOutOfRange {
        start: i64,
        end: i64,
        document_len: usize,
    },

    #[error("QUOTE_MISMATCH at [{start}, {end}): claimed {claimed:?}, actual {actual:?}")]
    QuoteMismatch {
        start: usize,
        end: usize,
        claimed: String,
        actual: String,
        /// First offset where the claimed quote does appear, if anywhere
        found_at: Option<usize>,
    },
}

impl QuoteInvariantError {
    pub fn code(&self) -> QuoteInvariantCode {
        match self {
            QuoteInvariantError::InvalidSpan { .. } => QuoteInvariantCode::InvalidSpan,
            QuoteInvariantError::SpanOutOfRange { .. } => QuoteInvariantCode::SpanOutOfRange,
            QuoteInvariantError::QuoteMismatch { .. } => QuoteInvariantCode::QuoteMismatch,
        }
    }
}

/// Check an extraction against the document it claims to quote
pub fn assert_quote_invariant(
    document: &Utf16Text,
    extraction: &Extraction,
) -> Result<(), QuoteInvariantError> {
    check_quote(
        document,
        extraction.span.char_start as i64,
        extraction.span.char_end as i64,
        &extraction.quote,
    )
}

/// Check raw (possibly model-supplied) bounds against the document
pub fn check_quote(
    document: &Utf16Text,
    start: i64,
    end: i64,
    quote: &str,
) -> Result<(), QuoteInvariantError> {
    if start > end {
        return Err(QuoteInvariantError::InvalidSpan {
            detail: format!("charStart {} > charEnd {}", start, end),
        });
    }
    let document_len = document.len();
    if start < 0 || end as u64 > document_len as u64 {
        return Err(QuoteInvariantError::SpanOutOfRange {
            start,
            end,
            document_len,
        });
    }

    let (start, end) = (start as usize, end as usize);
    if document.matches(start, end, quote) {
        return Ok(());
    }

    Err(QuoteInvariantError::QuoteMismatch {
        start,
        end,
        claimed: quote.to_string(),
        actual: document.slice(start, end).unwrap_or_default(),
        found_at: document.find(quote),
    })
}

/// Interpret a JSON span bound, rejecting anything that is not an integer
pub fn span_bound(value: Option<&Value>, name: &str) -> Result<i64, QuoteInvariantError> {
    let invalid = |what: &str| QuoteInvariantError::InvalidSpan {
        detail: format!("{} is {}", name, what),
    };

    match value {
        None | Some(Value::Null) => Err(invalid("missing")),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if n.as_u64().is_some() {
                Err(invalid("too large"))
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
                    _ => Err(invalid("not an integer")),
                }
            }
        }
        Some(_) => Err(invalid("not an integer")),
    }
}
