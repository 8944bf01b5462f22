//! Domain types for the extraction engine.
//!
//! This module contains the core data structures:
//! - Span: UTF-16 offset intervals over document text
//! - Extraction: a class + verbatim quote + span
//! - Program: the normalized extraction program
//! - DocumentShard: one window of the document

pub mod extraction;
pub mod program;
pub mod shard;
pub mod span;

// Re-export commonly used types
pub use extraction::{Extraction, Grounding};
pub use program::{Program, ProgramSpec};
pub use shard::DocumentShard;
pub use span::{utf16_len, OffsetMode, Span, Utf16Text};
