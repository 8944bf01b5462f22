//! groundwork - Grounded extraction engine
//!
//! Turns free-form, often malformed model output into extractions that are
//! provably verbatim spans of a source document, packaged as auditable
//! evidence bundles.
//!
//! # Architecture
//!
//! A run is deterministic and resumable:
//! - The document is split into content-addressed UTF-16 shards
//! - Each shard goes through a draft pass and at most one repair pass
//! - Every extraction is checked against the document before it counts
//! - Successful shards are checkpointed, so reruns skip finished work
//! - The bundle can be canonicalized and signed with HMAC-SHA-256
//!
//! # Modules
//!
//! - `adapters`: Model providers (command, replay)
//! - `core`: Sharding, prompts, JSON recovery, retry, orchestration
//! - `domain`: Data structures (Span, Extraction, Program, DocumentShard)
//! - `evidence`: Grounding, bundles, canonical JSON, attestation, JSONL
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run an extraction
//! groundwork extract --document report.txt --program program.yaml
//!
//! # Resume it after a partial failure
//! groundwork extract --document report.txt --program program.yaml --run-id <id> --durable
//!
//! # Verify signed bundles
//! groundwork verify --input bundles.jsonl
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod evidence;

// Re-export main types at crate root for convenience
pub use adapters::{Provider, ProviderError, ProviderRequest, ProviderResponse};
pub use crate::core::{EngineSettings, Orchestrator, RunRequest};
pub use domain::{DocumentShard, Extraction, Program, ProgramSpec, Span};
pub use evidence::{EvidenceBundle, VerificationOutcome};
