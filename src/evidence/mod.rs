//! Evidence: grounding, bundles and their integrity.
//!
//! # Design Principles
//!
//! - **Exact grounding**: an extraction counts only if its quote equals the
//!   document slice at its span, compared over UTF-16 code units.
//! - **Diagnostics are output**: a bundle always explains what happened,
//!   including for shards that produced nothing.
//! - **Order-independent integrity**: hashes and signatures are computed over
//!   canonical JSON, so key insertion order never matters.
//! - **Append-only persistence**: bundles are stored as JSONL.

pub mod attestation;
pub mod canonical;
pub mod grounding;
pub mod hashing;
pub mod jsonl;
pub mod types;

pub use attestation::{
    attest_evidence_bundle, attest_evidence_bundle_at, canonical_payload, detach_attestation,
    verify_detached_attestation, verify_evidence_bundle_attestation, AttestationError,
    AttestationKey, VerificationOutcome,
};
pub use canonical::{canonical_hash, canonical_json, to_canonical_json, CANONICALIZATION_ID};
pub use grounding::{assert_quote_invariant, QuoteInvariantCode, QuoteInvariantError};
pub use hashing::{sha256_hex, sha256_str};
pub use jsonl::{
    decode_jsonl_reader, decode_jsonl_to_evidence_bundles, encode_evidence_bundles_to_jsonl,
    JsonlDecoder, JsonlError,
};
pub use types::{
    Attestation, BudgetLog, Diagnostics, EmptyResultKind, EvidenceBundle, MultiPassEntry,
    NormalizationLedger, NormalizationStep, PassKind, PassRecord, PromptLogEntry, Provenance,
    RunCompleteness, RunCompletenessKind, ShardFailure, ShardFailureKind, ShardOutcome,
    ShardPlan, ShardPlanEntry, ShardStatus, BUNDLE_VERSION,
};

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::types::*;
    use crate::adapters::ProviderRunRecord;
    use crate::core::json::{JsonPipelineLog, RepairBudget};
    use crate::core::retry::RetryPolicy;
    use crate::domain::{Extraction, OffsetMode, Program, ProgramSpec, Span};

    /// A small but fully populated bundle
    pub fn sample_bundle() -> EvidenceBundle {
        let program = Program::from_spec(ProgramSpec {
            instructions: "Extract tokens.".to_string(),
            classes: vec!["token".to_string()],
            constraints: vec![],
            schema: Some(json!({"type": "object"})),
            examples: vec![],
        })
        .unwrap();

        let mut attributes = BTreeMap::new();
        attributes.insert("weight".to_string(), json!(0.5));
        let extraction = Extraction::new("token", "Beta", Span::new(6, 10)).with_attributes(attributes);

        let record = ProviderRunRecord {
            provider: "replay".to_string(),
            model: "test".to_string(),
            latency_ms: 0,
            retries: 0,
            request_hash: "req".to_string(),
        };

        EvidenceBundle {
            bundle_version: BUNDLE_VERSION.to_string(),
            run_id: "run-1".to_string(),
            program: program.clone(),
            extractions: vec![extraction.clone()],
            provenance: Provenance {
                engine: "groundwork".to_string(),
                engine_version: "0.1.0".to_string(),
                document_id: "doc".to_string(),
                document_hash: "dochash".to_string(),
                document_length: 10,
                program_hash: program.program_hash.clone(),
                provider: "replay".to_string(),
                model: "test".to_string(),
            },
            normalization_ledger: NormalizationLedger::default(),
            shard_plan: ShardPlan {
                document_id: "doc".to_string(),
                chunk_size: 2000,
                overlap: 200,
                offset_mode: OffsetMode::Utf16CodeUnit,
                shards: vec![ShardPlanEntry {
                    shard_id: "s1".to_string(),
                    start: 0,
                    end: 10,
                }],
            },
            diagnostics: Diagnostics {
                empty_result_kind: EmptyResultKind::NonEmpty,
                shard_outcomes: vec![ShardOutcome {
                    shard_id: "s1".to_string(),
                    start: 0,
                    end: 10,
                    status: ShardStatus::Success,
                    from_checkpoint: false,
                    attempts: 1,
                    extractions: vec![extraction],
                    provider_run_record: Some(record),
                    json_pipeline_log: Some(JsonPipelineLog::default()),
                    failure: None,
                }],
                failures: vec![],
                checkpoint_hits: 0,
                duplicates_removed: 0,
                prompt_log: vec![PromptLogEntry {
                    shard_id: "s1".to_string(),
                    pass: PassKind::Draft,
                    prompt_hash: "ph".to_string(),
                }],
                budget_log: BudgetLog {
                    retry_policy: RetryPolicy::default(),
                    deadline_ms: None,
                    deadline_exceeded: false,
                    shards_skipped_by_deadline: 0,
                    structured_output: false,
                    repair_budget: RepairBudget::default(),
                },
                multi_pass_log: vec![MultiPassEntry {
                    shard_id: "s1".to_string(),
                    passes: vec![PassRecord {
                        pass: PassKind::Draft,
                        ok: true,
                        failure_kind: None,
                    }],
                }],
                run_completeness: RunCompleteness::from_counts(1, 0),
            },
            attestation: None,
        }
    }
}
