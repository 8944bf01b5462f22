//! Evidence bundle data types
//!
//! These types are the persisted bundle schema. Field names serialize as
//! camelCase and enum values as snake_case.

use serde::{Deserialize, Serialize};

use crate::adapters::ProviderRunRecord;
use crate::core::json::{JsonPipelineLog, RepairBudget};
use crate::core::retry::RetryPolicy;
use crate::domain::{DocumentShard, Extraction, OffsetMode, Program};

pub const BUNDLE_VERSION: &str = "1";

/// The complete, auditable output of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceBundle {
    pub bundle_version: String,
    pub run_id: String,
    pub program: Program,
    pub extractions: Vec<Extraction>,
    pub provenance: Provenance,
    pub normalization_ledger: NormalizationLedger,
    pub shard_plan: ShardPlan,
    pub diagnostics: Diagnostics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Attestation>,
}

/// Where the bundle came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub engine: String,
    pub engine_version: String,
    pub document_id: String,
    /// SHA-256 of the normalized document
    pub document_hash: String,
    /// Normalized document length in UTF-16 code units
    pub document_length: usize,
    pub program_hash: String,
    pub provider: String,
    pub model: String,
}

/// One document normalization step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationStep {
    pub name: String,
    pub applied: bool,
    pub before_length: usize,
    pub after_length: usize,
}

/// What was done to the document before sharding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationLedger {
    pub steps: Vec<NormalizationStep>,
    pub original_hash: String,
    pub document_hash: String,
}

/// Shard window as recorded in the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardPlanEntry {
    pub shard_id: String,
    pub start: usize,
    pub end: usize,
}

impl From<&DocumentShard> for ShardPlanEntry {
    fn from(shard: &DocumentShard) -> Self {
        Self {
            shard_id: shard.shard_id.clone(),
            start: shard.start,
            end: shard.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardPlan {
    pub document_id: String,
    pub chunk_size: usize,
    pub overlap: usize,
    pub offset_mode: OffsetMode,
    pub shards: Vec<ShardPlanEntry>,
}

/// Shard-level failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardFailureKind {
    JsonPipelineFailure,
    PayloadShapeFailure,
    QuoteInvariantFailure,
    /// The provider call failed permanently or exhausted its retries
    ProviderFailure,
    /// Not started because the run deadline had passed
    DeadlineExceeded,
}

impl ShardFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardFailureKind::JsonPipelineFailure => "json_pipeline_failure",
            ShardFailureKind::PayloadShapeFailure => "payload_shape_failure",
            ShardFailureKind::QuoteInvariantFailure => "quote_invariant_failure",
            ShardFailureKind::ProviderFailure => "provider_failure",
            ShardFailureKind::DeadlineExceeded => "deadline_exceeded",
        }
    }

    /// Eligible for one repair pass
    pub fn is_repairable(&self) -> bool {
        matches!(
            self,
            ShardFailureKind::JsonPipelineFailure
                | ShardFailureKind::PayloadShapeFailure
                | ShardFailureKind::QuoteInvariantFailure
        )
    }
}

/// Draft or repair pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    Draft,
    Repair,
}

impl PassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::Draft => "draft",
            PassKind::Repair => "repair",
        }
    }
}

/// Final failure of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardFailure {
    pub shard_id: String,
    pub kind: ShardFailureKind,
    pub message: String,
    /// Underlying error code (`json_parse_failed`, `QUOTE_MISMATCH`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<PassKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Success,
    Failure,
}

/// What happened to one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardOutcome {
    pub shard_id: String,
    pub start: usize,
    pub end: usize,
    pub status: ShardStatus,
    pub from_checkpoint: bool,
    pub attempts: u32,
    pub extractions: Vec<Extraction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_run_record: Option<ProviderRunRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_pipeline_log: Option<JsonPipelineLog>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ShardFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyResultKind {
    NonEmpty,
    EmptyByEvidence,
    EmptyByFailure,
}

impl EmptyResultKind {
    pub fn classify(extraction_count: usize, failed_shards: usize) -> Self {
        if extraction_count > 0 {
            EmptyResultKind::NonEmpty
        } else if failed_shards == 0 {
            EmptyResultKind::EmptyByEvidence
        } else {
            EmptyResultKind::EmptyByFailure
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCompletenessKind {
    CompleteSuccess,
    PartialSuccess,
    CompleteFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCompleteness {
    pub kind: RunCompletenessKind,
    pub total_shards: usize,
    pub succeeded_shards: usize,
    pub failed_shards: usize,
}

impl RunCompleteness {
    pub fn from_counts(total_shards: usize, failed_shards: usize) -> Self {
        let kind = if failed_shards == 0 {
            RunCompletenessKind::CompleteSuccess
        } else if failed_shards < total_shards {
            RunCompletenessKind::PartialSuccess
        } else {
            RunCompletenessKind::CompleteFailure
        };
        Self {
            kind,
            total_shards,
            succeeded_shards: total_shards - failed_shards,
            failed_shards,
        }
    }
}

/// Prompt hash per shard pass, so prompts can be reproduced and compared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptLogEntry {
    pub shard_id: String,
    pub pass: PassKind,
    pub prompt_hash: String,
}

/// Budgets in force for the run and what they did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetLog {
    pub retry_policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    pub deadline_exceeded: bool,
    pub shards_skipped_by_deadline: usize,
    /// Whether structured generation was used
    pub structured_output: bool,
    pub repair_budget: RepairBudget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassRecord {
    pub pass: PassKind,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ShardFailureKind>,
}

/// Draft/repair history of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiPassEntry {
    pub shard_id: String,
    pub passes: Vec<PassRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub empty_result_kind: EmptyResultKind,
    pub shard_outcomes: Vec<ShardOutcome>,
    pub failures: Vec<ShardFailure>,
    pub checkpoint_hits: usize,
    pub duplicates_removed: usize,
    pub prompt_log: Vec<PromptLogEntry>,
    pub budget_log: BudgetLog,
    pub multi_pass_log: Vec<MultiPassEntry>,
    pub run_completeness: RunCompleteness,
}

/// HMAC attestation over a bundle's canonical form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub version: String,
    pub canonicalization: String,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub payload_hash: String,
    pub signature: String,
    pub signed_at: String,
}
