//! Evidence orchestrator.
//!
//! Drives one extraction run: normalize the document, shard it, take each
//! shard through a draft pass and at most one repair pass under the
//! checkpoint executor, then merge, deduplicate and package the result as
//! an [`EvidenceBundle`].
//!
//! A run only returns `Err` for caller mistakes (bad shard parameters, a
//! malformed retry policy, an oversized document) and for checkpoint store
//! failures. Whatever the model or provider does ends up in diagnostics.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{
    OutputChannel, Provider, ProviderError, ProviderRequest, ProviderResponse, ProviderRunRecord,
};
use crate::domain::{utf16_len, DocumentShard, Extraction, Grounding, OffsetMode, Program, Utf16Text};
use crate::evidence::grounding::{
    assert_quote_invariant, span_bound, QuoteInvariantCode, QuoteInvariantError,
};
use crate::evidence::hashing::sha256_str;
use crate::evidence::types::{
    BudgetLog, Diagnostics, EmptyResultKind, EvidenceBundle, MultiPassEntry, NormalizationLedger,
    NormalizationStep, PassKind, PassRecord, PromptLogEntry, Provenance, RunCompleteness,
    ShardFailure, ShardFailureKind, ShardOutcome, ShardPlan, ShardPlanEntry, ShardStatus,
    BUNDLE_VERSION,
};

use super::budget::{BudgetTracker, RunBudget};
use super::checkpoint::{
    checkpoint_key, CheckpointExecutor, CheckpointStore, ExecutionError, MemoryCheckpointStore,
};
use super::json::{payload_items, run_json_pipeline, JsonPipelineLog, JsonPipelineOptions, RepairBudget};
use super::prompt::{compile_prompt, compile_repair_prompt, CompiledPrompt, PromptContext, RepairContext};
use super::retry::{RandomSource, RetryPolicy, Sleeper, ThreadRandom, TokioSleeper};
use super::sharding::{chunk_document, map_shard_span_to_document, ChunkOptions, ShardingError};

pub const DEFAULT_CHUNK_SIZE: usize = 2000;
pub const DEFAULT_OVERLAP: usize = 200;
pub const DEFAULT_MAX_SCHEMA_CHARS: usize = 2000;
pub const DEFAULT_MODEL: &str = "llama3";

const ENGINE_NAME: &str = env!("CARGO_PKG_NAME");
const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// When to call `generate_structured` instead of `generate`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuredOutputMode {
    /// Only when the program schema actually constrains the output
    #[default]
    Auto,
    Always,
    Never,
}

impl StructuredOutputMode {
    pub fn use_structured(&self, program: &Program) -> bool {
        match self {
            StructuredOutputMode::Auto => program.has_meaningful_schema(),
            StructuredOutputMode::Always => true,
            StructuredOutputMode::Never => false,
        }
    }
}

/// Everything the engine needs besides the document and program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub model: String,
    pub chunk_size: usize,
    pub overlap: usize,
    pub structured_output: StructuredOutputMode,
    /// Character budget for the schema excerpt in prompts
    pub max_schema_chars: usize,
    /// Allow one repair pass after a repairable draft failure
    pub repair_pass: bool,
    /// Convert CRLF and CR line endings to LF before sharding
    pub normalize_newlines: bool,
    pub retry: RetryPolicy,
    pub repair_budget: RepairBudget,
    pub budget: RunBudget,
    /// Per-call timeout forwarded to the provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_timeout_ms: Option<u64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
            structured_output: StructuredOutputMode::Auto,
            max_schema_chars: DEFAULT_MAX_SCHEMA_CHARS,
            repair_pass: true,
            normalize_newlines: false,
            retry: RetryPolicy::default(),
            repair_budget: RepairBudget::default(),
            budget: RunBudget::default(),
            provider_timeout_ms: None,
        }
    }
}

/// Input of one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Reusing a run id resumes from its checkpoints; a fresh one is generated if absent
    pub run_id: Option<String>,
    pub document_id: String,
    pub document: String,
    pub program: Program,
}

impl RunRequest {
    pub fn new(document_id: impl Into<String>, document: impl Into<String>, program: Program) -> Self {
        Self {
            run_id: None,
            document_id: document_id.into(),
            document: document.into(),
            program,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// What a successful shard leaves in the checkpoint store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardCheckpoint {
    /// Grounded extractions with document-global spans
    pub extractions: Vec<Extraction>,
    pub provider_run_record: ProviderRunRecord,
    pub json_pipeline_log: JsonPipelineLog,
    pub passes: Vec<PassRecord>,
    pub prompt_log: Vec<PromptLogEntry>,
}

/// Why one pass over a shard produced no evidence
#[derive(Debug, Clone)]
struct PassFailure {
    kind: ShardFailureKind,
    message: String,
    code: Option<String>,
}

impl PassFailure {
    fn shape(index: usize, detail: &str) -> Self {
        Self {
            kind: ShardFailureKind::PayloadShapeFailure,
            message: format!("Extraction {}: {}", index, detail),
            code: None,
        }
    }

    fn grounding(error: QuoteInvariantError) -> Self {
        Self::invariant(error.code(), error.to_string())
    }

    fn invariant(code: QuoteInvariantCode, message: String) -> Self {
        Self {
            kind: ShardFailureKind::QuoteInvariantFailure,
            message,
            code: Some(code.as_str().to_string()),
        }
    }
}

struct PassEvaluation {
    result: Result<Vec<Extraction>, PassFailure>,
    log: JsonPipelineLog,
}

#[derive(Debug)]
struct ShardFailureReport {
    failure: ShardFailure,
    provider_run_record: Option<ProviderRunRecord>,
    json_pipeline_log: Option<JsonPipelineLog>,
    passes: Vec<PassRecord>,
    prompt_log: Vec<PromptLogEntry>,
}

/// Failure of the draft/repair unit for one shard
#[derive(Debug, Error)]
#[error("{}: {}", .report.failure.kind.as_str(), .report.failure.message)]
struct ShardUnitError {
    report: Box<ShardFailureReport>,
    /// Only transient provider failures are retried
    transient: bool,
}

impl ShardUnitError {
    fn provider(
        shard: &DocumentShard,
        error: ProviderError,
        pass: PassKind,
        mut passes: Vec<PassRecord>,
        prompt_log: Vec<PromptLogEntry>,
    ) -> Self {
        let transient = error.is_transient();
        passes.push(PassRecord {
            pass,
            ok: false,
            failure_kind: Some(ShardFailureKind::ProviderFailure),
        });
        Self {
            transient,
            report: Box::new(ShardFailureReport {
                failure: ShardFailure {
                    shard_id: shard.shard_id.clone(),
                    kind: ShardFailureKind::ProviderFailure,
                    message: error.to_string(),
                    code: Some(if transient { "transient" } else { "permanent" }.to_string()),
                    pass: Some(pass),
                },
                provider_run_record: None,
                json_pipeline_log: None,
                passes,
                prompt_log,
            }),
        }
    }

    fn evidence(
        shard: &DocumentShard,
        failure: PassFailure,
        pass: PassKind,
        response: ProviderResponse,
        log: JsonPipelineLog,
        passes: Vec<PassRecord>,
        prompt_log: Vec<PromptLogEntry>,
    ) -> Self {
        Self {
            transient: false,
            report: Box::new(ShardFailureReport {
                failure: ShardFailure {
                    shard_id: shard.shard_id.clone(),
                    kind: failure.kind,
                    message: failure.message,
                    code: failure.code,
                    pass: Some(pass),
                },
                provider_run_record: Some(response.run_record),
                json_pipeline_log: Some(log),
                passes,
                prompt_log,
            }),
        }
    }
}

/// Per-run inputs shared by every shard
struct ShardContext<'a> {
    program: &'a Program,
    document: &'a Utf16Text,
    structured: bool,
}

/// Main extraction orchestrator
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    settings: EngineSettings,
    store: Arc<dyn CheckpointStore<ShardCheckpoint>>,
    sleeper: Arc<dyn Sleeper>,
    random: Arc<dyn RandomSource>,
    executor: CheckpointExecutor<ShardCheckpoint>,
}

impl Orchestrator {
    /// Create an orchestrator with default settings and an in-memory checkpoint store
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        let store: Arc<dyn CheckpointStore<ShardCheckpoint>> = Arc::new(MemoryCheckpointStore::new());
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
        let random: Arc<dyn RandomSource> = Arc::new(ThreadRandom);
        let settings = EngineSettings::default();
        let executor = build_executor(&store, &settings, &sleeper, &random);
        Self {
            provider,
            settings,
            store,
            sleeper,
            random,
            executor,
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self.rebuild_executor()
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore<ShardCheckpoint>>) -> Self {
        self.store = store;
        self.rebuild_executor()
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self.rebuild_executor()
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self.rebuild_executor()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn rebuild_executor(mut self) -> Self {
        self.executor = build_executor(&self.store, &self.settings, &self.sleeper, &self.random);
        self
    }

    /// Run the engine over one document
    #[instrument(skip_all, fields(document_id = %request.document_id))]
    pub async fn run_extraction(&self, request: RunRequest) -> Result<EvidenceBundle> {
        let settings = &self.settings;
        settings
            .retry
            .validate()
            .context("Invalid retry policy")?;

        let run_id = request
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (text, ledger) = normalize_document(&request.document, settings.normalize_newlines);
        let document = Utf16Text::new(&text);
        settings
            .budget
            .validate_document(document.len())
            .context("Document rejected")?;

        let options = ChunkOptions::new(
            request.document_id.clone(),
            settings.chunk_size,
            settings.overlap,
        );
        let shards = chunk_document(&text, &request.program.program_hash, &options)
            .context("Invalid shard parameters")?;
        let structured = settings.structured_output.use_structured(&request.program);

        info!(
            %run_id,
            shards = shards.len(),
            document_units = document.len(),
            structured,
            "Starting extraction run"
        );

        let ctx = ShardContext {
            program: &request.program,
            document: &document,
            structured,
        };
        let mut tracker = BudgetTracker::new();
        let mut outcomes = Vec::with_capacity(shards.len());
        let mut prompt_log = Vec::new();
        let mut multi_pass_log = Vec::new();
        let mut checkpoint_hits = 0;

        for shard in &shards {
            if let Err(violation) = settings.budget.check(&tracker) {
                warn!(shard_id = %shard.shard_id, "Deadline passed, skipping shard");
                tracker.record_skipped();
                outcomes.push(failed_outcome(
                    shard,
                    0,
                    ShardFailure {
                        shard_id: shard.shard_id.clone(),
                        kind: ShardFailureKind::DeadlineExceeded,
                        message: violation.to_string(),
                        code: None,
                        pass: None,
                    },
                    None,
                    None,
                ));
                continue;
            }

            tracker.record_started();
            let key = checkpoint_key(&run_id, &shard.shard_id);
            let ctx = &ctx;
            let result = self
                .executor
                .execute(
                    &key,
                    move |attempt| self.run_shard(ctx, shard, attempt),
                    |e: &ShardUnitError| e.transient,
                )
                .await;

            match result {
                Ok(execution) => {
                    if execution.from_checkpoint {
                        checkpoint_hits += 1;
                    }
                    let value = execution.value;
                    debug!(
                        shard_id = %shard.shard_id,
                        extractions = value.extractions.len(),
                        from_checkpoint = execution.from_checkpoint,
                        "Shard succeeded"
                    );
                    prompt_log.extend(value.prompt_log);
                    multi_pass_log.push(MultiPassEntry {
                        shard_id: shard.shard_id.clone(),
                        passes: value.passes,
                    });
                    outcomes.push(ShardOutcome {
                        shard_id: shard.shard_id.clone(),
                        start: shard.start,
                        end: shard.end,
                        status: ShardStatus::Success,
                        from_checkpoint: execution.from_checkpoint,
                        attempts: execution.attempts,
                        extractions: value.extractions,
                        provider_run_record: Some(value.provider_run_record),
                        json_pipeline_log: Some(value.json_pipeline_log),
                        failure: None,
                    });
                }
                Err(ExecutionError::Work {
                    error: unit_error,
                    attempts,
                    ..
                }) => {
                    let report = *unit_error.report;
                    error!(
                        shard_id = %shard.shard_id,
                        kind = report.failure.kind.as_str(),
                        code = ?report.failure.code,
                        attempts,
                        "Shard failed"
                    );
                    prompt_log.extend(report.prompt_log);
                    multi_pass_log.push(MultiPassEntry {
                        shard_id: shard.shard_id.clone(),
                        passes: report.passes,
                    });
                    outcomes.push(failed_outcome(
                        shard,
                        attempts,
                        report.failure,
                        report.provider_run_record,
                        report.json_pipeline_log,
                    ));
                }
                Err(ExecutionError::Store(e)) => {
                    return Err(e).with_context(|| {
                        format!("Checkpoint store failed for shard {}", shard.shard_id)
                    });
                }
            }
        }

        let failures: Vec<ShardFailure> = outcomes
            .iter()
            .filter_map(|outcome| outcome.failure.clone())
            .collect();
        let (extractions, duplicates_removed) = merge_extractions(
            outcomes
                .iter()
                .flat_map(|outcome| outcome.extractions.iter().cloned()),
        );
        let empty_result_kind = EmptyResultKind::classify(extractions.len(), failures.len());
        let run_completeness = RunCompleteness::from_counts(shards.len(), failures.len());

        info!(
            %run_id,
            extractions = extractions.len(),
            failed_shards = failures.len(),
            duplicates_removed,
            checkpoint_hits,
            completeness = ?run_completeness.kind,
            "Extraction run finished"
        );

        Ok(EvidenceBundle {
            bundle_version: BUNDLE_VERSION.to_string(),
            run_id,
            provenance: Provenance {
                engine: ENGINE_NAME.to_string(),
                engine_version: ENGINE_VERSION.to_string(),
                document_id: request.document_id.clone(),
                document_hash: ledger.document_hash.clone(),
                document_length: document.len(),
                program_hash: request.program.program_hash.clone(),
                provider: self.provider.name().to_string(),
                model: settings.model.clone(),
            },
            program: request.program,
            extractions,
            normalization_ledger: ledger,
            shard_plan: ShardPlan {
                document_id: request.document_id,
                chunk_size: options.chunk_size,
                overlap: options.overlap,
                offset_mode: options.offset_mode,
                shards: shards.iter().map(ShardPlanEntry::from).collect(),
            },
            diagnostics: Diagnostics {
                empty_result_kind,
                shard_outcomes: outcomes,
                failures,
                checkpoint_hits,
                duplicates_removed,
                prompt_log,
                budget_log: BudgetLog {
                    retry_policy: settings.retry,
                    deadline_ms: settings.budget.deadline_ms,
                    deadline_exceeded: tracker.shards_skipped > 0,
                    shards_skipped_by_deadline: tracker.shards_skipped,
                    structured_output: structured,
                    repair_budget: settings.repair_budget,
                },
                multi_pass_log,
                run_completeness,
            },
            attestation: None,
        })
    }

    /// Draft pass, then one repair pass if the draft failed repairably
    async fn run_shard(
        &self,
        ctx: &ShardContext<'_>,
        shard: &DocumentShard,
        attempt: u32,
    ) -> Result<ShardCheckpoint, ShardUnitError> {
        let prompt_ctx = PromptContext {
            program: ctx.program,
            shard,
            max_schema_chars: self.settings.max_schema_chars,
        };
        let mut passes = Vec::new();
        let mut prompt_log = Vec::new();

        let draft_prompt = compile_prompt(&prompt_ctx);
        prompt_log.push(prompt_entry(shard, PassKind::Draft, &draft_prompt));
        let draft = match self
            .call_provider(ctx, shard, &draft_prompt, PassKind::Draft, attempt)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Err(ShardUnitError::provider(
                    shard,
                    e,
                    PassKind::Draft,
                    passes,
                    prompt_log,
                ))
            }
        };

        let evaluation = self.evaluate_response(&draft, shard, ctx.document);
        let failure = match evaluation.result {
            Ok(extractions) => {
                passes.push(pass_record(PassKind::Draft, None));
                return Ok(ShardCheckpoint {
                    extractions,
                    provider_run_record: draft.run_record,
                    json_pipeline_log: evaluation.log,
                    passes,
                    prompt_log,
                });
            }
            Err(failure) => failure,
        };
        passes.push(pass_record(PassKind::Draft, Some(failure.kind)));

        if !self.settings.repair_pass || !failure.kind.is_repairable() {
            return Err(ShardUnitError::evidence(
                shard,
                failure,
                PassKind::Draft,
                draft,
                evaluation.log,
                passes,
                prompt_log,
            ));
        }

        warn!(
            shard_id = %shard.shard_id,
            kind = failure.kind.as_str(),
            code = ?failure.code,
            "Draft pass failed, attempting repair"
        );

        let repair_prompt = compile_repair_prompt(
            &prompt_ctx,
            &RepairContext {
                previous_response: &draft.text,
                failure_kind: failure.kind.as_str(),
                failure_message: &failure.message,
            },
        );
        prompt_log.push(prompt_entry(shard, PassKind::Repair, &repair_prompt));
        let repaired = match self
            .call_provider(ctx, shard, &repair_prompt, PassKind::Repair, attempt)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Err(ShardUnitError::provider(
                    shard,
                    e,
                    PassKind::Repair,
                    passes,
                    prompt_log,
                ))
            }
        };

        let evaluation = self.evaluate_response(&repaired, shard, ctx.document);
        match evaluation.result {
            Ok(extractions) => {
                passes.push(pass_record(PassKind::Repair, None));
                Ok(ShardCheckpoint {
                    extractions,
                    provider_run_record: repaired.run_record,
                    json_pipeline_log: evaluation.log,
                    passes,
                    prompt_log,
                })
            }
            Err(failure) => {
                passes.push(pass_record(PassKind::Repair, Some(failure.kind)));
                Err(ShardUnitError::evidence(
                    shard,
                    failure,
                    PassKind::Repair,
                    repaired,
                    evaluation.log,
                    passes,
                    prompt_log,
                ))
            }
        }
    }

    async fn call_provider(
        &self,
        ctx: &ShardContext<'_>,
        shard: &DocumentShard,
        prompt: &CompiledPrompt,
        pass: PassKind,
        attempt: u32,
    ) -> Result<ProviderResponse, ProviderError> {
        let schema = if ctx.structured {
            ctx.program.schema.clone()
        } else {
            None
        };
        let request = ProviderRequest::new(self.settings.model.clone(), prompt.text.clone())
            .with_schema(schema)
            .with_metadata("shardId", Value::from(shard.shard_id.clone()))
            .with_metadata("pass", Value::from(pass.as_str()))
            .with_timeout_ms(self.settings.provider_timeout_ms);

        debug!(
            shard_id = %shard.shard_id,
            pass = pass.as_str(),
            attempt,
            prompt_hash = %prompt.prompt_hash,
            "Calling provider"
        );

        let mut response = if ctx.structured {
            self.provider.generate_structured(&request).await?
        } else {
            self.provider.generate(&request).await?
        };
        response.run_record.retries = attempt.saturating_sub(1);
        Ok(response)
    }

    fn evaluate_response(
        &self,
        response: &ProviderResponse,
        shard: &DocumentShard,
        document: &Utf16Text,
    ) -> PassEvaluation {
        let options = JsonPipelineOptions {
            budget: self.settings.repair_budget,
            tool_call_channel: response.output_channel == Some(OutputChannel::ToolCall),
        };
        let run = run_json_pipeline(&response.text, &options);
        let log = run.log;

        let value = match run.value {
            Ok(value) => value,
            Err(e) => {
                return PassEvaluation {
                    result: Err(PassFailure {
                        kind: ShardFailureKind::JsonPipelineFailure,
                        message: e.to_string(),
                        code: Some(e.code().to_string()),
                    }),
                    log,
                }
            }
        };

        let result = match payload_items(&value) {
            Some(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| ground_candidate(index, item, shard, document))
                .collect(),
            None => Err(PassFailure {
                kind: ShardFailureKind::PayloadShapeFailure,
                message: "Payload is neither an array nor an object with an extractions array"
                    .to_string(),
                code: None,
            }),
        };

        PassEvaluation { result, log }
    }
}

fn build_executor(
    store: &Arc<dyn CheckpointStore<ShardCheckpoint>>,
    settings: &EngineSettings,
    sleeper: &Arc<dyn Sleeper>,
    random: &Arc<dyn RandomSource>,
) -> CheckpointExecutor<ShardCheckpoint> {
    CheckpointExecutor::new(store.clone(), settings.retry)
        .with_sleeper(sleeper.clone())
        .with_random(random.clone())
}

fn prompt_entry(shard: &DocumentShard, pass: PassKind, prompt: &CompiledPrompt) -> PromptLogEntry {
    PromptLogEntry {
        shard_id: shard.shard_id.clone(),
        pass,
        prompt_hash: prompt.prompt_hash.clone(),
    }
}

fn pass_record(pass: PassKind, failure_kind: Option<ShardFailureKind>) -> PassRecord {
    PassRecord {
        pass,
        ok: failure_kind.is_none(),
        failure_kind,
    }
}

fn failed_outcome(
    shard: &DocumentShard,
    attempts: u32,
    failure: ShardFailure,
    provider_run_record: Option<ProviderRunRecord>,
    json_pipeline_log: Option<JsonPipelineLog>,
) -> ShardOutcome {
    ShardOutcome {
        shard_id: shard.shard_id.clone(),
        start: shard.start,
        end: shard.end,
        status: ShardStatus::Failure,
        from_checkpoint: false,
        attempts,
        extractions: Vec::new(),
        provider_run_record,
        json_pipeline_log,
        failure: Some(failure),
    }
}

/// Turn one model-supplied candidate into a grounded, document-global extraction
fn ground_candidate(
    index: usize,
    item: &Value,
    shard: &DocumentShard,
    document: &Utf16Text,
) -> Result<Extraction, PassFailure> {
    let object = item
        .as_object()
        .ok_or_else(|| PassFailure::shape(index, "not an object"))?;

    let class = object
        .get("extractionClass")
        .and_then(Value::as_str)
        .filter(|class| !class.trim().is_empty())
        .ok_or_else(|| PassFailure::shape(index, "extractionClass must be a non-empty string"))?;
    let quote = object
        .get("quote")
        .and_then(Value::as_str)
        .ok_or_else(|| PassFailure::shape(index, "quote must be a string"))?;
    let span = object
        .get("span")
        .and_then(Value::as_object)
        .ok_or_else(|| PassFailure::shape(index, "span must be an object"))?;

    if let Some(mode) = span.get("offsetMode") {
        if mode.as_str() != Some(OffsetMode::Utf16CodeUnit.as_str()) {
            return Err(PassFailure::shape(index, "offsetMode must be utf16_code_unit"));
        }
    }

    let grounding = match object.get("grounding") {
        None | Some(Value::Null) => Grounding::default(),
        Some(value) => serde_json::from_value::<Grounding>(value.clone())
            .map_err(|_| PassFailure::shape(index, "grounding must be explicit or inferred"))?,
    };
    let attributes = match object.get("attributes") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(
            map.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        ),
        Some(_) => return Err(PassFailure::shape(index, "attributes must be an object")),
    };

    let local_start = span_bound(span.get("charStart"), "charStart").map_err(PassFailure::grounding)?;
    let local_end = span_bound(span.get("charEnd"), "charEnd").map_err(PassFailure::grounding)?;
    let global = map_shard_span_to_document(shard, local_start, local_end).map_err(|e| {
        let code = match e {
            ShardingError::InvalidSpan { .. } => QuoteInvariantCode::InvalidSpan,
            _ => QuoteInvariantCode::SpanOutOfRange,
        };
        PassFailure::invariant(code, e.to_string())
    })?;

    let mut extraction = Extraction::new(class, quote, global).with_grounding(grounding);
    extraction.attributes = attributes;
    assert_quote_invariant(document, &extraction).map_err(PassFailure::grounding)?;
    Ok(extraction)
}

/// Collapse duplicates and sort by `(charStart, charEnd, extractionClass, quote)`.
///
/// Returns the merged list and how many entries were removed.
pub fn merge_extractions(
    extractions: impl IntoIterator<Item = Extraction>,
) -> (Vec<Extraction>, usize) {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    let mut removed = 0;

    for extraction in extractions {
        if seen.insert(extraction.dedup_key()) {
            merged.push(extraction);
        } else {
            removed += 1;
        }
    }

    merged.sort_by(|a, b| {
        a.span
            .char_start
            .cmp(&b.span.char_start)
            .then(a.span.char_end.cmp(&b.span.char_end))
            .then_with(|| a.extraction_class.cmp(&b.extraction_class))
            .then_with(|| a.quote.cmp(&b.quote))
    });

    (merged, removed)
}

/// Normalize a document before sharding, recording every step.
///
/// Lengths in the ledger are UTF-16 code units.
pub fn normalize_document(text: &str, normalize_newlines: bool) -> (String, NormalizationLedger) {
    let mut steps = Vec::new();

    let stripped = text.strip_prefix('\u{feff}');
    let mut current = stripped.unwrap_or(text).to_string();
    steps.push(NormalizationStep {
        name: "strip_bom".to_string(),
        applied: stripped.is_some(),
        before_length: utf16_len(text),
        after_length: utf16_len(&current),
    });

    if normalize_newlines {
        let before_length = utf16_len(&current);
        let normalized = current.replace("\r\n", "\n").replace('\r', "\n");
        let applied = normalized != current;
        current = normalized;
        steps.push(NormalizationStep {
            name: "normalize_newlines".to_string(),
            applied,
            before_length,
            after_length: utf16_len(&current),
        });
    }

    let ledger = NormalizationLedger {
        steps,
        original_hash: sha256_str(text),
        document_hash: sha256_str(&current),
    };
    (current, ledger)
}
