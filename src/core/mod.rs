//! Core extraction engine.
//!
//! This module contains:
//! - Sharding: UTF-16 windows over the document and span mapping
//! - Prompt: prompt compilation with untrusted-text boundaries
//! - Json: recovery of JSON from raw model output
//! - Retry / Checkpoint: resumable, bounded retry of shard work
//! - Budget: run deadline and document size limits
//! - Orchestrator: the draft/repair/finalize run

pub mod budget;
pub mod checkpoint;
pub mod json;
pub mod orchestrator;
pub mod prompt;
pub mod retry;
pub mod sharding;

// Re-export commonly used types
pub use budget::{BudgetTracker, BudgetViolation, RunBudget};
pub use checkpoint::{
    checkpoint_key, CheckpointError, CheckpointExecutor, CheckpointStore, Execution,
    ExecutionError, JsonlCheckpointStore, MemoryCheckpointStore,
};
pub use json::{run_json_pipeline, JsonParseError, JsonPipelineLog, JsonPipelineOptions, RepairBudget};
pub use orchestrator::{
    EngineSettings, Orchestrator, RunRequest, ShardCheckpoint, StructuredOutputMode,
};
pub use prompt::{compile_prompt, compile_repair_prompt, CompiledPrompt, PromptContext};
pub use retry::{RandomSource, RetryPolicy, Sleeper};
pub use sharding::{chunk_document, map_shard_span_to_document, ChunkOptions, ShardingError};
