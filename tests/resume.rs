//! Retry, Deadline and Resume Integration Tests
//!
//! Tests for transient-failure retries, the cooperative run deadline, and
//! resuming a partially failed run from durable checkpoints.

use std::sync::Arc;
use std::time::Duration;

use groundwork::adapters::{ReplayEntry, ReplayProvider};
use groundwork::core::retry::{FixedRandom, RecordingSleeper};
use groundwork::core::{
    CheckpointStore, EngineSettings, JsonlCheckpointStore, Orchestrator, RetryPolicy, RunBudget,
    RunRequest, ShardCheckpoint,
};
use groundwork::domain::{Program, ProgramSpec};
use groundwork::evidence::{EmptyResultKind, RunCompletenessKind, ShardFailureKind};
use serde_json::json;
use tempfile::TempDir;

fn program() -> Program {
    Program::from_spec(ProgramSpec {
        instructions: "Extract tokens.".to_string(),
        classes: vec!["token".to_string()],
        constraints: vec![],
        schema: None,
        examples: vec![],
    })
    .unwrap()
}

fn fast_retries() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy {
            attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 80,
            jitter_ratio: 0.0,
        },
        ..Default::default()
    }
}

fn alpha() -> ReplayEntry {
    ReplayEntry::text(
        json!([{"extractionClass": "token", "quote": "Alpha", "span": {"charStart": 0, "charEnd": 5}}])
            .to_string(),
    )
}

#[tokio::test]
async fn test_transient_error_is_retried() {
    let provider = Arc::new(
        ReplayProvider::new().with_sequence(vec![ReplayEntry::http_error(503, "overloaded"), alpha()]),
    );
    let sleeper = Arc::new(RecordingSleeper::new());
    let bundle = Orchestrator::new(provider.clone())
        .with_settings(fast_retries())
        .with_sleeper(sleeper.clone())
        .with_random(Arc::new(FixedRandom(0.0)))
        .run_extraction(RunRequest::new("doc", "Alpha Beta", program()))
        .await
        .unwrap();

    assert_eq!(provider.call_count(), 2);
    assert_eq!(sleeper.delays(), vec![Duration::from_millis(10)]);
    assert_eq!(bundle.extractions.len(), 1);

    let outcome = &bundle.diagnostics.shard_outcomes[0];
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.provider_run_record.as_ref().unwrap().retries, 1);
    assert_eq!(bundle.diagnostics.budget_log.retry_policy.attempts, 3);
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let provider = Arc::new(ReplayProvider::new().with_default(ReplayEntry::http_error(401, "denied")));
    let sleeper = Arc::new(RecordingSleeper::new());
    let bundle = Orchestrator::new(provider.clone())
        .with_settings(fast_retries())
        .with_sleeper(sleeper.clone())
        .run_extraction(RunRequest::new("doc", "Alpha Beta", program()))
        .await
        .unwrap();

    assert_eq!(provider.call_count(), 1);
    assert!(sleeper.delays().is_empty());
    assert_eq!(bundle.diagnostics.empty_result_kind, EmptyResultKind::EmptyByFailure);

    let failure = &bundle.diagnostics.failures[0];
    assert_eq!(failure.kind, ShardFailureKind::ProviderFailure);
    assert_eq!(failure.code.as_deref(), Some("permanent"));
}

#[tokio::test]
async fn test_attempts_exhausted() {
    let provider = Arc::new(ReplayProvider::new().with_default(ReplayEntry::http_error(429, "slow down")));
    let sleeper = Arc::new(RecordingSleeper::new());
    let bundle = Orchestrator::new(provider.clone())
        .with_settings(fast_retries())
        .with_sleeper(sleeper.clone())
        .with_random(Arc::new(FixedRandom(0.0)))
        .run_extraction(RunRequest::new("doc", "Alpha Beta", program()))
        .await
        .unwrap();

    assert_eq!(provider.call_count(), 3);
    assert_eq!(
        sleeper.delays(),
        vec![Duration::from_millis(10), Duration::from_millis(20)]
    );
    let outcome = &bundle.diagnostics.shard_outcomes[0];
    assert_eq!(outcome.attempts, 3);
    assert_eq!(
        outcome.failure.as_ref().unwrap().kind,
        ShardFailureKind::ProviderFailure
    );
}

#[tokio::test(start_paused = true)]
async fn test_deadline_turns_run_into_partial_success() {
    let provider = Arc::new(
        ReplayProvider::always("[]").with_latency(Duration::from_millis(100)),
    );
    let settings = EngineSettings {
        chunk_size: 4,
        overlap: 0,
        budget: RunBudget::with_deadline(Duration::from_millis(150)),
        ..Default::default()
    };
    let bundle = Orchestrator::new(provider.clone())
        .with_settings(settings)
        .run_extraction(RunRequest::new("doc", "aaaabbbbcccc", program()))
        .await
        .unwrap();

    // Shards start at t=0 and t=100; the third would start at t=200
    assert_eq!(provider.call_count(), 2);

    let diagnostics = &bundle.diagnostics;
    assert_eq!(diagnostics.run_completeness.kind, RunCompletenessKind::PartialSuccess);
    assert_eq!(diagnostics.run_completeness.failed_shards, 1);
    assert_eq!(diagnostics.failures[0].kind, ShardFailureKind::DeadlineExceeded);
    assert_eq!(diagnostics.shard_outcomes[2].attempts, 0);

    let budget = &diagnostics.budget_log;
    assert!(budget.deadline_exceeded);
    assert_eq!(budget.shards_skipped_by_deadline, 1);
    assert_eq!(budget.deadline_ms, Some(150));
}

#[tokio::test]
async fn test_resume_from_durable_checkpoints() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("checkpoints").join("run-1.jsonl");
    let settings = EngineSettings {
        chunk_size: 12,
        overlap: 6,
        ..Default::default()
    };
    let document = "Alpha Beta Gamma";

    // First run: shard 1 succeeds, shard 2 fails permanently
    let first_provider = Arc::new(
        ReplayProvider::new().with_sequence(vec![alpha(), ReplayEntry::http_error(400, "bad request")]),
    );
    let store: Arc<JsonlCheckpointStore<ShardCheckpoint>> =
        Arc::new(JsonlCheckpointStore::open(&path).unwrap());
    let first = Orchestrator::new(first_provider.clone())
        .with_settings(settings.clone())
        .with_checkpoint_store(store)
        .run_extraction(RunRequest::new("doc", document, program()).with_run_id("run-1"))
        .await
        .unwrap();

    assert_eq!(first.diagnostics.run_completeness.kind, RunCompletenessKind::PartialSuccess);
    assert_eq!(first.extractions.len(), 1);

    // Second run with a fresh process view of the same log
    let reopened: Arc<JsonlCheckpointStore<ShardCheckpoint>> =
        Arc::new(JsonlCheckpointStore::open(&path).unwrap());
    assert_eq!(reopened.list("ckpt:v1:run-1:").await.unwrap().len(), 1);

    let second_provider = Arc::new(ReplayProvider::always(
        json!([{"extractionClass": "token", "quote": "Gamma", "span": {"charStart": 5, "charEnd": 10}}])
            .to_string(),
    ));
    let second = Orchestrator::new(second_provider.clone())
        .with_settings(settings)
        .with_checkpoint_store(reopened)
        .run_extraction(RunRequest::new("doc", document, program()).with_run_id("run-1"))
        .await
        .unwrap();

    assert_eq!(second_provider.call_count(), 1);
    assert_eq!(second.diagnostics.checkpoint_hits, 1);
    assert!(second.diagnostics.shard_outcomes[0].from_checkpoint);
    assert!(!second.diagnostics.shard_outcomes[1].from_checkpoint);
    assert_eq!(
        second.diagnostics.run_completeness.kind,
        RunCompletenessKind::CompleteSuccess
    );

    let quotes: Vec<&str> = second.extractions.iter().map(|e| e.quote.as_str()).collect();
    assert_eq!(quotes, vec!["Alpha", "Gamma"]);
    assert_eq!(first.shard_plan, second.shard_plan);
}

#[tokio::test]
async fn test_different_run_id_does_not_reuse_checkpoints() {
    let provider = Arc::new(ReplayProvider::always("[]"));
    let orchestrator = Orchestrator::new(provider.clone());

    for run_id in ["a", "a", "b"] {
        orchestrator
            .run_extraction(RunRequest::new("doc", "Alpha Beta", program()).with_run_id(run_id))
            .await
            .unwrap();
    }

    // "a" is served from checkpoint the second time
    assert_eq!(provider.call_count(), 2);
}
