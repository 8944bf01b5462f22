//! End-to-end extraction scenarios
//!
//! Runs the orchestrator against the replay provider and checks the
//! resulting bundles.

use std::sync::Arc;

use groundwork::adapters::{ReplayEntry, ReplayProvider};
use groundwork::core::retry::{FixedRandom, RecordingSleeper};
use groundwork::core::sharding::{chunk_document, ChunkOptions};
use groundwork::core::{EngineSettings, Orchestrator, RetryPolicy, RunRequest};
use groundwork::domain::{Program, ProgramSpec, Span};
use groundwork::evidence::{
    sha256_hex, EmptyResultKind, EvidenceBundle, RunCompletenessKind, ShardFailureKind,
    ShardStatus,
};
use serde_json::json;

const BETA_RESPONSE: &str = r#"{"extractions":[{"extractionClass":"token","quote":"Beta","span":{"offsetMode":"utf16_code_unit","charStart":6,"charEnd":10},"grounding":"explicit"}]}"#;

fn token_program() -> Program {
    Program::from_spec(ProgramSpec {
        instructions: "Extract every token the text names.".to_string(),
        classes: vec!["token".to_string()],
        constraints: vec!["Quote the document verbatim.".to_string()],
        schema: None,
        examples: vec![],
    })
    .unwrap()
}

async fn run(provider: Arc<ReplayProvider>, document: &str, settings: EngineSettings) -> EvidenceBundle {
    Orchestrator::new(provider)
        .with_settings(settings)
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .with_random(Arc::new(FixedRandom(0.0)))
        .run_extraction(RunRequest::new("doc-1", document, token_program()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_single_grounded_extraction() {
    let provider = Arc::new(ReplayProvider::always(BETA_RESPONSE));
    let bundle = run(provider, "Alpha Beta", EngineSettings::default()).await;

    assert_eq!(bundle.extractions.len(), 1);
    let extraction = &bundle.extractions[0];
    assert_eq!(extraction.extraction_class, "token");
    assert_eq!(extraction.quote, "Beta");
    assert_eq!(extraction.span, Span::new(6, 10));

    let diagnostics = &bundle.diagnostics;
    assert_eq!(diagnostics.empty_result_kind, EmptyResultKind::NonEmpty);
    assert!(diagnostics.failures.is_empty());
    assert_eq!(diagnostics.run_completeness.kind, RunCompletenessKind::CompleteSuccess);
    assert_eq!(diagnostics.prompt_log.len(), 1);
    assert_eq!(diagnostics.prompt_log[0].prompt_hash.len(), 64);

    assert_eq!(bundle.provenance.provider, "replay");
    assert_eq!(bundle.provenance.document_length, 10);
    assert_eq!(bundle.provenance.document_hash, sha256_hex(b"Alpha Beta"));
    assert_eq!(bundle.provenance.program_hash, bundle.program.program_hash);
    assert_eq!(bundle.shard_plan.shards.len(), 1);
}

#[tokio::test]
async fn test_empty_by_evidence() {
    let provider = Arc::new(ReplayProvider::always(r#"{"extractions":[]}"#));
    let bundle = run(provider, "Alpha Beta", EngineSettings::default()).await;

    assert!(bundle.extractions.is_empty());
    assert_eq!(bundle.diagnostics.empty_result_kind, EmptyResultKind::EmptyByEvidence);
    assert!(bundle.diagnostics.failures.is_empty());
    assert_eq!(
        bundle.diagnostics.run_completeness.kind,
        RunCompletenessKind::CompleteSuccess
    );
}

#[tokio::test]
async fn test_prose_is_empty_by_failure() {
    let provider = Arc::new(ReplayProvider::always(
        "I cannot provide JSON for this request.",
    ));
    let bundle = run(provider.clone(), "Alpha Beta", EngineSettings::default()).await;

    assert!(bundle.extractions.is_empty());
    assert_eq!(bundle.diagnostics.empty_result_kind, EmptyResultKind::EmptyByFailure);
    assert_eq!(bundle.diagnostics.failures.len(), 1);

    let failure = &bundle.diagnostics.failures[0];
    assert_eq!(failure.kind, ShardFailureKind::JsonPipelineFailure);
    assert_eq!(failure.code.as_deref(), Some("json_payload_missing"));
    assert_eq!(
        bundle.diagnostics.run_completeness.kind,
        RunCompletenessKind::CompleteFailure
    );

    // Draft plus one repair pass, then the shard is given up
    assert_eq!(provider.call_count(), 2);
    let outcome = &bundle.diagnostics.shard_outcomes[0];
    assert_eq!(outcome.status, ShardStatus::Failure);
    let log = outcome.json_pipeline_log.as_ref().unwrap();
    assert!(!log.parse.ok);
    assert!(!log.extracted_json.found);
}

#[test]
fn test_chunk_scenario() {
    let options = ChunkOptions::new("doc", 5, 1);
    let shards = chunk_document("abcdefghij", "hash", &options).unwrap();

    let windows: Vec<(usize, usize, &str)> = shards
        .iter()
        .map(|s| (s.start, s.end, s.text.as_str()))
        .collect();
    assert_eq!(
        windows,
        vec![(0, 5, "abcde"), (4, 9, "efghi"), (8, 10, "ij")]
    );
}

#[test]
fn test_sha256_of_empty_input() {
    assert_eq!(
        sha256_hex(b""),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn test_backoff_scenario() {
    let policy = RetryPolicy {
        attempts: 4,
        base_delay_ms: 10,
        max_delay_ms: 80,
        jitter_ratio: 0.25,
    };
    assert_eq!(policy.backoff_ms(1), 10);
    assert_eq!(policy.backoff_ms(2), 20);
    assert_eq!(policy.backoff_ms(10), 80);
}

#[tokio::test]
async fn test_overlap_duplicates_collapse() {
    // Shards [0,12) "Alpha Beta G" and [6,16) "Beta Gamma" both see "Beta"
    let provider = Arc::new(ReplayProvider::new().with_sequence(vec![
        ReplayEntry::text(
            json!([
                {"extractionClass": "token", "quote": "Beta", "span": {"charStart": 6, "charEnd": 10}},
                {"extractionClass": "token", "quote": "Alpha", "span": {"charStart": 0, "charEnd": 5}}
            ])
            .to_string(),
        ),
        ReplayEntry::text(
            json!({"extractions": [
                {"extractionClass": "token", "quote": "Gamma", "span": {"charStart": 5, "charEnd": 10}},
                {"extractionClass": "token", "quote": "Beta", "span": {"charStart": 0, "charEnd": 4}}
            ]})
            .to_string(),
        ),
    ]));
    let settings = EngineSettings {
        chunk_size: 12,
        overlap: 6,
        ..Default::default()
    };
    let bundle = run(provider, "Alpha Beta Gamma", settings).await;

    let quotes: Vec<&str> = bundle.extractions.iter().map(|e| e.quote.as_str()).collect();
    assert_eq!(quotes, vec!["Alpha", "Beta", "Gamma"]);
    assert_eq!(bundle.extractions[2].span, Span::new(11, 16));
    assert_eq!(bundle.diagnostics.duplicates_removed, 1);
    assert_eq!(bundle.shard_plan.shards.len(), 2);
}

#[tokio::test]
async fn test_streamed_response_is_decoded() {
    let stream = [
        r#"data: {"choices":[{"delta":{"content":"{\"extractions\":[{\"extractionClass\":\"token\","}}]}"#,
        r#"data: {"choices":[{"delta":{"content":"\"quote\":\"Alpha\",\"span\":{\"charStart\":0,\"charEnd\":5}}]}"}}]}"#,
        "data: [DONE]",
        "",
    ]
    .join("\n");
    let provider = Arc::new(ReplayProvider::always(stream));
    let bundle = run(provider, "Alpha Beta", EngineSettings::default()).await;

    assert_eq!(bundle.extractions.len(), 1);
    assert_eq!(bundle.extractions[0].quote, "Alpha");
    let log = bundle.diagnostics.shard_outcomes[0]
        .json_pipeline_log
        .as_ref()
        .unwrap();
    assert!(log.stream.framed);
    assert!(log.stream.done_seen);
}

#[tokio::test]
async fn test_tool_call_channel() {
    let provider = Arc::new(ReplayProvider::new().with_default(ReplayEntry::tool_call(
        r#"[{"extractionClass":"token","quote":"Alpha","span":{"charStart":0,"charEnd":5}}]"#,
    )));
    let bundle = run(provider, "Alpha Beta", EngineSettings::default()).await;
    assert_eq!(bundle.extractions.len(), 1);
}

#[tokio::test]
async fn test_failed_repair_records_both_passes() {
    let mismatch = r#"[{"extractionClass":"token","quote":"Gamma","span":{"charStart":0,"charEnd":5}}]"#;
    let provider = Arc::new(ReplayProvider::always(mismatch));
    let bundle = run(provider.clone(), "Alpha Beta", EngineSettings::default()).await;

    assert_eq!(provider.call_count(), 2);
    let failure = &bundle.diagnostics.failures[0];
    assert_eq!(failure.kind, ShardFailureKind::QuoteInvariantFailure);
    assert_eq!(failure.code.as_deref(), Some("QUOTE_MISMATCH"));

    let passes = &bundle.diagnostics.multi_pass_log[0].passes;
    assert_eq!(passes.len(), 2);
    assert!(passes.iter().all(|p| !p.ok));

    // The repair prompt quotes the rejected answer
    let requests = provider.requests();
    assert!(requests[1].prompt.contains("Gamma"));
    assert_ne!(requests[0].prompt, requests[1].prompt);
}
