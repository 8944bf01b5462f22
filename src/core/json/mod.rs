//! JSON recovery pipeline.
//!
//! Raw provider text goes through four stages, each of which keeps a log:
//!
//! 1. `stream` - SSE frame decoding (pass-through for plain text)
//! 2. `extract` - first balanced `{...}` / `[...]` candidate
//! 3. `repair` - deterministic, content-preserving fixes
//! 4. `parse` - strict parse with positioned failure detail
//!
//! The pipeline never loses its log: success and failure both return the
//! same `JsonPipelineLog` shape so diagnostics survive either way.
//! `tool_calls` consumes the same decoded frames in parallel.

pub mod extract;
pub mod parse;
pub mod repair;
pub mod stream;
pub mod tool_calls;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use extract::{extract_candidate, find_first_json_value, ExtractionLog, JsonKind, JsonMatch};
pub use parse::{strict_parse, ParseFailureDetail};
pub use repair::{repair_candidate, RepairBudget, RepairBudgetRecord, RepairLog, RepairStep};
pub use stream::{decode_stream, frame_content, DecodedStream, StreamDecodeLog, StreamFrame};
pub use tool_calls::{assemble_tool_calls, AssembledToolCall, ToolCallAssembler};

/// Failures of the recovery pipeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JsonParseError {
    #[error("Malformed streamed frame at line {line}.")]
    StreamFrameMalformed { line: usize, detail: String },

    #[error("No JSON payload found: {}", .0.message)]
    PayloadMissing(ParseFailureDetail),

    #[error("JSON parse failed at position {}: {}", .0.position, .0.message)]
    ParseFailed(ParseFailureDetail),

    #[error("Schema validation failed: {message}")]
    SchemaValidationFailed { message: String },
}

impl JsonParseError {
    /// Stable failure code
    pub fn code(&self) -> &'static str {
        match self {
            JsonParseError::StreamFrameMalformed { .. } => "stream_frame_malformed",
            JsonParseError::PayloadMissing(_) => "json_payload_missing",
            JsonParseError::ParseFailed(_) => "json_parse_failed",
            JsonParseError::SchemaValidationFailed { .. } => "schema_validation_failed",
        }
    }

    pub fn detail(&self) -> Option<&ParseFailureDetail> {
        match self {
            JsonParseError::PayloadMissing(detail) | JsonParseError::ParseFailed(detail) => {
                Some(detail)
            }
            _ => None,
        }
    }

    pub fn to_record(&self) -> JsonParseErrorRecord {
        JsonParseErrorRecord {
            code: self.code().to_string(),
            message: self.to_string(),
            line: match self {
                JsonParseError::StreamFrameMalformed { line, .. } => Some(*line),
                _ => None,
            },
            detail: self.detail().cloned(),
        }
    }
}

/// Serializable form of a `JsonParseError`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonParseErrorRecord {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ParseFailureDetail>,
}

/// Outcome of the strict-parse stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseLog {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonParseErrorRecord>,
}

/// Composite log of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonPipelineLog {
    pub stream: StreamDecodeLog,
    pub extracted_json: ExtractionLog,
    pub repair: RepairLog,
    pub parse: ParseLog,
}

#[derive(Debug, Clone, Default)]
pub struct JsonPipelineOptions {
    pub budget: RepairBudget,
    /// The provider said its answer came back as a tool call
    pub tool_call_channel: bool,
}

/// Value or error, always with the log and any reassembled tool calls
#[derive(Debug, Clone)]
pub struct JsonPipelineRun {
    pub value: Result<Value, JsonParseError>,
    pub log: JsonPipelineLog,
    pub tool_calls: Vec<AssembledToolCall>,
}

impl JsonPipelineRun {
    pub fn is_ok(&self) -> bool {
        self.value.is_ok()
    }
}

/// Run decode, extract, repair and parse over raw provider output
pub fn run_json_pipeline(raw: &str, options: &JsonPipelineOptions) -> JsonPipelineRun {
    let mut log = JsonPipelineLog::default();

    let decoded = match decode_stream(raw) {
        Ok(decoded) => decoded,
        Err(err) => {
            log.stream.framed = true;
            log.parse = ParseLog {
                ok: false,
                error: Some(err.to_record()),
            };
            return JsonPipelineRun {
                value: Err(err),
                log,
                tool_calls: Vec::new(),
            };
        }
    };

    let tool_calls = assemble_tool_calls(decoded.frames.iter().map(|f| &f.payload));
    log.stream = decoded.log;
    log.stream.tool_call_count = tool_calls.len();

    let text = select_input(&decoded.text, &tool_calls, options.tool_call_channel);

    let (candidate, extraction_log) = extract_candidate(text);
    let candidate_found = extraction_log.found;
    log.extracted_json = extraction_log;

    let (repaired, repair_log) = repair_candidate(&candidate, &options.budget);
    log.repair = repair_log;

    let value = strict_parse(&repaired, candidate_found);
    log.parse = match &value {
        Ok(_) => ParseLog {
            ok: true,
            error: None,
        },
        Err(err) => ParseLog {
            ok: false,
            error: Some(err.to_record()),
        },
    };

    debug!(
        framed = log.stream.framed,
        found = candidate_found,
        repaired = log.repair.changed,
        ok = log.parse.ok,
        "JSON pipeline finished"
    );

    JsonPipelineRun {
        value,
        log,
        tool_calls,
    }
}

/// Pick decoded text or tool-call arguments as pipeline input
fn select_input<'a>(text: &'a str, calls: &'a [AssembledToolCall], tool_channel: bool) -> &'a str {
    let first_args = calls
        .iter()
        .map(|c| c.arguments.as_str())
        .find(|args| !args.trim().is_empty());

    match first_args {
        Some(args) if tool_channel || text.trim().is_empty() => args,
        _ => text,
    }
}

/// The extraction items of a parsed payload.
///
/// Accepts a bare array or an object with an `extractions` array; anything
/// else is a payload-shape failure.
pub fn payload_items(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => map.get("extractions").and_then(Value::as_array),
        _ => None,
    }
}
