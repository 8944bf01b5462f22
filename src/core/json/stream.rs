//! Streaming-frame decoding.
//!
//! Providers that stream answer with Server-Sent-Events framing:
//!
//! ```text
//! event: message
//! data: {"choices":[{"delta":{"content":"{\"extr"}}]}
//! data: {"choices":[{"delta":{"content":"actions\":[]}"}}]}
//! data: [DONE]
//! ```
//!
//! When no `data:`, `event:`, `id:` or `:` comment line is present the
//! input is passed through untouched. Otherwise every `data:` payload is
//! parsed and its text content concatenated in frame order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JsonParseError;

/// A decoded `data:` payload
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    /// 1-based line number of the `data:` line
    pub line: usize,
    /// Most recent `event:` name, if any
    pub event: Option<String>,
    pub payload: Value,
}

/// Summary of the decode stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDecodeLog {
    pub framed: bool,
    pub frame_count: usize,
    pub fragment_count: usize,
    pub done_seen: bool,
    pub tool_call_count: usize,
}

/// Output of the decode stage
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedStream {
    pub text: String,
    pub frames: Vec<StreamFrame>,
    pub log: StreamDecodeLog,
}

/// Decode SSE-framed provider output, or pass plain text through
pub fn decode_stream(raw: &str) -> Result<DecodedStream, JsonParseError> {
    if !has_frame_markers(raw) {
        return Ok(DecodedStream {
            text: raw.to_string(),
            frames: Vec::new(),
            log: StreamDecodeLog::default(),
        });
    }

    let mut log = StreamDecodeLog {
        framed: true,
        ..Default::default()
    };
    let mut text = String::new();
    let mut frames = Vec::new();
    let mut event: Option<String> = None;

    for (idx, line) in raw.split('\n').enumerate() {
        let line_no = idx + 1;
        let line = line.trim_end_matches('\r').trim_start();

        if line.is_empty() || line.starts_with(':') {
            continue;
        }

        if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
            continue;
        }

        let Some(payload) = line.strip_prefix("data:") else {
            // id:, retry: and unknown fields carry no content
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() {
            continue;
        }
        if payload == "[DONE]" || payload == "DONE" {
            log.done_seen = true;
            continue;
        }

        let value: Value = serde_json::from_str(payload).map_err(|e| {
            JsonParseError::StreamFrameMalformed {
                line: line_no,
                detail: e.to_string(),
            }
        })?;

        if let Some(fragment) = frame_content(&value) {
            text.push_str(&fragment);
            log.fragment_count += 1;
        }
        frames.push(StreamFrame {
            line: line_no,
            event: event.clone(),
            payload: value,
        });
    }

    log.frame_count = frames.len();
    Ok(DecodedStream { text, frames, log })
}

fn has_frame_markers(raw: &str) -> bool {
    raw.lines().any(|line| {
        let line = line.trim_start();
        ["data:", "event:", "id:", ":"]
            .iter()
            .any(|marker| line.starts_with(marker))
    })
}

/// Text content carried by one frame, trying provider shapes in order
pub fn frame_content(value: &Value) -> Option<String> {
    let choice = &value["choices"][0];
    if let Some(content) = choice["delta"]["content"].as_str() {
        return Some(content.to_string());
    }
    if let Some(content) = choice["message"]["content"].as_str() {
        return Some(content.to_string());
    }

    if let Some(parts) = value["candidates"][0]["content"]["parts"].as_array() {
        let texts: Vec<&str> = parts.iter().filter_map(|p| p["text"].as_str()).collect();
        if !texts.is_empty() {
            return Some(texts.concat());
        }
    }

    if value["type"].as_str() == Some("response.output_text.delta") {
        if let Some(delta) = value["delta"].as_str() {
            return Some(delta.to_string());
        }
    }

    ["output_text", "response", "content"]
        .iter()
        .find_map(|key| value[*key].as_str().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passes_through() {
        let raw = "Here is JSON: {\"a\": 1}\nthanks";
        let decoded = decode_stream(raw).unwrap();
        assert_eq!(decoded.text, raw);
        assert!(!decoded.log.framed);
        assert!(decoded.frames.is_empty());
    }

    #[test]
    fn test_openai_deltas_concatenate() {
        let raw = concat!(
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"extractions\\\":\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"[]}\"}}]}\n\n",
            "data: [DONE]\n"
        );
        let decoded = decode_stream(raw).unwrap();
        assert_eq!(decoded.text, "{\"extractions\":[]}");
        assert!(decoded.log.framed);
        assert!(decoded.log.done_seen);
        assert_eq!(decoded.log.frame_count, 3);
        assert_eq!(decoded.log.fragment_count, 2);
    }

    #[test]
    fn test_gemini_parts_and_generic_fields() {
        let raw = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ab\"},{\"text\":\"c\"}]}}]}\n",
            "data: {\"response\":\"d\"}\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"e\"}\n",
            "data: {\"output_text\":\"f\"}\n",
            "data: {\"choices\":[{\"message\":{\"content\":\"g\"}}]}\n",
            "data: DONE\n"
        );
        let decoded = decode_stream(raw).unwrap();
        assert_eq!(decoded.text, "abcdefg");
        assert!(decoded.log.done_seen);
    }

    #[test]
    fn test_event_names_are_attached() {
        let raw = "event: delta\ndata: {\"content\":\"x\"}\nid: 7\n";
        let decoded = decode_stream(raw).unwrap();
        assert_eq!(decoded.frames[0].event.as_deref(), Some("delta"));
        assert_eq!(decoded.frames[0].line, 2);
    }

    #[test]
    fn test_malformed_frame_reports_line() {
        let raw = "data: {\"content\":\"ok\"}\n\ndata: {not json\n";
        let err = decode_stream(raw).unwrap_err();
        assert_eq!(err.to_string(), "Malformed streamed frame at line 3.");
        assert_eq!(err.code(), "stream_frame_malformed");
    }

    #[test]
    fn test_comment_and_id_lines_are_framing() {
        for raw in [": keep-alive\n: ping\n", "id: 1\nid: 2\n"] {
            let decoded = decode_stream(raw).unwrap();
            assert!(decoded.log.framed, "{:?}", raw);
            assert_eq!(decoded.text, "");
            assert!(decoded.frames.is_empty());
        }
    }

    #[test]
    fn test_crlf_framing() {
        let raw = "data: {\"content\":\"a\"}\r\ndata: {\"content\":\"b\"}\r\n";
        assert_eq!(decode_stream(raw).unwrap().text, "ab");
    }
}
