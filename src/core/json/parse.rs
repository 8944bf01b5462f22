//! Strict parsing with positioned diagnostics.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::JsonParseError;

const SNIPPET_RADIUS: usize = 20;

/// Where and why strict parsing failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseFailureDetail {
    pub message: String,
    /// Byte offset of the failure in the parsed text
    pub position: usize,
    pub line: usize,
    pub column: usize,
    /// Up to 20 characters either side of `position`
    pub snippet: String,
    pub input_length: usize,
}

/// Parse `text` as exactly one JSON value.
///
/// `candidate_found` says whether extraction located a balanced value; when
/// it did not, a failure is reported as a missing payload rather than a
/// parse error.
pub fn strict_parse(text: &str, candidate_found: bool) -> Result<Value, JsonParseError> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Ok(value),
        Err(err) => {
            let (line, column) = (err.line(), err.column());
            let position = position_from_line_column(text, line, column);
            let detail = ParseFailureDetail {
                message: err.to_string(),
                position,
                line,
                column,
                snippet: snippet_around(text, position),
                input_length: text.len(),
            };

            if candidate_found && !text.trim().is_empty() {
                Err(JsonParseError::ParseFailed(detail))
            } else {
                Err(JsonParseError::PayloadMissing(detail))
            }
        }
    }
}

/// Byte offset of a 1-based line / column pair, clamped to a char boundary
fn position_from_line_column(text: &str, line: usize, column: usize) -> usize {
    let line_start: usize = text
        .split('\n')
        .take(line.saturating_sub(1))
        .map(|l| l.len() + 1)
        .sum();
    let mut position = (line_start + column.saturating_sub(1)).min(text.len());
    while position > 0 && !text.is_char_boundary(position) {
        position -= 1;
    }
    position
}

fn snippet_around(text: &str, position: usize) -> String {
    let char_index = text[..position].chars().count();
    let first = char_index.saturating_sub(SNIPPET_RADIUS);
    let last = char_index + SNIPPET_RADIUS;
    text.chars().skip(first).take(last - first).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_json() {
        let value = strict_parse("{\"a\": [1]}", true).unwrap();
        assert_eq!(value["a"][0], 1);
    }

    #[test]
    fn test_parse_failure_detail() {
        let text = "{\"a\": 1,\n \"b\": nope}";
        let err = strict_parse(text, true).unwrap_err();
        assert_eq!(err.code(), "json_parse_failed");
        let detail = err.detail().unwrap();
        assert_eq!(detail.line, 2);
        assert!(detail.column > 0);
        assert_eq!(detail.input_length, text.len());
        assert!(detail.snippet.contains("nope") || detail.snippet.contains("\"b\""));
        assert!(detail.position <= text.len());
    }

    #[test]
    fn test_missing_payload() {
        let err = strict_parse("I cannot provide JSON for this request.", false).unwrap_err();
        assert_eq!(err.code(), "json_payload_missing");

        let err = strict_parse("", true).unwrap_err();
        assert_eq!(err.code(), "json_payload_missing");
    }

    #[test]
    fn test_snippet_radius() {
        let text = format!("{}X{}", "a".repeat(50), "b".repeat(50));
        let snippet = snippet_around(&text, 50);
        assert_eq!(snippet.chars().count(), 40);
        assert!(snippet.starts_with(&"a".repeat(20)));
        assert!(snippet.contains('X'));
    }

    #[test]
    fn test_snippet_near_start() {
        let snippet = snippet_around("abcdef", 1);
        assert_eq!(snippet, "abcdef");
    }

    #[test]
    fn test_position_multibyte_safe() {
        let text = "[\"é\", é]";
        let err = strict_parse(text, true).unwrap_err();
        let detail = err.detail().unwrap();
        assert!(text.is_char_boundary(detail.position));
    }
}
