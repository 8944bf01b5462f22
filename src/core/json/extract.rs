//! Candidate extraction: find the first balanced JSON value in prose.
//!
//! Models wrap JSON in markdown fences, apologies and commentary. The scanner
//! walks the text looking for `{` or `[` and tries to match it to its closer
//! while skipping over string literals (escape-aware), so braces inside
//! strings never unbalance the match.

use serde::{Deserialize, Serialize};

/// Top-level shape of a located JSON value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonKind {
    Object,
    Array,
}

/// Byte range of a balanced value within the scanned text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonMatch {
    pub start: usize,
    pub end: usize,
    pub kind: JsonKind,
}

/// Record of the extraction stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionLog {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<JsonKind>,
    pub source_length: usize,
    pub candidate_length: usize,
}

/// Locate the first syntactically balanced `{...}` or `[...]`
pub fn find_first_json_value(text: &str) -> Option<JsonMatch> {
    let bytes = text.as_bytes();
    let mut from = 0;

    while let Some(offset) = bytes[from..].iter().position(|&b| b == b'{' || b == b'[') {
        let start = from + offset;
        if let Some(end) = match_balanced(bytes, start) {
            let kind = if bytes[start] == b'{' {
                JsonKind::Object
            } else {
                JsonKind::Array
            };
            return Some(JsonMatch { start, end, kind });
        }
        from = start + 1;
    }

    None
}

/// Return the exclusive end of the value opening at `start`, if it balances
fn match_balanced(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}

/// Pick the candidate text for repair and parsing.
///
/// Falls back to the whole text when nothing balances.
pub fn extract_candidate(text: &str) -> (String, ExtractionLog) {
    match find_first_json_value(text) {
        Some(found) => {
            let candidate = text[found.start..found.end].to_string();
            let log = ExtractionLog {
                found: true,
                start: Some(found.start),
                end: Some(found.end),
                kind: Some(found.kind),
                source_length: text.len(),
                candidate_length: candidate.len(),
            };
            (candidate, log)
        }
        None => (
            text.to_string(),
            ExtractionLog {
                found: false,
                start: None,
                end: None,
                kind: None,
                source_length: text.len(),
                candidate_length: text.len(),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_object_in_prose() {
        let text = "Sure! Here you go: {\"a\": [1, 2]} Hope that helps.";
        let found = find_first_json_value(text).unwrap();
        assert_eq!(&text[found.start..found.end], "{\"a\": [1, 2]}");
        assert_eq!(found.kind, JsonKind::Object);
    }

    #[test]
    fn test_markdown_fence() {
        let text = "```json\n[{\"x\": 1}]\n```";
        let found = find_first_json_value(text).unwrap();
        assert_eq!(&text[found.start..found.end], "[{\"x\": 1}]");
        assert_eq!(found.kind, JsonKind::Array);
    }

    #[test]
    fn test_brackets_inside_strings_ignored() {
        let text = r#"{"q": "a } tricky ] \" { string"}"#;
        let found = find_first_json_value(text).unwrap();
        assert_eq!(found.end, text.len());
    }

    #[test]
    fn test_skips_unbalanced_opener() {
        let text = "see [note} then {\"ok\": true}";
        let found = find_first_json_value(text).unwrap();
        assert_eq!(&text[found.start..found.end], "{\"ok\": true}");
    }

    #[test]
    fn test_nothing_balanced() {
        assert!(find_first_json_value("I cannot provide JSON for this request.").is_none());
        assert!(find_first_json_value("{\"open\": 1").is_none());
    }

    #[test]
    fn test_candidate_log() {
        let (candidate, log) = extract_candidate("xx{}yy");
        assert_eq!(candidate, "{}");
        assert!(log.found);
        assert_eq!((log.start, log.end), (Some(2), Some(4)));
        assert_eq!(log.source_length, 6);
        assert_eq!(log.candidate_length, 2);

        let (candidate, log) = extract_candidate("no json");
        assert_eq!(candidate, "no json");
        assert!(!log.found);
        assert_eq!(log.candidate_length, 7);
    }
}
