//! Deterministic repair of near-JSON candidates.
//!
//! Steps run in a fixed order and each records whether it changed anything.
//! No step guesses at content: they only remove bytes that can never be
//! valid JSON (BOM, raw control characters, surrounding prose, trailing
//! commas) or make invalid escapes literal.

use serde::{Deserialize, Serialize};

use super::extract::find_first_json_value;

/// Optional character budgets applied around repair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairBudget {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "max_candidate_chars"
    )]
    pub max_candidate_chars: Option<usize>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "max_repaired_chars"
    )]
    pub max_repaired_chars: Option<usize>,
}

/// One named repair step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairStep {
    pub name: String,
    pub applied: bool,
    pub before_length: usize,
    pub after_length: usize,
}

/// What the budgets did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairBudgetRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_candidate_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_repaired_chars: Option<usize>,
    pub candidate_truncated: bool,
    pub repaired_truncated: bool,
}

/// Record of the repair stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairLog {
    pub steps: Vec<RepairStep>,
    pub changed: bool,
    pub budget: RepairBudgetRecord,
}

pub const STEP_STRIP_BOM: &str = "strip_bom";
pub const STEP_STRIP_CONTROL_CHARS: &str = "strip_control_chars";
pub const STEP_EXTRACT_JSON_VALUE: &str = "extract_json_value";
pub const STEP_FIX_INVALID_ESCAPES: &str = "fix_invalid_escapes";
pub const STEP_REMOVE_TRAILING_COMMAS: &str = "remove_trailing_commas";

/// Run every repair step over `candidate`
pub fn repair_candidate(candidate: &str, budget: &RepairBudget) -> (String, RepairLog) {
    let mut log = RepairLog {
        budget: RepairBudgetRecord {
            max_candidate_chars: budget.max_candidate_chars,
            max_repaired_chars: budget.max_repaired_chars,
            ..Default::default()
        },
        ..Default::default()
    };

    let (mut text, truncated) = truncate_chars(candidate, budget.max_candidate_chars);
    log.budget.candidate_truncated = truncated;
    let input = text.clone();

    let steps: [(&str, fn(&str) -> String); 5] = [
        (STEP_STRIP_BOM, strip_bom),
        (STEP_STRIP_CONTROL_CHARS, strip_control_chars),
        (STEP_EXTRACT_JSON_VALUE, reextract_value),
        (STEP_FIX_INVALID_ESCAPES, fix_invalid_escapes),
        (STEP_REMOVE_TRAILING_COMMAS, remove_trailing_commas),
    ];

    for (name, step) in steps {
        let before_length = text.len();
        let next = step(&text);
        log.steps.push(RepairStep {
            name: name.to_string(),
            applied: next != text,
            before_length,
            after_length: next.len(),
        });
        text = next;
    }

    let (text, truncated) = truncate_chars(&text, budget.max_repaired_chars);
    log.budget.repaired_truncated = truncated;
    log.changed = text != input;

    (text, log)
}

/// Keep at most `limit` whole characters
fn truncate_chars(text: &str, limit: Option<usize>) -> (String, bool) {
    match limit {
        Some(limit) => match text.char_indices().nth(limit) {
            Some((cut, _)) => (text[..cut].to_string(), true),
            None => (text.to_string(), false),
        },
        None => (text.to_string(), false),
    }
}

fn strip_bom(text: &str) -> String {
    text.strip_prefix('\u{FEFF}').unwrap_or(text).to_string()
}

/// Drop 0x00-0x1F except tab, LF and CR
fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|&c| !(c < '\u{20}' && c != '\t' && c != '\n' && c != '\r'))
        .collect()
}

fn reextract_value(text: &str) -> String {
    match find_first_json_value(text) {
        Some(found) => text[found.start..found.end].to_string(),
        None => text.to_string(),
    }
}

/// Make invalid backslash escapes inside string literals literal.
///
/// `\q` becomes `\\q`; `\u` not followed by four hex digits becomes `\\u`.
/// Valid escapes and everything outside strings are left alone.
pub fn fix_invalid_escapes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = false;
                out.push(c);
                i += 1;
            }
            '\\' => match chars.get(i + 1) {
                Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't') => {
                    out.push(c);
                    out.push(chars[i + 1]);
                    i += 2;
                }
                Some('u') if is_unicode_escape(&chars[i + 2..]) => {
                    out.push(c);
                    out.push('u');
                    i += 2;
                }
                _ => {
                    out.push_str("\\\\");
                    i += 1;
                }
            },
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn is_unicode_escape(rest: &[char]) -> bool {
    rest.len() >= 4 && rest[..4].iter().all(|c| c.is_ascii_hexdigit())
}

/// Remove commas directly followed (modulo whitespace) by `]` or `}`.
///
/// String-aware: commas inside string literals are never touched.
pub fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        out.push(c);
    }

    out
}
