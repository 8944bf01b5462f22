//! Key-order-independent canonical JSON.
//!
//! Object keys are sorted at every nesting level by UTF-16 code units (the
//! order JavaScript's default sort produces), array order is preserved, and
//! no insignificant whitespace is emitted. Two values that differ only in key
//! insertion order therefore render to identical bytes, which is what makes
//! payload hashes and signatures stable.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::hashing::sha256_str;

/// Identifier recorded in attestations produced over this rendering
pub const CANONICALIZATION_ID: &str = "json-sorted-keys-v1";

/// Canonicalization errors
#[derive(Debug, Error)]
pub enum CanonicalizationError {
    #[error("Non-finite number at {path}")]
    NonFiniteNumber { path: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Render a JSON value canonically
pub fn canonical_json(value: &Value) -> Result<String, CanonicalizationError> {
    let mut out = String::new();
    write_value(&mut out, value, "$")?;
    Ok(out)
}

/// Serialize any value and render it canonically.
///
/// `None` fields marked `skip_serializing_if` are absent from the output,
/// matching how the same bundle would look after a JSON round trip.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalizationError> {
    let value = serde_json::to_value(value)?;
    canonical_json(&value)
}

/// SHA-256 hex digest of the canonical rendering
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalizationError> {
    Ok(sha256_str(&to_canonical_json(value)?))
}

fn write_value(out: &mut String, value: &Value, path: &str) -> Result<(), CanonicalizationError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(CanonicalizationError::NonFiniteNumber {
                        path: path.to_string(),
                    });
                }
            }
            out.push_str(&n.to_string());
        }
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item, &format!("{}[{}]", path, i))?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_value(out, &map[key.as_str()], &format!("{}.{}", path, key))?;
            }
            out.push('}');
        }
    }
    Ok(())
}
