//! Extraction programs.
//!
//! A [`Program`] is the normalized, immutable description of what to
//! extract. Normalization of loosely shaped input belongs to the caller; the
//! engine only needs the fields below plus a stable `program_hash`, which it
//! treats as opaque and folds into every shard id and prompt.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::evidence::canonical::canonical_hash;

/// Loosely shaped program definition, as written in a YAML or JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSpec {
    pub instructions: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default)]
    pub examples: Vec<Value>,
}

impl ProgramSpec {
    /// Load a program spec from a YAML or JSON file (YAML is a superset)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read program file: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse program definition")
    }
}

/// A normalized program with its content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    pub instructions: String,
    pub classes: Vec<String>,
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    pub examples: Vec<Value>,
    pub program_hash: String,
}

impl Program {
    /// Normalize a spec: trim the instructions, drop blank and duplicate
    /// classes/constraints (first occurrence wins), then hash the canonical
    /// payload.
    pub fn from_spec(spec: ProgramSpec) -> Result<Self> {
        let instructions = spec.instructions.trim().to_string();
        if instructions.is_empty() {
            anyhow::bail!("Program instructions cannot be empty");
        }

        let payload = ProgramSpec {
            instructions,
            classes: dedup_trimmed(spec.classes),
            constraints: dedup_trimmed(spec.constraints),
            schema: spec.schema,
            examples: spec.examples,
        };
        let program_hash =
            canonical_hash(&payload).context("Failed to canonicalize program payload")?;

        Ok(Self {
            instructions: payload.instructions,
            classes: payload.classes,
            constraints: payload.constraints,
            schema: payload.schema,
            examples: payload.examples,
            program_hash,
        })
    }

    /// Whether the schema constrains output enough to prefer structured generation.
    ///
    /// A schema that only carries annotation keywords does not.
    pub fn has_meaningful_schema(&self) -> bool {
        const ANNOTATION_KEYS: [&str; 4] = ["$schema", "$id", "title", "description"];
        match &self.schema {
            Some(Value::Object(map)) => map
                .keys()
                .any(|key| !ANNOTATION_KEYS.contains(&key.as_str())),
            _ => false,
        }
    }
}

fn dedup_trimmed(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim().to_string();
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
