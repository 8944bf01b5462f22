//! Grounded extractions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::span::Span;

/// How the model claims the extraction is supported by the text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Grounding {
    /// The quote states the extraction directly
    #[default]
    Explicit,
    /// The extraction is inferred from the quoted text
    Inferred,
}

/// A single extraction tied to a verbatim quote of the source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extraction {
    pub extraction_class: String,
    pub quote: String,
    pub span: Span,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub grounding: Grounding,
}

impl Extraction {
    pub fn new(extraction_class: impl Into<String>, quote: impl Into<String>, span: Span) -> Self {
        Self {
            extraction_class: extraction_class.into(),
            quote: quote.into(),
            span,
            attributes: None,
            grounding: Grounding::Explicit,
        }
    }

    pub fn with_grounding(mut self, grounding: Grounding) -> Self {
        self.grounding = grounding;
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, Value>) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Identity used when collapsing duplicates seen by overlapping shards
    pub fn dedup_key(&self) -> (String, String, usize, usize) {
        (
            self.extraction_class.clone(),
            self.quote.clone(),
            self.span.char_start,
            self.span.char_end,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_round_trip() {
        let json = r#"{
            "extractionClass": "token",
            "quote": "Beta",
            "span": {"offsetMode": "utf16_code_unit", "charStart": 6, "charEnd": 10},
            "grounding": "explicit"
        }"#;
        let extraction: Extraction = serde_json::from_str(json).unwrap();
        assert_eq!(extraction.extraction_class, "token");
        assert_eq!(extraction.span, Span::new(6, 10));
        assert!(extraction.attributes.is_none());

        let value = serde_json::to_value(&extraction).unwrap();
        assert!(value.get("attributes").is_none());
        assert_eq!(value["grounding"], "explicit");
    }

    #[test]
    fn test_grounding_defaults_to_explicit() {
        let json = r#"{"extractionClass":"c","quote":"q","span":{"charStart":0,"charEnd":1}}"#;
        let extraction: Extraction = serde_json::from_str(json).unwrap();
        assert_eq!(extraction.grounding, Grounding::Explicit);
    }
}
