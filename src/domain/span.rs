//! Spans over document text measured in UTF-16 code units.
//!
//! Offsets are UTF-16 code units so they agree with what JavaScript-based
//! consumers of an evidence bundle compute with `String.prototype.slice`.
//! Rust strings are UTF-8, so every slice goes through [`Utf16Text`].

use serde::{Deserialize, Serialize};

/// How span offsets are measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OffsetMode {
    /// Offsets count UTF-16 code units
    #[default]
    Utf16CodeUnit,
}

impl OffsetMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetMode::Utf16CodeUnit => "utf16_code_unit",
        }
    }
}

/// Half-open interval `[char_start, char_end)` over document text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(default)]
    pub offset_mode: OffsetMode,
    pub char_start: usize,
    pub char_end: usize,
}

impl Span {
    pub fn new(char_start: usize, char_end: usize) -> Self {
        Self {
            offset_mode: OffsetMode::Utf16CodeUnit,
            char_start,
            char_end,
        }
    }

    /// Length in code units (zero for inverted spans)
    pub fn len(&self) -> usize {
        self.char_end.saturating_sub(self.char_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A string paired with its UTF-16 encoding for offset-exact slicing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utf16Text {
    units: Vec<u16>,
}

impl Utf16Text {
    pub fn new(text: &str) -> Self {
        Self {
            units: text.encode_utf16().collect(),
        }
    }

    /// Length in UTF-16 code units
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Raw code units of `[start, end)`, `None` if out of range
    pub fn units(&self, start: usize, end: usize) -> Option<&[u16]> {
        if start > end || end > self.units.len() {
            return None;
        }
        Some(&self.units[start..end])
    }

    /// Decoded text of `[start, end)`.
    ///
    /// A boundary that splits a surrogate pair decodes to U+FFFD; callers
    /// that need exact comparison should use [`Utf16Text::matches`].
    pub fn slice(&self, start: usize, end: usize) -> Option<String> {
        self.units(start, end).map(String::from_utf16_lossy)
    }

    /// Whether `[start, end)` is exactly `quote`, compared unit by unit
    pub fn matches(&self, start: usize, end: usize, quote: &str) -> bool {
        match self.units(start, end) {
            Some(units) => units.iter().copied().eq(quote.encode_utf16()),
            None => false,
        }
    }

    /// First offset at which `needle` occurs, in code units
    pub fn find(&self, needle: &str) -> Option<usize> {
        let needle: Vec<u16> = needle.encode_utf16().collect();
        if needle.is_empty() || needle.len() > self.units.len() {
            return None;
        }
        self.units
            .windows(needle.len())
            .position(|window| window == needle.as_slice())
    }
}

/// UTF-16 length of a string without allocating the encoding
pub fn utf16_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}
