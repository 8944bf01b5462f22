//! Document shards.

use serde::{Deserialize, Serialize};

/// A contiguous, possibly overlapping window of document text.
///
/// `start`/`end` are document-global UTF-16 offsets. `shard_id` is a content
/// address over everything that produced the window, so a cached result can
/// only ever be reused for an identical window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentShard {
    pub shard_id: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl DocumentShard {
    /// Length in UTF-16 code units
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}
