//! Run budgets: wall-clock deadline and document size.
//!
//! The deadline is cooperative. It is checked before each not-yet-attempted
//! shard starts; an in-flight provider call is never interrupted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Limits for one extraction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBudget {
    /// Wall-clock deadline for the whole run in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "deadline_ms")]
    pub deadline_ms: Option<u64>,

    /// Largest accepted document, in UTF-16 code units
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "max_document_units"
    )]
    pub max_document_units: Option<usize>,
}

impl RunBudget {
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            deadline_ms: Some(deadline.as_millis() as u64),
            ..Default::default()
        }
    }

    /// Reject documents over the size limit
    pub fn validate_document(&self, document_units: usize) -> Result<(), BudgetViolation> {
        match self.max_document_units {
            Some(limit) if document_units > limit => Err(BudgetViolation::DocumentTooLarge {
                actual: document_units,
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// Check the tracker against the deadline
    pub fn check(&self, tracker: &BudgetTracker) -> Result<(), BudgetViolation> {
        if let Some(limit_ms) = self.deadline_ms {
            let elapsed_ms = tracker.elapsed_ms();
            if elapsed_ms >= limit_ms {
                return Err(BudgetViolation::DeadlineExceeded {
                    elapsed_ms,
                    limit_ms,
                });
            }
        }
        Ok(())
    }
}

/// Tracks progress of a run against its budget
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    /// When the run started (tokio clock, so tests can pause time)
    pub started_at: Instant,

    /// Shards started so far
    pub shards_started: usize,

    /// Shards skipped because the deadline had passed
    pub shards_skipped: usize,
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetTracker {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            shards_started: 0,
            shards_skipped: 0,
        }
    }

    pub fn record_started(&mut self) {
        self.shards_started += 1;
    }

    pub fn record_skipped(&mut self) {
        self.shards_skipped += 1;
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Budget violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetViolation {
    #[error("Run deadline exceeded: {elapsed_ms}ms >= {limit_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64, limit_ms: u64 },

    #[error("Document too large: {actual} > {limit} UTF-16 code units")]
    DocumentTooLarge { actual: usize, limit: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_limits_by_default() {
        let budget = RunBudget::default();
        assert!(budget.validate_document(usize::MAX).is_ok());
        assert!(budget.check(&BudgetTracker::new()).is_ok());
    }

    #[test]
    fn test_document_limit() {
        let budget = RunBudget {
            max_document_units: Some(10),
            ..Default::default()
        };
        assert!(budget.validate_document(10).is_ok());
        assert_eq!(
            budget.validate_document(11),
            Err(BudgetViolation::DocumentTooLarge {
                actual: 11,
                limit: 10
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_with_paused_clock() {
        let budget = RunBudget::with_deadline(Duration::from_millis(100));
        let mut tracker = BudgetTracker::new();
        assert!(budget.check(&tracker).is_ok());
        tracker.record_started();

        tokio::time::advance(Duration::from_millis(100)).await;
        let err = budget.check(&tracker).unwrap_err();
        assert!(matches!(err, BudgetViolation::DeadlineExceeded { limit_ms: 100, .. }));
        assert_eq!(tracker.shards_started, 1);
    }

    #[test]
    fn test_serde_shape() {
        let budget: RunBudget = serde_json::from_str(r#"{"deadlineMs": 50}"#).unwrap();
        assert_eq!(budget.deadline_ms, Some(50));
        assert_eq!(serde_json::to_string(&RunBudget::default()).unwrap(), "{}");
    }
}
