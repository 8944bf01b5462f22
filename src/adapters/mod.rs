//! Provider interfaces for model backends.
//!
//! Providers are a closed capability: plain `generate` and
//! `generate_structured`, the latter used when the program schema actually
//! constrains output. Dispatch is through `Arc<dyn Provider>`.

pub mod command;
pub mod replay;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::evidence::canonical::{canonical_hash, CanonicalizationError};

pub use command::{CommandProvider, CommandSpec};
pub use replay::{ReplayEntry, ReplayFixture, ReplayProvider};

/// One generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            schema: None,
            metadata: None,
            timeout_ms: None,
        }
    }

    pub fn with_schema(mut self, schema: Option<Value>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// SHA-256 of the canonical JSON form of the request
    pub fn request_hash(&self) -> Result<String, CanonicalizationError> {
        canonical_hash(self)
    }
}

/// Channel the answer arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    Text,
    ToolCall,
}

/// Provenance of one provider call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRunRecord {
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub retries: u32,
    pub request_hash: String,
}

/// Raw provider answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_channel: Option<OutputChannel>,
    pub run_record: ProviderRunRecord,
}

/// Provider failures, classified for retry eligibility only
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Transient provider error{}: {message}", status_suffix(.status))]
    Transient { message: String, status: Option<u16> },

    #[error("Permanent provider error{}: {message}", status_suffix(.status))]
    Permanent { message: String, status: Option<u16> },
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient {
            message: message.into(),
            status: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            message: message.into(),
            status: None,
        }
    }

    /// 408, 429 and 5xx are transient; every other status is permanent
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 408 || status == 429 || (500..=599).contains(&status) {
            ProviderError::Transient {
                message,
                status: Some(status),
            }
        } else {
            ProviderError::Permanent {
                message,
                status: Some(status),
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Transient { status, .. } | ProviderError::Permanent { status, .. } => {
                *status
            }
        }
    }
}

/// A model backend
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Free-form generation
    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Schema-constrained generation; backends without one fall back to `generate`
    async fn generate_structured(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        self.generate(request).await
    }
}
