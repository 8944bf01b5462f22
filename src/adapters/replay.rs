//! Deterministic provider double.
//!
//! Answers are looked up by request hash first, then taken from a FIFO
//! sequence, then from a default. Nothing touches the network.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{OutputChannel, Provider, ProviderError, ProviderRequest, ProviderResponse, ProviderRunRecord};

/// A scripted answer: response text, or an error
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_channel: Option<OutputChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplayError>,
}

/// Scripted failure; `status` is classified like an HTTP status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub transient: bool,
    pub message: String,
}

impl ReplayEntry {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(arguments: impl Into<String>) -> Self {
        Self {
            text: Some(arguments.into()),
            output_channel: Some(OutputChannel::ToolCall),
            error: None,
        }
    }

    pub fn http_error(status: u16, message: impl Into<String>) -> Self {
        Self {
            error: Some(ReplayError {
                status: Some(status),
                transient: false,
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    fn to_error(&self) -> Option<ProviderError> {
        let error = self.error.as_ref()?;
        Some(match error.status {
            Some(status) => ProviderError::from_http_status(status, error.message.clone()),
            None if error.transient => ProviderError::transient(error.message.clone()),
            None => ProviderError::permanent(error.message.clone()),
        })
    }
}

/// On-disk fixture for the replay provider (JSON or YAML)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayFixture {
    #[serde(default)]
    pub responses: HashMap<String, ReplayEntry>,
    #[serde(default)]
    pub sequence: Vec<ReplayEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ReplayEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ReplayFixture {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay fixture: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse replay fixture: {}", path.display()))
    }
}

/// Provider double keyed by request hash
#[derive(Debug, Default)]
pub struct ReplayProvider {
    by_hash: HashMap<String, ReplayEntry>,
    sequence: Mutex<VecDeque<ReplayEntry>>,
    default: Option<ReplayEntry>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    structured_calls: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ReplayProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every request not otherwise scripted with `text`
    pub fn always(text: impl Into<String>) -> Self {
        Self::new().with_default(ReplayEntry::text(text))
    }

    pub fn from_fixture(fixture: ReplayFixture) -> Self {
        Self {
            by_hash: fixture.responses,
            sequence: Mutex::new(fixture.sequence.into()),
            default: fixture.default,
            latency: fixture.latency_ms.map(Duration::from_millis),
            ..Default::default()
        }
    }

    pub fn with_response(mut self, request_hash: impl Into<String>, entry: ReplayEntry) -> Self {
        self.by_hash.insert(request_hash.into(), entry);
        self
    }

    pub fn with_sequence(self, entries: impl IntoIterator<Item = ReplayEntry>) -> Self {
        self.sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(entries);
        self
    }

    pub fn with_default(mut self, entry: ReplayEntry) -> Self {
        self.default = Some(entry);
        self
    }

    /// Simulated latency, slept on the tokio clock
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn structured_call_count(&self) -> usize {
        self.structured_calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn resolve(&self, request_hash: &str) -> Option<ReplayEntry> {
        if let Some(entry) = self.by_hash.get(request_hash) {
            return Some(entry.clone());
        }
        let next = self
            .sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        next.or_else(|| self.default.clone())
    }

    async fn answer(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let started = Instant::now();
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        let request_hash = request
            .request_hash()
            .map_err(|e| ProviderError::permanent(e.to_string()))?;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let entry = self.resolve(&request_hash).ok_or_else(|| {
            ProviderError::permanent(format!("No replay response for request {}", request_hash))
        })?;
        if let Some(error) = entry.to_error() {
            return Err(error);
        }

        Ok(ProviderResponse {
            text: entry.text.unwrap_or_default(),
            output_channel: entry.output_channel,
            run_record: ProviderRunRecord {
                provider: self.name().to_string(),
                model: request.model.clone(),
                latency_ms: started.elapsed().as_millis() as u64,
                retries: 0,
                request_hash,
            },
        })
    }
}

#[async_trait]
impl Provider for ReplayProvider {
    fn name(&self) -> &str {
        "replay"
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.answer(request).await
    }

    async fn generate_structured(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        self.structured_calls.fetch_add(1, Ordering::SeqCst);
        self.answer(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_then_sequence_then_default() {
        let keyed = ProviderRequest::new("m", "keyed");
        let provider = ReplayProvider::new()
            .with_response(keyed.request_hash().unwrap(), ReplayEntry::text("by-hash"))
            .with_sequence([ReplayEntry::text("first"), ReplayEntry::text("second")])
            .with_default(ReplayEntry::text("fallback"));

        let other = ProviderRequest::new("m", "other");
        assert_eq!(provider.generate(&keyed).await.unwrap().text, "by-hash");
        assert_eq!(provider.generate(&other).await.unwrap().text, "first");
        assert_eq!(provider.generate(&keyed).await.unwrap().text, "by-hash");
        assert_eq!(provider.generate(&other).await.unwrap().text, "second");
        assert_eq!(provider.generate(&other).await.unwrap().text, "fallback");
        assert_eq!(provider.call_count(), 5);
        assert_eq!(provider.requests().len(), 5);
    }

    #[tokio::test]
    async fn test_unscripted_request_is_permanent_error() {
        let provider = ReplayProvider::new();
        let err = provider
            .generate(&ProviderRequest::new("m", "p"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_scripted_errors() {
        let provider = ReplayProvider::new().with_sequence([
            ReplayEntry::http_error(503, "busy"),
            ReplayEntry::http_error(401, "denied"),
        ]);
        let request = ProviderRequest::new("m", "p");
        assert!(provider.generate(&request).await.unwrap_err().is_transient());
        assert!(!provider.generate(&request).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_run_record_and_structured_count() {
        let provider = ReplayProvider::always("{}");
        let request = ProviderRequest::new("model-x", "p");
        let response = provider.generate_structured(&request).await.unwrap();
        assert_eq!(response.run_record.provider, "replay");
        assert_eq!(response.run_record.model, "model-x");
        assert_eq!(response.run_record.request_hash, request.request_hash().unwrap());
        assert_eq!(provider.structured_call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_uses_tokio_clock() {
        let provider = ReplayProvider::always("{}").with_latency(Duration::from_millis(250));
        let response = provider
            .generate(&ProviderRequest::new("m", "p"))
            .await
            .unwrap();
        assert_eq!(response.run_record.latency_ms, 250);
    }

    #[test]
    fn test_fixture_parsing() {
        let fixture: ReplayFixture = serde_yaml::from_str(
            "sequence:\n  - text: '{\"extractions\": []}'\n  - error: {status: 429, message: slow}\ndefault:\n  text: nope\nlatencyMs: 5\n",
        )
        .unwrap();
        assert_eq!(fixture.sequence.len(), 2);
        assert_eq!(fixture.latency_ms, Some(5));
        let provider = ReplayProvider::from_fixture(fixture);
        assert_eq!(provider.default.as_ref().and_then(|d| d.text.as_deref()), Some("nope"));
    }
}
