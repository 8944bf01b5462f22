//! Local subprocess provider.
//!
//! Pipes the prompt to an executable on stdin and reads the answer from
//! stdout. The default command is `ollama run {model}`; `{model}` in any
//! argument is replaced with the request's model.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::{Provider, ProviderError, ProviderRequest, ProviderResponse, ProviderRunRecord};

const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// How to invoke the local model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSpec {
    /// Executable to spawn (default: "ollama")
    pub program: String,
    /// Arguments for plain generation
    pub args: Vec<String>,
    /// Extra arguments appended for structured generation
    pub structured_args: Vec<String>,
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            program: "ollama".to_string(),
            args: vec!["run".to_string(), "{model}".to_string()],
            structured_args: vec!["--format".to_string(), "json".to_string()],
        }
    }
}

/// Provider backed by a local command
pub struct CommandProvider {
    spec: CommandSpec,
    default_timeout: Duration,
}

impl Default for CommandProvider {
    fn default() -> Self {
        Self::new(CommandSpec::default())
    }
}

impl CommandProvider {
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn render_args(&self, request: &ProviderRequest, structured: bool) -> Vec<String> {
        let mut args: Vec<String> = self
            .spec
            .args
            .iter()
            .map(|arg| arg.replace("{model}", &request.model))
            .collect();
        if structured {
            args.extend(self.spec.structured_args.iter().cloned());
        }
        args
    }

    /// Spawn the command, feed the prompt and collect stdout
    async fn run(
        &self,
        request: &ProviderRequest,
        structured: bool,
    ) -> Result<ProviderResponse, ProviderError> {
        let request_hash = request
            .request_hash()
            .map_err(|e| ProviderError::permanent(e.to_string()))?;
        let step_timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let args = self.render_args(request, structured);
        let started = Instant::now();

        debug!(program = %self.spec.program, structured, "Spawning provider command");

        let mut child = Command::new(&self.spec.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::permanent(format!(
                    "Failed to spawn '{}': {}",
                    self.spec.program, e
                ))
            })?;

        // Feed stdin while collecting output so neither pipe can stall the
        // other, and keep both under the timeout
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A process that exits without reading stdin is judged by its exit status
                if let Err(e) = stdin.write_all(request.prompt.as_bytes()).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(ProviderError::transient(format!(
                            "Failed to write prompt to stdin: {}",
                            e
                        )));
                    }
                }
                // Drop stdin to signal EOF
            }
            Ok(())
        };
        let exchange = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed?;
            output.map_err(|e| {
                ProviderError::transient(format!("Failed to wait for process: {}", e))
            })
        };

        let output = timeout(step_timeout, exchange).await.map_err(|_| {
            ProviderError::transient(format!(
                "'{}' timed out after {:?}",
                self.spec.program, step_timeout
            ))
        })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(ProviderError::permanent(format!(
                "'{}' failed with exit code {}: {}",
                self.spec.program,
                exit_code,
                stderr.trim()
            )));
        }

        let text = String::from_utf8(output.stdout)
            .map_err(|_| ProviderError::permanent("Provider output is not valid UTF-8"))?;

        Ok(ProviderResponse {
            text,
            output_channel: None,
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
impl Provider for CommandProvider {
    fn name(&self) -> &str {
        "command"
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.run(request, false).await
    }

    async fn generate_structured(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        self.run(request, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandProvider {
        CommandProvider::new(CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            structured_args: vec![],
        })
    }

    #[test]
    fn test_default_spec_renders_model() {
        let provider = CommandProvider::default();
        let request = ProviderRequest::new("llama3", "p");
        assert_eq!(provider.render_args(&request, false), vec!["run", "llama3"]);
        assert_eq!(
            provider.render_args(&request, true),
            vec!["run", "llama3", "--format", "json"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echoes_stdin() {
        let provider = sh("cat");
        let response = provider
            .generate(&ProviderRequest::new("m", "{\"extractions\": []}"))
            .await
            .unwrap();
        assert_eq!(response.text, "{\"extractions\": []}");
        assert_eq!(response.run_record.provider, "command");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_permanent() {
        let provider = sh("echo boom >&2; exit 3");
        let err = provider
            .generate(&ProviderRequest::new("m", "p"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("exit code 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_transient() {
        let provider = sh("sleep 5");
        let request = ProviderRequest::new("m", "p").with_timeout_ms(Some(50));
        let err = provider.generate(&request).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_covers_unread_stdin() {
        // Larger than any pipe buffer, and the child never reads it
        let prompt = "x".repeat(4 * 1024 * 1024);
        let provider = sh("sleep 30");
        let request = ProviderRequest::new("m", prompt).with_timeout_ms(Some(200));

        let started = std::time::Instant::now();
        let err = provider.generate(&request).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_large_prompt_round_trips() {
        let prompt = "y".repeat(1024 * 1024);
        let response = sh("cat")
            .generate(&ProviderRequest::new("m", prompt.clone()))
            .await
            .unwrap();
        assert_eq!(response.text.len(), prompt.len());
    }

    #[tokio::test]
    async fn test_missing_binary_is_permanent() {
        let provider = CommandProvider::new(CommandSpec {
            program: "/nonexistent/groundwork-provider".to_string(),
            ..Default::default()
        });
        let err = provider
            .generate(&ProviderRequest::new("m", "p"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
