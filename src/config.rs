//! Configuration for groundwork.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (GROUNDWORK_HOME, GROUNDWORK_ATTESTATION_KEY)
//! 2. Config file (.groundwork/config.yaml)
//! 3. Defaults (~/.groundwork)
//!
//! Config file discovery:
//! - Searches current directory and parents for .groundwork/config.yaml
//! - `paths.home` is relative to the .groundwork/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::CommandSpec;
use crate::core::{EngineSettings, RepairBudget, RetryPolicy, RunBudget, StructuredOutputMode};
use crate::evidence::AttestationKey;

pub const HOME_ENV: &str = "GROUNDWORK_HOME";
pub const DEFAULT_KEY_ENV: &str = "GROUNDWORK_ATTESTATION_KEY";

const CONFIG_DIR: &str = ".groundwork";
const CONFIG_FILE: &str = "config.yaml";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub extraction: Option<ExtractionConfig>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub repair_budget: Option<RepairBudget>,
    #[serde(default)]
    pub attestation: Option<AttestationConfig>,
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .groundwork/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionConfig {
    pub chunk_size: Option<usize>,
    pub overlap: Option<usize>,
    pub structured_output: Option<StructuredOutputMode>,
    pub max_schema_chars: Option<usize>,
    pub repair_pass: Option<bool>,
    pub normalize_newlines: Option<bool>,
    pub deadline_ms: Option<u64>,
    pub max_document_units: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttestationConfig {
    pub key_id: Option<String>,
    /// Environment variable holding the HMAC secret
    pub key_env: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub structured_args: Option<Vec<String>>,
    pub model: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// Attestation key lookup settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttestationSettings {
    pub key_id: Option<String>,
    pub key_env: String,
}

impl Default for AttestationSettings {
    fn default() -> Self {
        Self {
            key_id: None,
            key_env: DEFAULT_KEY_ENV.to_string(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub engine: EngineSettings,
    pub command: CommandSpec,
    pub attestation: AttestationSettings,
}

impl ResolvedConfig {
    /// Directory holding durable checkpoint logs
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.home.join("checkpoints")
    }

    /// Checkpoint log for one run
    pub fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.checkpoints_dir().join(format!("{}.jsonl", run_id))
    }

    /// Read the attestation key from its environment variable, if set
    pub fn attestation_key(&self) -> Result<Option<AttestationKey>> {
        let secret = match std::env::var(&self.attestation.key_env) {
            Ok(secret) if !secret.is_empty() => secret,
            _ => return Ok(None),
        };
        let mut key = AttestationKey::new(secret.into_bytes())
            .with_context(|| format!("Invalid key in {}", self.attestation.key_env))?;
        if let Some(ref key_id) = self.attestation.key_id {
            key = key.with_key_id(key_id.clone());
        }
        Ok(Some(key))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Overlay file settings onto the defaults
fn engine_settings(file: &ConfigFile) -> EngineSettings {
    let mut settings = EngineSettings::default();

    if let Some(ref extraction) = file.extraction {
        if let Some(chunk_size) = extraction.chunk_size {
            settings.chunk_size = chunk_size;
        }
        if let Some(overlap) = extraction.overlap {
            settings.overlap = overlap;
        }
        if let Some(mode) = extraction.structured_output {
            settings.structured_output = mode;
        }
        if let Some(max) = extraction.max_schema_chars {
            settings.max_schema_chars = max;
        }
        if let Some(repair_pass) = extraction.repair_pass {
            settings.repair_pass = repair_pass;
        }
        if let Some(normalize) = extraction.normalize_newlines {
            settings.normalize_newlines = normalize;
        }
        settings.budget = RunBudget {
            deadline_ms: extraction.deadline_ms,
            max_document_units: extraction.max_document_units,
        };
    }
    if let Some(retry) = file.retry {
        settings.retry = retry;
    }
    if let Some(budget) = file.repair_budget {
        settings.repair_budget = budget;
    }
    if let Some(ref provider) = file.provider {
        if let Some(ref model) = provider.model {
            settings.model = model.clone();
        }
        settings.provider_timeout_ms = provider.timeout_ms;
    }

    settings
}

fn command_spec(file: &ConfigFile) -> CommandSpec {
    let mut spec = CommandSpec::default();
    if let Some(ref provider) = file.provider {
        if let Some(ref command) = provider.command {
            spec.program = command.clone();
        }
        if let Some(ref args) = provider.args {
            spec.args = args.clone();
        }
        if let Some(ref structured_args) = provider.structured_args {
            spec.structured_args = structured_args.clone();
        }
    }
    spec
}

/// Build the resolved configuration from an optional file and an environment lookup
fn resolve<E>(default_home: PathBuf, file: Option<(PathBuf, ConfigFile)>, env: E) -> ResolvedConfig
where
    E: Fn(&str) -> Option<String>,
{
    let (config_file, parsed) = match file {
        Some((path, parsed)) => (Some(path), parsed),
        None => (None, ConfigFile::default()),
    };

    let home = if let Some(env_home) = env(HOME_ENV) {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (&parsed.paths.home, &config_file) {
        let config_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let attestation = parsed
        .attestation
        .as_ref()
        .map(|a| AttestationSettings {
            key_id: a.key_id.clone(),
            key_env: a
                .key_env
                .clone()
                .unwrap_or_else(|| DEFAULT_KEY_ENV.to_string()),
        })
        .unwrap_or_default();

    ResolvedConfig {
        home,
        config_file,
        engine: engine_settings(&parsed),
        command: command_spec(&parsed),
        attestation,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let file = match find_config_file() {
        Some(path) => {
            let parsed = load_config_file(&path)?;
            Some((path, parsed))
        }
        None => None,
    };

    Ok(resolve(default_home, file, |name| std::env::var(name).ok()))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
