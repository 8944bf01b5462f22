//! Command-line interface for groundwork.
//!
//! Provides commands for running extractions, previewing shard plans,
//! recovering JSON from raw model output, and signing or verifying
//! evidence bundles.

use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use uuid::Uuid;

use crate::adapters::{CommandProvider, Provider, ReplayFixture, ReplayProvider};
use crate::config;
use crate::core::{
    chunk_document, run_json_pipeline, ChunkOptions, JsonPipelineOptions, JsonlCheckpointStore,
    Orchestrator, RunRequest, StructuredOutputMode,
};
use crate::domain::{Program, ProgramSpec};
use crate::evidence::{attest_evidence_bundle, RunCompletenessKind};

pub mod evidence;

/// groundwork - Grounded extraction engine
#[derive(Parser, Debug)]
#[command(name = "groundwork")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an extraction over a document
    Extract(ExtractArgs),

    /// Print the shard plan for a document
    Chunk {
        /// Document file
        #[arg(short, long)]
        document: PathBuf,

        /// Program file; its hash is part of every shard id
        #[arg(short, long)]
        program: Option<PathBuf>,

        /// Shard size in UTF-16 code units
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Overlap between shards in UTF-16 code units
        #[arg(long)]
        overlap: Option<usize>,

        /// Document id (defaults to the file stem)
        #[arg(long)]
        document_id: Option<String>,
    },

    /// Recover a JSON value from raw model output
    Recover {
        /// Input file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Treat the input as carrying a tool call
        #[arg(long)]
        tool_call: bool,
    },

    /// Sign every bundle in a JSONL file
    Attest {
        /// Bundles to sign
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the signed bundles
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Verify every bundle in a JSONL file
    Verify {
        /// Bundles to verify
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(clap::Args, Debug)]
pub struct ExtractArgs {
    /// Document file
    #[arg(short, long)]
    pub document: PathBuf,

    /// Program file (YAML or JSON)
    #[arg(short, long)]
    pub program: PathBuf,

    /// Document id (defaults to the file stem)
    #[arg(long)]
    pub document_id: Option<String>,

    /// Run id; reuse one with --durable to resume
    #[arg(long)]
    pub run_id: Option<String>,

    /// Answer from a replay fixture instead of the configured command
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// Model name passed to the provider
    #[arg(short, long)]
    pub model: Option<String>,

    /// Structured output mode
    #[arg(long, value_enum)]
    pub structured: Option<StructuredArg>,

    /// Append the bundle to this JSONL file instead of printing it
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Sign the bundle with the configured attestation key
    #[arg(long)]
    pub attest: bool,

    /// Keep checkpoints on disk so reruns with the same run id resume
    #[arg(long)]
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StructuredArg {
    Auto,
    Always,
    Never,
}

impl From<StructuredArg> for StructuredOutputMode {
    fn from(arg: StructuredArg) -> Self {
        match arg {
            StructuredArg::Auto => StructuredOutputMode::Auto,
            StructuredArg::Always => StructuredOutputMode::Always,
            StructuredArg::Never => StructuredOutputMode::Never,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Extract(args) => run_extract(args).await,
            Commands::Chunk {
                document,
                program,
                chunk_size,
                overlap,
                document_id,
            } => show_chunks(&document, program.as_deref(), chunk_size, overlap, document_id),
            Commands::Recover { input, tool_call } => recover(input, tool_call),
            Commands::Attest { input, output } => evidence::execute_attest(&input, &output).await,
            Commands::Verify { input } => evidence::execute_verify(&input).await,
            Commands::Config => show_config(),
        }
    }
}

fn read_file(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}: {}", what, path.display()))
}

fn load_program(path: &Path) -> Result<Program> {
    let spec = ProgramSpec::from_file(path)?;
    Program::from_spec(spec).with_context(|| format!("Invalid program: {}", path.display()))
}

fn default_document_id(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

/// Run the engine and emit one bundle
async fn run_extract(args: ExtractArgs) -> Result<()> {
    let cfg = config::config()?;

    let document = read_file(&args.document, "document")?;
    let program = load_program(&args.program)?;

    let provider: Arc<dyn Provider> = match args.replay {
        Some(ref path) => Arc::new(ReplayProvider::from_fixture(ReplayFixture::from_file(path)?)),
        None => Arc::new(CommandProvider::new(cfg.command.clone())),
    };

    let mut settings = cfg.engine.clone();
    if let Some(model) = args.model {
        settings.model = model;
    }
    if let Some(structured) = args.structured {
        settings.structured_output = structured.into();
    }

    let run_id = args
        .run_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut orchestrator = Orchestrator::new(provider).with_settings(settings);
    if args.durable {
        let path = cfg.checkpoint_path(&run_id);
        let store = JsonlCheckpointStore::open(&path)
            .with_context(|| format!("Failed to open checkpoints: {}", path.display()))?;
        orchestrator = orchestrator.with_checkpoint_store(Arc::new(store));
    }

    let document_id = args
        .document_id
        .unwrap_or_else(|| default_document_id(&args.document));
    let request = RunRequest::new(document_id, document, program).with_run_id(run_id.clone());
    let mut bundle = orchestrator.run_extraction(request).await?;

    if args.attest {
        let key = cfg.attestation_key()?.with_context(|| {
            format!(
                "No attestation key. Set {} to sign bundles",
                cfg.attestation.key_env
            )
        })?;
        bundle = attest_evidence_bundle(&bundle, &key)?;
    }

    let completeness = bundle.diagnostics.run_completeness;
    let extraction_count = bundle.extractions.len();

    match args.output {
        Some(ref path) => evidence::append_bundles(path, std::slice::from_ref(&bundle))?,
        None => print!("{}", evidence::to_jsonl(std::slice::from_ref(&bundle))?),
    }

    eprintln!(
        "\n[Run {}: {} extraction(s), {}/{} shard(s) succeeded]",
        run_id, extraction_count, completeness.succeeded_shards, completeness.total_shards
    );
    if completeness.kind == RunCompletenessKind::CompleteFailure {
        std::process::exit(1);
    }

    Ok(())
}

/// Print the shard plan for a document
fn show_chunks(
    document: &Path,
    program: Option<&Path>,
    chunk_size: Option<usize>,
    overlap: Option<usize>,
    document_id: Option<String>,
) -> Result<()> {
    let cfg = config::config()?;
    let text = read_file(document, "document")?;
    let program_hash = match program {
        Some(path) => load_program(path)?.program_hash,
        None => String::new(),
    };

    let options = ChunkOptions::new(
        document_id.unwrap_or_else(|| default_document_id(document)),
        chunk_size.unwrap_or(cfg.engine.chunk_size),
        overlap.unwrap_or(cfg.engine.overlap),
    );
    let shards = chunk_document(&text, &program_hash, &options)?;

    let plan = json!({
        "documentId": options.document_id,
        "chunkSize": options.chunk_size,
        "overlap": options.overlap,
        "offsetMode": options.offset_mode,
        "shards": shards,
    });
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

/// Run the JSON recovery pipeline over a file or stdin
fn recover(input_file: Option<PathBuf>, tool_call: bool) -> Result<()> {
    let cfg = config::config()?;

    let input = if let Some(path) = input_file {
        read_file(&path, "input file")?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Use --input <file> or pipe to stdin");
    };

    let options = JsonPipelineOptions {
        budget: cfg.engine.repair_budget,
        tool_call_channel: tool_call,
    };
    let run = run_json_pipeline(&input, &options);
    let ok = run.is_ok();

    let report = match run.value {
        Ok(value) => json!({"ok": true, "value": value, "log": run.log, "toolCalls": run.tool_calls}),
        Err(e) => json!({"ok": false, "error": e.to_record(), "log": run.log, "toolCalls": run.tool_calls}),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("groundwork configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Checkpoints:         {}", cfg.checkpoints_dir().display());
    println!();
    println!("Provider command: {} {}", cfg.command.program, cfg.command.args.join(" "));
    println!(
        "Attestation key:  ${} ({})",
        cfg.attestation.key_env,
        cfg.attestation.key_id.as_deref().unwrap_or("no key id")
    );
    println!();
    println!("Engine settings:");
    println!("{}", serde_yaml::to_string(&cfg.engine)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extract_args() {
        let cli = Cli::try_parse_from([
            "groundwork",
            "extract",
            "--document",
            "doc.txt",
            "--program",
            "program.yaml",
            "--replay",
            "fixture.yaml",
            "--structured",
            "never",
            "--durable",
        ])
        .unwrap();

        match cli.command {
            Commands::Extract(args) => {
                assert_eq!(args.document, PathBuf::from("doc.txt"));
                assert_eq!(args.replay, Some(PathBuf::from("fixture.yaml")));
                assert!(matches!(args.structured, Some(StructuredArg::Never)));
                assert!(args.durable);
                assert!(!args.attest);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_verify() {
        let cli = Cli::try_parse_from(["groundwork", "verify", "--input", "b.jsonl"]).unwrap();
        assert!(matches!(cli.command, Commands::Verify { .. }));
    }

    #[test]
    fn test_default_document_id() {
        assert_eq!(default_document_id(Path::new("/tmp/report.txt")), "report");
    }
}
