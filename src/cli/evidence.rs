//! Bundle file subcommands.
//!
//! Provides:
//! - `attest`: sign every bundle in a JSONL file
//! - `verify`: check every bundle's attestation
//! - appending bundles to a shared JSONL file under an exclusive lock

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::config;
use crate::evidence::{
    attest_evidence_bundle, decode_jsonl_reader, encode_evidence_bundles_to_jsonl,
    verify_evidence_bundle_attestation, AttestationKey, EvidenceBundle,
};

/// Render bundles as canonical JSONL
pub fn to_jsonl(bundles: &[EvidenceBundle]) -> Result<String> {
    encode_evidence_bundles_to_jsonl(bundles).context("Failed to encode bundles")
}

/// Append bundles to a JSONL file
pub fn append_bundles(path: &Path, bundles: &[EvidenceBundle]) -> Result<()> {
    let text = to_jsonl(bundles)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open bundle file: {}", path.display()))?;

    // Concurrent writers must not interleave lines
    file.lock_exclusive()
        .with_context(|| format!("Failed to lock bundle file: {}", path.display()))?;
    file.write_all(text.as_bytes())
        .context("Failed to write bundles")?;
    file.flush().context("Failed to flush bundles")?;

    // Lock is released when file is dropped
    Ok(())
}

/// Read every bundle from a JSONL file
pub async fn read_bundles(path: &Path) -> Result<Vec<EvidenceBundle>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open bundle file: {}", path.display()))?;
    decode_jsonl_reader(file)
        .await
        .with_context(|| format!("Failed to decode bundles: {}", path.display()))
}

fn require_key() -> Result<AttestationKey> {
    let cfg = config::config()?;
    cfg.attestation_key()?.with_context(|| {
        format!(
            "No attestation key. Set {} to sign or verify bundles",
            cfg.attestation.key_env
        )
    })
}

/// Sign every bundle in `input` and write them to `output`
pub async fn execute_attest(input: &Path, output: &Path) -> Result<()> {
    let key = require_key()?;
    let bundles = read_bundles(input).await?;

    let signed = bundles
        .iter()
        .map(|bundle| attest_evidence_bundle(bundle, &key))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to sign bundles")?;

    tokio::fs::write(output, to_jsonl(&signed)?)
        .await
        .with_context(|| format!("Failed to write bundles: {}", output.display()))?;

    eprintln!("Signed {} bundle(s) -> {}", signed.len(), output.display());
    Ok(())
}

/// Verify every bundle in `input`; exits non-zero if any fails
pub async fn execute_verify(input: &Path) -> Result<()> {
    let key = require_key()?;
    let bundles = read_bundles(input).await?;

    let mut failed = 0;
    for (index, bundle) in bundles.iter().enumerate() {
        let outcome = verify_evidence_bundle_attestation(bundle, &key)
            .with_context(|| format!("Failed to verify bundle {}", index + 1))?;
        if outcome.is_verified() {
            println!("✓ {} (run {})", outcome.as_str(), bundle.run_id);
        } else {
            failed += 1;
            println!("✗ {} (run {})", outcome.as_str(), bundle.run_id);
        }
    }

    println!();
    println!("{} verified, {} failed", bundles.len() - failed, failed);

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
