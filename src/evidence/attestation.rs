//! HMAC attestation of evidence bundles.
//!
//! The signed payload is the canonical JSON of the bundle with its own
//! `attestation` field removed, so attaching or detaching an attestation
//! never changes what it covers. Signatures are hex-encoded HMAC-SHA256 and
//! compared in constant time.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use super::canonical::{to_canonical_json, CanonicalizationError, CANONICALIZATION_ID};
use super::hashing::sha256_str;
use super::types::{Attestation, EvidenceBundle};

pub const ATTESTATION_VERSION: &str = "1";
pub const ATTESTATION_ALGORITHM: &str = "hmac-sha256";

type HmacSha256 = Hmac<Sha256>;

/// Attestation errors
#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("Attestation key is empty")]
    EmptyKey,

    #[error("Invalid attestation key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),
}

/// HMAC secret plus an optional public identifier
#[derive(Clone)]
pub struct AttestationKey {
    secret: Vec<u8>,
    key_id: Option<String>,
}

impl std::fmt::Debug for AttestationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationKey")
            .field("secret", &"<redacted>")
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl AttestationKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, AttestationError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(AttestationError::EmptyKey);
        }
        Ok(Self {
            secret,
            key_id: None,
        })
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = Some(key_id.into());
        self
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    fn mac(&self, payload: &str) -> Result<Vec<u8>, AttestationError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AttestationError::InvalidKey(e.to_string()))?;
        mac.update(payload.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

/// Canonical text of a bundle, excluding its attestation
pub fn canonical_payload(bundle: &EvidenceBundle) -> Result<String, CanonicalizationError> {
    if bundle.attestation.is_none() {
        return to_canonical_json(bundle);
    }
    let mut unsigned = bundle.clone();
    unsigned.attestation = None;
    to_canonical_json(&unsigned)
}

/// Split a bundle into its unsigned form and its attestation
pub fn detach_attestation(mut bundle: EvidenceBundle) -> (EvidenceBundle, Option<Attestation>) {
    let attestation = bundle.attestation.take();
    (bundle, attestation)
}

/// Sign a bundle now
pub fn attest_evidence_bundle(
    bundle: &EvidenceBundle,
    key: &AttestationKey,
) -> Result<EvidenceBundle, AttestationError> {
    attest_evidence_bundle_at(bundle, key, Utc::now())
}

/// Sign a bundle with an explicit timestamp; returns a new attested bundle
pub fn attest_evidence_bundle_at(
    bundle: &EvidenceBundle,
    key: &AttestationKey,
    signed_at: DateTime<Utc>,
) -> Result<EvidenceBundle, AttestationError> {
    let payload = canonical_payload(bundle)?;
    let signature = hex::encode(key.mac(&payload)?);

    let mut attested = bundle.clone();
    attested.attestation = Some(Attestation {
        version: ATTESTATION_VERSION.to_string(),
        canonicalization: CANONICALIZATION_ID.to_string(),
        algorithm: ATTESTATION_ALGORITHM.to_string(),
        key_id: key.key_id.clone(),
        payload_hash: sha256_str(&payload),
        signature,
        signed_at: signed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    });
    Ok(attested)
}

/// Result of verifying an attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Verified {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key_id: Option<String>,
    },
    MissingAttestation,
    UnsupportedAttestationVersion { version: String },
    UnsupportedCanonicalization { canonicalization: String },
    UnsupportedAlgorithm { algorithm: String },
    PayloadHashMismatch { expected: String, actual: String },
    InvalidSignature,
}

impl VerificationOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerificationOutcome::Verified { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationOutcome::Verified { .. } => "verified",
            VerificationOutcome::MissingAttestation => "missing_attestation",
            VerificationOutcome::UnsupportedAttestationVersion { .. } => {
                "unsupported_attestation_version"
            }
            VerificationOutcome::UnsupportedCanonicalization { .. } => {
                "unsupported_canonicalization"
            }
            VerificationOutcome::UnsupportedAlgorithm { .. } => "unsupported_algorithm",
            VerificationOutcome::PayloadHashMismatch { .. } => "payload_hash_mismatch",
            VerificationOutcome::InvalidSignature => "invalid_signature",
        }
    }
}

/// Verify the attestation embedded in a bundle
pub fn verify_evidence_bundle_attestation(
    bundle: &EvidenceBundle,
    key: &AttestationKey,
) -> Result<VerificationOutcome, AttestationError> {
    verify_detached_attestation(bundle, bundle.attestation.as_ref(), key)
}

/// Verify an attestation kept separately from its bundle
pub fn verify_detached_attestation(
    bundle: &EvidenceBundle,
    attestation: Option<&Attestation>,
    key: &AttestationKey,
) -> Result<VerificationOutcome, AttestationError> {
    let Some(attestation) = attestation else {
        return Ok(VerificationOutcome::MissingAttestation);
    };

    if attestation.version != ATTESTATION_VERSION {
        return Ok(VerificationOutcome::UnsupportedAttestationVersion {
            version: attestation.version.clone(),
        });
    }
    if attestation.canonicalization != CANONICALIZATION_ID {
        return Ok(VerificationOutcome::UnsupportedCanonicalization {
            canonicalization: attestation.canonicalization.clone(),
        });
    }
    if attestation.algorithm != ATTESTATION_ALGORITHM {
        return Ok(VerificationOutcome::UnsupportedAlgorithm {
            algorithm: attestation.algorithm.clone(),
        });
    }

    let payload = canonical_payload(bundle)?;
    let actual = sha256_str(&payload);
    if actual != attestation.payload_hash {
        warn!(run_id = %bundle.run_id, "Attestation payload hash mismatch");
        return Ok(VerificationOutcome::PayloadHashMismatch {
            expected: attestation.payload_hash.clone(),
            actual,
        });
    }

    let computed = key.mac(&payload)?;
    let provided = match hex::decode(&attestation.signature) {
        Ok(bytes) => bytes,
        Err(_) => return Ok(VerificationOutcome::InvalidSignature),
    };
    if bool::from(computed.ct_eq(&provided)) {
        Ok(VerificationOutcome::Verified {
            key_id: attestation.key_id.clone(),
        })
    } else {
        warn!(run_id = %bundle.run_id, "Attestation signature verification failed");
        Ok(VerificationOutcome::InvalidSignature)
    }
}
