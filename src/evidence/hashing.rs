//! Content hashing primitives.
//!
//! Every identifier the engine derives (shard ids, program hashes, prompt
//! hashes, request hashes, payload hashes) is a lowercase SHA-256 hex digest.

use sha2::{Digest, Sha256};

/// SHA-256 of a byte slice as 64 lowercase hex characters
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 of a string's UTF-8 bytes
pub fn sha256_str(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Hash an ordered list of fields without ambiguity between field boundaries.
///
/// Each part is length-prefixed, so `["ab", "c"]` and `["a", "bc"]` never
/// collide.
pub fn hash_parts<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref().as_bytes();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_str("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_parts_boundaries() {
        assert_ne!(hash_parts(&["ab", "c"]), hash_parts(&["a", "bc"]));
        assert_eq!(hash_parts(&["x", "y"]), hash_parts(&["x", "y"]));
        assert_eq!(hash_parts(&["x"]).len(), 64);
    }
}
