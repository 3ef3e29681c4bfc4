//! Hashing for change detection and idempotency tokens.
//!
//! All hashes are SHA-256 over a canonical JSON rendering. Maps are ordered
//! (`BTreeMap`), so identical inputs always produce identical digests.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::graph::Attributes;

use super::spec::DeployConfig;

/// Hasher for computing configuration and attribute hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire deployment configuration.
    #[must_use]
    pub fn hash_config(&self, config: &DeployConfig) -> String {
        digest_json(config)
    }

    /// Computes a hash of resolved node attributes.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &Attributes) -> String {
        digest_json(attributes)
    }

    /// Derives a provider client token.
    ///
    /// Cloud Control accepts tokens of at most 128 characters matching
    /// `[-A-Za-z0-9]+`; a hex digest of 64 characters fits.
    #[must_use]
    pub fn client_token(&self, parts: &[&str]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn digest_json<T: Serialize + ?Sized>(value: &T) -> String {
    // Serializing plain data structures to JSON cannot fail.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
