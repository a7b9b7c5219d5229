//! Integrity hash verification (SRI - Subresource Integrity) for images
//! whose expected digest is pinned by the host program.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Integrity hash in SRI format (e.g., "sha256-abc123...")
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntegrityHash {
    pub algorithm: HashAlgorithm,
    /// Base64-encoded digest
    pub hash: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha384" => Some(HashAlgorithm::Sha384),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Base64 digest of `content`
    pub fn compute(&self, content: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha256 => BASE64.encode(Sha256::digest(content)),
            HashAlgorithm::Sha384 => BASE64.encode(Sha384::digest(content)),
            HashAlgorithm::Sha512 => BASE64.encode(Sha512::digest(content)),
        }
    }
}

impl IntegrityHash {
    /// Parse a single SRI token. With several space-separated tokens, the
    /// first is used.
    pub fn parse(sri: &str) -> Option<Self> {
        let sri = sri.split_whitespace().next()?;
        let (algorithm, hash) = sri.split_once('-')?;
        if hash.is_empty() || hash.contains('-') {
            return None;
        }
        Some(Self {
            algorithm: HashAlgorithm::from_name(algorithm)?,
            hash: hash.to_string(),
        })
    }

    pub fn of(algorithm: HashAlgorithm, content: &[u8]) -> Self {
        Self {
            algorithm,
            hash: algorithm.compute(content),
        }
    }

    pub fn sha256(content: &[u8]) -> Self {
        Self::of(HashAlgorithm::Sha256, content)
    }

    pub fn verify(&self, content: &[u8]) -> bool {
        self.algorithm.compute(content) == self.hash
    }

    pub fn to_sri(&self) -> String {
        format!("{}-{}", self.algorithm.name(), self.hash)
    }
}

/// sha256 SRI string for `content`
pub fn compute_integrity(content: &[u8]) -> String {
    IntegrityHash::sha256(content).to_sri()
}

/// True when any of the space-separated SRI tokens matches `content`.
pub fn verify_integrity(content: &[u8], expected_integrity: &str) -> bool {
    expected_integrity
        .split_whitespace()
        .filter_map(IntegrityHash::parse)
        .any(|integrity| integrity.verify(content))
}
