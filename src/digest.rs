//! SHA256 digest utilities for content-addressed blobs
//!
//! Blob digests are `sha256:<64 hex>` strings. This module validates them, computes
//! them incrementally while bytes stream past, and maps them onto file names.

use sha2::{Digest, Sha256};

/// Utilities for working with SHA256 digests
pub struct DigestUtils;

impl DigestUtils {
    /// Compute full digest (with sha256: prefix) from byte data
    pub fn compute_digest(data: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
    }

    /// Validate SHA256 hex string (64 characters, all hex)
    pub fn is_valid_sha256_hex(hex_part: &str) -> bool {
        hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// Validate `algorithm:hex` digest format. Only sha256 content is verifiable,
    /// other algorithms are accepted as opaque keys.
    pub fn is_valid_digest(digest: &str) -> bool {
        match digest.split_once(':') {
            Some(("sha256", hex_part)) => Self::is_valid_sha256_hex(hex_part),
            Some((algorithm, encoded)) => {
                !algorithm.is_empty()
                    && !encoded.is_empty()
                    && algorithm
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
                    && encoded
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || "=_-".contains(c))
            }
            None => false,
        }
    }

    /// Filesystem-safe name for a digest: `sha256:abc` becomes `sha256-abc`
    pub fn to_file_name(digest: &str) -> String {
        digest.replacen(':', "-", 1)
    }
}

/// Incremental hasher fed while a blob streams to disk
pub struct DigestVerifier {
    expected: String,
    hasher: Option<Sha256>,
}

impl DigestVerifier {
    pub fn new(expected: &str) -> Self {
        // Only sha256 content can be checked; anything else passes through
        let hasher = expected.starts_with("sha256:").then(Sha256::new);
        Self {
            expected: expected.to_string(),
            hasher,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
    }

    /// Returns the computed digest when it differs from the expected one
    pub fn finish(self) -> std::result::Result<(), String> {
        match self.hasher {
            Some(hasher) => {
                let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
                if actual == self.expected {
                    Ok(())
                } else {
                    Err(actual)
                }
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn computes_digest_of_empty_input() {
        assert_eq!(DigestUtils::compute_digest(b""), EMPTY);
    }

    #[test]
    fn validates_digest_format() {
        assert!(DigestUtils::is_valid_digest(EMPTY));
        assert!(DigestUtils::is_valid_digest("sha512:abcdef"));
        assert!(!DigestUtils::is_valid_digest("sha256:xyz"));
        assert!(!DigestUtils::is_valid_digest("e3b0c44298fc1c149afbf4c8996fb924"));
        assert!(!DigestUtils::is_valid_digest("sha256:../../etc/passwd"));
    }

    #[test]
    fn file_name_replaces_first_separator() {
        assert_eq!(DigestUtils::to_file_name("sha256:abc"), "sha256-abc");
    }

    #[test]
    fn verifier_reports_actual_digest_on_mismatch() {
        let mut verifier = DigestVerifier::new(EMPTY);
        verifier.update(b"not empty");
        let actual = verifier.finish().unwrap_err();
        assert_eq!(actual, DigestUtils::compute_digest(b"not empty"));

        let mut verifier = DigestVerifier::new(EMPTY);
        verifier.update(b"");
        assert!(verifier.finish().is_ok());
    }
}
