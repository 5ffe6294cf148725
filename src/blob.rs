//! Blob descriptors and the digest → local path mapping

use crate::digest::DigestUtils;
use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A content-addressed object to transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blob {
    pub digest: String,
    pub size: u64,
}

impl Blob {
    pub fn new(digest: impl Into<String>, size: u64) -> Self {
        Self {
            digest: digest.into(),
            size,
        }
    }
}

/// Default layout: one file per blob named after its digest, e.g. `sha256-<hex>`
pub fn digest_to_path(digest: &str) -> PathBuf {
    PathBuf::from(DigestUtils::to_file_name(digest))
}

/// Maps a digest to a path relative to the session's blob directory
#[derive(Clone)]
pub struct BlobLayout {
    map: Arc<dyn Fn(&str) -> PathBuf + Send + Sync>,
}

impl BlobLayout {
    pub fn new<F>(map: F) -> Self
    where
        F: Fn(&str) -> PathBuf + Send + Sync + 'static,
    {
        Self { map: Arc::new(map) }
    }

    pub fn path_in(&self, dir: &Path, digest: &str) -> PathBuf {
        dir.join((self.map)(digest))
    }
}

impl Default for BlobLayout {
    fn default() -> Self {
        Self::new(digest_to_path)
    }
}

impl fmt::Debug for BlobLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobLayout").finish_non_exhaustive()
    }
}

/// Reject malformed digests before any request goes out
pub fn validate_blobs(blobs: &[Blob]) -> Result<()> {
    for blob in blobs {
        if !DigestUtils::is_valid_digest(&blob.digest) {
            return Err(TransferError::Validation(format!(
                "invalid blob digest: {}",
                blob.digest
            )));
        }
    }
    Ok(())
}

pub fn total_size(blobs: &[Blob]) -> u64 {
    blobs.iter().map(|b| b.size).sum()
}
