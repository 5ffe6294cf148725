//! Helpers shared by the upload and download integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use registry_blob_transfer::digest::DigestUtils;
use registry_blob_transfer::{AuthChallenge, Blob, ProgressFn, Result, TokenSource, TransferConfig};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Token source that hands out a fixed token and counts exchanges
pub struct CountingTokenSource {
    token: String,
    calls: AtomicUsize,
    pub last_scope: Mutex<Option<String>>,
}

impl CountingTokenSource {
    pub fn new(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            calls: AtomicUsize::new(0),
            last_scope: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for CountingTokenSource {
    async fn token(&self, challenge: &AuthChallenge) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_scope.lock().unwrap() = Some(challenge.scope.clone());
        Ok(self.token.clone())
    }
}

/// Records every `(completed, total)` pair the engine reports
#[derive(Clone, Default)]
pub struct ProgressLog {
    seen: Arc<Mutex<Vec<(i64, i64)>>>,
}

impl ProgressLog {
    pub fn callback(&self) -> impl Fn(i64, i64) + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |completed, total| seen.lock().unwrap().push((completed, total))
    }

    pub fn as_fn(&self) -> ProgressFn {
        Arc::new(self.callback())
    }

    pub fn values(&self) -> Vec<(i64, i64)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<(i64, i64)> {
        self.values().last().copied()
    }

    /// True if `completed` ever went backwards
    pub fn dipped(&self) -> bool {
        self.values().windows(2).any(|w| w[1].0 < w[0].0)
    }
}

/// Retry tuning that keeps tests fast
pub fn fast_config() -> TransferConfig {
    TransferConfig::default()
        .with_backoff_base(Duration::from_millis(5))
        .with_max_retries(3)
}

/// Write `data` into `dir` under the default layout and describe it
pub fn write_blob(dir: &Path, data: &[u8]) -> Blob {
    let digest = DigestUtils::compute_digest(data);
    std::fs::write(dir.join(DigestUtils::to_file_name(&digest)), data).unwrap();
    Blob::new(digest, data.len() as u64)
}

/// Describe `data` without writing it anywhere
pub fn blob_of(data: &[u8]) -> Blob {
    Blob::new(DigestUtils::compute_digest(data), data.len() as u64)
}

pub fn blob_path(digest: &str) -> String {
    format!("/v2/library/_/blobs/{}", digest)
}

pub const UPLOADS_PATH: &str = "/v2/library/_/blobs/uploads/";
