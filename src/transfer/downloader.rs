//! Bounded concurrent blob download with stall/slow detection and digest
//! verification

use crate::blob::{Blob, total_size};
use crate::config::DEFAULT_DOWNLOAD_CONCURRENCY;
use crate::digest::DigestVerifier;
use crate::error::{Result, TransferError};
use crate::transfer::progress::{AttemptProgress, ProgressFn, ProgressTracker};
use crate::transfer::session::Session;
use crate::transfer::speed::SpeedTracker;
use crate::transfer::watchdog::Watchdog;
use reqwest::header::CONTENT_LENGTH;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{self, File};

pub(crate) struct Downloader {
    session: Session,
    concurrency: usize,
    speeds: SpeedTracker,
}

impl Downloader {
    pub fn new(session: Session, concurrency: usize) -> Self {
        let concurrency = if concurrency == 0 {
            DEFAULT_DOWNLOAD_CONCURRENCY
        } else {
            concurrency
        };
        Self {
            session,
            concurrency,
            speeds: SpeedTracker::new(),
        }
    }

    pub async fn run(&self, blobs: Vec<Blob>, progress: Option<ProgressFn>) -> Result<()> {
        let output = &self.session.output;
        let started = Instant::now();

        let total = total_size(&blobs);
        let tracker = ProgressTracker::new(total, progress);

        let (missing, present_bytes) = self.filter_downloaded(blobs).await;
        if present_bytes > 0 {
            tracker.add(present_bytes as i64);
        }
        if missing.is_empty() {
            output.detail("All blobs present locally, nothing to download");
            return Ok(());
        }

        let missing_bytes = total - present_bytes;
        output.info(&format!(
            "Downloading {} blobs ({}) with {} concurrent connections",
            missing.len(),
            output.format_size(missing_bytes),
            self.concurrency
        ));

        self.session
            .run_bounded(missing, self.concurrency, |blob| {
                let tracker = &tracker;
                async move {
                    self.download_blob(&blob, tracker)
                        .await
                        .map_err(|e| e.for_blob("download", &blob.digest))
                }
            })
            .await?;

        output.success(&format!(
            "Downloaded {} in {}",
            output.format_size(missing_bytes),
            output.format_duration(started.elapsed())
        ));
        Ok(())
    }

    /// Split off blobs whose destination file already has the declared size;
    /// returns the rest and the byte count of the ones skipped
    async fn filter_downloaded(&self, blobs: Vec<Blob>) -> (Vec<Blob>, u64) {
        let mut missing = Vec::with_capacity(blobs.len());
        let mut present_bytes = 0;
        for blob in blobs {
            let on_disk = fs::metadata(self.session.path_of(&blob.digest)).await;
            if on_disk.is_ok_and(|m| m.is_file() && m.len() == blob.size) {
                self.session.output.trace(&format!(
                    "Blob {} already present, skipping",
                    self.session.output.short_digest(&blob.digest)
                ));
                present_bytes += blob.size;
            } else {
                missing.push(blob);
            }
        }
        (missing, present_bytes)
    }

    async fn download_blob(&self, blob: &Blob, tracker: &ProgressTracker) -> Result<()> {
        let label = format!("download {}", self.session.output.short_digest(&blob.digest));
        let dest = self.session.path_of(&blob.digest);

        // Timed per attempt, so failed attempts and backoff stay out of the median
        let elapsed = self
            .session
            .runner()
            .run(&label, tracker, |ledger| {
                let dest = &dest;
                async move {
                    let started = Instant::now();
                    self.download_once(blob, dest, ledger).await?;
                    Ok::<_, TransferError>(started.elapsed())
                }
            })
            .await?
            .as_secs_f64();

        if elapsed > 0.0 && blob.size > 0 {
            let speed = blob.size as f64 / elapsed;
            self.speeds.record(speed);
            self.session.output.debug(&format!(
                "Blob {} done at {}",
                self.session.output.short_digest(&blob.digest),
                self.session.output.format_speed(speed)
            ));
        }
        Ok(())
    }

    /// One attempt. Writes to a `.partial` sibling and renames on success, so a
    /// file at `dest` is always complete.
    async fn download_once(&self, blob: &Blob, dest: &Path, ledger: AttemptProgress) -> Result<()> {
        let stall_timeout = self.session.config.stall_timeout;
        let response = tokio::time::timeout(stall_timeout, self.session.registry.blobs().get(&blob.digest))
            .await
            .map_err(|_| TransferError::Stalled(stall_timeout))??;

        if let Some(length) = content_length(&response) {
            if length != blob.size {
                return Err(TransferError::SizeMismatch {
                    expected: blob.size,
                    actual: length,
                });
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(dest);
        let result = self.write_verified(blob, response, &partial, &ledger).await;
        if let Err(err) = result {
            let _ = fs::remove_file(&partial).await;
            return Err(err);
        }

        fs::rename(&partial, dest).await?;
        self.session.output.trace(&format!(
            "Blob {} written to {}",
            self.session.output.short_digest(&blob.digest),
            dest.display()
        ));
        Ok(())
    }

    async fn write_verified(
        &self,
        blob: &Blob,
        response: reqwest::Response,
        partial: &Path,
        ledger: &AttemptProgress,
    ) -> Result<()> {
        let mut file = File::create(partial).await?;
        let mut verifier = DigestVerifier::new(&blob.digest);
        let watchdog = Watchdog::new(&self.session.config, self.speeds.clone());

        let written = watchdog
            .copy(Box::pin(response.bytes_stream()), &mut file, &mut verifier, ledger)
            .await?;
        file.sync_all().await?;

        if written != blob.size {
            return Err(TransferError::SizeMismatch {
                expected: blob.size,
                actual: written,
            });
        }
        verifier
            .finish()
            .map_err(|actual| TransferError::DigestMismatch {
                expected: blob.digest.clone(),
                actual,
            })
    }
}

fn content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}
