//! Two-phase blob upload: existence probes, then bounded concurrent transfer,
//! then the optional manifest push

use crate::blob::{Blob, total_size};
use crate::config::{DEFAULT_UPLOAD_CONCURRENCY, EXISTS_CHECK_CONCURRENCY};
use crate::error::handlers::HttpErrorHandler;
use crate::error::{Result, TransferError};
use crate::registry::client::{challenge_header, redirect_target};
use crate::transfer::body::counting_body;
use crate::transfer::progress::{AttemptProgress, ProgressFn, ProgressTracker};
use crate::transfer::session::Session;
use reqwest::StatusCode;
use std::time::Instant;
use tokio::fs::File;
use url::Url;

/// Where the next PUT of a blob body goes
#[derive(Debug, Clone)]
enum PutTarget {
    /// The registry upload session; `reauthenticated` once a 401 was answered
    Registry { url: Url, reauthenticated: bool },
    /// Pre-authorized CDN endpoint from a 307; never gets the bearer token
    Cdn(Url),
}

pub(crate) struct Uploader {
    session: Session,
    concurrency: usize,
}

impl Uploader {
    pub fn new(session: Session, concurrency: usize) -> Self {
        let concurrency = if concurrency == 0 {
            DEFAULT_UPLOAD_CONCURRENCY
        } else {
            concurrency
        };
        Self {
            session,
            concurrency,
        }
    }

    pub async fn run(
        &self,
        blobs: Vec<Blob>,
        progress: Option<ProgressFn>,
        manifest: Option<(&str, &[u8])>,
    ) -> Result<()> {
        let output = &self.session.output;
        let started = Instant::now();

        if !blobs.is_empty() {
            self.check_local_sources(&blobs).await?;

            // Phase 1: which blobs does the registry still need?
            let needs_upload = self.check_blobs_exist(&blobs).await?;
            let (to_upload, total) = filter_blobs_for_upload(blobs, &needs_upload);

            if to_upload.is_empty() {
                output.detail("All blobs exist, nothing to upload");
            } else {
                // Phase 2: transfer what is missing
                output.info(&format!(
                    "Uploading {} blobs ({}) with {} concurrent connections",
                    to_upload.len(),
                    output.format_size(total),
                    self.concurrency
                ));
                let tracker = ProgressTracker::new(total, progress);
                self.upload_blobs(to_upload, &tracker).await?;
                output.success(&format!(
                    "Uploaded {} in {}",
                    output.format_size(total),
                    output.format_duration(started.elapsed())
                ));
            }
        }

        if let Some((reference, manifest)) = manifest {
            self.push_manifest(reference, manifest).await?;
        }
        Ok(())
    }

    /// Every blob must exist locally with its declared size before anything is sent
    async fn check_local_sources(&self, blobs: &[Blob]) -> Result<()> {
        for blob in blobs {
            let path = self.session.path_of(&blob.digest);
            let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                TransferError::Validation(format!(
                    "cannot read blob {} at {}: {}",
                    blob.digest,
                    path.display(),
                    e
                ))
            })?;
            if metadata.len() != blob.size {
                return Err(TransferError::Validation(format!(
                    "blob {} at {} is {} bytes, expected {}",
                    blob.digest,
                    path.display(),
                    metadata.len(),
                    blob.size
                )));
            }
        }
        Ok(())
    }

    /// HEAD every blob with a wide pool; `true` means the blob must be uploaded
    async fn check_blobs_exist(&self, blobs: &[Blob]) -> Result<Vec<bool>> {
        let session = &self.session;
        // Probes move no payload, the tracker only satisfies the retry runner
        let probe_progress = ProgressTracker::new(0, None);

        let presence = session
            .run_bounded(blobs.iter().collect::<Vec<&Blob>>(), EXISTS_CHECK_CONCURRENCY, |blob| {
                let probe_progress = &probe_progress;
                async move {
                    session
                        .runner()
                        .run(&format!("probe {}", blob.digest), probe_progress, |_| async move {
                            session.registry.blobs().exists(&blob.digest).await
                        })
                        .await
                        .map_err(|e| e.for_blob("existence check", &blob.digest))
                }
            })
            .await?;

        let already = presence.iter().filter(|exists| **exists).count();
        if already > 0 {
            session
                .output
                .detail(&format!("{} of {} blobs already in registry", already, blobs.len()));
        }
        Ok(presence.into_iter().map(|exists| !exists).collect())
    }

    async fn upload_blobs(&self, blobs: Vec<Blob>, tracker: &ProgressTracker) -> Result<()> {
        self.session
            .run_bounded(blobs, self.concurrency, |blob| async move {
                self.upload_blob(&blob, tracker)
                    .await
                    .map_err(|e| e.for_blob("upload", &blob.digest))
            })
            .await?;
        Ok(())
    }

    async fn upload_blob(&self, blob: &Blob, tracker: &ProgressTracker) -> Result<()> {
        let label = format!("upload {}", self.session.output.short_digest(&blob.digest));
        self.session
            .runner()
            .run(&label, tracker, |ledger| self.upload_once(blob, ledger))
            .await
    }

    /// One attempt: init session, then stream the body until it lands
    async fn upload_once(&self, blob: &Blob, ledger: AttemptProgress) -> Result<()> {
        let output = &self.session.output;
        output.debug(&format!(
            "uploading blob {} ({})",
            blob.digest,
            output.format_size(blob.size)
        ));

        let upload_url = self.session.registry.blobs().init_upload(&blob.digest).await?;
        let path = self.session.path_of(&blob.digest);

        let mut target = PutTarget::Registry {
            url: upload_url,
            reauthenticated: false,
        };

        loop {
            // Each send streams the blob from offset 0 through a handle and ledger
            // of its own; the client may keep draining an abandoned body
            let send = ledger.send();
            let body = counting_body(File::open(&path).await?, send.clone());

            target = match target {
                PutTarget::Registry { url, reauthenticated } => {
                    let tokens = self.session.registry.tokens();
                    let token = tokens.current();
                    let response = self
                        .session
                        .registry
                        .blobs()
                        .put(url.clone(), body, blob.size, token.as_deref())
                        .await?;

                    match response.status() {
                        StatusCode::CREATED | StatusCode::ACCEPTED => return Ok(()),
                        StatusCode::UNAUTHORIZED if !reauthenticated => {
                            send.rollback();
                            let challenge = challenge_header(response.headers());
                            tokens.refresh(token.as_deref(), challenge.as_deref()).await?;
                            PutTarget::Registry {
                                url,
                                reauthenticated: true,
                            }
                        }
                        StatusCode::TEMPORARY_REDIRECT => {
                            let cdn = redirect_target(&response)?;
                            let discarded = send.rollback();
                            output.detail(&format!(
                                "Blob {} redirected to {} ({} discarded)",
                                output.short_digest(&blob.digest),
                                cdn.host_str().unwrap_or_default(),
                                output.format_size(discarded.max(0) as u64)
                            ));
                            PutTarget::Cdn(cdn)
                        }
                        _ => return Err(HttpErrorHandler::from_response(response, "blob upload").await),
                    }
                }
                PutTarget::Cdn(url) => {
                    let response = self
                        .session
                        .registry
                        .blobs()
                        .put(url, body, blob.size, None)
                        .await?;
                    return match response.status() {
                        StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
                        _ => Err(HttpErrorHandler::from_response(response, "CDN blob upload").await),
                    };
                }
            };
        }
    }

    async fn push_manifest(&self, reference: &str, manifest: &[u8]) -> Result<()> {
        let session = &self.session;
        let progress = ProgressTracker::new(0, None);
        session
            .runner()
            .run(&format!("manifest {}", reference), &progress, |_| async move {
                session.registry.manifests().push_manifest(reference, manifest).await
            })
            .await
            .map_err(|e| e.for_blob("manifest push", reference))
    }
}

/// Keep the blobs flagged for upload and sum their sizes
fn filter_blobs_for_upload(blobs: Vec<Blob>, needs_upload: &[bool]) -> (Vec<Blob>, u64) {
    let to_upload: Vec<Blob> = blobs
        .into_iter()
        .zip(needs_upload)
        .filter_map(|(blob, needed)| needed.then_some(blob))
        .collect();
    let total = total_size(&to_upload);
    (to_upload, total)
}
