//! Concurrent blob transfer between a local directory and a registry
//!
//! [`upload`] and [`download`] each build a session from their options, run
//! every blob on a bounded worker pool with classified retries, and report
//! aggregate progress through the optional callback. Both return `Ok(())`
//! only once every requested blob has landed.

mod body;
mod downloader;
pub mod progress;
pub mod retry;
mod session;
pub mod speed;
mod uploader;
pub mod watchdog;

pub use progress::{AttemptProgress, ProgressFn, ProgressTracker};
pub use retry::{RetryBudget, RetryRunner};
pub use speed::SpeedTracker;
pub use watchdog::Watchdog;

use crate::blob::{Blob, BlobLayout, validate_blobs};
use crate::config::{DEFAULT_REPOSITORY, TransferConfig};
use crate::error::{Result, TransferError};
use crate::logging::Logger;
use crate::registry::{RegistryClient, TokenSource};
use downloader::Downloader;
use reqwest::Client;
use session::Session;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uploader::Uploader;

/// Settings shared by both directions
#[derive(Clone)]
struct Common {
    base_url: String,
    repository: String,
    blobs: Vec<Blob>,
    concurrency: usize,
    token: Option<String>,
    token_source: Option<Arc<dyn TokenSource>>,
    progress: Option<ProgressFn>,
    client: Option<Client>,
    logger: Logger,
    layout: BlobLayout,
    cancel: CancellationToken,
    config: TransferConfig,
}

impl Common {
    fn new(base_url: String) -> Self {
        Self {
            base_url,
            repository: DEFAULT_REPOSITORY.to_string(),
            blobs: Vec::new(),
            concurrency: 0,
            token: None,
            token_source: None,
            progress: None,
            client: None,
            logger: Logger::default(),
            layout: BlobLayout::default(),
            cancel: CancellationToken::new(),
            config: TransferConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(TransferError::Validation("base URL is required".into()));
        }
        validate_blobs(&self.blobs)?;
        self.config.validate()
    }

    fn registry(&self) -> Result<RegistryClient> {
        RegistryClient::builder(self.base_url.clone())
            .with_repository(self.repository.clone())
            .with_client(self.client.clone())
            .with_auth_token(self.token.clone())
            .with_token_source(self.token_source.clone())
            .with_user_agent(self.config.user_agent.clone())
            .with_output(self.logger.clone())
            .build()
    }

    fn session(&self, dir: &Path) -> Result<Session> {
        Ok(Session::new(
            self.registry()?,
            dir,
            self.layout.clone(),
            self.config.clone(),
            &self.cancel,
            self.logger.clone(),
        ))
    }
}

macro_rules! common_builders {
    ($options:ty) => {
        impl $options {
            /// Repository path; empty keeps the default `library/_`
            pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
                let repository = repository.into();
                if !repository.is_empty() {
                    self.common.repository = repository;
                }
                self
            }

            pub fn with_blobs(mut self, blobs: Vec<Blob>) -> Self {
                self.common.blobs = blobs;
                self
            }

            /// Maximum concurrent transfers; 0 uses the direction's default
            pub fn with_concurrency(mut self, concurrency: usize) -> Self {
                self.common.concurrency = concurrency;
                self
            }

            /// Initial bearer token
            pub fn with_token(mut self, token: impl Into<String>) -> Self {
                self.common.token = Some(token.into());
                self
            }

            /// Exchange callback invoked on 401
            pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
                self.common.token_source = Some(source);
                self
            }

            /// Called with `(completed, total)` bytes whenever progress moves
            pub fn with_progress<F>(mut self, callback: F) -> Self
            where
                F: Fn(i64, i64) + Send + Sync + 'static,
            {
                self.common.progress = Some(Arc::new(callback));
                self
            }

            /// HTTP client to use. It must not follow redirects on its own.
            pub fn with_client(mut self, client: Client) -> Self {
                self.common.client = Some(client);
                self
            }

            pub fn with_logger(mut self, logger: Logger) -> Self {
                self.common.logger = logger;
                self
            }

            pub fn with_layout(mut self, layout: BlobLayout) -> Self {
                self.common.layout = layout;
                self
            }

            pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
                self.common.cancel = cancel;
                self
            }

            pub fn with_config(mut self, config: TransferConfig) -> Self {
                self.common.config = config;
                self
            }

            pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
                self.common.config.stall_timeout = timeout;
                self
            }
        }
    };
}

/// Options for [`upload`]
#[derive(Clone)]
pub struct UploadOptions {
    common: Common,
    src_dir: PathBuf,
    manifest: Vec<u8>,
    manifest_ref: String,
}

impl UploadOptions {
    pub fn new(base_url: impl Into<String>, src_dir: impl Into<PathBuf>) -> Self {
        Self {
            common: Common::new(base_url.into()),
            src_dir: src_dir.into(),
            manifest: Vec::new(),
            manifest_ref: String::new(),
        }
    }

    /// Manifest to push under `reference` once every blob is in the registry
    pub fn with_manifest(mut self, manifest: impl Into<Vec<u8>>, reference: impl Into<String>) -> Self {
        self.manifest = manifest.into();
        self.manifest_ref = reference.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.common.validate()?;
        if self.manifest.is_empty() != self.manifest_ref.is_empty() {
            return Err(TransferError::Validation(
                "manifest and manifest reference must be given together".into(),
            ));
        }
        Ok(())
    }
}

common_builders!(UploadOptions);

/// Options for [`download`]
#[derive(Clone)]
pub struct DownloadOptions {
    common: Common,
    dest_dir: PathBuf,
}

impl DownloadOptions {
    pub fn new(base_url: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            common: Common::new(base_url.into()),
            dest_dir: dest_dir.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.common.validate()
    }
}

common_builders!(DownloadOptions);

/// Upload every blob the registry does not already have, then push the
/// manifest if one was given.
pub async fn upload(options: UploadOptions) -> Result<()> {
    options.validate()?;
    let UploadOptions {
        common,
        src_dir,
        manifest,
        manifest_ref,
    } = options;

    let session = common.session(&src_dir)?;
    session.output.section(&format!(
        "Upload {} blobs to {}/{}",
        common.blobs.len(),
        common.base_url,
        session.registry.repository()
    ));

    let manifest_push = (!manifest.is_empty()).then(|| (manifest_ref.as_str(), manifest.as_slice()));
    Uploader::new(session, common.concurrency)
        .run(common.blobs, common.progress, manifest_push)
        .await
}

/// Download every blob not already present at its declared size.
pub async fn download(options: DownloadOptions) -> Result<()> {
    options.validate()?;
    let DownloadOptions { common, dest_dir } = options;

    let session = common.session(&dest_dir)?;
    session.output.section(&format!(
        "Download {} blobs from {}/{}",
        common.blobs.len(),
        common.base_url,
        session.registry.repository()
    ));

    Downloader::new(session, common.concurrency)
        .run(common.blobs, common.progress)
        .await
}
