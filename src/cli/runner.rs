//! Push/pull driver behind the `blob-transfer` binary

use crate::blob::{Blob, total_size};
use crate::cli::args::{Args, Command, TargetArgs};
use crate::config::{RegistryConfig, TransferConfig};
use crate::error::{Result, TransferError};
use crate::logging::Logger;
use crate::registry::{BasicAuthTokenSource, ImageManifest, RegistryClient, TokenSource, default_client};
use crate::transfer::{self, DownloadOptions, UploadOptions};
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Progress is reported every this many percent
const PROGRESS_STEP: i64 = 5;

pub struct Runner {
    args: Args,
    output: Logger,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let output = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose)
        };
        Self {
            args,
            output,
            cancel: CancellationToken::new(),
        }
    }

    /// Token the runner passes to every transfer; cancel it to abort
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<()> {
        let start_time = Instant::now();
        let target = self.args.target();
        target.validate()?;
        let registry = target.registry_config()?;
        let client = default_client()?;

        match &self.args.command {
            Command::Push { manifest, .. } => self.push(target, &registry, client, manifest).await?,
            Command::Pull { .. } => self.pull(target, &registry, client).await?,
        }

        self.output.success(&format!(
            "Operation completed successfully in {}",
            self.output.format_duration(start_time.elapsed())
        ));
        Ok(())
    }

    async fn push(
        &self,
        target: &TargetArgs,
        registry: &RegistryConfig,
        client: Client,
        manifest_path: &Path,
    ) -> Result<()> {
        let manifest = tokio::fs::read(manifest_path).await.map_err(|e| {
            TransferError::Validation(format!("cannot read manifest {}: {}", manifest_path.display(), e))
        })?;
        let blobs = ImageManifest::from_slice(&manifest)?.blobs();
        self.report_blobs("push", &blobs);

        let options = UploadOptions::new(registry.address.clone(), target.dir.clone())
            .with_repository(registry.repository.clone())
            .with_blobs(blobs)
            .with_manifest(manifest, target.reference.clone())
            .with_concurrency(target.concurrency)
            .with_token_source(self.token_source(registry, client.clone()))
            .with_client(client)
            .with_logger(self.output.clone())
            .with_cancel(self.cancel.clone())
            .with_config(self.transfer_config(target))
            .with_progress(self.progress_reporter("Uploaded"));

        transfer::upload(options).await
    }

    async fn pull(&self, target: &TargetArgs, registry: &RegistryConfig, client: Client) -> Result<()> {
        let token_source = self.token_source(registry, client.clone());

        let manifest_client = RegistryClient::builder(registry.address.clone())
            .with_repository(registry.repository.clone())
            .with_client(Some(client.clone()))
            .with_token_source(Some(token_source.clone()))
            .with_output(self.output.clone())
            .build()?;
        let (manifest, raw) = manifest_client.manifests().fetch_manifest(&target.reference).await?;
        let blobs = manifest.blobs();
        self.report_blobs("pull", &blobs);

        let options = DownloadOptions::new(registry.address.clone(), target.dir.clone())
            .with_repository(registry.repository.clone())
            .with_blobs(blobs)
            .with_concurrency(target.concurrency)
            .with_token_source(token_source)
            .with_client(client)
            .with_logger(self.output.clone())
            .with_cancel(self.cancel.clone())
            .with_config(self.transfer_config(target))
            .with_progress(self.progress_reporter("Downloaded"));

        transfer::download(options).await?;

        let manifest_file = target.dir.join("manifest.json");
        tokio::fs::write(&manifest_file, raw).await?;
        self.output
            .detail(&format!("Manifest written to {}", manifest_file.display()));
        Ok(())
    }

    fn token_source(&self, registry: &RegistryConfig, client: Client) -> Arc<dyn TokenSource> {
        if registry.has_credentials() {
            self.output.detail("Using provided credentials");
        } else {
            self.output.detail("No credentials provided - attempting anonymous access");
        }
        Arc::new(BasicAuthTokenSource::new(
            client,
            registry.username.clone(),
            registry.password.clone(),
            self.output.clone(),
        ))
    }

    fn transfer_config(&self, target: &TargetArgs) -> TransferConfig {
        TransferConfig::default().with_stall_timeout(Duration::from_secs(target.stall_timeout))
    }

    fn report_blobs(&self, operation: &str, blobs: &[Blob]) {
        let total = total_size(blobs);
        self.output.info(&format!(
            "{} {} blobs ({}) with reference {}",
            operation,
            blobs.len(),
            self.output.format_size(total),
            self.args.target().reference
        ));
    }

    /// Progress callback that logs one line per `PROGRESS_STEP` percent
    fn progress_reporter(&self, verb: &'static str) -> impl Fn(i64, i64) + Send + Sync + 'static {
        let output = self.output.clone();
        let last_step = AtomicI64::new(-1);
        move |completed, total| {
            let Some(percent) = percent_of(completed, total) else {
                return;
            };
            let step = percent / PROGRESS_STEP;
            if last_step.fetch_max(step, Ordering::Relaxed) < step {
                output.info(&format!(
                    "{} {} / {} ({}%)",
                    verb,
                    output.format_size(completed.max(0) as u64),
                    output.format_size(total as u64),
                    percent
                ));
            }
        }
    }
}

fn percent_of(completed: i64, total: i64) -> Option<i64> {
    if total <= 0 {
        return None;
    }
    Some((completed.clamp(0, total) * 100) / total)
}
