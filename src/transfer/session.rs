//! State shared by the workers of one upload or download call

use crate::blob::BlobLayout;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::logging::Logger;
use crate::registry::RegistryClient;
use crate::transfer::retry::RetryRunner;
use futures::future::try_join_all;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

pub(crate) struct Session {
    pub registry: RegistryClient,
    pub dir: PathBuf,
    pub layout: BlobLayout,
    pub config: TransferConfig,
    /// Child of the caller's token: cancelled by the caller or by the first
    /// terminal blob failure
    pub cancel: CancellationToken,
    pub output: Logger,
}

impl Session {
    pub fn new(
        registry: RegistryClient,
        dir: &Path,
        layout: BlobLayout,
        config: TransferConfig,
        caller: &CancellationToken,
        output: Logger,
    ) -> Self {
        Self {
            registry,
            dir: dir.to_path_buf(),
            layout,
            config,
            cancel: caller.child_token(),
            output,
        }
    }

    pub fn path_of(&self, digest: &str) -> PathBuf {
        self.layout.path_in(&self.dir, digest)
    }

    pub fn runner(&self) -> RetryRunner<'_> {
        RetryRunner::new(&self.config, &self.cancel, &self.output)
    }

    async fn admit<'s>(&self, semaphore: &'s Semaphore) -> Result<SemaphorePermit<'s>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            permit = semaphore.acquire() => permit.map_err(|_| TransferError::Cancelled),
        }
    }

    /// Run `task` for every item with at most `limit` in flight.
    ///
    /// Results keep the input order. The first terminal failure cancels the
    /// session so siblings stop, and is the error returned.
    pub async fn run_bounded<T, R, F, Fut>(&self, items: Vec<T>, limit: usize, task: F) -> Result<Vec<R>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let semaphore = Semaphore::new(limit.max(1));
        let task = &task;
        let semaphore = &semaphore;

        let workers = items.into_iter().map(|item| async move {
            let _permit = self.admit(semaphore).await?;
            let result = task(item).await;
            if let Err(err) = &result {
                if !err.is_cancelled() {
                    self.cancel.cancel();
                }
            }
            result
        });

        try_join_all(workers).await
    }
}
