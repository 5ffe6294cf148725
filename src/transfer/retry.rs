//! Per-blob retry loop shared by uploads, downloads and existence probes
//!
//! Every attempt gets a fresh [`AttemptProgress`] ledger. Whatever the attempt
//! credited is rolled back before the failure is classified, so no blob is ever
//! counted twice. Classification follows [`FailureClass`]:
//!
//! - cancelled and terminal errors end the loop immediately
//! - stalls retry for free
//! - slow transfers cost an attempt once per `slow_strikes` in a row
//! - everything else costs one attempt
//!
//! Budgeted attempt `n > 0` is preceded by a `backoff_base * 2^(n-1)` sleep that
//! cancellation interrupts.

use crate::config::TransferConfig;
use crate::error::{FailureClass, Result, TransferError};
use crate::logging::Logger;
use crate::transfer::progress::{AttemptProgress, ProgressTracker};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempt accounting for one blob
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_retries: u32,
    slow_strikes: u32,
    attempt: u32,
    slow_streak: u32,
}

impl RetryBudget {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            slow_strikes: config.slow_strikes,
            attempt: 0,
            slow_streak: 0,
        }
    }

    /// Budgeted attempts consumed so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt. Returns `false` once the budget is spent.
    pub fn charge(&mut self, class: FailureClass) -> bool {
        match class {
            FailureClass::Cancelled | FailureClass::Terminal => return false,
            FailureClass::Stalled => self.slow_streak = 0,
            FailureClass::Slow => {
                self.slow_streak += 1;
                if self.slow_streak >= self.slow_strikes {
                    self.slow_streak = 0;
                    self.attempt += 1;
                }
            }
            FailureClass::Transient => {
                self.slow_streak = 0;
                self.attempt += 1;
            }
        }
        self.attempt < self.max_retries
    }
}

/// Sleep for `delay` unless the session is cancelled first
pub async fn backoff(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Stalls retry without limit, so they are only reported in verbose output
fn warns_on_retry(class: FailureClass) -> bool {
    class != FailureClass::Stalled
}

/// Drives attempts of one blob until success, a terminal error or exhaustion
pub struct RetryRunner<'a> {
    config: &'a TransferConfig,
    cancel: &'a CancellationToken,
    logger: &'a Logger,
}

impl<'a> RetryRunner<'a> {
    pub fn new(config: &'a TransferConfig, cancel: &'a CancellationToken, logger: &'a Logger) -> Self {
        Self {
            config,
            cancel,
            logger,
        }
    }

    pub async fn run<T, F, Fut>(&self, label: &str, progress: &ProgressTracker, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut(AttemptProgress) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut budget = RetryBudget::new(self.config);

        loop {
            let attempt = budget.attempt();
            if attempt > 0 {
                let delay = self.config.backoff_delay(attempt);
                self.logger.detail(&format!(
                    "{}: retrying in {} (attempt {}/{})",
                    label,
                    self.logger.format_duration(delay),
                    attempt + 1,
                    self.config.max_retries
                ));
                backoff(self.cancel, delay).await?;
            }

            let ledger = progress.attempt();
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
                result = attempt_fn(ledger.clone()) => result,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            // Compensating action for every failed attempt
            let rolled_back = ledger.rollback();

            let class = err.class();
            match class {
                FailureClass::Cancelled | FailureClass::Terminal => return Err(err),
                _ => {}
            }

            let message = format!(
                "{}: attempt failed ({}){}",
                label,
                err,
                if rolled_back > 0 {
                    format!(", rolled back {}", self.logger.format_size(rolled_back as u64))
                } else {
                    String::new()
                }
            );
            if warns_on_retry(class) {
                self.logger.warning(&message);
            } else {
                self.logger.detail(&message);
            }

            if !budget.charge(class) {
                return Err(TransferError::MaxRetriesExceeded { last: Box::new(err) });
            }
        }
    }
}
