//! Stall and slow-link detection for streaming downloads

use crate::config::TransferConfig;
use crate::digest::DigestVerifier;
use crate::error::{Result, TransferError};
use crate::transfer::progress::AttemptProgress;
use crate::transfer::speed::SpeedTracker;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, MissedTickBehavior};

/// Health limits for one in-flight transfer
#[derive(Debug, Clone)]
pub struct Watchdog {
    stall_timeout: Duration,
    slow_grace: Duration,
    slow_ratio: f64,
    interval: Duration,
    speeds: SpeedTracker,
}

impl Watchdog {
    pub fn new(config: &TransferConfig, speeds: SpeedTracker) -> Self {
        Self {
            stall_timeout: config.stall_timeout,
            slow_grace: config.slow_grace,
            slow_ratio: config.slow_ratio,
            interval: config.watchdog_interval,
            speeds,
        }
    }

    /// Copy `stream` into `dst`, feeding `verifier` and crediting `ledger`.
    ///
    /// Fails with [`TransferError::Stalled`] when no chunk arrives within the
    /// stall timeout, and with [`TransferError::Slow`] when, after the grace
    /// period, throughput is below the session median times the slow ratio.
    pub async fn copy<S, E, W>(
        &self,
        mut stream: S,
        dst: &mut W,
        verifier: &mut DigestVerifier,
        ledger: &AttemptProgress,
    ) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: Into<TransferError>,
        W: AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let mut last_data = started;
        let mut written: u64 = 0;

        let mut ticker = tokio::time::interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        dst.write_all(&bytes).await?;
                        verifier.update(&bytes);
                        ledger.add(bytes.len() as u64);
                        written += bytes.len() as u64;
                        last_data = Instant::now();
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => {
                        dst.flush().await?;
                        return Ok(written);
                    }
                },
                _ = ticker.tick() => self.check(started, last_data, written)?,
            }
        }
    }

    fn check(&self, started: Instant, last_data: Instant, written: u64) -> Result<()> {
        if last_data.elapsed() >= self.stall_timeout {
            return Err(TransferError::Stalled(self.stall_timeout));
        }

        let elapsed = started.elapsed();
        if elapsed < self.slow_grace {
            return Ok(());
        }
        let threshold = self.speeds.slow_threshold(self.slow_ratio);
        let observed = written as f64 / elapsed.as_secs_f64();
        if threshold > 0.0 && observed < threshold {
            return Err(TransferError::Slow { observed, threshold });
        }
        Ok(())
    }
}
