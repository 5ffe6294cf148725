//! Configuration for transfer sessions: defaults, tuning knobs and env loading

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Concurrent blob uploads per session when the caller does not say otherwise
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 32;

/// Concurrent blob downloads per session when the caller does not say otherwise
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 64;

/// Existence probes are latency-bound, so they get a much wider pool
pub const EXISTS_CHECK_CONCURRENCY: usize = 128;

/// Budgeted attempts per blob (stalls are not counted)
pub const MAX_RETRIES: u32 = 6;

pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_USER_AGENT: &str = concat!("registry-blob-transfer/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_REPOSITORY: &str = "library/_";

/// Retry, health-detection and identification settings shared by both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub max_retries: u32,
    /// First backoff delay; doubles with every budgeted attempt
    pub backoff_base: Duration,
    pub stall_timeout: Duration,
    /// A transfer is slow when it runs below `median * slow_ratio`
    pub slow_ratio: f64,
    /// How long an attempt runs before slow detection kicks in
    pub slow_grace: Duration,
    /// Consecutive slow observations that cost one attempt
    pub slow_strikes: u32,
    /// How often the watchdog samples an in-flight download
    pub watchdog_interval: Duration,
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff_base: Duration::from_secs(1),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            slow_ratio: 0.1,
            slow_grace: Duration::from_secs(5),
            slow_strikes: 3,
            watchdog_interval: Duration::from_secs(1),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl TransferConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_slow_ratio(mut self, ratio: f64) -> Self {
        self.slow_ratio = ratio;
        self
    }

    pub fn with_slow_grace(mut self, grace: Duration) -> Self {
        self.slow_grace = grace;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Delay before budgeted attempt `attempt` (0 means no delay)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        self.backoff_base
            .saturating_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(TransferError::Validation(
                "max_retries must be greater than 0".to_string(),
            ));
        }
        if self.stall_timeout.is_zero() {
            return Err(TransferError::Validation(
                "stall_timeout must be greater than 0".to_string(),
            ));
        }
        if self.watchdog_interval.is_zero() {
            return Err(TransferError::Validation(
                "watchdog_interval must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.slow_ratio) {
            return Err(TransferError::Validation(format!(
                "slow_ratio must be in [0, 1), got {}",
                self.slow_ratio
            )));
        }
        if self.slow_strikes == 0 {
            return Err(TransferError::Validation(
                "slow_strikes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where to reach the registry and with which credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub address: String,
    pub repository: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryConfig {
    pub fn new(address: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            repository: repository.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Load from `REGISTRY_ADDRESS`, `REGISTRY_REPOSITORY`, `REGISTRY_USERNAME`
    /// and `REGISTRY_PASSWORD`
    pub fn from_env() -> Result<Self> {
        let address = env::var("REGISTRY_ADDRESS")
            .map_err(|_| TransferError::Validation("REGISTRY_ADDRESS not set".to_string()))?;
        let repository =
            env::var("REGISTRY_REPOSITORY").unwrap_or_else(|_| DEFAULT_REPOSITORY.to_string());
        Ok(Self {
            address,
            repository,
            username: env::var("REGISTRY_USERNAME").ok(),
            password: env::var("REGISTRY_PASSWORD").ok(),
        })
    }

    /// Fill fields that were not given explicitly from the environment
    pub fn merge_env(mut self) -> Self {
        if self.username.is_none() {
            self.username = env::var("REGISTRY_USERNAME").ok();
        }
        if self.password.is_none() {
            self.password = env::var("REGISTRY_PASSWORD").ok();
        }
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(TransferError::Validation(
                "Registry address cannot be empty".to_string(),
            ));
        }
        if !self.address.starts_with("http://") && !self.address.starts_with("https://") {
            return Err(TransferError::Validation(format!(
                "Invalid registry address: {}. Must start with http:// or https://",
                self.address
            )));
        }
        if self.repository.is_empty() {
            return Err(TransferError::Validation(
                "Repository name cannot be empty".to_string(),
            ));
        }
        match (&self.username, &self.password) {
            (Some(_), None) => Err(TransferError::Validation(
                "Password is required when username is provided".to_string(),
            )),
            (None, Some(_)) => Err(TransferError::Validation(
                "Username is required when password is provided".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
