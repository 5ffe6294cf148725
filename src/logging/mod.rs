//! Output control for transfer sessions
//!
//! This module provides the [`Logger`] handle that transfer sessions carry around.
//! It filters by verbosity the same way for every caller and forwards messages as
//! `tracing` events, so the binary (or an embedding application) decides where they
//! end up by installing a subscriber.

use std::time::Duration;

/// Logger responsible for all transfer output
#[derive(Debug, Clone, Default)]
pub struct Logger {
    pub verbose: bool,
    pub quiet: bool,
}

impl Logger {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            quiet: false,
        }
    }

    pub fn new_quiet() -> Self {
        Self {
            verbose: false,
            quiet: true,
        }
    }

    /// Main section heading
    pub fn section(&self, title: &str) {
        if !self.quiet {
            tracing::info!("=== {} ===", title);
        }
    }

    // Structured logging levels
    pub fn trace(&self, message: &str) {
        if self.verbose && !self.quiet {
            tracing::trace!("{}", message);
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbose && !self.quiet {
            tracing::debug!("{}", message);
        }
    }

    /// Detailed information (only shown in verbose mode)
    pub fn detail(&self, message: &str) {
        if self.verbose && !self.quiet {
            tracing::info!("  {}", message);
        }
    }

    /// Information message
    pub fn info(&self, message: &str) {
        if !self.quiet {
            tracing::info!("{}", message);
        }
    }

    /// Success message
    pub fn success(&self, message: &str) {
        if !self.quiet {
            tracing::info!(outcome = "success", "{}", message);
        }
    }

    /// Warnings are shown even in quiet mode
    pub fn warning(&self, message: &str) {
        tracing::warn!("{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!("{}", message);
    }

    /// Format file size in human-readable units
    pub fn format_size(&self, bytes: u64) -> String {
        if bytes < 1024 {
            format!("{} B", bytes)
        } else if bytes < 1024 * 1024 {
            format!("{:.1} KB", bytes as f64 / 1024.0)
        } else if bytes < 1024 * 1024 * 1024 {
            format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
        } else {
            format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
        }
    }

    /// Format duration in human-readable format
    pub fn format_duration(&self, duration: Duration) -> String {
        let secs = duration.as_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m{}s", secs / 60, secs % 60)
        } else {
            format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
        }
    }

    /// Format transfer speed in human-readable format
    pub fn format_speed(&self, bytes_per_sec: f64) -> String {
        format!("{}/s", self.format_size(bytes_per_sec.max(0.0) as u64))
    }

    /// Short form of a digest for log lines
    pub fn short_digest<'a>(&self, digest: &'a str) -> &'a str {
        let end = digest
            .char_indices()
            .nth(19)
            .map(|(i, _)| i)
            .unwrap_or(digest.len());
        &digest[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_use_binary_units() {
        let logger = Logger::default();
        assert_eq!(logger.format_size(512), "512 B");
        assert_eq!(logger.format_size(1536), "1.5 KB");
        assert_eq!(logger.format_size(10 * 1024 * 1024), "10.0 MB");
        assert_eq!(logger.format_speed(2048.0), "2.0 KB/s");
    }

    #[test]
    fn durations_roll_over_units() {
        let logger = Logger::default();
        assert_eq!(logger.format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(logger.format_duration(Duration::from_secs(125)), "2m5s");
        assert_eq!(logger.format_duration(Duration::from_secs(3725)), "1h2m5s");
    }

    #[test]
    fn short_digest_truncates_long_values_only() {
        let logger = Logger::default();
        assert_eq!(logger.short_digest("sha256:0123456789abcdef0123"), "sha256:0123456789ab");
        assert_eq!(logger.short_digest("sha256:ab"), "sha256:ab");
    }
}
