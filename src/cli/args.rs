//! Command-line argument parsing

use crate::config::{DEFAULT_STALL_TIMEOUT, RegistryConfig};
use crate::error::{Result, TransferError};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "blob-transfer")]
#[command(about = "Push and pull content-addressed blobs to and from OCI/Docker registries")]
#[command(version, author)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(long = "verbose", short = 'v', global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Quiet mode
    #[arg(
        long = "quiet",
        short = 'q',
        global = true,
        conflicts_with = "verbose",
        help = "Only print errors"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload the blobs of a local manifest, then push the manifest
    Push {
        #[command(flatten)]
        target: TargetArgs,

        /// Manifest JSON whose config and layers name the blobs to upload
        #[arg(long = "manifest", short = 'm', help = "Path to the manifest JSON file")]
        manifest: PathBuf,
    },
    /// Fetch a manifest and download its blobs
    Pull {
        #[command(flatten)]
        target: TargetArgs,
    },
}

/// Flags shared by push and pull
#[derive(ClapArgs, Debug, Clone)]
pub struct TargetArgs {
    /// Registry base URL, falls back to REGISTRY_ADDRESS
    #[arg(long = "registry", short = 'r', help = "Registry base URL, e.g. https://registry.example.com")]
    pub registry: Option<String>,

    #[arg(
        long = "repository",
        default_value = "library/_",
        help = "Repository path inside the registry"
    )]
    pub repository: String,

    #[arg(long = "reference", short = 't', default_value = "latest", help = "Tag or digest")]
    pub reference: String,

    /// Local blob directory
    #[arg(long = "dir", short = 'd', help = "Directory holding blob files named sha256-<hex>")]
    pub dir: PathBuf,

    /// Registry username
    #[arg(long = "username", short = 'u', help = "Username for registry authentication")]
    pub username: Option<String>,

    /// Registry password
    #[arg(long = "password", short = 'p', help = "Password for registry authentication")]
    pub password: Option<String>,

    /// Number of concurrent transfers
    #[arg(
        long = "concurrency",
        short = 'j',
        default_value = "0",
        help = "Concurrent transfers (0 uses the built-in default)"
    )]
    pub concurrency: usize,

    #[arg(
        long = "stall-timeout",
        default_value_t = DEFAULT_STALL_TIMEOUT.as_secs(),
        help = "Seconds without data before a download is restarted"
    )]
    pub stall_timeout: u64,
}

impl Args {
    pub fn parse_args() -> Self {
        Args::parse()
    }

    pub fn target(&self) -> &TargetArgs {
        match &self.command {
            Command::Push { target, .. } | Command::Pull { target } => target,
        }
    }
}

impl TargetArgs {
    /// Registry settings from flags, with unset values taken from the environment
    pub fn registry_config(&self) -> Result<RegistryConfig> {
        let config = match &self.registry {
            Some(address) => RegistryConfig::new(address.clone(), self.repository.clone())
                .with_credentials(self.username.clone(), self.password.clone())
                .merge_env(),
            None => {
                let mut config = RegistryConfig::from_env()?;
                config.repository = self.repository.clone();
                if self.username.is_some() {
                    config.username = self.username.clone();
                }
                if self.password.is_some() {
                    config.password = self.password.clone();
                }
                config
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reference.is_empty() {
            return Err(TransferError::Validation("reference cannot be empty".to_string()));
        }
        if self.stall_timeout == 0 {
            return Err(TransferError::Validation("stall timeout must be positive".to_string()));
        }
        Ok(())
    }
}
