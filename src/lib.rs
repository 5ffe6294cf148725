//! Registry Blob Transfer Library
//!
//! Resumable, concurrent upload and download of content-addressed blobs
//! against OCI/Docker registries. Entry points are [`upload`] and
//! [`download`]; the `blob-transfer` binary is a thin driver on top.

pub mod blob;
pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod logging;
pub mod registry;
pub mod transfer;

pub use blob::{Blob, BlobLayout};
pub use config::TransferConfig;
pub use error::{FailureClass, Result, TransferError};
pub use logging::Logger;
pub use registry::{AuthChallenge, BasicAuthTokenSource, TokenSource};
pub use transfer::{DownloadOptions, ProgressFn, UploadOptions, download, upload};
