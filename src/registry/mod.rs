//! Registry module for Docker Registry HTTP API v2 interactions
//!
//! This module provides the session-scoped registry client, bearer token
//! handling, and the blob/manifest calls the transfer engine is built on.

pub mod auth;
pub mod client;
pub mod operations;
pub mod token_manager;

pub use auth::{AuthChallenge, BasicAuthTokenSource, TokenSource};
pub use client::{RegistryClient, RegistryClientBuilder, default_client};
pub use operations::{BlobOperations, Descriptor, ImageManifest, ManifestOperations};
pub use token_manager::TokenManager;
