//! Manifest operations for the registry client
//!
//! - Manifest push (PUT /v2/{name}/manifests/{reference})
//! - Manifest fetch (GET /v2/{name}/manifests/{reference})

use crate::blob::Blob;
use crate::error::handlers::HttpErrorHandler;
use crate::error::{Result, TransferError};
use crate::registry::client::RegistryClient;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const OCI_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";

/// Content descriptor inside a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// The subset of a v2 / OCI image manifest needed to enumerate its blobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let manifest: ImageManifest = serde_json::from_slice(data)?;
        if manifest.schema_version != 2 {
            return Err(TransferError::Parse(format!(
                "unsupported manifest schema version {}",
                manifest.schema_version
            )));
        }
        Ok(manifest)
    }

    /// Config blob followed by layers, duplicates removed
    pub fn blobs(&self) -> Vec<Blob> {
        let mut blobs: Vec<Blob> = Vec::with_capacity(self.layers.len() + 1);
        for descriptor in std::iter::once(&self.config).chain(self.layers.iter()) {
            if !blobs.iter().any(|b| b.digest == descriptor.digest) {
                blobs.push(Blob::new(descriptor.digest.clone(), descriptor.size));
            }
        }
        blobs
    }
}

pub struct ManifestOperations<'a> {
    client: &'a RegistryClient,
}

impl<'a> ManifestOperations<'a> {
    pub fn new(client: &'a RegistryClient) -> Self {
        Self { client }
    }

    /// Upload manifest bytes under `reference`; 200 or 201 is success
    pub async fn push_manifest(&self, reference: &str, manifest: &[u8]) -> Result<()> {
        let url = self.client.endpoint(&format!("manifests/{}", reference))?;
        let output = self.client.output();
        output.detail(&format!("Pushing manifest {} ({} bytes)", reference, manifest.len()));

        let body = manifest.to_vec();
        let response = self
            .client
            .send("manifest push", |token| {
                self.client
                    .request(Method::PUT, url.clone(), token)
                    .header(CONTENT_TYPE, DOCKER_MANIFEST_V2)
                    .body(body.clone())
            })
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                output.success(&format!("Manifest {} pushed", reference));
                Ok(())
            }
            _ => Err(HttpErrorHandler::from_response(response, "manifest push").await),
        }
    }

    /// Fetch and parse the manifest stored under `reference`
    pub async fn fetch_manifest(&self, reference: &str) -> Result<(ImageManifest, Vec<u8>)> {
        let url = self.client.endpoint(&format!("manifests/{}", reference))?;
        let accept = format!("{}, {}", DOCKER_MANIFEST_V2, OCI_MANIFEST_V1);

        let response = self
            .client
            .send("manifest fetch", |token| {
                self.client
                    .request(Method::GET, url.clone(), token)
                    .header(ACCEPT, accept.as_str())
            })
            .await?;

        if response.status() != StatusCode::OK {
            return Err(HttpErrorHandler::from_response(response, "manifest fetch").await);
        }

        let raw = response.bytes().await?.to_vec();
        let manifest = ImageManifest::from_slice(&raw)?;
        Ok((manifest, raw))
    }
}
