//! Blob operations for the registry client
//!
//! Implements the Docker Registry v2 blob calls used by transfers:
//! - Blob existence checks (HEAD /v2/{name}/blobs/{digest})
//! - Upload session start (POST /v2/{name}/blobs/uploads/?digest=...)
//! - Monolithic blob PUT to a session or CDN URL
//! - Blob download (GET /v2/{name}/blobs/{digest}) with manual redirect handling

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{Result, TransferError};
use crate::registry::client::{RegistryClient, challenge_header, redirect_target, resolve_location};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Method, Response, StatusCode};
use url::Url;

const MAX_REDIRECTS: usize = 10;
const UPLOAD_LOCATION_HEADERS: &[&str] = &["docker-upload-location", "location"];

pub struct BlobOperations<'a> {
    client: &'a RegistryClient,
}

impl<'a> BlobOperations<'a> {
    pub fn new(client: &'a RegistryClient) -> Self {
        Self { client }
    }

    pub fn blob_url(&self, digest: &str) -> Result<Url> {
        self.client.endpoint(&format!("blobs/{}", digest))
    }

    /// Check if blob exists using a HEAD request: 200 means present, any other
    /// final status means absent
    pub async fn exists(&self, digest: &str) -> Result<bool> {
        let url = self.blob_url(digest)?;
        let output = self.client.output();

        let response = self
            .client
            .send("blob existence check", |token| {
                self.client.request(Method::HEAD, url.clone(), token)
            })
            .await?;

        let exists = response.status() == StatusCode::OK;
        if exists {
            output.detail(&format!("Blob {} exists in registry", output.short_digest(digest)));
        } else {
            output.detail(&format!(
                "Blob {} not in registry (status {})",
                output.short_digest(digest),
                response.status()
            ));
        }
        Ok(exists)
    }

    /// Start an upload session and return the absolute session URL with the
    /// digest attached
    pub async fn init_upload(&self, digest: &str) -> Result<Url> {
        let mut endpoint = self.client.endpoint("blobs/uploads/")?;
        endpoint.query_pairs_mut().append_pair("digest", digest);

        let response = self
            .client
            .send("upload session start", |token| {
                self.client.request(Method::POST, endpoint.clone(), token)
            })
            .await?;

        if response.status() != StatusCode::ACCEPTED {
            return Err(HttpErrorHandler::from_response(response, "upload session start").await);
        }

        let location = resolve_location(response.headers(), UPLOAD_LOCATION_HEADERS, response.url())?
            .ok_or_else(|| {
                TransferError::ProtocolViolation("upload session response has no upload location".to_string())
            })?;

        let url = with_digest(location, digest);
        self.client
            .output()
            .debug(&format!("Upload session started, location: {}", url));
        Ok(url)
    }

    /// PUT the whole blob body to `url`. The response is returned as-is: the
    /// upload state machine decides what 401 and 307 mean.
    pub async fn put(&self, url: Url, body: Body, size: u64, token: Option<&str>) -> Result<Response> {
        self.client
            .request(Method::PUT, url, token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "blob upload"))
    }

    /// GET a blob, following redirects by hand. The bearer token is only sent
    /// to the registry host, never to a CDN.
    pub async fn get(&self, digest: &str) -> Result<Response> {
        let tokens = self.client.tokens();
        let mut url = self.blob_url(digest)?;
        let mut reauthenticated = false;

        for _ in 0..MAX_REDIRECTS {
            let on_registry = self.client.is_registry_host(&url);
            let token = if on_registry { tokens.current() } else { None };

            let response = self
                .client
                .request(Method::GET, url.clone(), token.as_deref())
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "blob download"))?;

            match response.status() {
                StatusCode::OK => return Ok(response),
                StatusCode::UNAUTHORIZED if on_registry && !reauthenticated => {
                    let challenge = challenge_header(response.headers());
                    tokens.refresh(token.as_deref(), challenge.as_deref()).await?;
                    reauthenticated = true;
                }
                status if status.is_redirection() && response.headers().contains_key(LOCATION) => {
                    let next = redirect_target(&response)?;
                    if !self.client.is_registry_host(&next) {
                        self.client.output().debug(&format!(
                            "Blob {} redirected to {}",
                            self.client.output().short_digest(digest),
                            next.host_str().unwrap_or_default()
                        ));
                    }
                    url = next;
                }
                _ => return Err(HttpErrorHandler::from_response(response, "blob download").await),
            }
        }

        Err(TransferError::ProtocolViolation(format!(
            "too many redirects downloading {}",
            digest
        )))
    }
}

/// Set (or replace) the `digest` query parameter
pub(crate) fn with_digest(mut url: Url, digest: &str) -> Url {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "digest")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for (key, value) in &pairs {
            query.append_pair(key, value);
        }
        query.append_pair("digest", digest);
    }
    url
}
