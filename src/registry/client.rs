//! Registry client shared by the workers of one transfer session
//!
//! Holds the HTTP client, the registry base URL and repository, and the session's
//! [`TokenManager`]. All registry calls go through [`RegistryClient::send`], which
//! attaches the bearer token and transparently re-issues a request once after a
//! 401 + token refresh.

use crate::config::{DEFAULT_REPOSITORY, DEFAULT_USER_AGENT};
use crate::error::handlers::NetworkErrorHandler;
use crate::error::{Result, TransferError};
use crate::logging::Logger;
use crate::registry::auth::TokenSource;
use crate::registry::operations::{BlobOperations, ManifestOperations};
use crate::registry::token_manager::TokenManager;
use reqwest::header::{HeaderMap, LOCATION, USER_AGENT, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use url::Url;

pub struct RegistryClientBuilder {
    address: String,
    repository: String,
    client: Option<Client>,
    token: Option<String>,
    token_source: Option<Arc<dyn TokenSource>>,
    user_agent: String,
    output: Logger,
}

impl RegistryClientBuilder {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            repository: DEFAULT_REPOSITORY.to_string(),
            client: None,
            token: None,
            token_source: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            output: Logger::default(),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        let repository = repository.into();
        if !repository.is_empty() {
            self.repository = repository;
        }
        self
    }

    pub fn with_client(mut self, client: Option<Client>) -> Self {
        self.client = client;
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_token_source(mut self, source: Option<Arc<dyn TokenSource>>) -> Self {
        self.token_source = source;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_output(mut self, output: Logger) -> Self {
        self.output = output;
        self
    }

    pub fn build(self) -> Result<RegistryClient> {
        let base = Url::parse(self.address.trim_end_matches('/')).map_err(|e| {
            TransferError::Validation(format!("invalid registry address {}: {}", self.address, e))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TransferError::Validation(format!(
                "Invalid registry address: {}. Must start with http:// or https://",
                self.address
            )));
        }

        let client = match self.client {
            Some(client) => client,
            None => default_client()?,
        };

        Ok(RegistryClient {
            client,
            address: self.address.trim_end_matches('/').to_string(),
            base,
            repository: self.repository.trim_matches('/').to_string(),
            user_agent: self.user_agent,
            tokens: TokenManager::new(self.token, self.token_source, self.output.clone()),
            output: self.output,
        })
    }
}

/// HTTP client used when the caller supplies none. Redirects are handled by the
/// transfer code itself so that bearer tokens never leak to CDN hosts.
pub fn default_client() -> Result<Client> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "client setup"))
}

#[derive(Clone)]
pub struct RegistryClient {
    client: Client,
    address: String,
    base: Url,
    repository: String,
    user_agent: String,
    tokens: TokenManager,
    output: Logger,
}

impl RegistryClient {
    pub fn builder(address: impl Into<String>) -> RegistryClientBuilder {
        RegistryClientBuilder::new(address)
    }

    pub fn blobs(&self) -> BlobOperations<'_> {
        BlobOperations::new(self)
    }

    pub fn manifests(&self) -> ManifestOperations<'_> {
        ManifestOperations::new(self)
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    /// `{base}/v2/{repository}/{path}`
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/v2/{}/{}",
            self.address, self.repository, path
        ))?)
    }

    /// True when `url` points at the registry itself rather than a CDN
    pub fn is_registry_host(&self, url: &Url) -> bool {
        url.host_str() == self.base.host_str()
            && url.port_or_known_default() == self.base.port_or_known_default()
    }

    /// Base request with user agent and, when given, the bearer token
    pub fn request(&self, method: reqwest::Method, url: Url, token: Option<&str>) -> RequestBuilder {
        let request = self
            .client
            .request(method, url)
            .header(USER_AGENT, self.user_agent.as_str());
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Authenticated-request convention: attach the token, and on 401 refresh it
    /// through the [`TokenManager`] and re-issue the identical request once.
    ///
    /// `build` is called once per issue and must produce the same request.
    /// A second 401 is returned to the caller like any other response.
    pub async fn send<F>(&self, context: &str, build: F) -> Result<Response>
    where
        F: Fn(Option<&str>) -> RequestBuilder,
    {
        let token = self.tokens.current();
        let response = build(token.as_deref())
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, context))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = challenge_header(response.headers());
        let fresh = self.tokens.refresh(token.as_deref(), challenge.as_deref()).await?;
        self.output.debug(&format!("{}: re-issuing request with refreshed token", context));

        build(Some(&fresh))
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, context))
    }
}

pub(crate) fn challenge_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Resolve a `Location`-style header against the URL of the request that
/// returned it
pub(crate) fn resolve_location(headers: &HeaderMap, names: &[&str], request_url: &Url) -> Result<Option<Url>> {
    let value = names
        .iter()
        .filter_map(|name| headers.get(*name))
        .find_map(|v| v.to_str().ok().filter(|s| !s.is_empty()));

    match value {
        Some(location) => request_url.join(location).map(Some).map_err(|e| {
            TransferError::ProtocolViolation(format!("invalid location {:?}: {}", location, e))
        }),
        None => Ok(None),
    }
}

pub(crate) fn redirect_target(response: &Response) -> Result<Url> {
    resolve_location(response.headers(), &[LOCATION.as_str()], response.url())?.ok_or_else(|| {
        TransferError::ProtocolViolation(format!(
            "redirect ({}) without Location header",
            response.status()
        ))
    })
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("address", &self.address)
            .field("repository", &self.repository)
            .field("tokens", &self.tokens)
            .finish()
    }
}
