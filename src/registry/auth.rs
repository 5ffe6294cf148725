//! Authentication challenges and token exchange for registry access

use crate::error::{Result, TransferError};
use crate::error::handlers::NetworkErrorHandler;
use crate::logging::Logger;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

/// Parsed `WWW-Authenticate: Bearer realm=...,service=...,scope=...` header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: String,
    pub scope: String,
}

impl AuthChallenge {
    /// Parse a Bearer challenge. Unknown schemes and malformed input yield an
    /// empty challenge rather than an error; the token source decides what to do.
    pub fn parse(header: &str) -> Self {
        let header = header.trim();
        let params = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest,
            _ => return Self::default(),
        };

        let mut challenge = Self::default();
        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = value,
                "service" => challenge.service = value,
                "scope" => challenge.scope = value,
                _ => {}
            }
        }
        challenge
    }

    pub fn is_empty(&self) -> bool {
        self.realm.is_empty()
    }
}

/// Split `k="v",k2=v2` honoring quotes, so scopes like
/// `repository:foo:pull,push` survive intact
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
            value = value.trim().to_string();
        }
        params.push((key.trim().to_string(), value));
    }
    params
}

/// Exchanges an authentication challenge for a bearer token.
///
/// Called by the session whenever the registry answers 401; the returned token
/// is shared by every worker of that session.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, challenge: &AuthChallenge) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// Token source that logs into the challenge realm with HTTP basic credentials
/// (or anonymously when none are configured)
#[derive(Debug, Clone)]
pub struct BasicAuthTokenSource {
    client: Client,
    username: Option<String>,
    password: Option<String>,
    output: Logger,
}

impl BasicAuthTokenSource {
    pub fn new(client: Client, username: Option<String>, password: Option<String>, output: Logger) -> Self {
        Self {
            client,
            username,
            password,
            output,
        }
    }

    pub fn anonymous(client: Client, output: Logger) -> Self {
        Self::new(client, None, None, output)
    }

    fn token_url(challenge: &AuthChallenge) -> Result<url::Url> {
        let mut url = url::Url::parse(&challenge.realm)
            .map_err(|e| TransferError::Auth(format!("invalid token realm {:?}: {}", challenge.realm, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if !challenge.service.is_empty() {
                query.append_pair("service", &challenge.service);
            }
            if !challenge.scope.is_empty() {
                query.append_pair("scope", &challenge.scope);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl TokenSource for BasicAuthTokenSource {
    async fn token(&self, challenge: &AuthChallenge) -> Result<String> {
        if challenge.is_empty() {
            return Err(TransferError::Auth(
                "registry challenge carries no realm".to_string(),
            ));
        }

        let url = Self::token_url(challenge)?;
        self.output.detail(&format!("Requesting token from: {}", url));

        let mut request = self.client.get(url);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "token request"))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error response".to_string());
            return Err(TransferError::Auth(format!(
                "token request failed with status {}: {}",
                status,
                error_text.trim()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Auth(format!("failed to parse token response: {}", e)))?;

        if let Some(expires_in) = body.expires_in {
            self.output.detail(&format!("Token expires in {} seconds", expires_in));
        }

        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TransferError::Auth("token response contained no token".to_string()))
    }
}
