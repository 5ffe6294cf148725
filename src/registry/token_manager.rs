//! Shared bearer token slot for one transfer session
//!
//! Every worker of a session reads the same slot. When a request comes back 401
//! the worker asks the [`TokenManager`] to refresh; concurrent refreshes are
//! coalesced so a burst of 401s triggers a single token exchange.

use crate::error::{Result, TransferError};
use crate::logging::Logger;
use crate::registry::auth::{AuthChallenge, TokenSource};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Thread-safe token holder with on-demand refresh
#[derive(Clone)]
pub struct TokenManager {
    token: Arc<RwLock<Option<String>>>,
    source: Option<Arc<dyn TokenSource>>,
    refresh_gate: Arc<tokio::sync::Mutex<()>>,
    exchanges: Arc<AtomicU64>,
    output: Logger,
}

impl TokenManager {
    pub fn new(initial: Option<String>, source: Option<Arc<dyn TokenSource>>, output: Logger) -> Self {
        Self {
            token: Arc::new(RwLock::new(initial.filter(|t| !t.is_empty()))),
            source,
            refresh_gate: Arc::new(tokio::sync::Mutex::new(())),
            exchanges: Arc::new(AtomicU64::new(0)),
            output,
        }
    }

    /// Token to attach to the next request, if any
    pub fn current(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn can_refresh(&self) -> bool {
        self.source.is_some()
    }

    /// Number of token exchanges performed by this session
    pub fn exchanges(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }

    /// Handle a 401 received while `stale` was attached.
    ///
    /// If another worker already replaced `stale`, its token is returned without
    /// a new exchange. Otherwise the challenge is handed to the token source and
    /// the result stored for everyone.
    pub async fn refresh(&self, stale: Option<&str>, www_authenticate: Option<&str>) -> Result<String> {
        let source = self.source.as_ref().ok_or_else(|| {
            TransferError::Unauthorized("registry requires authentication but no token source is configured".to_string())
        })?;

        let _gate = self.refresh_gate.lock().await;

        if let Some(current) = self.current() {
            if Some(current.as_str()) != stale {
                self.output.debug("token already refreshed by another worker");
                return Ok(current);
            }
        }

        let challenge = AuthChallenge::parse(www_authenticate.unwrap_or_default());
        self.output.detail(&format!(
            "Received 401 Unauthorized - exchanging token (service: {}, scope: {})",
            challenge.service, challenge.scope
        ));

        let fresh = source.token(&challenge).await?;
        self.exchanges.fetch_add(1, Ordering::SeqCst);

        *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(fresh.clone());
        Ok(fresh)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("has_token", &self.current().is_some())
            .field("can_refresh", &self.can_refresh())
            .field("exchanges", &self.exchanges())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct CountingSource {
        calls: AtomicU64,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn token(&self, challenge: &AuthChallenge) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(format!("{}-{}", challenge.service, n))
        }
    }

    #[tokio::test]
    async fn concurrent_refreshes_exchange_once() {
        let source = Arc::new(CountingSource { calls: AtomicU64::new(0) });
        let manager = TokenManager::new(None, Some(source.clone()), Logger::new_quiet());

        let header = r#"Bearer realm="https://auth/token",service="reg""#;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.refresh(None, Some(header)).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "reg-1");
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.exchanges(), 1);
        assert_eq!(manager.current().as_deref(), Some("reg-1"));
    }

    #[tokio::test]
    async fn stale_token_is_replaced() {
        let source = Arc::new(CountingSource { calls: AtomicU64::new(0) });
        let manager = TokenManager::new(Some("old".into()), Some(source), Logger::new_quiet());

        let fresh = manager.refresh(Some("old"), Some(r#"Bearer realm="r",service="s""#)).await.unwrap();
        assert_eq!(fresh, "s-1");
        assert_eq!(manager.current().as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn refresh_without_source_is_unauthorized() {
        let manager = TokenManager::new(None, None, Logger::new_quiet());
        let err = manager.refresh(None, None).await.unwrap_err();
        assert!(matches!(err, TransferError::Unauthorized(_)));
    }
}
