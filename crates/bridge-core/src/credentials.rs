//! Bearer credential lifecycle: login, caching, and serialized renewal.
//!
//! The manager is the only writer of the current [`Credential`]. Every read and replacement goes
//! through one async mutex, which is held across the login exchange itself. Callers that hit a
//! 401 while another task is renewing therefore queue on the mutex and pick up the fresh
//! credential instead of starting a second login.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::http::{excerpt, redact_url, sanitize_reqwest_error};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use url::Url;

/// An issued bearer token.
///
/// Never mutated after issue except for the validity flag; renewal produces a new value with a
/// higher generation.
pub struct Credential {
    token: String,
    issued_at: DateTime<Utc>,
    generation: u64,
    valid: AtomicBool,
}

impl Credential {
    fn new(token: String, generation: u64) -> Self {
        Self {
            token,
            issued_at: Utc::now(),
            generation,
            valid: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Monotonic counter; a later login always has a higher generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the credential as rejected by the upstream API.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("generation", &self.generation)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Owns the current credential for one upstream API.
pub struct CredentialManager {
    client: reqwest::Client,
    login_url: Url,
    username: String,
    password: String,
    token_field: String,
    current: Mutex<Option<Arc<Credential>>>,
    generation: AtomicU64,
    logins: AtomicU64,
}

impl CredentialManager {
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the login URL cannot be built from the config.
    pub fn new(config: &BridgeConfig, client: reqwest::Client) -> Result<Self> {
        Ok(Self {
            client,
            login_url: config.endpoint_url(&config.login_path)?,
            username: config.username.clone(),
            password: config.password.clone(),
            token_field: config.token_field.clone(),
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            logins: AtomicU64::new(0),
        })
    }

    /// Perform one login exchange and return the issued credential.
    ///
    /// This does not touch the cached credential; use [`Self::current`] or [`Self::renew`] for
    /// that.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Authentication`] on transport failure or timeout, a non-2xx
    /// response, a non-JSON body, or a missing/empty token field.
    pub async fn acquire(&self) -> Result<Arc<Credential>> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        let login_url = redact_url(&self.login_url);

        let response = self
            .client
            .post(self.login_url.clone())
            .json(&json!({
                "username": self.username,
                "password": self.password,
            }))
            .send()
            .await
            .map_err(|e| {
                BridgeError::Authentication(format!(
                    "login request to '{login_url}' failed: {}",
                    sanitize_reqwest_error(&e)
                ))
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            BridgeError::Authentication(format!(
                "failed to read login response from '{login_url}': {}",
                sanitize_reqwest_error(&e)
            ))
        })?;

        if !status.is_success() {
            return Err(BridgeError::Authentication(format!(
                "login to '{login_url}' returned {status}: {}",
                excerpt(&bytes)
            )));
        }

        let body: Value = serde_json::from_slice(&bytes).map_err(|e| {
            BridgeError::Authentication(format!(
                "login response from '{login_url}' is not JSON: {e}"
            ))
        })?;

        let token = body
            .get(&self.token_field)
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                BridgeError::Authentication(format!(
                    "no {} in authentication response",
                    self.token_field
                ))
            })?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("Authenticated against {login_url} (credential generation {generation})");
        Ok(Arc::new(Credential::new(token.to_string(), generation)))
    }

    /// The cached credential, logging in first if there is none or it was invalidated.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Authentication`] if a login is needed and fails.
    pub async fn current(&self) -> Result<Arc<Credential>> {
        let mut slot = self.current.lock().await;
        if let Some(cred) = slot.as_ref()
            && cred.is_valid()
        {
            return Ok(cred.clone());
        }
        let fresh = self.acquire().await?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Force a fresh login and replace the cached credential.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Authentication`] if the login fails. The previous credential stays
    /// cached in that case.
    pub async fn renew(&self) -> Result<Arc<Credential>> {
        let mut slot = self.current.lock().await;
        let fresh = self.acquire().await?;
        if let Some(old) = slot.replace(fresh.clone()) {
            old.invalidate();
        }
        Ok(fresh)
    }

    /// Renew on behalf of a request that was rejected while holding `stale`.
    ///
    /// If another task already replaced `stale` with a still-valid credential, that credential
    /// is returned without a new login.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Authentication`] if a login is needed and fails.
    pub async fn renew_after(&self, stale: &Credential) -> Result<Arc<Credential>> {
        stale.invalidate();
        let mut slot = self.current.lock().await;
        if let Some(cred) = slot.as_ref()
            && cred.generation() > stale.generation()
            && cred.is_valid()
        {
            tracing::debug!(
                "Credential generation {} already replaced by {}",
                stale.generation(),
                cred.generation()
            );
            return Ok(cred.clone());
        }
        let fresh = self.acquire().await?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Number of login exchanges attempted so far.
    #[must_use]
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("login_url", &redact_url(&self.login_url))
            .field("username", &self.username)
            .field("token_field", &self.token_field)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::build_client;
    use mcp_openapi_bridge_test_support::{MockApi, PASSWORD, USERNAME};
    use std::time::Duration;

    fn manager(base_url: &str, password: &str) -> CredentialManager {
        let cfg = BridgeConfig::new(base_url, USERNAME, password);
        let client = build_client(&cfg).expect("client");
        CredentialManager::new(&cfg, client).expect("manager")
    }

    #[tokio::test]
    async fn acquire_returns_token_from_login_response() {
        let api = MockApi::start_default().await.expect("mock");
        let mgr = manager(&api.base_url(), PASSWORD);

        let cred = mgr.acquire().await.expect("login");
        assert_eq!(cred.token(), "token-1");
        assert!(cred.is_valid());
        assert_eq!(cred.generation(), 1);
        assert_eq!(api.login_count(), 1);
    }

    #[tokio::test]
    async fn current_caches_until_invalidated() {
        let api = MockApi::start_default().await.expect("mock");
        let mgr = manager(&api.base_url(), PASSWORD);

        let first = mgr.current().await.expect("login");
        let again = mgr.current().await.expect("cached");
        assert_eq!(first.token(), again.token());
        assert_eq!(api.login_count(), 1);

        first.invalidate();
        let next = mgr.current().await.expect("relogin");
        assert_eq!(next.token(), "token-2");
        assert_eq!(api.login_count(), 2);
    }

    #[tokio::test]
    async fn renew_replaces_and_invalidates_previous() {
        let api = MockApi::start_default().await.expect("mock");
        let mgr = manager(&api.base_url(), PASSWORD);

        let old = mgr.current().await.expect("login");
        let new = mgr.renew().await.expect("renew");
        assert!(!old.is_valid());
        assert!(new.generation() > old.generation());
        assert_eq!(mgr.current().await.expect("cached").token(), new.token());
    }

    #[tokio::test]
    async fn concurrent_renewals_after_same_stale_credential_log_in_once() {
        let api = MockApi::start_default().await.expect("mock");
        api.set_login_delay(Duration::from_millis(100));
        let mgr = Arc::new(manager(&api.base_url(), PASSWORD));

        let stale = mgr.current().await.expect("login");
        assert_eq!(api.login_count(), 1);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            let stale = stale.clone();
            tasks.push(tokio::spawn(async move { mgr.renew_after(&stale).await }));
        }
        let mut tokens = Vec::new();
        for t in tasks {
            tokens.push(t.await.expect("join").expect("renew").token().to_string());
        }

        assert_eq!(api.login_count(), 2);
        assert!(tokens.iter().all(|t| t == "token-2"), "{tokens:?}");
    }

    #[tokio::test]
    async fn bad_password_is_authentication_error() {
        let api = MockApi::start_default().await.expect("mock");
        let mgr = manager(&api.base_url(), "wrong");

        let err = mgr.acquire().await.expect_err("must fail");
        assert!(matches!(err, BridgeError::Authentication(_)), "{err}");
        assert!(err.to_string().contains("401"), "{err}");
        assert!(!err.to_string().contains("wrong"), "password leaked: {err}");
    }

    #[tokio::test]
    async fn missing_token_field_is_authentication_error() {
        let api = MockApi::start_default().await.expect("mock");
        api.set_omit_token(true);
        let mgr = manager(&api.base_url(), PASSWORD);

        let err = mgr.acquire().await.expect_err("must fail");
        assert!(err.to_string().contains("no access_token"), "{err}");
    }

    #[tokio::test]
    async fn unreachable_login_endpoint_is_authentication_error() {
        let mgr = manager("http://127.0.0.1:9", PASSWORD);
        let err = mgr.acquire().await.expect_err("must fail");
        assert!(matches!(err, BridgeError::Authentication(_)), "{err}");
    }

    #[test]
    fn debug_output_redacts_token() {
        let cred = Credential::new("super-secret".to_string(), 1);
        let dbg = format!("{cred:?}");
        assert!(!dbg.contains("super-secret"));
    }
}
