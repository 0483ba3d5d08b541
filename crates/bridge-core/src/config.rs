use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Configuration for one bridged API.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    /// Base URL of the remote API (`https://host:port`).
    pub base_url: String,

    /// Login identity.
    pub username: String,
    pub password: String,

    /// Verify the server's TLS certificate. Disabling keeps TLS, only skipping validation.
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,

    /// Timeout applied to every network call (login, spec fetch, tool calls).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_login_path")]
    pub login_path: String,

    #[serde(default = "default_spec_path")]
    pub spec_path: String,

    /// Field of the login response that carries the bearer token.
    #[serde(default = "default_token_field")]
    pub token_field: String,

    /// Auto-discovery configuration.
    #[serde(default)]
    pub auto_discover: AutoDiscoverConfig,

    /// Optional spec hash (`sha256:<hex>`) for version detection.
    #[serde(default)]
    pub spec_hash: Option<String>,

    /// Hash policy: warn, fail, or ignore.
    #[serde(default)]
    pub spec_hash_policy: HashPolicy,
}

fn default_verify_tls() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_login_path() -> String {
    "/api/auth/login".to_string()
}

fn default_spec_path() -> String {
    "/v3/api-docs".to_string()
}

fn default_token_field() -> String {
    "access_token".to_string()
}

impl BridgeConfig {
    /// Minimal config with every optional setting at its default.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            verify_tls: default_verify_tls(),
            timeout_secs: default_timeout_secs(),
            login_path: default_login_path(),
            spec_path: default_spec_path(),
            token_field: default_token_field(),
            auto_discover: AutoDiscoverConfig::default(),
            spec_hash: None,
            spec_hash_policy: HashPolicy::default(),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check the config before any network activity.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the base URL is not an absolute `http(s)` URL, identity
    /// material is empty, the timeout is zero, or a configured path is not absolute.
    pub fn validate(&self) -> Result<()> {
        let url = self.parsed_base_url()?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(BridgeError::Config(format!(
                "baseUrl must include a host: '{}'",
                self.base_url
            )));
        }
        if self.username.trim().is_empty() {
            return Err(BridgeError::Config("username must not be empty".to_string()));
        }
        if self.password.is_empty() {
            return Err(BridgeError::Config("password must not be empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(BridgeError::Config(
                "timeoutSecs must be greater than zero".to_string(),
            ));
        }
        for (field, path) in [("loginPath", &self.login_path), ("specPath", &self.spec_path)] {
            if !path.starts_with('/') {
                return Err(BridgeError::Config(format!(
                    "{field} must start with '/': '{path}'"
                )));
            }
        }
        if self.token_field.is_empty() {
            return Err(BridgeError::Config("tokenField must not be empty".to_string()));
        }
        Ok(())
    }

    /// The base URL parsed, with scheme checked.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the URL does not parse or is not `http(s)`.
    pub fn parsed_base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| BridgeError::Config(format!("invalid baseUrl '{}': {e}", self.base_url)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(BridgeError::Config(format!(
                "baseUrl must use http or https, got '{other}'"
            ))),
        }
    }

    /// Join an absolute API path onto the base URL, keeping any base path prefix.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] if the base URL is invalid.
    pub fn endpoint_url(&self, path: &str) -> Result<Url> {
        let base = self.parsed_base_url()?;
        let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
        Url::parse(&joined)
            .map_err(|e| BridgeError::Config(format!("invalid endpoint URL '{joined}': {e}")))
    }
}

/// Hash verification policy.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HashPolicy {
    /// Log warning if hash doesn't match.
    #[default]
    Warn,
    /// Fail startup if hash doesn't match.
    Fail,
    /// Ignore hash verification.
    Ignore,
}

/// Auto-discovery configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AutoDiscoverConfig {
    /// Simple boolean: true = expose every operation, false = expose none.
    Enabled(bool),
    /// Glob filters over `"METHOD /path"`; exclude wins over include.
    Detailed {
        #[serde(default)]
        include: Vec<String>,
        #[serde(default)]
        exclude: Vec<String>,
    },
}

impl Default for AutoDiscoverConfig {
    fn default() -> Self {
        AutoDiscoverConfig::Enabled(true)
    }
}

impl AutoDiscoverConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        match self {
            AutoDiscoverConfig::Enabled(b) => *b,
            AutoDiscoverConfig::Detailed { .. } => true,
        }
    }

    #[must_use]
    pub fn include_patterns(&self) -> &[String] {
        match self {
            AutoDiscoverConfig::Enabled(_) => &[],
            AutoDiscoverConfig::Detailed { include, .. } => include,
        }
    }

    #[must_use]
    pub fn exclude_patterns(&self) -> &[String] {
        match self {
            AutoDiscoverConfig::Enabled(_) => &[],
            AutoDiscoverConfig::Detailed { exclude, .. } => exclude,
        }
    }

    /// Whether the operation `"METHOD /path"` should be exposed.
    #[must_use]
    pub fn allows(&self, method: &str, path: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let operation = format!("{} {}", method.to_uppercase(), path);
        if self
            .exclude_patterns()
            .iter()
            .any(|p| glob_match(p, &operation))
        {
            return false;
        }
        let include = self.include_patterns();
        include.is_empty() || include.iter().any(|p| glob_match(p, &operation))
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    // `*` matches any sequence, `?` any single byte
    let pattern_bytes = pattern.as_bytes();
    let text_bytes = text.as_bytes();

    let mut pattern_index = 0usize;
    let mut text_index = 0usize;
    let mut star_index: Option<usize> = None;
    let mut star_text_index: usize = 0;

    while text_index < text_bytes.len() {
        match pattern_bytes.get(pattern_index) {
            Some(b'*') => {
                star_index = Some(pattern_index);
                pattern_index += 1;
                star_text_index = text_index;
            }
            Some(b'?') => {
                pattern_index += 1;
                text_index += 1;
            }
            Some(&b) if b == text_bytes[text_index] => {
                pattern_index += 1;
                text_index += 1;
            }
            _ => {
                let Some(si) = star_index else {
                    return false;
                };
                pattern_index = si + 1;
                star_text_index += 1;
                text_index = star_text_index;
            }
        }
    }

    while matches!(pattern_bytes.get(pattern_index), Some(b'*')) {
        pattern_index += 1;
    }

    pattern_index == pattern_bytes.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_from_yaml() {
        let cfg: BridgeConfig = serde_yaml::from_str(
            "baseUrl: https://teamserver:50443\nusername: op\npassword: pw\n",
        )
        .expect("parse");
        assert!(cfg.verify_tls);
        assert_eq!(cfg.timeout_secs, 30);
        assert_eq!(cfg.login_path, "/api/auth/login");
        assert_eq!(cfg.spec_path, "/v3/api-docs");
        assert_eq!(cfg.token_field, "access_token");
        assert!(cfg.auto_discover.is_enabled());
        cfg.validate().expect("valid");
    }

    #[test]
    fn validate_rejects_bad_scheme_and_empty_identity() {
        let cfg = BridgeConfig::new("ftp://host", "op", "pw");
        assert!(matches!(cfg.validate(), Err(BridgeError::Config(_))));

        let cfg = BridgeConfig::new("https://host", " ", "pw");
        assert!(matches!(cfg.validate(), Err(BridgeError::Config(_))));

        let cfg = BridgeConfig::new("https://host", "op", "");
        assert!(matches!(cfg.validate(), Err(BridgeError::Config(_))));

        let mut cfg = BridgeConfig::new("https://host", "op", "pw");
        cfg.timeout_secs = 0;
        assert!(matches!(cfg.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn endpoint_url_keeps_base_prefix() {
        let cfg = BridgeConfig::new("https://host:50443/vendor/", "op", "pw");
        assert_eq!(
            cfg.endpoint_url("/api/auth/login").expect("url").as_str(),
            "https://host:50443/vendor/api/auth/login"
        );
    }

    #[test]
    fn auto_discover_exclude_wins() {
        let ad: AutoDiscoverConfig = serde_yaml::from_str(
            "include: ['GET *', 'POST /hosts']\nexclude: ['GET /admin/*']\n",
        )
        .expect("parse");
        assert!(ad.allows("get", "/hosts"));
        assert!(ad.allows("POST", "/hosts"));
        assert!(!ad.allows("DELETE", "/hosts/{id}"));
        assert!(!ad.allows("GET", "/admin/users"));

        assert!(!AutoDiscoverConfig::Enabled(false).allows("GET", "/hosts"));
        // Braces in templated paths are literal.
        assert!(glob_match("GET /hosts/{id}", "GET /hosts/{id}"));
    }
}
