//! Configuration for the CAS authentication middleware.
//!
//! [`CasAuthConfig`] holds every option that affects the protocol. It can be
//! built in code with [`CasAuthConfig::builder`] or loaded from a TOML file
//! (plus `CAS_AUTH_*` environment variables) with [`load_config_from_file`].
//!
//! [`Settings`] is the set-once holder shared by a middleware instance: once a
//! configuration has been set, or the defaults have been used by a request,
//! further attempts to configure fail with [`ConfigError::AlreadySet`].

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use config::{Config, Environment};
use serde::Deserialize;
use source::FileConfigSource;

use crate::client::error::ErrorCode;
use crate::path::GetPathError;

pub mod source;

/// Key under which the access token is persisted in a [`TokenStore`](crate::store::TokenStore).
pub const ACCESS_TOKEN_KEY: &str = "access_token";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration is already set")]
    AlreadySet,

    #[error("OAuth mode requires `{0}` to be set")]
    MissingOAuthParameter(&'static str),

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::Config
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoadConfigError {
    #[error("Failed to get config file path: {0}")]
    FailedToGetConfigFilePath(#[from] GetPathError),

    #[error("Failed to build config: {0}")]
    FailedToBuildConfig(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(#[from] ConfigError),
}

/// Sink for refresh failures, called with the failing step's code and a message.
#[derive(Clone)]
pub struct ErrorCallback(Arc<dyn Fn(ErrorCode, &str) + Send + Sync>);

impl ErrorCallback {
    pub fn new(callback: impl Fn(ErrorCode, &str) + Send + Sync + 'static) -> Self {
        ErrorCallback(Arc::new(callback))
    }

    pub fn call(&self, code: ErrorCode, message: &str) {
        (self.0)(code, message)
    }
}

impl fmt::Debug for ErrorCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorCallback(..)")
    }
}

impl PartialEq for ErrorCallback {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CasAuthConfig {
    /// Base URL of the authentication API, without trailing slash
    pub auth_api_base_url: String,
    /// Path of the service endpoint, relative to `auth_api_base_url`
    pub service_endpoint: String,
    /// Path of the token endpoint, relative to `auth_api_base_url`
    pub token_endpoint: String,
    /// Endpoint that exchanges a service id for a ticket (non-OAuth mode)
    pub ticket_url: String,

    /// Base URL of the CAS server (OAuth mode)
    pub cas_base_url: Option<String>,
    /// Login path on the CAS server (OAuth mode)
    pub cas_login_path: String,
    /// Ticket path on the CAS server (OAuth mode)
    pub cas_ticket_path: String,

    /// Number of passes a single request may make before a challenge is surfaced
    pub max_attempts: u32,
    /// Hold managed requests until a token exists instead of waiting for a 401
    pub require_access_token: bool,
    /// Persist the access token in the token store
    pub cache_access_token: bool,
    /// Lifetime of a persisted token
    pub cache_expires_minutes: u64,
    /// URL prefixes of the APIs this middleware authenticates
    pub managed_apis: Vec<String>,

    /// Acquire tickets through the OAuth browser-redirect flow
    pub oauth: bool,
    pub client_id: Option<String>,
    pub redirect_url: Option<String>,
    pub oauth_scope: String,

    /// Upper bound on a whole refresh sequence, unbounded when unset
    pub refresh_timeout_secs: Option<u64>,

    #[serde(skip)]
    pub error_callback: Option<ErrorCallback>,
}

impl Default for CasAuthConfig {
    fn default() -> Self {
        CasAuthConfig {
            auth_api_base_url: "https://example.com".to_string(),
            service_endpoint: "service".to_string(),
            token_endpoint: "token/new".to_string(),
            ticket_url: String::new(),
            cas_base_url: None,
            cas_login_path: "oauth2.0/authorize".to_string(),
            cas_ticket_path: "oauth2.0/ticket".to_string(),
            max_attempts: 3,
            require_access_token: false,
            cache_access_token: false,
            cache_expires_minutes: 60,
            managed_apis: Vec::new(),
            oauth: false,
            client_id: None,
            redirect_url: None,
            oauth_scope: "cas".to_string(),
            refresh_timeout_secs: None,
            error_callback: None,
        }
    }
}

/// The two endpoints of the authentication API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Service,
    Token,
}

impl CasAuthConfig {
    pub fn builder() -> CasAuthConfigBuilder {
        CasAuthConfigBuilder::default()
    }

    /// Resolve the absolute URL of an authentication API endpoint.
    pub fn api_url(&self, endpoint: Endpoint) -> String {
        let path = match endpoint {
            Endpoint::Service => &self.service_endpoint,
            Endpoint::Token => &self.token_endpoint,
        };
        join_url(&self.auth_api_base_url, path)
    }

    /// Ticket endpoint used by a refresh, depending on the mode.
    pub fn resolved_ticket_url(&self) -> String {
        match (&self.cas_base_url, self.oauth) {
            (Some(base), true) => join_url(base, &self.cas_ticket_path),
            _ => self.ticket_url.clone(),
        }
    }

    /// Login endpoint of the identity provider (OAuth mode).
    pub fn login_url(&self) -> Option<String> {
        self.cas_base_url
            .as_deref()
            .map(|base| join_url(base, &self.cas_login_path))
    }

    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_expires_minutes.saturating_mul(60))
    }

    /// Normalize and check the configuration.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if let Some(stripped) = self.auth_api_base_url.strip_suffix('/') {
            self.auth_api_base_url = stripped.to_string();
        }

        let mut seen = Vec::with_capacity(self.managed_apis.len());
        for api in self.managed_apis.drain(..) {
            if !seen.contains(&api) {
                seen.push(api);
            }
        }
        self.managed_apis = seen;

        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts);
        }

        if self.oauth {
            if self.client_id.is_none() {
                return Err(ConfigError::MissingOAuthParameter("client_id"));
            }
            if self.redirect_url.is_none() {
                return Err(ConfigError::MissingOAuthParameter("redirect_url"));
            }
            if self.cas_base_url.is_none() {
                return Err(ConfigError::MissingOAuthParameter("cas_base_url"));
            }
        }

        Ok(self)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Builder for [`CasAuthConfig`], validated on [`build`](Self::build).
#[derive(Debug, Default)]
pub struct CasAuthConfigBuilder {
    config: CasAuthConfig,
}

impl CasAuthConfigBuilder {
    pub fn auth_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.auth_api_base_url = url.into();
        self
    }

    pub fn service_endpoint(mut self, path: impl Into<String>) -> Self {
        self.config.service_endpoint = path.into();
        self
    }

    pub fn token_endpoint(mut self, path: impl Into<String>) -> Self {
        self.config.token_endpoint = path.into();
        self
    }

    pub fn ticket_url(mut self, url: impl Into<String>) -> Self {
        self.config.ticket_url = url.into();
        self
    }

    pub fn cas_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.cas_base_url = Some(url.into());
        self
    }

    pub fn cas_login_path(mut self, path: impl Into<String>) -> Self {
        self.config.cas_login_path = path.into();
        self
    }

    pub fn cas_ticket_path(mut self, path: impl Into<String>) -> Self {
        self.config.cas_ticket_path = path.into();
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts;
        self
    }

    pub fn require_access_token(mut self, require: bool) -> Self {
        self.config.require_access_token = require;
        self
    }

    pub fn cache_access_token(mut self, cache: bool) -> Self {
        self.config.cache_access_token = cache;
        self
    }

    pub fn cache_expires_minutes(mut self, minutes: u64) -> Self {
        self.config.cache_expires_minutes = minutes;
        self
    }

    pub fn add_managed_api(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if !self.config.managed_apis.contains(&prefix) {
            self.config.managed_apis.push(prefix);
        }
        self
    }

    pub fn add_managed_apis<I, T>(self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        prefixes
            .into_iter()
            .fold(self, |builder, prefix| builder.add_managed_api(prefix))
    }

    pub fn oauth(mut self, enabled: bool) -> Self {
        self.config.oauth = enabled;
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = Some(client_id.into());
        self
    }

    pub fn redirect_url(mut self, url: impl Into<String>) -> Self {
        self.config.redirect_url = Some(url.into());
        self
    }

    pub fn oauth_scope(mut self, scope: impl Into<String>) -> Self {
        self.config.oauth_scope = scope.into();
        self
    }

    pub fn refresh_timeout_secs(mut self, secs: u64) -> Self {
        self.config.refresh_timeout_secs = Some(secs);
        self
    }

    pub fn error_callback(
        mut self,
        callback: impl Fn(ErrorCode, &str) + Send + Sync + 'static,
    ) -> Self {
        self.config.error_callback = Some(ErrorCallback::new(callback));
        self
    }

    pub fn build(self) -> Result<CasAuthConfig, ConfigError> {
        self.config.validate()
    }
}

/// Set-once configuration shared by every clone of a middleware instance.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    config: Arc<OnceLock<Arc<CasAuthConfig>>>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create settings that are already configured.
    pub fn with_config(config: CasAuthConfig) -> Result<Self, ConfigError> {
        let settings = Self::new();
        settings.configure(config)?;
        Ok(settings)
    }

    /// Set the configuration. Fails once a configuration was set or used.
    pub fn configure(&self, config: CasAuthConfig) -> Result<(), ConfigError> {
        let config = config.validate()?;
        self.config
            .set(Arc::new(config))
            .map_err(|_| ConfigError::AlreadySet)
    }

    /// The active configuration, locking in the defaults on first use.
    pub fn get(&self) -> Arc<CasAuthConfig> {
        self.config
            .get_or_init(|| Arc::new(CasAuthConfig::default()))
            .clone()
    }
}

/// Load the config from the default file and environment variables.
pub fn load_config(instance: Option<&str>) -> Result<CasAuthConfig, LoadConfigError> {
    let config_file_path = crate::path::config_file()?;
    load_config_from_file(config_file_path, true, instance)
}

/// Load the config from a file and `CAS_AUTH_*` environment variables.
///
/// Top-level keys apply to every instance; the table named `instance` (if
/// any) overrides them for that middleware instance.
pub fn load_config_from_file(
    config_file_path: impl AsRef<Path>,
    load_environment_variables: bool,
    instance: Option<&str>,
) -> Result<CasAuthConfig, LoadConfigError> {
    let config_file_path = config_file_path.as_ref();

    // Layers (from lowest to highest precedence):
    // 1. Top-level keys of the file
    // 2. The instance table
    // 3. Environment variables with prefix CAS_AUTH_
    let mut config_builder =
        Config::builder().add_source(FileConfigSource::shared(config_file_path));

    if let Some(instance) = instance {
        config_builder =
            config_builder.add_source(FileConfigSource::instance(config_file_path, instance));
    }

    if load_environment_variables {
        config_builder = config_builder.add_source(
            Environment::with_prefix("CAS_AUTH")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("managed_apis"),
        );
    }

    let config = config_builder
        .build()?
        .try_deserialize::<CasAuthConfig>()?;

    Ok(config.validate()?)
}
