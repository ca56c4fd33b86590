//! Runtime settings
//!
//! The provider constants (endpoints, client ids, scopes) live with each
//! adapter. Only values that depend on the hosting application can be
//! overridden from the environment.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Staleness window for cached directory listings
pub const DEFAULT_MAX_CACHE_AGE: Duration = Duration::from_secs(2 * 60);

/// How long the user has to complete authorization in the popup
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between popup location checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Byte range size for chunked uploads (5 MiB)
pub const DEFAULT_SLICE_SIZE: usize = 5 * 1024 * 1024;

/// HTTP client timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Static callback page served by the hosting application
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080/oauth/callback.html";

/// Environment variable overriding the callback page URL
pub const REDIRECT_URI_ENV: &str = "CLOUDSYNC_REDIRECT_URI";

/// Environment variable overriding the HTTP timeout (seconds)
pub const REQUEST_TIMEOUT_ENV: &str = "CLOUDSYNC_REQUEST_TIMEOUT_SECS";

/// Directory cache settings
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_cache_age: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_cache_age: DEFAULT_MAX_CACHE_AGE,
        }
    }
}

/// Popup authorization settings
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub redirect_uri: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_AUTH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
        }
    }
}

/// All settings for a registry of cached sources
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub auth: AuthSettings,
    pub upload_slice_size: usize,
    pub request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            auth: AuthSettings::default(),
            upload_slice_size: DEFAULT_SLICE_SIZE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Settings {
    /// Defaults, with the host-specific values taken from the environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(uri) = lookup(REDIRECT_URI_ENV).filter(|v| !v.trim().is_empty()) {
            settings.auth.redirect_uri = uri.trim().to_string();
        }

        if let Some(raw) = lookup(REQUEST_TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => settings.request_timeout = Duration::from_secs(secs),
                _ => warn!(value = %raw, "Ignoring invalid {}", REQUEST_TIMEOUT_ENV),
            }
        }

        settings
    }

    /// Build the shared HTTP client
    pub fn http_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
    }

    /// Build the client for OAuth2 token requests, which never follows redirects
    pub fn token_client(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
    }
}
