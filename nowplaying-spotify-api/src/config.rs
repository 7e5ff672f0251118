//! Spotify provider configuration.

use const_format::concatcp;
use nowplaying_core::{CoreError, ProvidersConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Provider name used in config file
pub const PROVIDER_NAME: &str = "spotify";

pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8888/callback";
pub const DEFAULT_ACCOUNTS_BASE_URL: &str = "https://accounts.spotify.com";
pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com/v1";

const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
const DEFAULT_PROGRESS_TICK_MS: u64 = 1_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SKIP_REFETCH_DELAY_MS: u64 = 500;

/// Scopes requested at login
pub const DEFAULT_SCOPES: &[&str] = &[
    "user-read-private",
    "user-read-email",
    "user-top-read",
    "user-read-recently-played",
    "user-read-currently-playing",
    "user-read-playback-state",
    "user-modify-playback-state",
];

/// Spotify-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotifyProviderConfig {
    /// Spotify OAuth client ID
    pub client_id: String,
    /// Spotify OAuth client secret
    pub client_secret: String,
    /// OAuth redirect URI, also where the loopback callback server listens
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_accounts_base_url")]
    pub accounts_base_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Now-playing polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Local progress extrapolation step in milliseconds
    #[serde(default = "default_progress_tick")]
    pub progress_tick_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Delay before re-fetching playback after a skip
    #[serde(default = "default_skip_refetch_delay")]
    pub skip_refetch_delay_ms: u64,
}

fn default_redirect_uri() -> String {
    DEFAULT_REDIRECT_URI.into()
}

fn default_scopes() -> Vec<String> {
    DEFAULT_SCOPES.iter().map(|s| (*s).to_string()).collect()
}

fn default_accounts_base_url() -> String {
    DEFAULT_ACCOUNTS_BASE_URL.into()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.into()
}

const fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

const fn default_progress_tick() -> u64 {
    DEFAULT_PROGRESS_TICK_MS
}

const fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

const fn default_skip_refetch_delay() -> u64 {
    DEFAULT_SKIP_REFETCH_DELAY_MS
}

impl SpotifyProviderConfig {
    /// Config with the given credentials and defaults for everything else
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: default_redirect_uri(),
            scopes: default_scopes(),
            accounts_base_url: default_accounts_base_url(),
            api_base_url: default_api_base_url(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            progress_tick_ms: DEFAULT_PROGRESS_TICK_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            skip_refetch_delay_ms: DEFAULT_SKIP_REFETCH_DELAY_MS,
        }
    }

    /// Extract Spotify config from the dynamic providers config.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be parsed.
    pub fn from_providers(providers: &ProvidersConfig) -> Result<Option<Self>, CoreError> {
        providers.get(PROVIDER_NAME)
    }

    /// Validate that required fields are present.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or empty, or if a
    /// URL or interval is unusable.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.client_id.is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "providers.spotify.client_id".into(),
            });
        }
        if self.client_secret.is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "providers.spotify.client_secret".into(),
            });
        }
        for (field, value) in [
            ("redirect_uri", &self.redirect_uri),
            ("accounts_base_url", &self.accounts_base_url),
            ("api_base_url", &self.api_base_url),
        ] {
            if let Err(e) = url::Url::parse(value) {
                return Err(CoreError::ConfigInvalid {
                    message: format!("providers.spotify.{field} is not a valid URL: {e}"),
                });
            }
        }
        for (field, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("progress_tick_ms", self.progress_tick_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(CoreError::ConfigInvalid {
                    message: format!("providers.spotify.{field} must be positive"),
                });
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub const fn skip_refetch_delay(&self) -> Duration {
        Duration::from_millis(self.skip_refetch_delay_ms)
    }
}

/// Config template for Spotify provider.
/// This is appended to the base config template when creating a new config file.
pub const CONFIG_TEMPLATE: &str = concatcp!(
    r#"[providers.spotify]
# Get these from https://developer.spotify.com/dashboard
client_id = ""
client_secret = ""
# Must match a redirect URI registered for the app
redirect_uri = ""#,
    DEFAULT_REDIRECT_URI,
    r#""
# How often to poll the currently playing track
poll_interval_ms = "#,
    DEFAULT_POLL_INTERVAL_MS,
    r"
# Local progress update step between polls
progress_tick_ms = ",
    DEFAULT_PROGRESS_TICK_MS,
    r"
# request_timeout_ms = ",
    DEFAULT_REQUEST_TIMEOUT_MS,
    r"
# skip_refetch_delay_ms = ",
    DEFAULT_SKIP_REFETCH_DELAY_MS,
    "\n\n"
);

#[cfg(test)]
mod tests {
    use super::*;
    use nowplaying_core::{build_config_template, NowPlayingConfig};

    fn parse(section: &str) -> SpotifyProviderConfig {
        let config = NowPlayingConfig::from_toml_str(section).expect("config should parse");
        SpotifyProviderConfig::from_providers(&config.providers)
            .expect("section should parse")
            .expect("section should exist")
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse("[providers.spotify]\nclient_id = \"id\"\nclient_secret = \"secret\"\n");

        assert_eq!(config.redirect_uri, DEFAULT_REDIRECT_URI);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.progress_tick(), Duration::from_secs(1));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.skip_refetch_delay(), Duration::from_millis(500));
        assert!(config.scopes.iter().any(|s| s == "user-top-read"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_template_parses_and_requires_credentials() {
        let providers: &[&str] = &[CONFIG_TEMPLATE];
        let config = parse(&build_config_template(Some(providers)));

        assert_eq!(config.poll_interval_ms, 10_000);
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigMissingField { field }) if field == "providers.spotify.client_id"
        ));
    }

    #[test]
    fn test_missing_secret_reported() {
        let config = SpotifyProviderConfig::new("id", "");
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigMissingField { field }) if field == "providers.spotify.client_secret"
        ));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut config = SpotifyProviderConfig::new("id", "secret");
        config.api_base_url = "not a url".into();
        assert!(matches!(config.validate(), Err(CoreError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = SpotifyProviderConfig::new("id", "secret");
        config.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(CoreError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let mut config = SpotifyProviderConfig::new("id", "secret");
        config.request_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigInvalid { message }) if message.contains("request_timeout_ms")
        ));
    }
}
