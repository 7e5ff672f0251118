use thiserror::Error;

/// Errors from the session file or in-memory token store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the OAuth authorization-code flow and token lifecycle.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The authorization server redirected back with `error=...`.
    #[error("Spotify authorization failed: {0}")]
    ProviderError(String),

    /// Redirect `state` did not match the stored nonce (or there was none).
    #[error("Authorization state mismatch")]
    StateMismatch,

    #[error("Authorization code missing from callback")]
    MissingCode,

    #[error("Token exchange failed with HTTP {status}: {body}")]
    TokenExchangeFailed { status: u16, body: String },

    #[error("Token refresh failed with HTTP {status}: {body}")]
    RefreshFailed { status: u16, body: String },

    /// No usable session remains; the user has to sign in again.
    #[error("Spotify session expired, sign in again")]
    ReauthRequired,

    #[error("Network error during authentication: {0}")]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to generate authorization state: {0}")]
    Nonce(getrandom::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The loopback callback server failed or timed out.
    #[error("OAuth callback failed: {reason}")]
    Callback { reason: String },
}

/// Errors from resource (GET) requests.
#[derive(Debug, Error)]
pub enum FetchError {
    /// HTTP 204: nothing is playing.
    #[error("No content")]
    NoContent,

    #[error("Access token rejected (HTTP 401)")]
    Unauthorized,

    #[error("Spotify API returned HTTP {status}")]
    Transient { status: u16 },

    #[error("Request timed out")]
    TimedOut,

    #[error("Network error: {0}")]
    Network(reqwest::Error),

    #[error("Network error: {0}")]
    Middleware(reqwest_middleware::Error),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::TimedOut
        } else {
            Self::Network(e)
        }
    }
}

impl From<reqwest_middleware::Error> for FetchError {
    fn from(e: reqwest_middleware::Error) -> Self {
        match e {
            reqwest_middleware::Error::Reqwest(e) => Self::from(e),
            other @ reqwest_middleware::Error::Middleware(_) => Self::Middleware(other),
        }
    }
}

/// Errors from playback control commands.
#[derive(Debug, Error)]
pub enum ControlError {
    /// HTTP 403: playback control needs a Premium account.
    #[error("Spotify Premium is required for playback control")]
    PremiumRequired,

    #[error("Playback command failed with HTTP {status}")]
    ControlFailed { status: u16 },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Errors that abort a dashboard load.
#[derive(Debug, Error)]
pub enum DashboardError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Failed to load user profile: {0}")]
    Profile(#[source] FetchError),
}
