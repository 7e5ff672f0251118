use crate::config::SpotifyProviderConfig;
use crate::error::AuthError;
use crate::token_store::{TokenRecord, TokenStore};
use async_trait::async_trait;
use axum::{extract::Query, response::Html, routing::get, Router};
use nowplaying_core::{Clock, SystemClock};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use url::Url;

/// Timeout for interactive OAuth callback (10 minutes)
const OAUTH_CALLBACK_TIMEOUT_SECS: u64 = 600;

const STATE_NONCE_LEN: usize = 16;
const NONCE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
/// Largest multiple of the alphabet size that fits in a byte; bytes at or
/// above it are rejected so every character is equally likely.
const NONCE_ACCEPT_BOUND: usize = 248;

/// Source of bearer tokens for resource requests.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// A token that has not expired yet, refreshing first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ReauthRequired`] when there is no usable session.
    async fn access_token(&self) -> Result<String, AuthError>;

    /// Refresh unconditionally, after the API rejected the current token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ReauthRequired`] when the refresh fails.
    async fn refresh_access_token(&self) -> Result<String, AuthError>;
}

/// Where the session currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    LoggedOut,
    Authenticated,
    /// A token exists but has expired; a refresh may still succeed
    Expired,
}

/// Query parameters of the OAuth redirect
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    /// Parse a raw redirect query string, with or without the leading `?`.
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        let query = query.strip_prefix('?').unwrap_or(query);
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }
        params
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Spotify OAuth session manager.
///
/// Owns the authorization-code flow and the token lifecycle:
///
/// ```text
/// LoggedOut -> AwaitingCallback -> ExchangingCode -> Authenticated
/// Authenticated -> Refreshing -> Authenticated | LoggedOut
/// ```
///
/// Tokens are persisted through a [`TokenStore`], so a restart picks up the
/// previous session.
pub struct SpotifyOAuth {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    scopes: Vec<String>,
    accounts_base_url: String,
    http: reqwest::Client,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    refresh_lock: Mutex<()>,
}

impl SpotifyOAuth {
    /// Create a new OAuth manager using the system clock
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &SpotifyProviderConfig, store: Arc<dyn TokenStore>) -> Result<Self, AuthError> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a new OAuth manager with a custom clock
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_clock(
        config: &SpotifyProviderConfig,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scopes: config.scopes.clone(),
            accounts_base_url: config.accounts_base_url.trim_end_matches('/').to_string(),
            http,
            store,
            clock,
            refresh_lock: Mutex::new(()),
        })
    }

    fn token_url(&self) -> String {
        format!("{}/api/token", self.accounts_base_url)
    }

    /// Start a login attempt.
    ///
    /// Stores a fresh state nonce (replacing any earlier one) and returns the
    /// authorization URL the user has to visit.
    ///
    /// # Errors
    ///
    /// Returns an error if the nonce cannot be generated or stored.
    pub fn begin_login(&self) -> Result<Url, AuthError> {
        let nonce = generate_state_nonce()?;
        self.store.put_state_nonce(&nonce)?;

        let mut url = Url::parse(&format!("{}/authorize", self.accounts_base_url))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("state", &nonce);

        debug!("Generated authorization URL");
        Ok(url)
    }

    /// Validate the redirect and extract the authorization code.
    ///
    /// The stored nonce is consumed whatever the outcome, so a redirect can
    /// be accepted at most once.
    ///
    /// # Errors
    ///
    /// [`AuthError::ProviderError`] if the redirect carries `error`,
    /// [`AuthError::StateMismatch`] if `state` is absent or differs from the
    /// stored nonce, [`AuthError::MissingCode`] if there is no code.
    pub fn complete_login(&self, params: &CallbackParams) -> Result<String, AuthError> {
        let expected = self.store.take_state_nonce()?;

        if let Some(error) = &params.error {
            return Err(AuthError::ProviderError(error.clone()));
        }

        match (expected.as_deref(), params.state.as_deref()) {
            (Some(expected), Some(received)) if expected == received => {}
            _ => return Err(AuthError::StateMismatch),
        }

        params
            .code
            .clone()
            .filter(|code| !code.is_empty())
            .ok_or(AuthError::MissingCode)
    }

    /// Exchange an authorization code for tokens. Does not persist them.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenExchangeFailed`] on a non-2xx response, or a
    /// network error.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenRecord, AuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .request_token(&form, |status, body| AuthError::TokenExchangeFailed { status, body })
            .await?;

        Ok(TokenRecord::issue(
            response.access_token,
            response.refresh_token.unwrap_or_default(),
            response.expires_in,
            self.clock.now_epoch_ms(),
        ))
    }

    /// Trade a refresh token for a new access token. Does not persist it.
    ///
    /// The returned record keeps `refresh_token` when the response carries
    /// no replacement.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RefreshFailed`] on a non-2xx response, or a
    /// network error.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenRecord, AuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self
            .request_token(&form, |status, body| AuthError::RefreshFailed { status, body })
            .await?;

        let refresh_token = response
            .refresh_token
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(TokenRecord::issue(
            response.access_token,
            refresh_token,
            response.expires_in,
            self.clock.now_epoch_ms(),
        ))
    }

    async fn request_token(
        &self,
        form: &[(&str, &str)],
        rejected: fn(u16, String) -> AuthError,
    ) -> Result<TokenResponse, AuthError> {
        let response = self.http.post(self.token_url()).form(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(rejected(status.as_u16(), body));
        }

        Ok(response.json().await?)
    }

    /// Finish a login from the redirect parameters and persist the tokens.
    ///
    /// Any failure leaves the session logged out.
    ///
    /// # Errors
    ///
    /// Returns the validation or exchange error.
    pub async fn handle_callback(&self, params: &CallbackParams) -> Result<(), AuthError> {
        let result = self.complete_and_store(params).await;
        if let Err(e) = &result {
            warn!("Spotify login failed: {}", e);
            self.clear_tokens();
        }
        result
    }

    async fn complete_and_store(&self, params: &CallbackParams) -> Result<(), AuthError> {
        let code = self.complete_login(params)?;
        let record = self.exchange_code(&code).await?;
        self.store.put(&record)?;
        info!("Successfully authenticated with Spotify");
        Ok(())
    }

    /// Current access token if unexpired, otherwise refresh and persist.
    ///
    /// No network request is made while the stored token is valid.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ReauthRequired`] when there is no session or the
    /// refresh fails (the stored tokens are cleared in that case).
    pub async fn get_valid_access_token(&self) -> Result<String, AuthError> {
        if let Some(record) = self.store.get()? {
            if record.is_valid_at(self.clock.now_epoch_ms()) {
                return Ok(record.access_token);
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited
        let Some(record) = self.store.get()? else {
            return Err(AuthError::ReauthRequired);
        };
        if record.is_valid_at(self.clock.now_epoch_ms()) {
            return Ok(record.access_token);
        }

        debug!("Access token expired, refreshing");
        self.refresh_and_store(&record).await
    }

    /// Refresh regardless of the stored expiry.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ReauthRequired`] when there is no session or the
    /// refresh fails (the stored tokens are cleared in that case).
    pub async fn refresh_session(&self) -> Result<String, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let Some(record) = self.store.get()? else {
            return Err(AuthError::ReauthRequired);
        };
        self.refresh_and_store(&record).await
    }

    async fn refresh_and_store(&self, record: &TokenRecord) -> Result<String, AuthError> {
        if record.refresh_token.is_empty() {
            warn!("Session has no refresh token, sign-in required");
            self.clear_tokens();
            return Err(AuthError::ReauthRequired);
        }

        info!("Refreshing Spotify access token");
        match self.refresh(&record.refresh_token).await {
            Ok(refreshed) => {
                self.store.put(&refreshed)?;
                Ok(refreshed.access_token)
            }
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                self.clear_tokens();
                Err(AuthError::ReauthRequired)
            }
        }
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn session_state(&self) -> Result<SessionState, AuthError> {
        Ok(match self.store.get()? {
            None => SessionState::LoggedOut,
            Some(record) if record.is_valid_at(self.clock.now_epoch_ms()) => SessionState::Authenticated,
            Some(_) => SessionState::Expired,
        })
    }

    /// Forget the session and any pending login attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub fn logout(&self) -> Result<(), AuthError> {
        self.store.clear()?;
        self.store.clear_state_nonce()?;
        info!("Signed out of Spotify");
        Ok(())
    }

    fn clear_tokens(&self) {
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear stored Spotify tokens: {}", e);
        }
    }

    /// Ensure we have a valid session, refreshing or signing in if needed
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails.
    pub async fn ensure_authenticated(&self) -> Result<(), AuthError> {
        info!("Checking for stored Spotify session...");

        match self.session_state()? {
            SessionState::Authenticated => {
                info!("Valid stored session found, skipping OAuth server");
                return Ok(());
            }
            SessionState::Expired => {
                info!("Stored session expired, refreshing...");
                match self.get_valid_access_token().await {
                    Ok(_) => return Ok(()),
                    Err(AuthError::ReauthRequired) => info!("Refresh failed, sign-in required"),
                    Err(e) => return Err(e),
                }
            }
            SessionState::LoggedOut => {}
        }

        info!("No valid session, starting OAuth server for interactive authentication...");
        self.authenticate_interactive().await
    }

    /// Run the login with a local callback server using axum
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot start, the callback times out,
    /// or the callback fails validation or code exchange.
    pub async fn authenticate_interactive(&self) -> Result<(), AuthError> {
        let (addr, callback_path) = self.parse_redirect_uri()?;

        let (tx, rx) = oneshot::channel::<CallbackParams>();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let app = Self::build_callback_router(&callback_path, tx);
        let listener = Self::start_callback_server(addr, &callback_path).await?;

        let auth_url = self.begin_login()?;
        Self::prompt_authorization(auth_url.as_str(), addr, &callback_path);

        let params = Self::wait_for_callback(rx, listener, app).await?;

        info!("Received authorization callback, exchanging code for token...");
        self.handle_callback(&params).await
    }

    /// Socket address and path the redirect URI points at
    fn parse_redirect_uri(&self) -> Result<(SocketAddr, String), AuthError> {
        let parsed = Url::parse(&self.redirect_uri)?;

        let host = match parsed.host_str() {
            None | Some("localhost") => "127.0.0.1",
            Some(host) => host,
        };
        let port = parsed.port().unwrap_or(8888);

        let addr = format!("{host}:{port}")
            .parse()
            .map_err(|e| AuthError::Callback {
                reason: format!("Invalid callback address {host}:{port}: {e}"),
            })?;

        Ok((addr, parsed.path().to_string()))
    }

    fn build_callback_router(
        callback_path: &str,
        tx: Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>,
    ) -> Router {
        Router::new().route(
            callback_path,
            get(move |Query(params): Query<CallbackParams>| {
                let tx = tx.clone();
                async move { Self::handle_callback_request(params, tx).await }
            }),
        )
    }

    /// Forward the first redirect to the waiting login and render a page.
    async fn handle_callback_request(
        params: CallbackParams,
        tx: Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>,
    ) -> Html<String> {
        let page = match (&params.error, &params.code) {
            (Some(error), _) => failure_html(error),
            (None, Some(_)) => SUCCESS_HTML.to_string(),
            (None, None) => failure_html("No authorization code received."),
        };

        if let Some(sender) = tx.lock().await.take() {
            let _ = sender.send(params);
        }

        Html(page)
    }

    async fn start_callback_server(
        addr: SocketAddr,
        callback_path: &str,
    ) -> Result<tokio::net::TcpListener, AuthError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| AuthError::Callback {
                reason: format!("Failed to bind to {addr}: {e}"),
            })?;

        info!(
            "OAuth callback server listening on http://{}{}",
            addr, callback_path
        );
        Ok(listener)
    }

    /// Open the browser, falling back to printing the URL
    fn prompt_authorization(auth_url: &str, addr: SocketAddr, callback_path: &str) {
        info!("Opening browser for Spotify authorization...");

        if let Err(e) = open::that(auth_url) {
            warn!("Could not open browser automatically: {}", e);
            info!("Please open this URL manually:\n{auth_url}");
        }

        info!(
            "Waiting for authorization callback on http://{}{callback_path}...",
            addr
        );
    }

    async fn wait_for_callback(
        rx: oneshot::Receiver<CallbackParams>,
        listener: tokio::net::TcpListener,
        app: Router,
    ) -> Result<CallbackParams, AuthError> {
        let server = axum::serve(listener, app);

        tokio::select! {
            result = rx => {
                result.map_err(|_| AuthError::Callback {
                    reason: "Callback channel closed unexpectedly".into(),
                })
            }
            _ = server => {
                Err(AuthError::Callback {
                    reason: "Server stopped unexpectedly".into(),
                })
            }
            () = tokio::time::sleep(Duration::from_secs(OAUTH_CALLBACK_TIMEOUT_SECS)) => {
                Err(AuthError::Callback {
                    reason: format!(
                        "Timed out after {} minutes. Please try again.",
                        OAUTH_CALLBACK_TIMEOUT_SECS / 60
                    ),
                })
            }
        }
    }
}

#[async_trait]
impl AccessTokenProvider for SpotifyOAuth {
    async fn access_token(&self) -> Result<String, AuthError> {
        self.get_valid_access_token().await
    }

    async fn refresh_access_token(&self) -> Result<String, AuthError> {
        self.refresh_session().await
    }
}

/// 16 alphanumeric characters from the OS CSPRNG
fn generate_state_nonce() -> Result<String, AuthError> {
    let mut nonce = String::with_capacity(STATE_NONCE_LEN);
    let mut buf = [0u8; 32];

    while nonce.len() < STATE_NONCE_LEN {
        getrandom::getrandom(&mut buf).map_err(AuthError::Nonce)?;
        for byte in buf {
            let index = usize::from(byte);
            if index >= NONCE_ACCEPT_BOUND {
                continue;
            }
            nonce.push(char::from(NONCE_ALPHABET[index % NONCE_ALPHABET.len()]));
            if nonce.len() == STATE_NONCE_LEN {
                break;
            }
        }
    }

    Ok(nonce)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn failure_html(message: &str) -> String {
    let message = escape_html(message);
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Authorization Failed</title></head>
<body style="font-family: sans-serif; text-align: center; padding: 50px;">
    <h1>Authorization Failed</h1>
    <p>{message}</p>
    <p>Please close this window and try again.</p>
</body>
</html>"#
    )
}

const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>Authorization Received</title></head>
<body style="font-family: sans-serif; text-align: center; padding: 50px; background: #191414; color: white;">
    <h1>Authorization Received</h1>
    <p>Return to the terminal to continue. You can close this window.</p>
</body>
</html>"#;
