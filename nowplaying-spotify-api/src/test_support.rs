//! Scripted stand-ins for the Spotify endpoints and the crate's seams.

use crate::client::{Device, PlayerApi, PlayerCommand};
use crate::error::{AuthError, ControlError, FetchError};
use crate::oauth::AccessTokenProvider;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use nowplaying_core::{Clock, PlaybackSnapshot};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wall clock that only moves when told to.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn at(now_ms: i64) -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(now_ms)))
    }

    pub fn set(&self, now_ms: i64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub body: String,
}

#[derive(Default)]
struct FakeState {
    /// Queued (status, body) per "METHOD /path"; the last entry repeats
    routes: Mutex<HashMap<String, VecDeque<(u16, String)>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// In-process HTTP server playing the accounts and Web API endpoints.
pub struct FakeServer {
    base_url: String,
    state: Arc<FakeState>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("fake server address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Queue a response for `method path`
    pub fn respond(&self, method: &str, path: &str, status: u16, body: impl Into<String>) {
        self.state
            .routes
            .lock()
            .expect("routes lock")
            .entry(format!("{method} {path}"))
            .or_default()
            .push_back((status, body.into()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().expect("requests lock").clone()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

async fn handle(
    State(state): State<Arc<FakeState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.requests.lock().expect("requests lock").push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    let key = format!("{method} {}", uri.path());
    let scripted = {
        let mut routes = state.routes.lock().expect("routes lock");
        routes.get_mut(&key).and_then(|queue| {
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        })
    };

    match scripted {
        Some((status, body)) => (
            StatusCode::from_u16(status).expect("valid status"),
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Token provider with a fixed access token and scripted refresh outcomes.
pub struct FakeTokens {
    token: Mutex<String>,
    refresh_succeeds: bool,
    refresh_calls: AtomicUsize,
}

impl FakeTokens {
    pub fn new(refresh_succeeds: bool) -> Arc<Self> {
        Arc::new(Self {
            token: Mutex::new("token-1".into()),
            refresh_succeeds,
            refresh_calls: AtomicUsize::new(0),
        })
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccessTokenProvider for FakeTokens {
    async fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.token.lock().expect("token lock").clone())
    }

    async fn refresh_access_token(&self) -> Result<String, AuthError> {
        let calls = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_succeeds {
            return Err(AuthError::ReauthRequired);
        }
        let token = format!("token-{}", calls + 1);
        *self.token.lock().expect("token lock") = token.clone();
        Ok(token)
    }
}

/// Scripted result of a "currently playing" fetch
#[derive(Debug, Clone)]
pub enum Fetch {
    Playing(PlaybackSnapshot),
    /// Answers with the snapshot once the delay has passed
    Delayed(Duration, PlaybackSnapshot),
    NoContent,
    Unauthorized,
    Status(u16),
}

/// Player API with scripted responses and a call log.
#[derive(Default)]
pub struct FakePlayerApi {
    fetches: Mutex<VecDeque<Fetch>>,
    pub fetch_tokens: Mutex<Vec<String>>,
    devices: Mutex<Vec<Device>>,
    command_status: Mutex<Option<u16>>,
    rejected_token: Mutex<Option<String>>,
    pub commands: Mutex<Vec<(PlayerCommand, Option<String>)>>,
}

impl FakePlayerApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue fetch results; the last one repeats
    pub fn script(&self, fetches: impl IntoIterator<Item = Fetch>) {
        self.fetches.lock().expect("fetch lock").extend(fetches);
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.lock().expect("devices lock") = devices;
    }

    /// Make every command fail with `status`
    pub fn fail_commands(&self, status: u16) {
        *self.command_status.lock().expect("status lock") = Some(status);
    }

    /// Answer 401 to commands sent with `token`
    pub fn reject_token(&self, token: &str) {
        *self.rejected_token.lock().expect("rejected token lock") = Some(token.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_tokens.lock().expect("token log lock").len()
    }

    pub fn sent_commands(&self) -> Vec<(PlayerCommand, Option<String>)> {
        self.commands.lock().expect("command lock").clone()
    }
}

#[async_trait]
impl PlayerApi for FakePlayerApi {
    async fn currently_playing(&self, access_token: &str) -> Result<PlaybackSnapshot, FetchError> {
        self.fetch_tokens
            .lock()
            .expect("token log lock")
            .push(access_token.to_string());

        let next = {
            let mut fetches = self.fetches.lock().expect("fetch lock");
            if fetches.len() > 1 {
                fetches.pop_front()
            } else {
                fetches.front().cloned()
            }
        };

        match next.unwrap_or(Fetch::NoContent) {
            Fetch::Playing(snapshot) => Ok(snapshot),
            Fetch::Delayed(delay, snapshot) => {
                tokio::time::sleep(delay).await;
                Ok(snapshot)
            }
            Fetch::NoContent => Err(FetchError::NoContent),
            Fetch::Unauthorized => Err(FetchError::Unauthorized),
            Fetch::Status(status) => Err(FetchError::Transient { status }),
        }
    }

    async fn devices(&self, _access_token: &str) -> Result<Vec<Device>, FetchError> {
        Ok(self.devices.lock().expect("devices lock").clone())
    }

    async fn send_command(
        &self,
        access_token: &str,
        command: PlayerCommand,
        device_id: Option<&str>,
    ) -> Result<(), ControlError> {
        self.commands
            .lock()
            .expect("command lock")
            .push((command, device_id.map(str::to_string)));

        if self.rejected_token.lock().expect("rejected token lock").as_deref() == Some(access_token) {
            return Err(ControlError::ControlFailed { status: 401 });
        }

        match *self.command_status.lock().expect("status lock") {
            None => Ok(()),
            Some(403) => Err(ControlError::PremiumRequired),
            Some(status) => Err(ControlError::ControlFailed { status }),
        }
    }
}
