//! Spotify now-playing polling.

use crate::client::PlayerApi;
use crate::error::{AuthError, FetchError};
use crate::oauth::AccessTokenProvider;
use async_trait::async_trait;
use nowplaying_core::{CoreError, PlaybackSnapshot, PlaybackSource, SyncEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one fetch-and-publish round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    Published,
    /// Fetch failed transiently; a `FetchFailed` event was emitted
    Failed,
    /// Completed after cancellation and was dropped
    Discarded,
    /// Refresh failed; a `ReauthRequired` event was emitted
    SessionExpired,
}

/// Fetch the currently playing item once and publish it.
///
/// A 401 triggers exactly one token refresh and one retry. A second 401
/// after a successful refresh counts as a transient failure.
pub(crate) async fn sync_once(
    tokens: &dyn AccessTokenProvider,
    api: &dyn PlayerApi,
    sync_engine: &Arc<SyncEngine>,
    cancel_token: &CancellationToken,
) -> SyncOutcome {
    let token = match tokens.access_token().await {
        Ok(token) => token,
        Err(AuthError::ReauthRequired) => return expire_session(sync_engine).await,
        Err(e) => {
            warn!("Could not obtain Spotify access token: {}", e);
            sync_engine.report_fetch_error(e.to_string());
            return SyncOutcome::Failed;
        }
    };

    let mut result = api.currently_playing(&token).await;
    if matches!(result, Err(FetchError::Unauthorized)) {
        debug!("Access token rejected, refreshing");
        match tokens.refresh_access_token().await {
            Ok(fresh) => result = api.currently_playing(&fresh).await,
            Err(e) => {
                warn!("Token refresh after 401 failed: {}", e);
                return expire_session(sync_engine).await;
            }
        }
    }

    if cancel_token.is_cancelled() {
        debug!("Discarding playback fetched after stop");
        return SyncOutcome::Discarded;
    }

    match result {
        Ok(snapshot) => {
            sync_engine.publish_snapshot(snapshot).await;
            SyncOutcome::Published
        }
        Err(FetchError::NoContent) => {
            debug!("Nothing playing");
            sync_engine
                .publish_snapshot(PlaybackSnapshot::nothing_playing())
                .await;
            SyncOutcome::Published
        }
        Err(e) => {
            warn!("Playback fetch failed: {}", e);
            sync_engine.report_fetch_error(e.to_string());
            SyncOutcome::Failed
        }
    }
}

async fn expire_session(sync_engine: &Arc<SyncEngine>) -> SyncOutcome {
    sync_engine.stop_progress().await;
    sync_engine.notify_reauth_required();
    SyncOutcome::SessionExpired
}

/// Spotify playback poller implementing [`PlaybackSource`].
pub struct SpotifyPoller {
    tokens: Arc<dyn AccessTokenProvider>,
    api: Arc<dyn PlayerApi>,
    sync_engine: Arc<SyncEngine>,
    poll_interval: Duration,
    cancel_token: CancellationToken,
}

impl SpotifyPoller {
    /// Create a new Spotify poller
    ///
    /// # Arguments
    /// * `tokens` - Source of access tokens
    /// * `api` - Player endpoints
    /// * `sync_engine` - Sync engine to publish snapshots to
    /// * `poll_interval` - Time between ticks; the first tick is immediate
    /// * `cancel_token` - Optional external cancellation token for graceful shutdown
    pub fn new(
        tokens: Arc<dyn AccessTokenProvider>,
        api: Arc<dyn PlayerApi>,
        sync_engine: Arc<SyncEngine>,
        poll_interval: Duration,
        cancel_token: Option<CancellationToken>,
    ) -> Self {
        Self {
            tokens,
            api,
            sync_engine,
            poll_interval,
            cancel_token: cancel_token.unwrap_or_default(),
        }
    }

    /// Start polling in a background task
    #[must_use]
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!("Spotify poller stopped with error: {}", e);
            }
        })
    }
}

#[async_trait]
impl PlaybackSource for SpotifyPoller {
    fn name(&self) -> &'static str {
        "spotify"
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    async fn run(&self) -> Result<(), CoreError> {
        info!(
            "Starting Spotify playback poller (every {}ms)",
            self.poll_interval.as_millis()
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                outcome = sync_once(
                    self.tokens.as_ref(),
                    self.api.as_ref(),
                    &self.sync_engine,
                    &self.cancel_token,
                ) => outcome,
            };

            if outcome == SyncOutcome::SessionExpired {
                error!("Spotify session expired, stopping poller");
                return Err(CoreError::SessionExpired);
            }
        }

        // Extrapolation must not outlive the loop feeding it
        self.sync_engine.stop_progress().await;
        info!("Poller shutting down gracefully");
        Ok(())
    }
}
