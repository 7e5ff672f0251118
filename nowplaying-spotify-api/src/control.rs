//! Playback control relay.

use crate::client::{PlayerApi, PlayerCommand};
use crate::error::ControlError;
use crate::oauth::AccessTokenProvider;
use crate::poller::sync_once;
use nowplaying_core::SyncEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Forwards play/pause/skip to the user's active device and reconciles the
/// [`SyncEngine`] from the outcome.
///
/// Play and pause update the snapshot immediately. Skips cannot know the next
/// track, so they schedule a single re-fetch shortly after the command.
pub struct PlaybackControls {
    tokens: Arc<dyn AccessTokenProvider>,
    api: Arc<dyn PlayerApi>,
    sync_engine: Arc<SyncEngine>,
    skip_refetch_delay: Duration,
    cancel_token: CancellationToken,
}

impl PlaybackControls {
    pub fn new(
        tokens: Arc<dyn AccessTokenProvider>,
        api: Arc<dyn PlayerApi>,
        sync_engine: Arc<SyncEngine>,
        skip_refetch_delay: Duration,
        cancel_token: Option<CancellationToken>,
    ) -> Self {
        Self {
            tokens,
            api,
            sync_engine,
            skip_refetch_delay,
            cancel_token: cancel_token.unwrap_or_default(),
        }
    }

    /// Resume playback.
    ///
    /// # Errors
    ///
    /// [`ControlError::PremiumRequired`] for free accounts, or another
    /// [`ControlError`] if the command fails.
    pub async fn play(&self) -> Result<(), ControlError> {
        self.send(PlayerCommand::Play).await?;
        self.sync_engine.set_playing(true).await;
        Ok(())
    }

    /// Pause playback.
    ///
    /// # Errors
    ///
    /// [`ControlError::PremiumRequired`] for free accounts, or another
    /// [`ControlError`] if the command fails.
    pub async fn pause(&self) -> Result<(), ControlError> {
        self.send(PlayerCommand::Pause).await?;
        self.sync_engine.set_playing(false).await;
        Ok(())
    }

    /// Pause if playing, otherwise play.
    ///
    /// # Errors
    ///
    /// See [`Self::play`] and [`Self::pause`].
    pub async fn toggle(&self) -> Result<(), ControlError> {
        if self.sync_engine.is_playing().await {
            self.pause().await
        } else {
            self.play().await
        }
    }

    /// Skip to the next track.
    ///
    /// # Errors
    ///
    /// [`ControlError::PremiumRequired`] for free accounts, or another
    /// [`ControlError`] if the command fails.
    pub async fn skip_next(&self) -> Result<(), ControlError> {
        self.send(PlayerCommand::Next).await?;
        self.schedule_refetch();
        Ok(())
    }

    /// Skip to the previous track.
    ///
    /// # Errors
    ///
    /// [`ControlError::PremiumRequired`] for free accounts, or another
    /// [`ControlError`] if the command fails.
    pub async fn skip_previous(&self) -> Result<(), ControlError> {
        self.send(PlayerCommand::Previous).await?;
        self.schedule_refetch();
        Ok(())
    }

    /// Cancel pending re-fetches
    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    async fn send(&self, command: PlayerCommand) -> Result<(), ControlError> {
        let token = self.tokens.access_token().await?;
        let device_id = self.active_device_id(&token).await;

        let result = self
            .api
            .send_command(&token, command, device_id.as_deref())
            .await;

        // One refresh and retry, as for polling
        if let Err(ControlError::ControlFailed { status: 401 }) = result {
            debug!("Access token rejected for {:?}, refreshing", command);
            let fresh = self.tokens.refresh_access_token().await?;
            self.api
                .send_command(&fresh, command, device_id.as_deref())
                .await?;
        } else {
            result?;
        }

        info!("Sent {:?} to Spotify", command);
        Ok(())
    }

    /// Active device ID, or `None` to let Spotify pick
    async fn active_device_id(&self, access_token: &str) -> Option<String> {
        match self.api.devices(access_token).await {
            Ok(devices) => devices
                .into_iter()
                .find(|device| device.is_active)
                .and_then(|device| device.id),
            Err(e) => {
                debug!("Device lookup failed, sending without device id: {}", e);
                None
            }
        }
    }

    fn schedule_refetch(&self) {
        let tokens = self.tokens.clone();
        let api = self.api.clone();
        let sync_engine = self.sync_engine.clone();
        let delay = self.skip_refetch_delay;
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = cancel_token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let outcome = sync_once(tokens.as_ref(), api.as_ref(), &sync_engine, &cancel_token).await;
                    debug!("Re-fetched playback after skip: {:?}", outcome);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Device;
    use crate::test_support::{FakePlayerApi, FakeTokens, Fetch};
    use nowplaying_core::{PlaybackSnapshot, TrackInfo};

    fn snapshot(id: &str, is_playing: bool) -> PlaybackSnapshot {
        PlaybackSnapshot::new(
            Some(TrackInfo::new(id, "Song", vec!["Artist".into()], "Album", 200_000)),
            10_000,
            is_playing,
        )
    }

    fn device(id: &str, is_active: bool) -> Device {
        Device {
            id: Some(id.into()),
            name: id.into(),
            is_active,
            device_type: "Computer".into(),
            volume_percent: None,
        }
    }

    fn controls(api: &Arc<FakePlayerApi>, engine: &Arc<SyncEngine>) -> PlaybackControls {
        PlaybackControls::new(
            FakeTokens::new(true),
            api.clone(),
            engine.clone(),
            Duration::from_millis(500),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_targets_active_device_and_updates_snapshot() {
        let engine = SyncEngine::new();
        engine.publish_snapshot(snapshot("t1", false)).await;
        let api = FakePlayerApi::new();
        api.set_devices(vec![device("phone", false), device("laptop", true)]);

        controls(&api, &engine).play().await.expect("play");

        assert_eq!(
            api.sent_commands(),
            vec![(PlayerCommand::Play, Some("laptop".to_string()))]
        );
        assert!(engine.is_playing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_without_active_device_omits_device_id() {
        let engine = SyncEngine::new();
        engine.publish_snapshot(snapshot("t1", true)).await;
        let api = FakePlayerApi::new();
        api.set_devices(vec![device("phone", false)]);

        controls(&api, &engine).pause().await.expect("pause");

        assert_eq!(api.sent_commands(), vec![(PlayerCommand::Pause, None)]);
        assert!(!engine.is_playing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_premium_required_leaves_snapshot_unchanged() {
        let engine = SyncEngine::new();
        engine.publish_snapshot(snapshot("t1", false)).await;
        let api = FakePlayerApi::new();
        api.fail_commands(403);

        let result = controls(&api, &engine).play().await;

        assert!(matches!(result, Err(ControlError::PremiumRequired)));
        assert!(!engine.is_playing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failure_reports_status() {
        let engine = SyncEngine::new();
        let api = FakePlayerApi::new();
        api.fail_commands(404);

        assert!(matches!(
            controls(&api, &engine).skip_next().await,
            Err(ControlError::ControlFailed { status: 404 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_token_is_refreshed_once() {
        let engine = SyncEngine::new();
        let tokens = FakeTokens::new(true);
        let api = FakePlayerApi::new();
        api.reject_token("token-1");
        let controls = PlaybackControls::new(
            tokens.clone(),
            api.clone(),
            engine.clone(),
            Duration::from_millis(500),
            None,
        );

        controls.play().await.expect("play after refresh");

        assert_eq!(tokens.refreshes(), 1);
        assert_eq!(
            api.sent_commands(),
            vec![(PlayerCommand::Play, None), (PlayerCommand::Play, None)]
        );
        assert!(engine.is_playing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_refetches_after_delay() {
        let engine = SyncEngine::new();
        engine.publish_snapshot(snapshot("t1", true)).await;
        let api = FakePlayerApi::new();
        api.script([Fetch::Playing(snapshot("t2", true))]);

        controls(&api, &engine).skip_next().await.expect("skip");
        assert_eq!(api.sent_commands(), vec![(PlayerCommand::Next, None)]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(api.fetch_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(api.fetch_count(), 1);
        assert_eq!(engine.current_track().await.map(|t| t.id), Some("t2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_refetch() {
        let engine = SyncEngine::new();
        let api = FakePlayerApi::new();
        api.script([Fetch::Playing(snapshot("t2", true))]);
        let controls = controls(&api, &engine);

        controls.skip_previous().await.expect("skip");
        controls.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(api.fetch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_follows_current_state() {
        let engine = SyncEngine::new();
        engine.publish_snapshot(snapshot("t1", true)).await;
        let api = FakePlayerApi::new();
        let controls = controls(&api, &engine);

        controls.toggle().await.expect("toggle");
        controls.toggle().await.expect("toggle");

        assert_eq!(
            api.sent_commands(),
            vec![(PlayerCommand::Pause, None), (PlayerCommand::Play, None)]
        );
        assert!(engine.is_playing().await);
    }
}
