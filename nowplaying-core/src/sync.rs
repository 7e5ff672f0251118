use crate::playback::{PlaybackSnapshot, TrackInfo};
use crate::progress::ProgressExtrapolation;
use crate::time::DurationExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default interval between locally extrapolated progress updates
const DEFAULT_PROGRESS_STEP: Duration = Duration::from_secs(1);

/// Events emitted by the sync engine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A fresh snapshot replaced the current one
    SnapshotUpdated { snapshot: PlaybackSnapshot },
    /// The current track changed (`None` when nothing is playing anymore)
    TrackChanged { track: Option<TrackInfo> },
    /// Progress extrapolated locally between polls
    ProgressTick { progress_ms: u64, duration_ms: u64 },
    /// The session could not be refreshed; the user has to sign in again
    ReauthRequired,
    /// A fetch failed transiently; polling continues
    FetchFailed { message: String },
}

/// Sync engine state
struct SyncEngineInner {
    snapshot: PlaybackSnapshot,
    /// Bumped on every installed snapshot; stale progress tasks compare against it
    generation: u64,
    progress_token: Option<CancellationToken>,
}

/// Owner of the current playback snapshot and its progress timer.
///
/// Pollers and control relays publish snapshots here; any number of
/// listeners subscribe to [`SyncEvent`]s. Publishing a snapshot always
/// cancels the running progress timer and starts a new one if the snapshot
/// is playing, so the extrapolated and polled positions cannot drift apart.
pub struct SyncEngine {
    inner: RwLock<SyncEngineInner>,
    event_tx: broadcast::Sender<SyncEvent>,
    progress_step: Duration,
    cancel_token: CancellationToken,
}

impl SyncEngine {
    /// Create a new sync engine with a one second progress step
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_progress_step(DEFAULT_PROGRESS_STEP)
    }

    /// Create a new sync engine with a custom progress step
    #[must_use]
    pub fn with_progress_step(progress_step: Duration) -> Arc<Self> {
        Arc::new(Self::build(progress_step))
    }

    fn build(progress_step: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        Self {
            inner: RwLock::new(SyncEngineInner {
                snapshot: PlaybackSnapshot::nothing_playing(),
                generation: 0,
                progress_token: None,
            }),
            event_tx,
            progress_step,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Replace the current snapshot and restart progress extrapolation
    pub async fn publish_snapshot(self: &Arc<Self>, snapshot: PlaybackSnapshot) {
        let mut inner = self.inner.write().await;
        self.install(&mut inner, snapshot);
    }

    /// Flip the playing flag after a successful play/pause command.
    ///
    /// The remote player confirmed the change, so the current snapshot is
    /// re-published with the new flag instead of waiting for the next poll.
    pub async fn set_playing(self: &Arc<Self>, is_playing: bool) {
        let mut inner = self.inner.write().await;
        let snapshot = PlaybackSnapshot {
            is_playing,
            ..inner.snapshot.clone()
        };
        self.install(&mut inner, snapshot);
    }

    fn install(self: &Arc<Self>, inner: &mut SyncEngineInner, snapshot: PlaybackSnapshot) {
        if let Some(token) = inner.progress_token.take() {
            token.cancel();
        }
        inner.generation = inner.generation.wrapping_add(1);

        if inner.snapshot.track_changed(&snapshot) {
            let _ = self.event_tx.send(SyncEvent::TrackChanged {
                track: snapshot.track.clone(),
            });
        }
        let _ = self.event_tx.send(SyncEvent::SnapshotUpdated {
            snapshot: snapshot.clone(),
        });

        if !self.cancel_token.is_cancelled() {
            if let Some(extrapolation) =
                ProgressExtrapolation::from_snapshot(&snapshot, self.progress_step.as_millis_u64())
            {
                let token = self.cancel_token.child_token();
                inner.progress_token = Some(token.clone());
                self.spawn_progress(inner.generation, extrapolation, token);
            }
        }

        inner.snapshot = snapshot;
    }

    fn spawn_progress(
        self: &Arc<Self>,
        generation: u64,
        mut extrapolation: ProgressExtrapolation,
        token: CancellationToken,
    ) {
        let engine = Arc::downgrade(self);
        let step = self.progress_step;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + step, step);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else {
                            break;
                        };
                        if !engine.apply_progress(generation, &mut extrapolation).await {
                            break;
                        }
                    }
                }
            }
            debug!("Progress extrapolation {} finished", generation);
        });
    }

    /// Apply one extrapolation step. Returns whether the timer should keep running.
    async fn apply_progress(&self, generation: u64, extrapolation: &mut ProgressExtrapolation) -> bool {
        let mut inner = self.inner.write().await;
        if inner.generation != generation {
            return false;
        }

        let Some(progress_ms) = extrapolation.advance() else {
            return false;
        };
        inner.snapshot.progress_ms = progress_ms;
        let _ = self.event_tx.send(SyncEvent::ProgressTick {
            progress_ms,
            duration_ms: extrapolation.duration_ms(),
        });

        if extrapolation.is_finished() {
            inner.progress_token = None;
            return false;
        }
        true
    }

    /// Cancel the progress timer without touching the snapshot
    pub async fn stop_progress(&self) {
        let mut inner = self.inner.write().await;
        inner.generation = inner.generation.wrapping_add(1);
        if let Some(token) = inner.progress_token.take() {
            token.cancel();
        }
    }

    /// Tell listeners the session is gone. Callers emit this once per expiry episode.
    pub fn notify_reauth_required(&self) {
        let _ = self.event_tx.send(SyncEvent::ReauthRequired);
    }

    /// Report a transient fetch failure
    pub fn report_fetch_error(&self, message: impl Into<String>) {
        let _ = self.event_tx.send(SyncEvent::FetchFailed {
            message: message.into(),
        });
    }

    /// Get the current snapshot
    pub async fn snapshot(&self) -> PlaybackSnapshot {
        self.inner.read().await.snapshot.clone()
    }

    /// Check if currently playing
    pub async fn is_playing(&self) -> bool {
        self.inner.read().await.snapshot.is_playing
    }

    /// Get current track info
    pub async fn current_track(&self) -> Option<TrackInfo> {
        self.inner.read().await.snapshot.track.clone()
    }

    /// Cancel all timers. Snapshots published afterwards are stored and
    /// broadcast but no longer extrapolated.
    pub fn dispose(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::build(DEFAULT_PROGRESS_STEP)
    }
}
