//! Playback source trait.

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A background task that keeps the [`SyncEngine`](crate::SyncEngine) fed
/// with playback snapshots from a remote player.
///
/// ```ignore
/// let poller = SpotifyPoller::new(tokens, api, sync_engine, interval, cancel_token);
/// tokio::spawn(async move { poller.run().await });
/// ```
#[async_trait]
pub trait PlaybackSource: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &'static str;

    /// Run until cancelled or until the session can no longer be used.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SessionExpired`](crate::CoreError::SessionExpired)
    /// when the user has to sign in again.
    async fn run(&self) -> Result<()>;

    fn cancel_token(&self) -> CancellationToken;

    /// Signal the source to stop.
    fn stop(&self) {
        self.cancel_token().cancel();
    }
}
