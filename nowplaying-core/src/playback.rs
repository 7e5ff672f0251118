use serde::{Deserialize, Serialize};

/// Point-in-time view of what the user is playing.
///
/// Snapshots are replaced wholesale whenever fresh data arrives from the
/// remote player. The only in-place mutation is local progress extrapolation
/// between polls (see [`crate::ProgressExtrapolation`]).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    /// Current track (None if nothing is playing)
    pub track: Option<TrackInfo>,
    /// Playback position in milliseconds
    pub progress_ms: u64,
    /// Whether playback is running
    pub is_playing: bool,
}

impl PlaybackSnapshot {
    /// Create a new snapshot
    #[must_use]
    pub const fn new(track: Option<TrackInfo>, progress_ms: u64, is_playing: bool) -> Self {
        Self {
            track,
            progress_ms,
            is_playing,
        }
    }

    /// The explicit "nothing playing" snapshot: no track, progress reset to 0.
    #[must_use]
    pub const fn nothing_playing() -> Self {
        Self {
            track: None,
            progress_ms: 0,
            is_playing: false,
        }
    }

    #[must_use]
    pub const fn is_nothing_playing(&self) -> bool {
        self.track.is_none()
    }

    /// Track duration in milliseconds, or 0 when nothing is playing
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.track.as_ref().map_or(0, |t| t.duration_ms)
    }

    /// Current track ID, if any
    #[must_use]
    pub fn track_id(&self) -> Option<&str> {
        self.track.as_ref().map(|t| t.id.as_str())
    }

    /// Check if the track has changed
    #[must_use]
    pub fn track_changed(&self, other: &Self) -> bool {
        match (&self.track, &other.track) {
            (Some(a), Some(b)) => a.id != b.id,
            (None, None) => false,
            _ => true,
        }
    }
}

/// Information about the currently playing track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Spotify track ID (bare ID, not the `spotify:track:` URI)
    pub id: String,
    /// Track name
    pub name: String,
    /// Artist names in credit order
    pub artist_names: Vec<String>,
    /// Album name
    pub album: String,
    /// Track duration in milliseconds
    pub duration_ms: u64,
    /// Link to the track in the Spotify web player
    pub external_url: Option<String>,
}

impl TrackInfo {
    /// Create a new track info
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        artist_names: Vec<String>,
        album: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            artist_names,
            album: album.into(),
            duration_ms,
            external_url: None,
        }
    }

    /// Attach the external (web player) URL
    #[must_use]
    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = Some(url.into());
        self
    }

    /// Artist names joined for display ("A, B")
    #[must_use]
    pub fn artists_display(&self) -> String {
        self.artist_names.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> TrackInfo {
        TrackInfo::new(
            id,
            "Song",
            vec!["Artist".into()],
            "Album",
            180_000,
        )
    }

    #[test]
    fn test_nothing_playing() {
        let snapshot = PlaybackSnapshot::nothing_playing();
        assert!(snapshot.is_nothing_playing());
        assert!(!snapshot.is_playing);
        assert_eq!(snapshot.progress_ms, 0);
        assert_eq!(snapshot.duration_ms(), 0);
        assert_eq!(snapshot.track_id(), None);
        assert_eq!(snapshot, PlaybackSnapshot::default());
    }

    #[test]
    fn test_snapshot_new() {
        let snapshot = PlaybackSnapshot::new(Some(track("track123")), 30_000, true);

        assert!(snapshot.is_playing);
        assert!(!snapshot.is_nothing_playing());
        assert_eq!(snapshot.progress_ms, 30_000);
        assert_eq!(snapshot.duration_ms(), 180_000);
        assert_eq!(snapshot.track_id(), Some("track123"));
    }

    #[test]
    fn test_track_changed_same_track() {
        let a = PlaybackSnapshot::new(Some(track("track123")), 0, true);
        let b = PlaybackSnapshot::new(Some(track("track123")), 30_000, true);
        assert!(!a.track_changed(&b));
    }

    #[test]
    fn test_track_changed_different_track() {
        let a = PlaybackSnapshot::new(Some(track("track123")), 0, true);
        let b = PlaybackSnapshot::new(Some(track("track456")), 0, true);
        assert!(a.track_changed(&b));
    }

    #[test]
    fn test_track_changed_none_to_some() {
        let a = PlaybackSnapshot::nothing_playing();
        let b = PlaybackSnapshot::new(Some(track("track123")), 0, true);
        assert!(a.track_changed(&b));
        assert!(b.track_changed(&a));
    }

    #[test]
    fn test_track_changed_both_none() {
        let a = PlaybackSnapshot::nothing_playing();
        assert!(!a.track_changed(&PlaybackSnapshot::nothing_playing()));
    }

    #[test]
    fn test_track_info_artists_display() {
        let info = TrackInfo::new(
            "id",
            "Song",
            vec!["First".into(), "Second".into()],
            "Album",
            1000,
        )
        .with_external_url("https://open.spotify.com/track/id");

        assert_eq!(info.artists_display(), "First, Second");
        assert_eq!(
            info.external_url.as_deref(),
            Some("https://open.spotify.com/track/id")
        );
    }
}
