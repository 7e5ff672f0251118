//! Local progress extrapolation between remote polls.

use crate::playback::PlaybackSnapshot;

/// Advances playback progress locally in fixed steps.
///
/// Progress is clamped to the track duration and extrapolation finishes once
/// the end of the track is reached. It never wraps or moves on to the next
/// track; the next real poll corrects the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressExtrapolation {
    progress_ms: u64,
    duration_ms: u64,
    step_ms: u64,
}

impl ProgressExtrapolation {
    /// Create an extrapolation from raw values.
    #[must_use]
    pub const fn new(progress_ms: u64, duration_ms: u64, step_ms: u64) -> Self {
        Self {
            progress_ms,
            duration_ms,
            step_ms,
        }
    }

    /// Start extrapolating from a snapshot.
    ///
    /// Returns `None` if the snapshot is paused, has no track, or is already
    /// at the end of the track.
    #[must_use]
    pub fn from_snapshot(snapshot: &PlaybackSnapshot, step_ms: u64) -> Option<Self> {
        if !snapshot.is_playing || step_ms == 0 {
            return None;
        }
        let duration_ms = snapshot.track.as_ref()?.duration_ms;
        let extrapolation = Self::new(snapshot.progress_ms, duration_ms, step_ms);
        (!extrapolation.is_finished()).then_some(extrapolation)
    }

    /// Advance by one step, returning the new progress.
    ///
    /// Returns `None` once the end of the track has been reached.
    pub fn advance(&mut self) -> Option<u64> {
        if self.is_finished() {
            return None;
        }
        self.progress_ms = self
            .progress_ms
            .saturating_add(self.step_ms)
            .min(self.duration_ms);
        Some(self.progress_ms)
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.progress_ms >= self.duration_ms
    }

    #[must_use]
    pub const fn progress_ms(&self) -> u64 {
        self.progress_ms
    }

    #[must_use]
    pub const fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::TrackInfo;

    fn snapshot(progress_ms: u64, duration_ms: u64, is_playing: bool) -> PlaybackSnapshot {
        PlaybackSnapshot::new(
            Some(TrackInfo::new("id", "Song", vec![], "Album", duration_ms)),
            progress_ms,
            is_playing,
        )
    }

    #[test]
    fn test_stops_at_track_end() {
        let mut extrapolation = ProgressExtrapolation::from_snapshot(&snapshot(195_000, 200_000, true), 1000)
            .expect("playing snapshot should extrapolate");

        let steps: Vec<u64> = std::iter::from_fn(|| extrapolation.advance()).collect();

        assert_eq!(steps, vec![196_000, 197_000, 198_000, 199_000, 200_000]);
        assert!(extrapolation.is_finished());
        assert_eq!(extrapolation.advance(), None);
        assert_eq!(extrapolation.progress_ms(), 200_000);
    }

    #[test]
    fn test_last_step_is_clamped() {
        let mut extrapolation = ProgressExtrapolation::new(199_500, 200_000, 1000);
        assert_eq!(extrapolation.advance(), Some(200_000));
        assert_eq!(extrapolation.advance(), None);
    }

    #[test]
    fn test_paused_snapshot_does_not_extrapolate() {
        assert!(ProgressExtrapolation::from_snapshot(&snapshot(0, 200_000, false), 1000).is_none());
    }

    #[test]
    fn test_nothing_playing_does_not_extrapolate() {
        let nothing = PlaybackSnapshot {
            is_playing: true,
            ..PlaybackSnapshot::nothing_playing()
        };
        assert!(ProgressExtrapolation::from_snapshot(&nothing, 1000).is_none());
    }

    #[test]
    fn test_finished_snapshot_does_not_extrapolate() {
        assert!(ProgressExtrapolation::from_snapshot(&snapshot(200_000, 200_000, true), 1000).is_none());
    }
}
