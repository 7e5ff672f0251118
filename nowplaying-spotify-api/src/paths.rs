//! Path constants for Spotify-specific files.

use std::path::PathBuf;

/// The name of the persisted Spotify session file
pub const SPOTIFY_SESSION_FILE_NAME: &str = ".spotify_session.json";

/// Get the Spotify session file path (~/.config/nowplaying/.spotify_session.json)
#[must_use]
pub fn spotify_session_path() -> PathBuf {
    nowplaying_core::config_dir().join(SPOTIFY_SESSION_FILE_NAME)
}
