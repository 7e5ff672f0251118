pub mod client;
pub mod config;
pub mod control;
pub mod dashboard;
pub mod error;
pub mod oauth;
pub mod paths;
pub mod poller;
pub mod token_store;

#[cfg(test)]
mod test_support;

pub use client::{PlayerApi, PlayerCommand, SpotifyClient, TimeRange};
pub use config::{SpotifyProviderConfig, CONFIG_TEMPLATE as SPOTIFY_CONFIG_TEMPLATE};
pub use control::PlaybackControls;
pub use dashboard::{AudioFeatureSummary, Dashboard, DashboardLoader, GenreShare};
pub use error::{AuthError, ControlError, DashboardError, FetchError, StoreError};
pub use oauth::{AccessTokenProvider, CallbackParams, SessionState, SpotifyOAuth};
pub use paths::SPOTIFY_SESSION_FILE_NAME;
pub use poller::SpotifyPoller;
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenRecord, TokenStore};
