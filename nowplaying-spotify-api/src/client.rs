//! Bearer-authenticated Spotify Web API client.

use crate::config::SpotifyProviderConfig;
use crate::error::{ControlError, FetchError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nowplaying_core::{PlaybackSnapshot, TrackInfo};
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default number of retry attempts for dashboard requests
const DEFAULT_MAX_RETRIES: u32 = 3;

const USER_AGENT: &str = concat!("nowplaying/", env!("CARGO_PKG_VERSION"));

/// Playback commands relayed to the active device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerCommand {
    Play,
    Pause,
    Next,
    Previous,
}

impl PlayerCommand {
    fn method(self) -> reqwest::Method {
        match self {
            Self::Play | Self::Pause => reqwest::Method::PUT,
            Self::Next | Self::Previous => reqwest::Method::POST,
        }
    }

    const fn path(self) -> &'static str {
        match self {
            Self::Play => "me/player/play",
            Self::Pause => "me/player/pause",
            Self::Next => "me/player/next",
            Self::Previous => "me/player/previous",
        }
    }
}

/// Player endpoints used by the poller and the control relay.
#[async_trait]
pub trait PlayerApi: Send + Sync {
    /// Fetch the currently playing item.
    ///
    /// # Errors
    ///
    /// [`FetchError::NoContent`] when nothing is playing (HTTP 204),
    /// [`FetchError::Unauthorized`] on HTTP 401, other variants for
    /// transient failures.
    async fn currently_playing(&self, access_token: &str) -> Result<PlaybackSnapshot, FetchError>;

    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn devices(&self, access_token: &str) -> Result<Vec<Device>, FetchError>;

    /// # Errors
    ///
    /// [`ControlError::PremiumRequired`] on HTTP 403,
    /// [`ControlError::ControlFailed`] on any other non-2xx status.
    async fn send_command(
        &self,
        access_token: &str,
        command: PlayerCommand,
        device_id: Option<&str>,
    ) -> Result<(), ControlError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    /// About the last four weeks
    ShortTerm,
    /// About the last six months
    MediumTerm,
    LongTerm,
}

impl TimeRange {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::MediumTerm => "medium_term",
            Self::LongTerm => "long_term",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalUrls {
    pub spotify: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    pub height: Option<u32>,
    pub width: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Followers {
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub country: Option<String>,
    /// "premium", "free", ...
    pub product: Option<String>,
    pub followers: Option<Followers>,
    #[serde(default)]
    pub images: Vec<Image>,
}

/// Artist as embedded in tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistRef {
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub genres: Vec<String>,
    pub popularity: Option<u32>,
    #[serde(default)]
    pub images: Vec<Image>,
    #[serde(default)]
    pub external_urls: ExternalUrls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub name: String,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// `None` for local files
    pub id: Option<String>,
    pub name: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub artists: Vec<ArtistRef>,
    pub album: Album,
    pub popularity: Option<u32>,
    #[serde(default)]
    pub external_urls: ExternalUrls,
}

impl Track {
    #[must_use]
    pub fn to_track_info(&self) -> TrackInfo {
        let info = TrackInfo::new(
            self.id.clone().unwrap_or_default(),
            &self.name,
            self.artists.iter().map(|a| a.name.clone()).collect(),
            &self.album.name,
            self.duration_ms,
        );
        match &self.external_urls.spotify {
            Some(url) => info.with_external_url(url),
            None => info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayHistory {
    pub track: Track,
    pub played_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub id: String,
    pub energy: f64,
    pub danceability: f64,
    pub valence: f64,
    pub tempo: f64,
    pub acousticness: f64,
    pub instrumentalness: f64,
    pub speechiness: f64,
    pub liveness: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: Option<String>,
    pub name: String,
    pub is_active: bool,
    #[serde(rename = "type")]
    pub device_type: String,
    pub volume_percent: Option<u32>,
}

/// List wrapper shared by offset- and cursor-paged endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging<T> {
    pub items: Vec<T>,
    pub total: Option<u64>,
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CurrentlyPlaying {
    #[serde(default)]
    is_playing: bool,
    progress_ms: Option<u64>,
    item: Option<PlayingItem>,
}

/// A track or a podcast episode
#[derive(Debug, Deserialize)]
struct PlayingItem {
    id: Option<String>,
    name: String,
    duration_ms: u64,
    #[serde(default)]
    artists: Vec<ArtistRef>,
    album: Option<Album>,
    show: Option<Show>,
    #[serde(default)]
    external_urls: ExternalUrls,
}

#[derive(Debug, Deserialize)]
struct Show {
    name: String,
}

impl CurrentlyPlaying {
    fn into_snapshot(self) -> PlaybackSnapshot {
        let Some(item) = self.item else {
            return PlaybackSnapshot::nothing_playing();
        };

        let (artist_names, album) = match (item.album, item.show) {
            (Some(album), _) => (
                item.artists.into_iter().map(|a| a.name).collect(),
                album.name,
            ),
            (None, Some(show)) => (vec![show.name], "Podcast".to_string()),
            (None, None) => (
                item.artists.into_iter().map(|a| a.name).collect(),
                String::new(),
            ),
        };

        let mut track = TrackInfo::new(
            item.id.unwrap_or_default(),
            item.name,
            artist_names,
            album,
            item.duration_ms,
        );
        track.external_url = item.external_urls.spotify;

        let progress_ms = self.progress_ms.unwrap_or(0).min(item.duration_ms);
        PlaybackSnapshot::new(Some(track), progress_ms, self.is_playing)
    }
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
struct AudioFeaturesResponse {
    audio_features: Vec<Option<AudioFeatures>>,
}

/// Spotify Web API client.
///
/// Player requests go through the plain client so a poll tick makes exactly
/// one attempt. Dashboard reads go through the retrying client.
pub struct SpotifyClient {
    api_base_url: String,
    http: reqwest::Client,
    retrying: ClientWithMiddleware,
}

impl SpotifyClient {
    /// Create a new client with the default 3 retries for dashboard reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &SpotifyProviderConfig) -> Result<Self, FetchError> {
        Self::with_max_retries(config, DEFAULT_MAX_RETRIES)
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_max_retries(config: &SpotifyProviderConfig, max_retries: u32) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(5))
            .user_agent(USER_AGENT)
            .build()?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let retrying = ClientBuilder::new(http.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            http,
            retrying,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.api_base_url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let response = self
            .retrying
            .get(self.endpoint(path))
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await?;

        let body = checked_body(response).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// `GET me`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be decoded.
    pub async fn user_profile(&self, access_token: &str) -> Result<UserProfile, FetchError> {
        self.get_json(access_token, "me", &[]).await
    }

    /// `GET me/top/tracks`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be decoded.
    pub async fn top_tracks(
        &self,
        access_token: &str,
        time_range: TimeRange,
        limit: u32,
    ) -> Result<Paging<Track>, FetchError> {
        let query = [
            ("time_range", time_range.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        self.get_json(access_token, "me/top/tracks", &query).await
    }

    /// `GET me/top/artists`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be decoded.
    pub async fn top_artists(
        &self,
        access_token: &str,
        time_range: TimeRange,
        limit: u32,
    ) -> Result<Paging<Artist>, FetchError> {
        let query = [
            ("time_range", time_range.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        self.get_json(access_token, "me/top/artists", &query).await
    }

    /// `GET me/player/recently-played`
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be decoded.
    pub async fn recently_played(
        &self,
        access_token: &str,
        limit: u32,
    ) -> Result<Paging<PlayHistory>, FetchError> {
        self.get_json(
            access_token,
            "me/player/recently-played",
            &[("limit", limit.to_string())],
        )
        .await
    }

    /// `GET audio-features?ids=...`. Tracks without analysis are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be decoded.
    pub async fn audio_features(
        &self,
        access_token: &str,
        track_ids: &[String],
    ) -> Result<Vec<AudioFeatures>, FetchError> {
        if track_ids.is_empty() {
            return Ok(Vec::new());
        }
        let response: AudioFeaturesResponse = self
            .get_json(access_token, "audio-features", &[("ids", track_ids.join(","))])
            .await?;
        Ok(response.audio_features.into_iter().flatten().collect())
    }
}

/// Map the status of a resource response and read its body
async fn checked_body(response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
    match response.status() {
        StatusCode::NO_CONTENT => Err(FetchError::NoContent),
        StatusCode::UNAUTHORIZED => Err(FetchError::Unauthorized),
        status if status.is_success() => Ok(response.bytes().await?.to_vec()),
        status => Err(FetchError::Transient {
            status: status.as_u16(),
        }),
    }
}

#[async_trait]
impl PlayerApi for SpotifyClient {
    async fn currently_playing(&self, access_token: &str) -> Result<PlaybackSnapshot, FetchError> {
        let response = self
            .http
            .get(self.endpoint("me/player/currently-playing"))
            .bearer_auth(access_token)
            .query(&[("additional_types", "track,episode")])
            .send()
            .await?;

        let body = checked_body(response).await?;
        if body.is_empty() {
            return Err(FetchError::NoContent);
        }

        let playing: CurrentlyPlaying = serde_json::from_slice(&body)?;
        let snapshot = playing.into_snapshot();
        debug!(
            "Polled Spotify: playing={}, track={:?}, progress={}ms",
            snapshot.is_playing,
            snapshot.track.as_ref().map(|t| &t.name),
            snapshot.progress_ms
        );
        Ok(snapshot)
    }

    async fn devices(&self, access_token: &str) -> Result<Vec<Device>, FetchError> {
        let response = self
            .http
            .get(self.endpoint("me/player/devices"))
            .bearer_auth(access_token)
            .send()
            .await?;

        let body = checked_body(response).await?;
        let devices: DevicesResponse = serde_json::from_slice(&body)?;
        Ok(devices.devices)
    }

    async fn send_command(
        &self,
        access_token: &str,
        command: PlayerCommand,
        device_id: Option<&str>,
    ) -> Result<(), ControlError> {
        let mut request = self
            .http
            .request(command.method(), self.endpoint(command.path()))
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_LENGTH, 0);
        if let Some(device_id) = device_id {
            request = request.query(&[("device_id", device_id)]);
        }

        let status = request.send().await?.status();
        debug!("{:?} command returned HTTP {}", command, status);

        match status {
            s if s.is_success() => Ok(()),
            StatusCode::FORBIDDEN => Err(ControlError::PremiumRequired),
            s => Err(ControlError::ControlFailed { status: s.as_u16() }),
        }
    }
}
