//! One-shot load of the listening dashboard.

use crate::client::{
    Artist, AudioFeatures, Device, PlayHistory, PlayerApi, SpotifyClient, TimeRange, Track,
    UserProfile,
};
use crate::error::{DashboardError, FetchError};
use crate::oauth::AccessTokenProvider;
use nowplaying_core::PlaybackSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TOP_ITEMS_LIMIT: u32 = 6;
const RECENTLY_PLAYED_LIMIT: u32 = 5;
/// Artists sampled for the genre breakdown
const GENRE_ARTISTS_LIMIT: u32 = 50;
const AUDIO_FEATURE_TRACKS: usize = 10;
const TOP_GENRES: usize = 6;

/// Everything the dashboard shows
#[derive(Debug, Clone)]
pub struct Dashboard {
    pub profile: UserProfile,
    pub now_playing: PlaybackSnapshot,
    pub top_tracks: Vec<Track>,
    pub top_artists: Vec<Artist>,
    pub recently_played: Vec<PlayHistory>,
    pub devices: Vec<Device>,
    /// `None` when no audio features could be loaded
    pub audio_features: Option<AudioFeatureSummary>,
    pub genres: Vec<GenreShare>,
}

/// Mean audio features over the user's top tracks
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFeatureSummary {
    pub energy: f64,
    pub danceability: f64,
    pub valence: f64,
    pub tempo: f64,
    pub acousticness: f64,
    pub instrumentalness: f64,
    pub speechiness: f64,
    pub liveness: f64,
    /// Number of tracks averaged
    pub sample_count: usize,
}

impl AudioFeatureSummary {
    /// Average `features`, or `None` if there are none.
    #[must_use]
    pub fn average(features: &[AudioFeatures]) -> Option<Self> {
        if features.is_empty() {
            return None;
        }

        let n = f64::from(u32::try_from(features.len()).unwrap_or(u32::MAX));
        let mean = |field: fn(&AudioFeatures) -> f64| features.iter().map(field).sum::<f64>() / n;

        Some(Self {
            energy: mean(|f| f.energy),
            danceability: mean(|f| f.danceability),
            valence: mean(|f| f.valence),
            tempo: mean(|f| f.tempo),
            acousticness: mean(|f| f.acousticness),
            instrumentalness: mean(|f| f.instrumentalness),
            speechiness: mean(|f| f.speechiness),
            liveness: mean(|f| f.liveness),
            sample_count: features.len(),
        })
    }
}

/// One slice of the genre breakdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenreShare {
    /// Genre name with its first letter capitalised
    pub genre: String,
    pub count: u32,
    /// Share of the kept genres, rounded to a whole percent
    pub percentage: u32,
}

/// Count genres across `artists` and keep the `limit` most frequent.
///
/// Ties are broken by genre name. Percentages are relative to the kept
/// genres only, so they sum to roughly 100.
#[must_use]
pub fn genre_breakdown(artists: &[Artist], limit: usize) -> Vec<GenreShare> {
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for genre in artists.iter().flat_map(|a| a.genres.iter()) {
        *counts.entry(genre.as_str()).or_default() += 1;
    }

    let mut sorted: Vec<(&str, u32)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    sorted.truncate(limit);

    let total: u32 = sorted.iter().map(|(_, count)| count).sum();
    if total == 0 {
        return Vec::new();
    }

    sorted
        .into_iter()
        .map(|(genre, count)| GenreShare {
            genre: capitalize(genre),
            count,
            percentage: (count * 100 + total / 2) / total,
        })
        .collect()
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Loads the dashboard sections for the signed-in user.
pub struct DashboardLoader {
    tokens: Arc<dyn AccessTokenProvider>,
    client: Arc<SpotifyClient>,
}

impl DashboardLoader {
    pub fn new(tokens: Arc<dyn AccessTokenProvider>, client: Arc<SpotifyClient>) -> Self {
        Self { tokens, client }
    }

    /// Load every section.
    ///
    /// The profile is required. Every other section that fails to load is
    /// logged and left empty.
    ///
    /// # Errors
    ///
    /// Returns [`DashboardError::Auth`] without a usable session and
    /// [`DashboardError::Profile`] if the profile cannot be loaded.
    pub async fn load(&self) -> Result<Dashboard, DashboardError> {
        let mut token = self.tokens.access_token().await?;

        let profile = match self.client.user_profile(&token).await {
            Err(FetchError::Unauthorized) => {
                debug!("Access token rejected, refreshing before dashboard load");
                token = self.tokens.refresh_access_token().await?;
                self.client.user_profile(&token).await
            }
            other => other,
        }
        .map_err(DashboardError::Profile)?;

        info!(
            "Loading dashboard for {}",
            profile.display_name.as_deref().unwrap_or(&profile.id)
        );

        let (now_playing, top_tracks, top_artists, recently_played, devices, genre_artists) = futures::join!(
            self.client.currently_playing(&token),
            self.client.top_tracks(&token, TimeRange::ShortTerm, TOP_ITEMS_LIMIT),
            self.client.top_artists(&token, TimeRange::ShortTerm, TOP_ITEMS_LIMIT),
            self.client.recently_played(&token, RECENTLY_PLAYED_LIMIT),
            self.client.devices(&token),
            self.client.top_artists(&token, TimeRange::MediumTerm, GENRE_ARTISTS_LIMIT),
        );

        let now_playing = match now_playing {
            Ok(snapshot) => snapshot,
            Err(FetchError::NoContent) => PlaybackSnapshot::nothing_playing(),
            Err(e) => {
                warn!("Failed to load currently playing: {}", e);
                PlaybackSnapshot::nothing_playing()
            }
        };
        let top_tracks = section("top tracks", top_tracks.map(|page| page.items));
        let top_artists = section("top artists", top_artists.map(|page| page.items));
        let recently_played = section("recently played", recently_played.map(|page| page.items));
        let devices = section("devices", devices);
        let genre_artists = section("genre artists", genre_artists.map(|page| page.items));

        let ids: Vec<String> = top_tracks
            .iter()
            .filter_map(|track| track.id.clone())
            .take(AUDIO_FEATURE_TRACKS)
            .collect();
        let audio_features = match self.client.audio_features(&token, &ids).await {
            Ok(features) => AudioFeatureSummary::average(&features),
            Err(e) => {
                warn!("Failed to load audio features: {}", e);
                None
            }
        };

        Ok(Dashboard {
            profile,
            now_playing,
            top_tracks,
            top_artists,
            recently_played,
            devices,
            audio_features,
            genres: genre_breakdown(&genre_artists, TOP_GENRES),
        })
    }

    /// [`Self::load`], retrying up to `attempts` times in total when the
    /// profile cannot be loaded.
    ///
    /// # Errors
    ///
    /// Returns the last [`DashboardError::Profile`] once attempts run out,
    /// or [`DashboardError::Auth`] immediately.
    pub async fn load_with_retry(&self, attempts: u32, delay: Duration) -> Result<Dashboard, DashboardError> {
        let mut attempt = 1;
        loop {
            match self.load().await {
                Err(DashboardError::Profile(e)) if attempt < attempts => {
                    warn!(
                        "Could not load Spotify profile ({}), retrying in {}ms (attempt {}/{})",
                        e,
                        delay.as_millis(),
                        attempt,
                        attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn section<T>(name: &str, result: Result<Vec<T>, FetchError>) -> Vec<T> {
    result.unwrap_or_else(|e| {
        warn!("Failed to load {}: {}", name, e);
        Vec::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpotifyProviderConfig;
    use crate::test_support::{FakeServer, FakeTokens};

    fn artist(name: &str, genres: &[&str]) -> Artist {
        Artist {
            id: name.into(),
            name: name.into(),
            genres: genres.iter().map(|g| (*g).to_string()).collect(),
            popularity: None,
            images: Vec::new(),
            external_urls: crate::client::ExternalUrls::default(),
        }
    }

    fn features(energy: f64, tempo: f64) -> AudioFeatures {
        AudioFeatures {
            id: "t".into(),
            energy,
            danceability: 0.5,
            valence: 0.5,
            tempo,
            acousticness: 0.0,
            instrumentalness: 0.0,
            speechiness: 0.0,
            liveness: 0.0,
        }
    }

    fn loader(server: &FakeServer) -> DashboardLoader {
        let mut config = SpotifyProviderConfig::new("id", "secret");
        config.api_base_url = server.base_url().to_string();
        let client = SpotifyClient::with_max_retries(&config, 0).expect("client should build");
        DashboardLoader::new(FakeTokens::new(true), Arc::new(client))
    }

    #[test]
    fn test_genre_breakdown() {
        let artists = vec![
            artist("a", &["pop", "dance pop"]),
            artist("b", &["pop", "rock"]),
            artist("c", &["pop", "rock", "indie"]),
        ];

        let genres = genre_breakdown(&artists, 6);

        assert_eq!(
            genres,
            vec![
                GenreShare { genre: "Pop".into(), count: 3, percentage: 43 },
                GenreShare { genre: "Rock".into(), count: 2, percentage: 29 },
                GenreShare { genre: "Dance pop".into(), count: 1, percentage: 14 },
                GenreShare { genre: "Indie".into(), count: 1, percentage: 14 },
            ]
        );
    }

    #[test]
    fn test_genre_breakdown_keeps_top_six() {
        let artists = vec![artist("a", &["g1", "g2", "g3", "g4", "g5", "g6", "g7"]), artist("b", &["g7"])];

        let genres = genre_breakdown(&artists, 6);

        assert_eq!(genres.len(), 6);
        assert_eq!(genres[0].genre, "G7");
        assert_eq!(genres[5].genre, "G5");
        assert_eq!(genres[0].percentage, 29);
    }

    #[test]
    fn test_genre_breakdown_without_genres_is_empty() {
        assert!(genre_breakdown(&[artist("a", &[])], 6).is_empty());
    }

    #[test]
    fn test_audio_feature_average() {
        let summary =
            AudioFeatureSummary::average(&[features(0.2, 100.0), features(0.6, 140.0)]).expect("summary");

        assert!((summary.energy - 0.4).abs() < 1e-9);
        assert!((summary.tempo - 120.0).abs() < 1e-9);
        assert_eq!(summary.sample_count, 2);
        assert!(AudioFeatureSummary::average(&[]).is_none());
    }

    #[tokio::test]
    async fn test_profile_failure_is_fatal() {
        let server = FakeServer::start().await;
        server.respond("GET", "/me", 500, "");

        let result = loader(&server).load().await;

        assert!(matches!(
            result,
            Err(DashboardError::Profile(FetchError::Transient { status: 500 }))
        ));
        assert_eq!(server.count("GET", "/me/top/tracks"), 0);
    }

    #[tokio::test]
    async fn test_profile_retried_until_it_loads() {
        let server = FakeServer::start().await;
        server.respond("GET", "/me", 503, "");
        server.respond("GET", "/me", 200, r#"{"id": "user1", "display_name": "User"}"#);

        let dashboard = loader(&server)
            .load_with_retry(3, Duration::from_millis(10))
            .await
            .expect("dashboard after retry");

        assert_eq!(dashboard.profile.id, "user1");
        assert_eq!(server.count("GET", "/me"), 2);
    }

    #[tokio::test]
    async fn test_profile_retries_are_bounded() {
        let server = FakeServer::start().await;
        server.respond("GET", "/me", 500, "");

        let result = loader(&server).load_with_retry(3, Duration::from_millis(10)).await;

        assert!(matches!(
            result,
            Err(DashboardError::Profile(FetchError::Transient { status: 500 }))
        ));
        assert_eq!(server.count("GET", "/me"), 3);
    }

    #[tokio::test]
    async fn test_failing_sections_become_empty() {
        let server = FakeServer::start().await;
        server.respond("GET", "/me", 200, r#"{"id": "user1", "display_name": null}"#);
        server.respond("GET", "/me/player/currently-playing", 204, "");
        server.respond("GET", "/me/top/tracks", 503, "");
        server.respond(
            "GET",
            "/me/top/artists",
            200,
            r#"{"items": [{"id": "a1", "name": "Artist", "genres": ["synthwave"]}], "total": 1, "next": null}"#,
        );
        server.respond("GET", "/me/player/recently-played", 500, "");
        server.respond("GET", "/me/player/devices", 200, r#"{"devices": []}"#);

        let dashboard = loader(&server).load().await.expect("dashboard");

        assert_eq!(dashboard.profile.id, "user1");
        assert!(dashboard.now_playing.is_nothing_playing());
        assert!(dashboard.top_tracks.is_empty());
        assert!(dashboard.recently_played.is_empty());
        assert_eq!(dashboard.top_artists.len(), 1);
        assert_eq!(dashboard.audio_features, None);
        assert_eq!(
            dashboard.genres,
            vec![GenreShare { genre: "Synthwave".into(), count: 1, percentage: 100 }]
        );
        assert_eq!(server.count("GET", "/audio-features"), 0);
    }
}
