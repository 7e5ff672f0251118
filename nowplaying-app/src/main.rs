use nowplaying_core::{CoreError, NowPlayingConfig, PlaybackSource, SyncEngine, SyncEvent};
use nowplaying_spotify_api::{
    AuthError, Dashboard, DashboardError, DashboardLoader, FetchError, FileTokenStore, PlaybackControls,
    SpotifyClient, SpotifyOAuth, SpotifyPoller, SpotifyProviderConfig, SPOTIFY_CONFIG_TEMPLATE,
};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Profile(DashboardError),
}

const PROFILE_ATTEMPTS: u32 = 3;
const PROFILE_RETRY_DELAY: Duration = Duration::from_secs(5);

fn main() {
    // Check config for logging.enabled before full config load
    let file_logging_enabled = check_file_logging_enabled();
    init_tracing(file_logging_enabled);

    // Load config or create template on first run
    let provider_templates: &[&str] = &[SPOTIFY_CONFIG_TEMPLATE];
    let config = match NowPlayingConfig::load_or_create(Some(provider_templates)) {
        Ok(config) => config,
        Err(CoreError::ConfigNotFound { path }) => {
            print_new_config_notice(&path);
            std::process::exit(0);
        }
        Err(e) => {
            error!("{e}");
            error!(
                "Fix or delete {} and restart",
                NowPlayingConfig::config_path().display()
            );
            std::process::exit(1);
        }
    };

    let spotify_config = match spotify_config(&config) {
        Ok(spotify_config) => spotify_config,
        Err(e) => {
            error!("{e}");
            error!(
                "Edit {} and restart. Get Spotify credentials from https://developer.spotify.com/dashboard",
                NowPlayingConfig::config_path().display()
            );
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    // Create shared cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();

    let ctrlc_token = cancel_token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down gracefully...");
        ctrlc_token.cancel();
    }) {
        error!("Failed to set Ctrl+C handler: {}", e);
    }

    let result = runtime.block_on(run(spotify_config, cancel_token));

    // Stdin reads park a blocking thread; don't wait on it
    runtime.shutdown_timeout(Duration::from_secs(1));

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

/// Extract and validate the `[providers.spotify]` section
fn spotify_config(config: &NowPlayingConfig) -> Result<SpotifyProviderConfig, CoreError> {
    let spotify_config = SpotifyProviderConfig::from_providers(&config.providers)?.ok_or_else(|| {
        CoreError::ConfigMissingField {
            field: "providers.spotify".into(),
        }
    })?;
    spotify_config.validate()?;
    Ok(spotify_config)
}

fn print_new_config_notice(config_path: &Path) {
    info!("A configuration file has been created at {}", config_path.display());
    info!("Please edit it with your Spotify credentials:");
    info!("  \u{2022} providers.spotify.client_id");
    info!("  \u{2022} providers.spotify.client_secret");
    info!("Get these from https://developer.spotify.com/dashboard");
}

async fn run(config: SpotifyProviderConfig, cancel_token: CancellationToken) -> Result<(), AppError> {
    let store = Arc::new(FileTokenStore::at_default_path());
    let oauth = Arc::new(SpotifyOAuth::new(&config, store)?);

    if !authenticate(&oauth, &cancel_token).await? {
        return Ok(());
    }

    let client = Arc::new(SpotifyClient::new(&config)?);

    // Nothing works without the profile, so startup stops here if it never loads
    let loader = DashboardLoader::new(oauth.clone(), client.clone());
    let dashboard = tokio::select! {
        () = cancel_token.cancelled() => return Ok(()),
        result = loader.load_with_retry(PROFILE_ATTEMPTS, PROFILE_RETRY_DELAY) => result,
    };
    match dashboard {
        Ok(dashboard) => log_dashboard(&dashboard),
        Err(DashboardError::Auth(e)) => return Err(e.into()),
        Err(e) => {
            error!("Check your connection and run nowplaying again to retry");
            return Err(AppError::Profile(e));
        }
    }

    let sync_engine = SyncEngine::with_progress_step(config.progress_tick());
    tokio::spawn(log_sync_events(sync_engine.clone()));

    let controls = Arc::new(PlaybackControls::new(
        oauth.clone(),
        client.clone(),
        sync_engine.clone(),
        config.skip_refetch_delay(),
        Some(cancel_token.child_token()),
    ));
    tokio::spawn(read_commands(controls, cancel_token.clone()));

    loop {
        let poller = Arc::new(SpotifyPoller::new(
            oauth.clone(),
            client.clone(),
            sync_engine.clone(),
            config.poll_interval(),
            Some(cancel_token.child_token()),
        ));
        let mut handle = poller.clone().start();

        tokio::select! {
            () = cancel_token.cancelled() => {
                poller.stop();
                let _ = handle.await;
                break;
            }
            _ = &mut handle => {}
        }

        if cancel_token.is_cancelled() {
            break;
        }

        // The poller only ends on its own when the session is gone
        warn!("Spotify session expired, signing in again...");
        if !authenticate(&oauth, &cancel_token).await? {
            break;
        }
    }

    sync_engine.dispose();
    info!("Shutdown complete");
    Ok(())
}

/// Ensure a valid session. Returns `false` if interrupted by Ctrl+C.
async fn authenticate(oauth: &SpotifyOAuth, cancel_token: &CancellationToken) -> Result<bool, AuthError> {
    tokio::select! {
        () = cancel_token.cancelled() => Ok(false),
        result = oauth.ensure_authenticated() => {
            result?;
            info!("Spotify authenticated successfully!");
            Ok(true)
        }
    }
}

fn log_dashboard(dashboard: &Dashboard) {
    let profile = &dashboard.profile;
    info!(
        "Signed in as {} ({}, {} followers)",
        profile.display_name.as_deref().unwrap_or(&profile.id),
        profile.product.as_deref().unwrap_or("unknown plan"),
        profile.followers.as_ref().map_or(0, |f| f.total)
    );

    for (rank, track) in dashboard.top_tracks.iter().enumerate() {
        let info = track.to_track_info();
        info!("Top track #{}: {} - {}", rank + 1, info.artists_display(), info.name);
    }
    for (rank, artist) in dashboard.top_artists.iter().enumerate() {
        info!("Top artist #{}: {}", rank + 1, artist.name);
    }
    for item in &dashboard.recently_played {
        let info = item.track.to_track_info();
        info!(
            "Recently played: {} - {} at {}",
            info.artists_display(),
            info.name,
            item.played_at.format("%Y-%m-%d %H:%M")
        );
    }
    for device in &dashboard.devices {
        info!(
            "Device: {} ({}){}",
            device.name,
            device.device_type,
            if device.is_active { " [active]" } else { "" }
        );
    }
    if let Some(features) = &dashboard.audio_features {
        info!(
            "Audio profile over {} tracks: energy {:.2}, danceability {:.2}, valence {:.2}, tempo {:.0} BPM",
            features.sample_count,
            features.energy,
            features.danceability,
            features.valence,
            features.tempo
        );
    }
    for share in &dashboard.genres {
        info!("Genre: {} {}%", share.genre, share.percentage);
    }
}

/// Relay single-letter commands from stdin to the player
async fn read_commands(controls: Arc<PlaybackControls>, cancel_token: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("Commands: p = play/pause, n = next, b = previous, q = quit");

    loop {
        let line = tokio::select! {
            () = cancel_token.cancelled() => break,
            line = lines.next_line() => line,
        };

        let result = match line {
            Ok(Some(line)) => match line.trim() {
                "p" => controls.toggle().await,
                "n" => controls.skip_next().await,
                "b" => controls.skip_previous().await,
                "q" => {
                    cancel_token.cancel();
                    break;
                }
                "" => continue,
                other => {
                    warn!("Unknown command: {other}");
                    continue;
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read command: {}", e);
                break;
            }
        };

        if let Err(e) = result {
            warn!("Playback command failed: {}", e);
        }
    }

    controls.stop();
}

/// Log all sync events to the console
async fn log_sync_events(sync_engine: Arc<SyncEngine>) {
    let mut rx = sync_engine.subscribe();

    loop {
        match rx.recv().await {
            Ok(event) => match &event {
                SyncEvent::TrackChanged { track: Some(track) } => {
                    info!(
                        "Now playing: {} - {} [{}]",
                        track.artists_display(),
                        track.name,
                        track.album
                    );
                }
                SyncEvent::TrackChanged { track: None } => {
                    info!("Nothing playing");
                }
                SyncEvent::SnapshotUpdated { snapshot } => {
                    tracing::debug!(
                        "Snapshot: playing={}, {}/{}ms",
                        snapshot.is_playing,
                        snapshot.progress_ms,
                        snapshot.duration_ms()
                    );
                }
                SyncEvent::ProgressTick { .. } => {}
                SyncEvent::ReauthRequired => {
                    warn!("Spotify session expired");
                }
                SyncEvent::FetchFailed { message } => {
                    warn!("Playback fetch failed: {}", message);
                }
            },
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                info!("Sync event channel closed");
                break;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                info!("Missed {} sync events", n);
            }
        }
    }
}

/// Check if file logging is enabled by reading the config file.
/// This is done before full config loading to set up tracing first.
/// Returns `false` if config doesn't exist or can't be parsed.
fn check_file_logging_enabled() -> bool {
    #[derive(serde::Deserialize)]
    struct PartialConfig {
        #[serde(default)]
        logging: PartialLoggingConfig,
    }
    #[derive(serde::Deserialize, Default)]
    struct PartialLoggingConfig {
        #[serde(default)]
        enabled: bool,
    }

    let Ok(content) = std::fs::read_to_string(NowPlayingConfig::config_path()) else {
        return false;
    };

    toml::from_str::<PartialConfig>(&content)
        .map(|c| c.logging.enabled)
        .unwrap_or(false)
}

/// Initialize tracing with console output and optional file logging
fn init_tracing(file_logging_enabled: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer();

    if file_logging_enabled {
        let log_path = nowplaying_core::log_file_path();

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match File::create(&log_path) {
            Ok(file) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(file_layer)
                    .init();

                return;
            }
            Err(e) => {
                eprintln!("Failed to create log file at {}: {e}", log_path.display());
            }
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
