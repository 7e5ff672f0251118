pub mod config;
pub mod error;
pub mod paths;
pub mod playback;
pub mod progress;
pub mod source;
pub mod sync;
pub mod time;

pub use config::{build_config_template, LoggingConfig, NowPlayingConfig, ProvidersConfig};
pub use error::CoreError;
pub use paths::{
    config_dir, log_file_path, CONFIG_DIR_NAME, CONFIG_FILE_NAME, LOG_FILE_NAME,
};
pub use playback::{PlaybackSnapshot, TrackInfo};
pub use progress::ProgressExtrapolation;
pub use source::PlaybackSource;
pub use sync::{SyncEngine, SyncEvent};
pub use time::{Clock, DurationExt, SystemClock};
