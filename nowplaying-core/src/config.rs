use crate::error::{CoreError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NowPlayingConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Provider-specific sections, keyed by provider name (`[providers.spotify]`)
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to ~/.config/nowplaying/nowplaying.log
    #[serde(default)]
    pub enabled: bool,
}

/// Dynamic `[providers.*]` tables.
///
/// Each provider crate owns the shape of its own section and extracts it
/// with [`ProvidersConfig::get`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvidersConfig(toml::Table);

impl ProvidersConfig {
    /// Deserialize the section for `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the section exists but does not match `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.0
            .get(name)
            .map(|value| toml::Value::try_into::<T>(value.clone()))
            .transpose()
            .map_err(CoreError::from)
    }
}

impl NowPlayingConfig {
    /// Get the configuration directory path (~/.config/nowplaying/)
    #[must_use]
    pub fn config_dir() -> PathBuf {
        crate::paths::config_dir()
    }

    /// Get the config file path (~/.config/nowplaying/config.toml)
    #[must_use]
    pub fn config_path() -> PathBuf {
        crate::paths::config_path()
    }

    /// Load config from the default path, or write a template on first run.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigNotFound`] after writing the template, or an
    /// error if the file cannot be read or parsed.
    pub fn load_or_create(provider_templates: Option<&[&str]>) -> Result<Self> {
        Self::load_or_create_at(&Self::config_path(), provider_templates)
    }

    /// Load config from `path`, or write a template there if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigNotFound`] after writing the template, or an
    /// error if the file cannot be read or parsed.
    pub fn load_or_create_at(path: &Path, provider_templates: Option<&[&str]>) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(path, build_config_template(provider_templates))?;

            return Err(CoreError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

const BASE_CONFIG_TEMPLATE: &str = r"# Now Playing Configuration
# ~/.config/nowplaying/config.toml

[logging]
# Also write logs to ~/.config/nowplaying/nowplaying.log
enabled = false

";

/// Build the config template written on first run.
///
/// Provider crates contribute their own `[providers.*]` sections.
#[must_use]
pub fn build_config_template(provider_templates: Option<&[&str]>) -> String {
    let mut template = BASE_CONFIG_TEMPLATE.to_string();
    for provider_template in provider_templates.unwrap_or_default() {
        template.push_str(provider_template);
    }
    template
}
