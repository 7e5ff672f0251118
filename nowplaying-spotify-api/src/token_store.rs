//! Persistent storage for the OAuth session.
//!
//! The store only keeps values. Expiry and refresh decisions live in
//! [`SpotifyOAuth`](crate::SpotifyOAuth).

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Access token, refresh token and absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp in milliseconds after which the access token is invalid
    pub expires_at_epoch_ms: i64,
}

impl TokenRecord {
    /// Build a record from a token response received at `now_ms`.
    pub fn issue(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in_secs: u64,
        now_ms: i64,
    ) -> Self {
        let ttl_ms = i64::try_from(expires_in_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at_epoch_ms: now_ms.saturating_add(ttl_ms),
        }
    }

    #[must_use]
    pub const fn is_valid_at(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_epoch_ms
    }
}

/// Storage seam for the session.
pub trait TokenStore: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn get(&self) -> Result<Option<TokenRecord>, StoreError>;

    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn put(&self, record: &TokenRecord) -> Result<(), StoreError>;

    /// Remove the token record, keeping any pending state nonce.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn clear(&self) -> Result<(), StoreError>;

    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be read.
    fn state_nonce(&self) -> Result<Option<String>, StoreError>;

    /// Store the nonce for a new login attempt, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn put_state_nonce(&self, nonce: &str) -> Result<(), StoreError>;

    /// Remove and return the stored nonce.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn take_state_nonce(&self) -> Result<Option<String>, StoreError>;

    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn clear_state_nonce(&self) -> Result<(), StoreError> {
        self.take_state_nonce().map(|_| ())
    }
}

/// Everything the stores persist
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<TokenRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_nonce: Option<String>,
}

impl PersistedSession {
    const fn is_empty(&self) -> bool {
        self.token.is_none() && self.state_nonce.is_none()
    }
}

/// Session persisted as a JSON document so restarts keep the login.
pub struct FileTokenStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at ~/.config/nowplaying/.spotify_session.json
    #[must_use]
    pub fn at_default_path() -> Self {
        Self::new(crate::paths::spotify_session_path())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_session(&self) -> Result<PersistedSession, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(PersistedSession::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_session(&self, session: &PersistedSession) -> Result<(), StoreError> {
        if session.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_private(&self.path, &serde_json::to_string_pretty(session)?)?;
        debug!("Saved Spotify session to {:?}", self.path);
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(PersistedSession) -> R) -> Result<R, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(self.read_session()?))
    }

    fn update<R>(&self, f: impl FnOnce(&mut PersistedSession) -> R) -> Result<R, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut session = self.read_session()?;
        let result = f(&mut session);
        self.write_session(&session)?;
        Ok(result)
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self) -> Result<Option<TokenRecord>, StoreError> {
        self.read(|session| session.token)
    }

    fn put(&self, record: &TokenRecord) -> Result<(), StoreError> {
        self.update(|session| session.token = Some(record.clone()))
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.update(|session| session.token = None)
    }

    fn state_nonce(&self) -> Result<Option<String>, StoreError> {
        self.read(|session| session.state_nonce)
    }

    fn put_state_nonce(&self, nonce: &str) -> Result<(), StoreError> {
        self.update(|session| session.state_nonce = Some(nonce.to_string()))
    }

    fn take_state_nonce(&self) -> Result<Option<String>, StoreError> {
        self.update(|session| session.state_nonce.take())
    }
}

/// In-process session for tests and throwaway logins.
#[derive(Default)]
pub struct MemoryTokenStore {
    session: Mutex<PersistedSession>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a token record
    #[must_use]
    pub fn with_token(record: TokenRecord) -> Self {
        Self {
            session: Mutex::new(PersistedSession {
                token: Some(record),
                state_nonce: None,
            }),
        }
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut PersistedSession) -> R) -> R {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut session)
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.with_session(|session| session.token.clone()))
    }

    fn put(&self, record: &TokenRecord) -> Result<(), StoreError> {
        self.with_session(|session| session.token = Some(record.clone()));
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.with_session(|session| session.token = None);
        Ok(())
    }

    fn state_nonce(&self) -> Result<Option<String>, StoreError> {
        Ok(self.with_session(|session| session.state_nonce.clone()))
    }

    fn put_state_nonce(&self, nonce: &str) -> Result<(), StoreError> {
        self.with_session(|session| session.state_nonce = Some(nonce.to_string()));
        Ok(())
    }

    fn take_state_nonce(&self) -> Result<Option<String>, StoreError> {
        Ok(self.with_session(|session| session.state_nonce.take()))
    }
}

/// Write `contents` readable by the owner only
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(0o600);
        // Files created before this mode was applied keep their old bits
        if path.exists() {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
    }
    options.open(path)?.write_all(contents.as_bytes())
}
