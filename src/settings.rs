use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    consts::{
        DEFAULT_CACHE_LIMIT, MAX_CACHE_LIMIT, MAX_MIN_PRIORITY, STREAM_BACKOFF_BASE_SECS,
        STREAM_BACKOFF_MAX_SECS, STREAM_CONNECT_TIMEOUT_SECS, STREAM_LIVENESS_CHECK_INTERVAL_SECS,
        STREAM_LIVENESS_IDLE_SECS, STREAM_LIVENESS_PING_GRACE_SECS, STREAM_SYNC_INTERVAL_SECS,
    },
    error::{Error, Result},
    pause::PauseMode,
    util::restrict_file_permissions,
};

/// Stream timing knobs. The idle window in particular is environment dependent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StreamTuning {
    pub connect_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub liveness_check_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub ping_grace_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            connect_timeout_secs: STREAM_CONNECT_TIMEOUT_SECS,
            sync_interval_secs: STREAM_SYNC_INTERVAL_SECS,
            liveness_check_interval_secs: STREAM_LIVENESS_CHECK_INTERVAL_SECS,
            idle_timeout_secs: STREAM_LIVENESS_IDLE_SECS,
            ping_grace_secs: STREAM_LIVENESS_PING_GRACE_SECS,
            backoff_base_secs: STREAM_BACKOFF_BASE_SECS,
            backoff_max_secs: STREAM_BACKOFF_MAX_SECS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub base_url: String,
    pub token: Option<String>,
    pub min_priority: i64,
    pub cache_limit: usize,
    pub launch_at_login: bool,
    pub start_minimized_to_tray: bool,
    pub pause_until: Option<u64>,
    pub pause_mode: Option<PauseMode>,
    pub quiet_hours_start: Option<u8>,
    pub quiet_hours_end: Option<u8>,
    pub stream: StreamTuning,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            min_priority: 0,
            cache_limit: DEFAULT_CACHE_LIMIT,
            launch_at_login: false,
            start_minimized_to_tray: false,
            pause_until: None,
            pause_mode: None,
            quiet_hours_start: None,
            quiet_hours_end: None,
            stream: StreamTuning::default(),
        }
    }
}

impl Settings {
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    pub fn effective_cache_limit(&self) -> usize {
        normalize_cache_limit(self.cache_limit)
    }
}

/// What `load_settings` hands out: the token is reduced to a presence flag.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct SettingsView {
    pub base_url: String,
    pub has_token: bool,
    pub min_priority: i64,
    pub cache_limit: usize,
    pub launch_at_login: bool,
    pub start_minimized_to_tray: bool,
    pub pause_until: Option<u64>,
    pub pause_mode: Option<PauseMode>,
    pub quiet_hours_start: Option<u8>,
    pub quiet_hours_end: Option<u8>,
}

impl From<&Settings> for SettingsView {
    fn from(stored: &Settings) -> Self {
        Self {
            base_url: stored.base_url.clone(),
            has_token: stored.token().is_some(),
            min_priority: stored.min_priority,
            cache_limit: stored.effective_cache_limit(),
            launch_at_login: stored.launch_at_login,
            start_minimized_to_tray: stored.start_minimized_to_tray,
            pause_until: stored.pause_until,
            pause_mode: stored.pause_mode,
            quiet_hours_start: stored.quiet_hours_start,
            quiet_hours_end: stored.quiet_hours_end,
        }
    }
}

/// Input of `save_settings`. `None` keeps the stored value; an empty token keeps the stored token.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SettingsUpdate {
    pub base_url: String,
    pub token: String,
    pub min_priority: Option<i64>,
    pub cache_limit: Option<usize>,
    pub launch_at_login: Option<bool>,
    pub start_minimized_to_tray: Option<bool>,
    pub quiet_hours_start: Option<u8>,
    pub quiet_hours_end: Option<u8>,
}

impl SettingsUpdate {
    /// Folds the update into `current`. Pause state is carried over untouched.
    pub fn apply(self, current: &Settings) -> Result<Settings> {
        let base_url = normalize_base_url(&self.base_url)?;

        let token = if self.token.trim().is_empty() {
            match current.token() {
                Some(existing) => {
                    debug!("save_settings: keeping existing token");
                    Some(existing.to_string())
                }
                None => return Err(Error::Credential("Token is required".to_string())),
            }
        } else {
            debug!(token_len = self.token.trim().len(), "save_settings: new token");
            Some(self.token.trim().to_string())
        };

        let quiet_start = self.quiet_hours_start.or(current.quiet_hours_start);
        let quiet_end = self.quiet_hours_end.or(current.quiet_hours_end);

        Ok(Settings {
            base_url,
            token,
            min_priority: self
                .min_priority
                .unwrap_or(current.min_priority)
                .clamp(0, MAX_MIN_PRIORITY),
            cache_limit: normalize_cache_limit(self.cache_limit.unwrap_or(current.cache_limit)),
            launch_at_login: self.launch_at_login.unwrap_or(current.launch_at_login),
            start_minimized_to_tray: self
                .start_minimized_to_tray
                .unwrap_or(current.start_minimized_to_tray),
            pause_until: current.pause_until,
            pause_mode: current.pause_mode,
            quiet_hours_start: quiet_start.map(|h| h % 24),
            quiet_hours_end: quiet_end.map(|h| h % 24),
            stream: current.stream.clone(),
        })
    }
}

/// Narrow load/save contract to whatever durably owns the settings.
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings>;
    fn save(&self, settings: &Settings) -> Result<()>;
}

/// Serializes read-modify-write cycles on one store. Everything that writes
/// settings must share the same writer, or a slow writer can clobber a
/// faster one with a stale copy.
pub struct SettingsWriter {
    store: Arc<dyn SettingsStore>,
    lock: Mutex<()>,
}

impl SettingsWriter {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// The underlying store, for read-only users.
    pub fn store(&self) -> Arc<dyn SettingsStore> {
        Arc::clone(&self.store)
    }

    pub fn load(&self) -> Result<Settings> {
        self.store.load()
    }

    /// Holds the write lock until the returned guard is dropped.
    pub fn begin(&self) -> Result<SettingsTxn<'_>> {
        let guard = self
            .lock
            .lock()
            .map_err(|_| Error::lock_poisoned("Settings writer"))?;
        Ok(SettingsTxn {
            store: self.store.as_ref(),
            _guard: guard,
        })
    }

    /// Loads, mutates and saves under the write lock. Nothing is saved when
    /// `mutate` fails or leaves the settings unchanged.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut Settings) -> Result<T>) -> Result<(Settings, T)> {
        let txn = self.begin()?;
        let current = txn.load()?;
        let mut next = current.clone();
        let value = mutate(&mut next)?;
        if next != current {
            txn.save(&next)?;
        }
        Ok((next, value))
    }
}

/// A load/save pair that no other writer can interleave with.
pub struct SettingsTxn<'a> {
    store: &'a dyn SettingsStore,
    _guard: MutexGuard<'a, ()>,
}

impl SettingsTxn<'_> {
    pub fn load(&self) -> Result<Settings> {
        self.store.load()
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        self.store.save(settings)
    }
}

/// `settings.json` in the companion's config directory, readable by the owner only.
#[derive(Debug, Clone)]
pub struct JsonFileSettingsStore {
    path: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(config_dir: &Path) -> Result<Self> {
        fs::create_dir_all(config_dir)
            .map_err(|error| Error::Storage(format!("Failed to create config directory: {error}")))?;
        let path = config_dir.join("settings.json");
        restrict_file_permissions(&path);
        Ok(Self::new(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettingsStore {
    fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|error| Error::Storage(format!("Failed to read settings: {error}")))?;
        serde_json::from_str::<Settings>(&content)
            .map_err(|error| Error::Storage(format!("Failed to parse settings: {error}")))
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)
            .map_err(|error| Error::Storage(format!("Failed to serialize settings: {error}")))?;
        fs::write(&self.path, content)
            .map_err(|error| Error::Storage(format!("Failed to write settings: {error}")))?;
        restrict_file_permissions(&self.path);
        Ok(())
    }
}

/// Volatile store for embedding without a config directory.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: Mutex<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: Mutex::new(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings> {
        self.inner
            .lock()
            .map(|settings| settings.clone())
            .map_err(|_| Error::lock_poisoned("Settings"))
    }

    fn save(&self, settings: &Settings) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| Error::lock_poisoned("Settings"))?;
        *guard = settings.clone();
        Ok(())
    }
}

pub fn normalize_cache_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_CACHE_LIMIT)
}

pub fn normalize_base_url(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::Config("Server URL is required".to_string()));
    }

    let url = reqwest::Url::parse(trimmed)
        .map_err(|error| Error::Config(format!("Invalid server URL: {error}")))?;

    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::Config(
            "Server URL must start with http:// or https://".to_string(),
        ));
    }

    Ok(trimmed.to_string())
}

pub fn build_stream_ws_url(base_url: &str) -> Result<String> {
    let mut ws_url = reqwest::Url::parse(base_url)
        .map_err(|error| Error::Config(format!("Invalid server URL: {error}")))?;

    let ws_scheme = match ws_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => {
            return Err(Error::Config(
                "Server URL must start with http:// or https://".to_string(),
            ))
        }
    };
    ws_url
        .set_scheme(ws_scheme)
        .map_err(|_| Error::Config(format!("Unable to convert URL scheme to {ws_scheme}")))?;

    let mut path = ws_url.path().trim_end_matches('/').to_string();
    path.push_str("/stream");
    ws_url.set_path(&path);
    Ok(ws_url.to_string())
}
