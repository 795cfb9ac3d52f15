//! Persisted widget settings and the serialized accessor around them.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::Credential;

const APP_DIR: &str = "ClaudeUsageBar";
const CONFIG_FILE: &str = "config.json";

/// Lowest accepted poll interval in seconds
pub const MIN_POLL_INTERVAL_SECS: u64 = 10;
pub const MAX_POLL_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

pub const MIN_OPACITY: f64 = 0.3;
pub const MAX_OPACITY: f64 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no per-user config directory available")]
    NoConfigDir,
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Default for Position {
    fn default() -> Self {
        Self { x: 20, y: 80 }
    }
}

/// On-disk settings record. Missing or mistyped fields fall back to
/// [`Config::default`] one at a time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Config {
    pub position: Position,
    pub opacity: f64,
    pub session_key: Option<Credential>,
    /// Seconds between automatic fetches
    pub poll_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            position: Position::default(),
            opacity: 0.9,
            session_key: None,
            poll_interval: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Parse a config document, clamping values into their valid ranges
    ///
    /// Only a document that isn't a JSON object is an error. A field of the
    /// wrong type is dropped on its own and the rest are kept.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let fields: Map<String, Value> = serde_json::from_str(content)?;
        let defaults = Config::default();
        let interval: f64 = field(&fields, "poll_interval", defaults.poll_interval as f64);

        let mut config = Config {
            position: field(&fields, "position", defaults.position),
            opacity: field(&fields, "opacity", defaults.opacity),
            session_key: field(&fields, "session_key", defaults.session_key),
            // `as` saturates, and normalize() clamps the result
            poll_interval: interval.round() as u64,
        };
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        self.poll_interval = clamp_interval(self.poll_interval);
        self.opacity = clamp_opacity(self.opacity);
        if self
            .session_key
            .as_ref()
            .is_some_and(|c| c.expose().trim().is_empty())
        {
            self.session_key = None;
        }
    }
}

fn field<T: DeserializeOwned>(fields: &Map<String, Value>, key: &str, fallback: T) -> T {
    let Some(value) = fields.get(key) else {
        return fallback;
    };
    match T::deserialize(value) {
        Ok(v) => v,
        Err(e) => {
            warn!("Ignoring invalid `{key}` in config: {e}");
            fallback
        }
    }
}

pub fn clamp_interval(secs: u64) -> u64 {
    secs.clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS)
}

pub fn clamp_opacity(opacity: f64) -> f64 {
    if opacity.is_nan() {
        return Config::default().opacity;
    }
    opacity.clamp(MIN_OPACITY, MAX_OPACITY)
}

/// Default location: `<config_dir>/ClaudeUsageBar/config.json`
pub fn default_path() -> Result<PathBuf, ConfigError> {
    let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(dir.join(APP_DIR).join(CONFIG_FILE))
}

/// Load a config file, falling back to defaults when it is missing or corrupt
pub fn load(path: &Path) -> Config {
    read(path).unwrap_or_default()
}

fn read(path: &Path) -> Option<Config> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No config at {}", path.display());
            return None;
        }
        Err(e) => {
            warn!("Failed to read {}: {e}", path.display());
            return None;
        }
    };

    match Config::from_json(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("Ignoring unreadable config {}: {e}", path.display());
            None
        }
    }
}

pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(config)?;

    // Write aside and rename so a torn write never replaces a good file
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, json).map_err(|source| ConfigError::Write {
        path: temp_path.clone(),
        source,
    })?;
    std::fs::rename(&temp_path, path).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Single owner of the config record.
///
/// Every mutation runs under the lock and is written to disk before the lock
/// is released, so credential capture on a worker thread and settings changes
/// on the UI thread can't lose each other's updates. Each mutation starts from
/// the file's current contents, which keeps writes made by another process
/// (such as `login`) intact.
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<Config>,
}

impl ConfigStore {
    pub fn open(path: PathBuf) -> Self {
        let config = load(&path);
        Self {
            path,
            inner: Mutex::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> Config {
        self.inner.lock().clone()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner.lock().session_key.clone()
    }

    pub fn poll_interval_secs(&self) -> u64 {
        self.inner.lock().poll_interval
    }

    /// Pick up the file as it is on disk now. A missing or unreadable file
    /// leaves the in-memory record alone.
    pub fn reload(&self) -> Config {
        let mut guard = self.inner.lock();
        if let Some(on_disk) = read(&self.path) {
            *guard = on_disk;
        }
        guard.clone()
    }

    /// Apply a mutation and persist it. A failed write is logged; the
    /// in-memory value still applies.
    pub fn update<F>(&self, mutate: F) -> Config
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.inner.lock();
        if let Some(on_disk) = read(&self.path) {
            *guard = on_disk;
        }
        mutate(&mut guard);
        guard.normalize();
        if let Err(e) = save(&self.path, &guard) {
            warn!("{e}");
        }
        guard.clone()
    }

    pub fn set_credential(&self, credential: Credential) {
        self.update(|c| c.session_key = Some(credential));
    }

    pub fn clear_credential(&self) {
        self.update(|c| c.session_key = None);
    }

    pub fn set_poll_interval(&self, secs: u64) -> u64 {
        self.update(|c| c.poll_interval = secs).poll_interval
    }

    pub fn set_opacity(&self, opacity: f64) -> f64 {
        self.update(|c| c.opacity = opacity).opacity
    }

    pub fn set_position(&self, x: i32, y: i32) {
        self.update(|c| c.position = Position { x, y });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::open(dir.path().join(APP_DIR).join(CONFIG_FILE))
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("nope.json"));
        assert_eq!(
            config,
            Config {
                position: Position { x: 20, y: 80 },
                opacity: 0.9,
                session_key: None,
                poll_interval: 60,
            }
        );
    }

    #[test]
    fn test_partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"opacity": 0.5, "position": {"x": 300}, "extra": true}"#)
            .unwrap();

        let config = load(&path);
        assert_eq!(config.opacity, 0.5);
        assert_eq!(config.position, Position { x: 300, y: 80 });
        assert_eq!(config.poll_interval, 60);
        assert_eq!(config.session_key, None);
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load(&path), Config::default());
    }

    #[test]
    fn test_values_clamped_on_load() {
        let config = Config::from_json(r#"{"poll_interval": 2, "opacity": 0.05}"#).unwrap();
        assert_eq!(config.poll_interval, MIN_POLL_INTERVAL_SECS);
        assert_eq!(config.opacity, MIN_OPACITY);

        let config = Config::from_json(&format!(r#"{{"poll_interval": {}}}"#, u64::MAX)).unwrap();
        assert_eq!(config.poll_interval, MAX_POLL_INTERVAL_SECS);
        assert_eq!(clamp_interval(u64::MAX), MAX_POLL_INTERVAL_SECS);
    }

    #[test]
    fn test_mistyped_field_keeps_the_rest() {
        let config = Config::from_json(
            r#"{"session_key": "sk-keep", "poll_interval": 30.0, "opacity": "high",
                "position": {"x": 500, "y": 600}}"#,
        )
        .unwrap();
        assert_eq!(
            config,
            Config {
                position: Position { x: 500, y: 600 },
                opacity: 0.9,
                session_key: Credential::new("sk-keep"),
                poll_interval: 30,
            }
        );

        let config = Config::from_json(r#"{"session_key": 42, "position": {"x": 7}}"#).unwrap();
        assert_eq!(config.session_key, None);
        assert_eq!(config.position, Position { x: 7, y: 80 });
    }

    #[test]
    fn test_mistyped_field_survives_next_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"session_key": "sk-keep", "poll_interval": "soon"}"#).unwrap();

        let store = ConfigStore::open(path.clone());
        store.set_opacity(0.5);

        let reloaded = load(&path);
        assert_eq!(reloaded.session_key, Credential::new("sk-keep"));
        assert_eq!(reloaded.poll_interval, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(reloaded.opacity, 0.5);
    }

    #[test]
    fn test_non_object_document_is_rejected() {
        assert!(Config::from_json("[1, 2]").is_err());
        assert!(Config::from_json("null").is_err());
    }

    #[test]
    fn test_null_session_key_reads_as_none() {
        let config = Config::from_json(r#"{"session_key": null}"#).unwrap();
        assert!(config.session_key.is_none());
        let config = Config::from_json(r#"{"session_key": ""}"#).unwrap();
        assert!(config.session_key.is_none());
    }

    #[test]
    fn test_store_persists_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.set_credential(Credential::new("sk-abc").unwrap());
        store.set_position(5, 6);
        assert_eq!(store.set_poll_interval(3), MIN_POLL_INTERVAL_SECS);

        let reloaded = load(store.path());
        assert_eq!(reloaded.session_key, Credential::new("sk-abc"));
        assert_eq!(reloaded.position, Position { x: 5, y: 6 });
        assert_eq!(reloaded.poll_interval, MIN_POLL_INTERVAL_SECS);

        store.clear_credential();
        assert!(load(store.path()).session_key.is_none());
    }

    #[test]
    fn test_save_replaces_file_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ half written").unwrap();

        let config = Config {
            poll_interval: 120,
            ..Config::default()
        };
        save(&path, &config).unwrap();

        assert_eq!(load(&path), config);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_mutation_keeps_credential_written_by_another_store() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = store_in(&dir);
        let cli = store_in(&dir);

        cli.set_credential(Credential::new("sk-from-login").unwrap());
        overlay.set_position(100, 100);

        assert_eq!(overlay.credential(), Credential::new("sk-from-login"));
        let on_disk = load(overlay.path());
        assert_eq!(on_disk.session_key, Credential::new("sk-from-login"));
        assert_eq!(on_disk.position, Position { x: 100, y: 100 });
    }

    #[test]
    fn test_reload_picks_up_external_writes() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = store_in(&dir);
        assert!(overlay.reload().session_key.is_none());

        store_in(&dir).set_credential(Credential::new("sk-new").unwrap());
        assert!(overlay.credential().is_none());
        assert_eq!(overlay.reload().session_key, Credential::new("sk-new"));
        assert_eq!(overlay.credential(), Credential::new("sk-new"));

        std::fs::remove_file(overlay.path()).unwrap();
        assert_eq!(overlay.reload().session_key, Credential::new("sk-new"));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store_in(&dir));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    store.set_position(i, i);
                }
            })
        };
        store.set_credential(Credential::new("sk-race").unwrap());
        writer.join().unwrap();

        let config = store.snapshot();
        assert_eq!(config.session_key, Credential::new("sk-race"));
        assert_eq!(config.position, Position { x: 49, y: 49 });
        assert_eq!(load(store.path()), config);
    }
}
