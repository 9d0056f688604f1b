//! Expiring memory of the last transform applied per playlist.
//!
//! All settings live under one root key as a JSON object. After the first
//! backend failure the store switches to its in-memory copy for the rest of
//! the session. Only the write that failed reports it to the caller.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};

use crate::{error::StoreError, order::TransformKind};

pub const SETTINGS_ROOT_KEY: &str = "playlistManagerSettings";

pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// String key-value contract offered by the host's storage.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Process-local backend. Also the fallback when no durable store exists.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Default,
    Dark,
}

/// Last transform applied to one playlist.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub playlist_id: String,
    pub transform: TransformKind,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub captured_at: DateTime<Utc>,
}

impl PersistedRecord {
    pub fn is_fresh(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        now - self.captured_at < retention
    }
}

/// Settings object stored under [`SETTINGS_ROOT_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_true")]
    pub auto_save: bool,
    #[serde(default = "default_true")]
    pub remember_sort: bool,
    #[serde(default = "default_true")]
    pub notifications: bool,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub saved_playlists: BTreeMap<String, PersistedRecord>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_save: true,
            remember_sort: true,
            notifications: true,
            theme: Theme::Default,
            saved_playlists: BTreeMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One row of the saved-records overview offered to a settings UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    pub playlist_id: String,
    pub transform: TransformKind,
    pub captured_at: DateTime<Utc>,
    pub fresh: bool,
}

/// Settings cache in front of a [`KeyValueStore`].
pub struct SettingsStore {
    backend: Box<dyn KeyValueStore>,
    settings: Settings,
    retention: Duration,
    degraded: bool,
}

impl SettingsStore {
    pub fn open(backend: Box<dyn KeyValueStore>, retention: Duration) -> Self {
        let mut store = Self {
            backend,
            settings: Settings::default(),
            retention,
            degraded: false,
        };
        store.reload();
        store
    }

    pub fn in_memory() -> Self {
        Self::open(
            Box::new(MemoryStore::new()),
            Duration::days(DEFAULT_RETENTION_DAYS),
        )
    }

    /// Re-reads the root key. Keeps the cached settings when degraded.
    pub fn reload(&mut self) {
        if self.degraded {
            return;
        }
        match self.backend.get(SETTINGS_ROOT_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Settings>(&raw) {
                Ok(settings) => self.settings = settings,
                Err(err) => {
                    warn!("Stored settings are unreadable, using defaults: {}", err);
                    self.settings = Settings::default();
                }
            },
            Ok(None) => {
                debug!("No stored settings; using defaults");
                self.settings = Settings::default();
            }
            Err(err) => self.degrade(&err),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// `true` once the backend failed; the session runs on memory only.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn update_settings(&mut self, update: impl FnOnce(&mut Settings)) -> crate::Result<()> {
        update(&mut self.settings);
        self.flush()
    }

    /// Fresh record for `playlist_id`; stale records read as absent.
    pub fn record(&self, playlist_id: &str, now: DateTime<Utc>) -> Option<&PersistedRecord> {
        self.settings
            .saved_playlists
            .get(playlist_id)
            .filter(|record| record.is_fresh(now, self.retention))
    }

    /// The record is kept in memory even when the write fails.
    pub fn upsert(
        &mut self,
        playlist_id: &str,
        transform: TransformKind,
        now: DateTime<Utc>,
    ) -> crate::Result<()> {
        self.settings.saved_playlists.insert(
            playlist_id.to_string(),
            PersistedRecord {
                playlist_id: playlist_id.to_string(),
                transform,
                captured_at: now,
            },
        );
        self.flush()
    }

    pub fn remove(&mut self, playlist_id: &str) -> crate::Result<()> {
        if self.settings.saved_playlists.remove(playlist_id).is_none() {
            return Ok(());
        }
        self.flush()
    }

    /// Saved records, most recent first.
    pub fn summary(&self, now: DateTime<Utc>) -> Vec<RecordSummary> {
        let mut rows: Vec<RecordSummary> = self
            .settings
            .saved_playlists
            .values()
            .map(|record| RecordSummary {
                playlist_id: record.playlist_id.clone(),
                transform: record.transform,
                captured_at: record.captured_at,
                fresh: record.is_fresh(now, self.retention),
            })
            .collect();
        rows.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        rows
    }

    fn flush(&mut self) -> crate::Result<()> {
        if self.degraded {
            return Ok(());
        }
        let written = serde_json::to_string(&self.settings)
            .map_err(StoreError::from)
            .and_then(|payload| self.backend.set(SETTINGS_ROOT_KEY, &payload));
        if let Err(err) = written {
            self.degrade(&err);
            return Err(err.into());
        }
        Ok(())
    }

    fn degrade(&mut self, err: &StoreError) {
        warn!(
            "Settings storage unavailable, continuing with in-memory settings: {}",
            err
        );
        self.degraded = true;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{
        KeyValueStore, MemoryStore, Settings, SettingsStore, Theme, SETTINGS_ROOT_KEY,
    };
    use crate::{
        error::{EngineError, StoreError},
        order::TransformKind,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, 8, 0, 0).single().expect("valid date")
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::NoDataDir)
        }

        fn set(&mut self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::NoDataDir)
        }
    }

    /// Readable but rejects every write.
    struct ReadOnlyStore;

    impl KeyValueStore for ReadOnlyStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        fn set(&mut self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::NoDataDir)
        }
    }

    #[test]
    fn test_defaults_when_nothing_stored() {
        let store = SettingsStore::in_memory();
        assert_eq!(store.settings(), &Settings::default());
        assert!(store.settings().auto_save);
        assert!(store.settings().remember_sort);
        assert!(store.settings().notifications);
        assert_eq!(store.settings().theme, Theme::Default);
        assert!(!store.is_degraded());
    }

    #[test]
    fn test_record_expires_after_retention_window() {
        let mut store = SettingsStore::in_memory();
        store
            .upsert("PL1", TransformKind::Reverse, now() - Duration::days(8))
            .expect("stored");
        store
            .upsert("PL2", TransformKind::SortTitle, now() - Duration::days(6))
            .expect("stored");

        assert_eq!(store.record("PL1", now()), None);
        assert_eq!(
            store.record("PL2", now()).map(|record| record.transform),
            Some(TransformKind::SortTitle)
        );
    }

    #[test]
    fn test_upsert_keeps_one_record_per_identity() {
        let mut store = SettingsStore::in_memory();
        store
            .upsert("PL", TransformKind::Reverse, now() - Duration::hours(2))
            .expect("stored");
        store
            .upsert("PL", TransformKind::SortDuration, now())
            .expect("stored");

        let summary = store.summary(now());
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].transform, TransformKind::SortDuration);

        store.remove("PL").expect("removed");
        assert!(store.summary(now()).is_empty());
    }

    #[test]
    fn test_settings_round_trip_through_backend_json() {
        let mut backend = MemoryStore::new();
        backend
            .set(
                SETTINGS_ROOT_KEY,
                r#"{"autoSave":true,"rememberSort":false,"theme":"dark",
                    "savedPlaylists":{"PL":{"playlistId":"PL","transform":"upload-date","capturedAt":1778400000000}}}"#,
            )
            .expect("write");
        let store = SettingsStore::open(Box::new(backend), Duration::days(7));

        let settings = store.settings();
        assert!(!settings.remember_sort);
        assert!(settings.notifications);
        assert_eq!(settings.theme, Theme::Dark);
        let record = &settings.saved_playlists["PL"];
        assert_eq!(record.transform, TransformKind::SortRecency);
        assert_eq!(record.captured_at.timestamp_millis(), 1_778_400_000_000);
    }

    #[test]
    fn test_unreadable_payload_falls_back_to_defaults() {
        let mut backend = MemoryStore::new();
        backend.set(SETTINGS_ROOT_KEY, "not json").expect("write");
        let store = SettingsStore::open(Box::new(backend), Duration::days(7));
        assert_eq!(store.settings(), &Settings::default());
        assert!(!store.is_degraded());
    }

    #[test]
    fn test_failing_backend_degrades_to_memory() {
        let mut store = SettingsStore::open(Box::new(FailingStore), Duration::days(7));
        assert!(store.is_degraded());

        assert!(store.upsert("PL", TransformKind::Shuffle, now()).is_ok());
        assert!(store
            .update_settings(|settings| settings.notifications = false)
            .is_ok());

        assert_eq!(
            store.record("PL", now()).map(|record| record.transform),
            Some(TransformKind::Shuffle)
        );
        assert!(!store.settings().notifications);
    }

    #[test]
    fn test_first_failed_write_reports_unavailable() {
        let mut store = SettingsStore::open(Box::new(ReadOnlyStore), Duration::days(7));
        assert!(!store.is_degraded());

        let first = store.upsert("PL", TransformKind::Reverse, now());
        assert!(matches!(first, Err(EngineError::PersistenceUnavailable(_))));
        assert!(store.is_degraded());
        assert_eq!(
            store.record("PL", now()).map(|record| record.transform),
            Some(TransformKind::Reverse)
        );

        assert!(store.upsert("PL", TransformKind::SortTitle, now()).is_ok());
        assert!(store.remove("PL").is_ok());
        assert_eq!(store.record("PL", now()), None);
    }
}
