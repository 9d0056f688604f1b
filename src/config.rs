//! Engine configuration model and defaults, persisted to `config.toml`.

use std::path::PathBuf;

use chrono::Duration;
use log::warn;

use crate::{
    discovery::ItemDiscovery,
    persistence::DEFAULT_RETENTION_DAYS,
    selector::{parse_cascade, Selector},
};

/// Root configuration persisted to `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Settle delays between host signals and engine reactions.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Discovery cascade overrides and retry budget.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Settings storage preferences.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Settle delays, in milliseconds.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TimingConfig {
    /// Wait after a navigation before re-checking eligibility.
    #[serde(default = "default_navigation_check_ms")]
    pub navigation_check_ms: u64,
    /// Same, on single-item views whose side panel renders late.
    #[serde(default = "default_watch_navigation_check_ms")]
    pub watch_navigation_check_ms: u64,
    /// Wait between an eligibility success and the first discovery.
    #[serde(default = "default_activation_settle_ms")]
    pub activation_settle_ms: u64,
    #[serde(default = "default_watch_activation_settle_ms")]
    pub watch_activation_settle_ms: u64,
    /// Wait before retrying an empty discovery.
    #[serde(default = "default_discovery_retry_ms")]
    pub discovery_retry_ms: u64,
    /// Wait after a playlist panel is inserted into the tree.
    #[serde(default = "default_panel_appeared_ms")]
    pub panel_appeared_ms: u64,
    /// Wait after the current item changes within the same playlist.
    #[serde(default = "default_item_advance_ms")]
    pub item_advance_ms: u64,
    /// Wait after the host reports the current item finished playing.
    #[serde(default = "default_playback_ended_ms")]
    pub playback_ended_ms: u64,
    /// Wait before silently replaying a remembered transform.
    #[serde(default = "default_replay_settle_ms")]
    pub replay_settle_ms: u64,
}

/// Discovery cascade overrides.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DiscoveryConfig {
    /// Retries after an empty discovery before giving up until the next
    /// navigation or panel insertion.
    #[serde(default = "default_max_discovery_retries")]
    pub max_retries: u32,
    /// Replaces the built-in item cascade when non-empty.
    #[serde(default)]
    pub item_selectors: Vec<String>,
}

/// Settings storage preferences.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Days a remembered transform stays replayable.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Overrides the default `settings.db` location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            navigation_check_ms: default_navigation_check_ms(),
            watch_navigation_check_ms: default_watch_navigation_check_ms(),
            activation_settle_ms: default_activation_settle_ms(),
            watch_activation_settle_ms: default_watch_activation_settle_ms(),
            discovery_retry_ms: default_discovery_retry_ms(),
            panel_appeared_ms: default_panel_appeared_ms(),
            item_advance_ms: default_item_advance_ms(),
            playback_ended_ms: default_playback_ended_ms(),
            replay_settle_ms: default_replay_settle_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_discovery_retries(),
            item_selectors: Vec::new(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            retention_days: default_retention_days(),
            database_path: None,
        }
    }
}

impl Config {
    /// Clamps values that would make the engine spin or never settle.
    pub fn sanitized(self) -> Self {
        let timing = TimingConfig {
            discovery_retry_ms: self.timing.discovery_retry_ms.max(50),
            ..self.timing
        };
        Config {
            timing,
            discovery: DiscoveryConfig {
                max_retries: self.discovery.max_retries.min(1_000),
                ..self.discovery
            },
            persistence: PersistenceConfig {
                retention_days: self.persistence.retention_days.clamp(1, 3_650),
                ..self.persistence
            },
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.persistence.retention_days))
    }

    /// Discovery with the configured cascade, or the built-in one.
    pub fn item_discovery(&self) -> ItemDiscovery {
        if self.discovery.item_selectors.is_empty() {
            return ItemDiscovery::new();
        }
        let sources: Vec<&str> = self
            .discovery
            .item_selectors
            .iter()
            .map(String::as_str)
            .collect();
        let cascade: Vec<Selector> = parse_cascade(&sources);
        if cascade.is_empty() {
            warn!("No configured item selector is valid; using the built-in cascade");
            return ItemDiscovery::new();
        }
        ItemDiscovery::new().with_item_cascade(cascade)
    }
}

fn default_navigation_check_ms() -> u64 {
    1_000
}

fn default_watch_navigation_check_ms() -> u64 {
    2_000
}

fn default_activation_settle_ms() -> u64 {
    100
}

fn default_watch_activation_settle_ms() -> u64 {
    1_500
}

fn default_discovery_retry_ms() -> u64 {
    1_000
}

fn default_panel_appeared_ms() -> u64 {
    500
}

fn default_item_advance_ms() -> u64 {
    500
}

fn default_playback_ended_ms() -> u64 {
    1_000
}

fn default_replay_settle_ms() -> u64 {
    1_000
}

fn default_max_discovery_retries() -> u32 {
    10
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS as u32
}
