//! Configuration management for Flock.
//!
//! All binaries share a unified configuration file at `~/.flock/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Explicit config file values
//! 2. Environment variables (`FLOCK_DATA_DIR`)
//! 3. Default values

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".flock"),
        |dirs| dirs.home_dir().join(".flock"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Engine Configuration
// ============================================================================

/// Active-hour window during which the scheduler may act.
///
/// Supports overnight wrap: `start = "22:00", end = "06:00"` means the
/// window spans midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHours {
    /// Window start (HH:MM)
    #[serde(default = "default_active_start")]
    pub start: String,
    /// Window end (HH:MM)
    #[serde(default = "default_active_end")]
    pub end: String,
}

fn default_active_start() -> String {
    "08:00".to_string()
}
fn default_active_end() -> String {
    "23:00".to_string()
}

impl Default for ActiveHours {
    fn default() -> Self {
        Self {
            start: default_active_start(),
            end: default_active_end(),
        }
    }
}

impl ActiveHours {
    fn parse(time_str: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(time_str, "%H:%M").ok()
    }

    /// Check whether the given time falls inside the window.
    ///
    /// Unparseable bounds are treated as an always-open window so a
    /// bad config degrades to "run anytime" rather than "never run".
    pub fn contains(&self, now: NaiveTime) -> bool {
        let (start, end) = match (Self::parse(&self.start), Self::parse(&self.end)) {
            (Some(s), Some(e)) => (s, e),
            _ => return true,
        };

        if start <= end {
            now >= start && now < end
        } else {
            // Overnight wrap, e.g. 22:00-06:00
            now >= start || now < end
        }
    }

    /// Seconds to wait from `now` until the window next opens.
    ///
    /// Returns zero when already inside the window.
    pub fn seconds_until_open(&self, now: NaiveTime) -> u64 {
        if self.contains(now) {
            return 0;
        }
        let start = match Self::parse(&self.start) {
            Some(s) => s,
            None => return 0,
        };

        let diff = start.signed_duration_since(now).num_seconds();
        if diff >= 0 {
            diff as u64
        } else {
            (diff + 86_400) as u64
        }
    }
}

/// Core engine pacing and safety limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum follow actions per UTC day
    #[serde(default = "default_daily_follow_limit")]
    pub daily_follow_limit: u32,

    /// Maximum follow actions per hour
    #[serde(default = "default_hourly_follow_limit")]
    pub hourly_follow_limit: u32,

    /// Minimum minutes between scheduler ticks
    #[serde(default = "default_min_interval_minutes")]
    pub min_interval_minutes: u32,

    /// Maximum minutes between scheduler ticks
    #[serde(default = "default_max_interval_minutes")]
    pub max_interval_minutes: u32,

    /// Hours of the day during which the engine may act
    #[serde(default)]
    pub active_hours: ActiveHours,

    /// Consecutive action failures before the run halts
    #[serde(default = "default_stop_on_error_count")]
    pub stop_on_error_count: u32,

    /// Run the full state machine but skip surface mutations
    #[serde(default)]
    pub dry_run: bool,

    /// Minimum seconds between individual actions
    #[serde(default = "default_min_action_delay_secs")]
    pub min_action_delay_secs: u64,

    /// Maximum seconds between individual actions
    #[serde(default = "default_max_action_delay_secs")]
    pub max_action_delay_secs: u64,

    /// Base cooldown seconds after a rate-limit signal
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
}

fn default_daily_follow_limit() -> u32 {
    100
}
fn default_hourly_follow_limit() -> u32 {
    20
}
fn default_min_interval_minutes() -> u32 {
    30
}
fn default_max_interval_minutes() -> u32 {
    90
}
fn default_stop_on_error_count() -> u32 {
    5
}
fn default_min_action_delay_secs() -> u64 {
    30
}
fn default_max_action_delay_secs() -> u64 {
    90
}
fn default_rate_limit_cooldown_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            daily_follow_limit: default_daily_follow_limit(),
            hourly_follow_limit: default_hourly_follow_limit(),
            min_interval_minutes: default_min_interval_minutes(),
            max_interval_minutes: default_max_interval_minutes(),
            active_hours: ActiveHours::default(),
            stop_on_error_count: default_stop_on_error_count(),
            dry_run: false,
            min_action_delay_secs: default_min_action_delay_secs(),
            max_action_delay_secs: default_max_action_delay_secs(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
        }
    }
}

// ============================================================================
// Detection / Snapshot Configuration
// ============================================================================

/// Change-detection and snapshot retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Snapshots retained per (subject, kind) pair
    #[serde(default = "default_snapshot_keep_count")]
    pub snapshot_keep_count: usize,

    /// Follower-count milestones that trigger events
    #[serde(default = "default_milestones")]
    pub milestones: Vec<u64>,

    /// Page limit when listing members from the surface
    #[serde(default = "default_member_page_limit")]
    pub member_page_limit: usize,
}

fn default_snapshot_keep_count() -> usize {
    30
}
fn default_milestones() -> Vec<u64> {
    vec![100, 500, 1_000, 5_000, 10_000, 50_000, 100_000]
}
fn default_member_page_limit() -> usize {
    200
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            snapshot_keep_count: default_snapshot_keep_count(),
            milestones: default_milestones(),
            member_page_limit: default_member_page_limit(),
        }
    }
}

// ============================================================================
// Notification Configuration
// ============================================================================

/// Webhook notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Master enable flag
    #[serde(default)]
    pub enabled: bool,

    /// Webhook endpoints keyed by channel name
    #[serde(default)]
    pub webhooks: HashMap<String, String>,

    /// Delivery retry count per channel
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Request timeout in seconds
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_retry_count() -> u32 {
    2
}
fn default_notify_timeout_secs() -> u64 {
    10
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Unified Flock configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Username of the tracked account
    #[serde(default)]
    pub account: String,

    /// Engine pacing and limits
    #[serde(default)]
    pub engine: EngineConfig,

    /// Change detection settings
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Logging settings
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Data directory override (defaults to the config dir)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the default path, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(config_path())
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {:?}", path))?;

        Ok(config)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let dir = config_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {:?}", dir))?;

        let contents = serde_json::to_string_pretty(self)?;
        fs::write(config_path(), contents).context("Failed to write config")?;
        Ok(())
    }

    /// Resolve the data directory, honoring `FLOCK_DATA_DIR`.
    pub fn data_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("FLOCK_DATA_DIR") {
            return PathBuf::from(dir);
        }
        self.data_dir.clone().unwrap_or_else(config_dir)
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("flock.db")
    }
}
