use anyhow::{Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Current usage-state file version
const USAGE_VERSION: &str = "1.0";

/// Persisted usage counters. Both counters are monotone within a calendar
/// day and reset to zero exactly once when the local date advances past
/// `last_reset_date`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UsageState {
    pub version: String,
    /// Stable identifier for this device, stamped into mirror records.
    pub device_id: String,
    /// Total seconds of counted screen time today (display counter).
    pub screen_time_seconds: i64,
    /// Seconds counted against the daily limit today (enforcement counter).
    pub limit_used_seconds: i64,
    /// Local date the counters were last reset, YYYY-MM-DD.
    pub last_reset_date: String,
}

impl UsageState {
    pub fn new() -> Self {
        Self {
            version: USAGE_VERSION.to_string(),
            device_id: Uuid::new_v4().to_string(),
            screen_time_seconds: 0,
            limit_used_seconds: 0,
            last_reset_date: today_string(),
        }
    }
}

impl Default for UsageState {
    fn default() -> Self {
        Self::new()
    }
}

fn today_string() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Owns the usage counters. Advanced once per second by the engine loop;
/// nothing else mutates the persisted state.
pub struct UsageAccumulator {
    state: UsageState,
    path: PathBuf,
}

impl UsageAccumulator {
    /// Load persisted counters, falling back to a fresh state when the file
    /// is missing or unreadable. A version mismatch also starts fresh.
    pub fn load(path: &Path) -> Self {
        let state = match read_usage_state(path) {
            Ok(Some(state)) => state,
            Ok(None) => UsageState::new(),
            Err(e) => {
                warn!("Could not load usage state, starting fresh: {:#}", e);
                UsageState::new()
            }
        };

        Self {
            state,
            path: path.to_path_buf(),
        }
    }

    /// Advance the counters by one second iff child mode is active and no
    /// sleep/quiet window is in effect. Restricted seconds never count
    /// against the limit. Every 10th counted second the counters are
    /// flushed; flush failures are swallowed and retried on the next flush.
    pub fn tick(&mut self, child_mode_active: bool, restricted_now: bool) {
        if !child_mode_active || restricted_now {
            return;
        }

        self.state.screen_time_seconds += 1;
        self.state.limit_used_seconds += 1;

        if self.state.screen_time_seconds % 10 == 0 {
            self.flush_logged();
        }
    }

    /// Reset the counters when the local calendar date has advanced past
    /// the persisted reset marker. Returns true if a reset happened.
    pub fn check_date_change(&mut self) -> bool {
        let today = today_string();
        if self.state.last_reset_date == today {
            return false;
        }

        info!(
            "Date changed {} -> {}, resetting usage counters",
            self.state.last_reset_date, today
        );
        self.state.screen_time_seconds = 0;
        self.state.limit_used_seconds = 0;
        self.state.last_reset_date = today;
        self.flush_logged();
        true
    }

    pub fn flush(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.state)
            .context("Failed to serialize usage state")?;

        crate::platform::common::atomic_write(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write usage state: {}", self.path.display()))
    }

    fn flush_logged(&self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush usage counters: {:#}", e);
        }
    }

    pub fn snapshot(&self) -> UsageState {
        self.state.clone()
    }

    pub fn device_id(&self) -> &str {
        &self.state.device_id
    }

    pub fn limit_used_seconds(&self) -> i64 {
        self.state.limit_used_seconds
    }

    pub fn screen_time_seconds(&self) -> i64 {
        self.state.screen_time_seconds
    }

    #[cfg(test)]
    pub fn set_last_reset_date(&mut self, date: &str) {
        self.state.last_reset_date = date.to_string();
    }
}

fn read_usage_state(path: &Path) -> Result<Option<UsageState>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read usage state: {}", path.display()))?;

    let state: UsageState = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse usage state: {}", path.display()))?;

    if state.version != USAGE_VERSION {
        warn!(
            "Usage state version mismatch (expected {}, got {}), starting fresh",
            USAGE_VERSION, state.version
        );
        return Ok(None);
    }

    Ok(Some(state))
}

/// Format a second count as `H:MM` for the status line.
pub fn format_hours_minutes(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{}:{:02}", seconds / 3600, (seconds % 3600) / 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn accumulator(dir: &tempfile::TempDir) -> UsageAccumulator {
        UsageAccumulator::load(&dir.path().join("usage.json"))
    }

    #[test]
    fn tick_counts_only_while_active_and_unrestricted() {
        let dir = tempdir().unwrap();
        let mut acc = accumulator(&dir);

        for _ in 0..5 {
            acc.tick(false, false);
        }
        assert_eq!(acc.limit_used_seconds(), 0);
        assert_eq!(acc.screen_time_seconds(), 0);

        for _ in 0..5 {
            acc.tick(true, true);
        }
        assert_eq!(acc.limit_used_seconds(), 0);

        for _ in 0..7 {
            acc.tick(true, false);
        }
        assert_eq!(acc.limit_used_seconds(), 7);
        assert_eq!(acc.screen_time_seconds(), 7);
    }

    #[test]
    fn counters_advance_by_exactly_n_ticks() {
        let dir = tempdir().unwrap();
        let mut acc = accumulator(&dir);

        for _ in 0..123 {
            acc.tick(true, false);
        }
        assert_eq!(acc.limit_used_seconds(), 123);
        assert_eq!(acc.screen_time_seconds(), 123);
    }

    #[test]
    fn every_tenth_tick_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let mut acc = UsageAccumulator::load(&path);

        for _ in 0..9 {
            acc.tick(true, false);
        }
        assert!(!path.exists());

        acc.tick(true, false);
        assert!(path.exists());

        let reloaded = UsageAccumulator::load(&path);
        assert_eq!(reloaded.screen_time_seconds(), 10);
    }

    #[test]
    fn date_rollover_resets_exactly_once() {
        let dir = tempdir().unwrap();
        let mut acc = accumulator(&dir);

        for _ in 0..30 {
            acc.tick(true, false);
        }
        acc.set_last_reset_date("2020-01-01");

        assert!(acc.check_date_change());
        assert_eq!(acc.limit_used_seconds(), 0);
        assert_eq!(acc.screen_time_seconds(), 0);

        // Same day again: no second reset.
        acc.tick(true, false);
        assert!(!acc.check_date_change());
        assert_eq!(acc.limit_used_seconds(), 1);
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");

        let mut acc = UsageAccumulator::load(&path);
        for _ in 0..20 {
            acc.tick(true, false);
        }
        acc.flush().unwrap();
        let device_id = acc.device_id().to_string();

        let reloaded = UsageAccumulator::load(&path);
        assert_eq!(reloaded.limit_used_seconds(), 20);
        assert_eq!(reloaded.device_id(), device_id);
    }

    #[test]
    fn corrupt_state_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("usage.json");
        std::fs::write(&path, "{broken").unwrap();

        let acc = UsageAccumulator::load(&path);
        assert_eq!(acc.limit_used_seconds(), 0);
    }

    #[test]
    fn format_hours_minutes_output() {
        assert_eq!(format_hours_minutes(0), "0:00");
        assert_eq!(format_hours_minutes(59), "0:00");
        assert_eq!(format_hours_minutes(60), "0:01");
        assert_eq!(format_hours_minutes(3600), "1:00");
        assert_eq!(format_hours_minutes(3661), "1:01");
        assert_eq!(format_hours_minutes(-5), "0:00");
    }
}
