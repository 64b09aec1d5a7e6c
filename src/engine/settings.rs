use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Wall-clock time of day, device-local. Compared as minute-of-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }

    /// Minute-of-day in [0, 1439]. Out-of-range components wrap instead
    /// of overflowing, so a hostile clock value can never poison a
    /// comparison.
    pub fn minute_of_day(&self) -> u32 {
        (self.hour % 24) * 60 + self.minute % 60
    }
}

/// A named daily window during which usage is restricted, independent of
/// the sleep schedule.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuietPeriod {
    pub name: String,
    pub start_hour: u32,
    pub start_minute: u32,
    pub end_hour: u32,
    pub end_minute: u32,
    pub enabled: bool,
}

impl Default for QuietPeriod {
    fn default() -> Self {
        Self {
            name: String::new(),
            start_hour: 0,
            start_minute: 0,
            end_hour: 0,
            end_minute: 0,
            enabled: false,
        }
    }
}

impl QuietPeriod {
    pub fn start(&self) -> TimeOfDay {
        TimeOfDay::new(self.start_hour, self.start_minute)
    }

    pub fn end(&self) -> TimeOfDay {
        TimeOfDay::new(self.end_hour, self.end_minute)
    }
}

/// The parent-synced settings snapshot. Replaced wholesale by the sync
/// collaborator; the engine never mutates it apart from clearing the
/// unlock-request flag after honoring it.
///
/// Field names follow the synced settings document so the file can be
/// produced by the remote side as-is.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub parent_id: String,
    pub child_id: String,
    pub is_child_mode_active: bool,
    /// Daily limit in seconds, 0 = unlimited.
    pub daily_time_limit: i64,
    /// Epoch millis before which limit enforcement is suppressed, 0 = none.
    pub time_limit_disabled_until: i64,
    pub sleep_schedule_enabled: bool,
    pub bedtime_hour: u32,
    pub bedtime_minute: u32,
    pub wake_hour: u32,
    pub wake_minute: u32,
    /// Inactivity threshold in minutes, 0 = disabled.
    pub screen_timeout_minutes: i64,
    pub quiet_times: Vec<QuietPeriod>,
    /// Mirrored lock flag from the remote side. Not authoritative for
    /// local enforcement; only consulted for unlock-request handling.
    pub is_locked: bool,
    pub unlock_requested: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parent_id: String::new(),
            child_id: String::new(),
            is_child_mode_active: false,
            daily_time_limit: 0,
            time_limit_disabled_until: 0,
            sleep_schedule_enabled: false,
            bedtime_hour: 20,
            bedtime_minute: 0,
            wake_hour: 7,
            wake_minute: 0,
            screen_timeout_minutes: 0,
            quiet_times: Vec::new(),
            is_locked: false,
            unlock_requested: false,
        }
    }
}

impl Settings {
    pub fn bedtime(&self) -> TimeOfDay {
        TimeOfDay::new(self.bedtime_hour, self.bedtime_minute)
    }

    pub fn wake(&self) -> TimeOfDay {
        TimeOfDay::new(self.wake_hour, self.wake_minute)
    }

    /// The remote mirror is routed by the identity pair; empty ids disable it.
    pub fn has_identity(&self) -> bool {
        !self.parent_id.is_empty() && !self.child_id.is_empty()
    }

    /// Build settings from a parsed JSON document, recovering per field:
    /// an unparseable or missing field falls back to its default without
    /// rejecting the rest of the document.
    pub fn from_json_value(value: &Value) -> Self {
        let d = Settings::default();
        Self {
            parent_id: field(value, "parentId", d.parent_id),
            child_id: field(value, "childId", d.child_id),
            is_child_mode_active: field(value, "isChildModeActive", d.is_child_mode_active),
            daily_time_limit: field(value, "dailyTimeLimit", d.daily_time_limit),
            time_limit_disabled_until: field(
                value,
                "timeLimitDisabledUntil",
                d.time_limit_disabled_until,
            ),
            sleep_schedule_enabled: field(value, "sleepScheduleEnabled", d.sleep_schedule_enabled),
            bedtime_hour: hour_field(value, "bedtimeHour", d.bedtime_hour),
            bedtime_minute: minute_field(value, "bedtimeMinute", d.bedtime_minute),
            wake_hour: hour_field(value, "wakeHour", d.wake_hour),
            wake_minute: minute_field(value, "wakeMinute", d.wake_minute),
            screen_timeout_minutes: field(value, "screenTimeoutMinutes", d.screen_timeout_minutes),
            quiet_times: quiet_times_field(value),
            is_locked: field(value, "isLocked", d.is_locked),
            unlock_requested: field(value, "unlockRequested", d.unlock_requested),
        }
    }
}

fn field<T: DeserializeOwned>(value: &Value, key: &str, default: T) -> T {
    value
        .get(key)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(default)
}

/// Clock components are validated like any other field: a value outside
/// the valid range counts as unparseable and falls back to the default.
fn hour_field(value: &Value, key: &str, default: u32) -> u32 {
    let v = field(value, key, default);
    if v < 24 { v } else { default }
}

fn minute_field(value: &Value, key: &str, default: u32) -> u32 {
    let v = field(value, key, default);
    if v < 60 { v } else { default }
}

/// Quiet periods recover element-wise: a malformed entry, or one with an
/// out-of-range clock component, is skipped and the rest of the list
/// survives.
fn quiet_times_field(value: &Value) -> Vec<QuietPeriod> {
    match value.get("quietTimes") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| serde_json::from_value::<QuietPeriod>(item.clone()).ok())
            .filter(has_valid_clock)
            .collect(),
        _ => Vec::new(),
    }
}

fn has_valid_clock(period: &QuietPeriod) -> bool {
    period.start_hour < 24
        && period.start_minute < 60
        && period.end_hour < 24
        && period.end_minute < 60
}

/// Load settings from the synced JSON file. A missing file yields defaults;
/// a file that is not JSON at all is an error the caller may swallow in
/// favor of last-known-good values.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;

    Ok(Settings::from_json_value(&value))
}
