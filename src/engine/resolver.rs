use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::warn;

use crate::engine::schedule::ScheduleEvaluator;
use crate::engine::settings::{Settings, TimeOfDay};

/// The single active restriction kind. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestrictionKind {
    None,
    Sleep,
    Quiet,
    TimeLimit,
    BlockedApp,
    ScreenTimeout,
}

impl RestrictionKind {
    /// Kinds that persist until their governing window/counter condition
    /// clears, and are therefore cleared by the overlay hide path.
    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Sleep | Self::Quiet | Self::TimeLimit)
    }
}

/// Derived per tick, never persisted.
#[derive(Debug, Clone)]
pub struct RestrictionDecision {
    pub kind: RestrictionKind,
    /// Human-facing display text; opaque to the engine.
    pub reason: String,
    pub active_since: DateTime<Utc>,
}

impl RestrictionDecision {
    pub fn none(now: DateTime<Utc>) -> Self {
        Self {
            kind: RestrictionKind::None,
            reason: String::new(),
            active_since: now,
        }
    }

    fn restricted(kind: RestrictionKind, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            active_since: now,
        }
    }
}

/// Everything one evaluation reads. Assembled by the engine loop so the
/// resolver itself stays clock- and I/O-free.
pub struct EvalInputs<'a> {
    pub settings: &'a Settings,
    pub limit_used_seconds: i64,
    pub blocklist: &'a HashSet<String>,
    pub foreground_package: Option<&'a str>,
    pub last_activity: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub now_tod: TimeOfDay,
}

/// Effect of the one-minute pre-warning latch for this evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningEdge {
    /// Latch just fired; show the countdown banner once.
    Show { remaining_seconds: i64 },
    /// Remaining time climbed back above a minute; hide the banner.
    Clear,
    NoChange,
}

/// The core state machine. Output is a pure function of the current inputs
/// (first match in a fixed priority order wins); the only memory carried
/// across evaluations is the one-minute-warning latch.
pub struct RestrictionResolver {
    own_package: String,
    one_minute_warning_shown: bool,
}

impl RestrictionResolver {
    pub fn new(own_package: impl Into<String>) -> Self {
        Self {
            own_package: own_package.into(),
            one_minute_warning_shown: false,
        }
    }

    /// Evaluate the priority chain. Each sub-check fails open: an error is
    /// logged and treated as "condition false" for that check only, so a
    /// bad input can never take the whole evaluation loop down.
    pub fn evaluate(&self, inputs: &EvalInputs<'_>) -> RestrictionDecision {
        let now = inputs.now;

        if ScheduleEvaluator::in_sleep_window(inputs.now_tod, inputs.settings) {
            return RestrictionDecision::restricted(
                RestrictionKind::Sleep,
                "Bedtime - time to sleep",
                now,
            );
        }

        if let Some(period) = ScheduleEvaluator::active_quiet_period(inputs.now_tod, inputs.settings)
        {
            let reason = if period.name.is_empty() {
                "Quiet time - take a break".to_string()
            } else {
                format!("Quiet time: {}", period.name)
            };
            return RestrictionDecision::restricted(RestrictionKind::Quiet, reason, now);
        }

        if fail_open("time_limit", self.time_limit_exceeded(inputs)) {
            return RestrictionDecision::restricted(
                RestrictionKind::TimeLimit,
                "Daily screen time limit reached",
                now,
            );
        }

        if fail_open("screen_timeout", self.screen_timed_out(inputs)) {
            return RestrictionDecision::restricted(
                RestrictionKind::ScreenTimeout,
                "Screen idle - tap to continue",
                now,
            );
        }

        if self.foreground_app_blocked(inputs) {
            return RestrictionDecision::restricted(
                RestrictionKind::BlockedApp,
                "This app is blocked",
                now,
            );
        }

        RestrictionDecision::none(now)
    }

    fn time_limit_exceeded(&self, inputs: &EvalInputs<'_>) -> Result<bool> {
        let settings = inputs.settings;
        if settings.daily_time_limit <= 0 {
            return Ok(false);
        }
        if inputs.limit_used_seconds < settings.daily_time_limit {
            return Ok(false);
        }
        // Parent-granted grace period suppresses enforcement until it lapses.
        Ok(inputs.now.timestamp_millis() >= settings.time_limit_disabled_until)
    }

    fn screen_timed_out(&self, inputs: &EvalInputs<'_>) -> Result<bool> {
        let timeout_minutes = inputs.settings.screen_timeout_minutes;
        if timeout_minutes <= 0 {
            return Ok(false);
        }

        let idle = inputs
            .now
            .signed_duration_since(inputs.last_activity)
            .num_seconds();
        let threshold = timeout_minutes
            .checked_mul(60)
            .ok_or_else(|| anyhow::anyhow!("screen timeout threshold overflow"))?;

        Ok(idle >= threshold)
    }

    fn foreground_app_blocked(&self, inputs: &EvalInputs<'_>) -> bool {
        let Some(package) = inputs.foreground_package else {
            return false;
        };
        if package == self.own_package {
            return false;
        }
        // Launchers and the system UI are never treated as blockable; the
        // home redirect itself lands on them.
        if package.contains("launcher") || package.contains("systemui") {
            return false;
        }
        inputs.blocklist.contains(package)
    }

    /// Advance the one-minute-warning latch. Fires once when remaining time
    /// first enters [1, 60] with the limit enforceable, clears once when
    /// remaining time next exceeds 60 (new day, or limit extended).
    pub fn check_warning(&mut self, settings: &Settings, limit_used: i64, now: DateTime<Utc>) -> WarningEdge {
        let limit = settings.daily_time_limit;
        let in_window = if limit > 0 {
            let remaining = limit - limit_used;
            let disabled = now.timestamp_millis() < settings.time_limit_disabled_until;
            !disabled && (1..=60).contains(&remaining)
        } else {
            false
        };

        if in_window && !self.one_minute_warning_shown {
            self.one_minute_warning_shown = true;
            return WarningEdge::Show {
                remaining_seconds: limit - limit_used,
            };
        }

        // The latch only releases once remaining time is back above a
        // minute; sitting at/below zero keeps it held so the banner never
        // re-fires while the limit overlay is up.
        let above_minute = limit <= 0 || limit - limit_used > 60;
        if above_minute && self.one_minute_warning_shown {
            self.one_minute_warning_shown = false;
            return WarningEdge::Clear;
        }

        WarningEdge::NoChange
    }

    #[cfg(test)]
    pub fn warning_latched(&self) -> bool {
        self.one_minute_warning_shown
    }
}

fn fail_open(check: &str, result: Result<bool>) -> bool {
    match result {
        Ok(v) => v,
        Err(e) => {
            warn!("Restriction check '{}' failed, treating as inactive: {:#}", check, e);
            false
        }
    }
}
