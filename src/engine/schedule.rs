use crate::engine::settings::{QuietPeriod, Settings, TimeOfDay};

/// Pure evaluation of the sleep window and quiet-time windows against a
/// wall-clock time of day. No side effects, no clock access; callers pass
/// `now` so behavior is fully deterministic under test.
pub struct ScheduleEvaluator;

impl ScheduleEvaluator {
    /// True while the sleep window is active. The start boundary (bedtime)
    /// is included, the end boundary (wake) is excluded. A bedtime later
    /// than the wake time wraps across midnight.
    pub fn in_sleep_window(now: TimeOfDay, settings: &Settings) -> bool {
        if !settings.sleep_schedule_enabled {
            return false;
        }
        Self::window_contains(now, settings.bedtime(), settings.wake())
    }

    /// True if any enabled quiet period contains `now`, under the same
    /// boundary and wraparound rules as the sleep window.
    pub fn in_quiet_window(now: TimeOfDay, settings: &Settings) -> bool {
        Self::active_quiet_period(now, settings).is_some()
    }

    /// The first enabled quiet period containing `now`, if any. Periods are
    /// checked in the order the parent defined them.
    pub fn active_quiet_period(now: TimeOfDay, settings: &Settings) -> Option<&QuietPeriod> {
        settings
            .quiet_times
            .iter()
            .filter(|p| p.enabled)
            .find(|p| Self::window_contains(now, p.start(), p.end()))
    }

    pub fn is_restricted_time(now: TimeOfDay, settings: &Settings) -> bool {
        Self::in_sleep_window(now, settings) || Self::in_quiet_window(now, settings)
    }

    fn window_contains(now: TimeOfDay, start: TimeOfDay, end: TimeOfDay) -> bool {
        let cur = now.minute_of_day();
        let start = start.minute_of_day();
        let end = end.minute_of_day();

        if start > end {
            // Window wraps midnight, e.g. 20:00 -> 07:00.
            cur >= start || cur < end
        } else {
            cur >= start && cur < end
        }
    }
}
