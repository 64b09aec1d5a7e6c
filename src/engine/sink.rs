use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::resolver::{RestrictionDecision, RestrictionKind, WarningEdge};

/// How long a screen-timeout overlay may stay up before the device is
/// forced to the home screen anyway.
const AUTO_EXIT_GRACE: Duration = Duration::from_secs(10);

/// The enforcement operations the host exposes to the engine. The real
/// lock UI is an external collaborator; this seam is what tests mock.
pub trait EnforcementSurface: Send + Sync + 'static {
    /// Send the device to its home/launcher surface immediately.
    fn redirect_home(&self) -> Result<()>;

    /// Show or hide the full-screen lock overlay with a display reason.
    fn set_overlay(&self, visible: bool, reason: &str) -> Result<()>;

    /// Best-effort transient notice (warning banner, fallback message).
    fn notify(&self, title: &str, message: &str) -> Result<()>;
}

/// The parent-facing status record. Best-effort and never authoritative
/// for local enforcement.
pub trait StatusMirror: Send + Sync + 'static {
    fn publish_lock_state(&self, record: &LockStatusRecord) -> Result<()>;
    fn publish_presence(&self, online: bool, device_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatusRecord {
    pub is_locked: bool,
    pub lock_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    pub device_id: String,
}

/// Applies resolver output to the enforcement surface and mirrors lock
/// state remotely. Owns the only overlay-visibility state in the engine;
/// every show/hide follows from comparing the previous and new decision.
pub struct DecisionSink {
    surface: Arc<dyn EnforcementSurface>,
    mirror: Arc<dyn StatusMirror>,
    mirror_enabled: bool,
    device_id: String,
    overlay_active: Arc<AtomicBool>,
    active_kind: RestrictionKind,
    warning_banner_active: bool,
    auto_exit: Option<JoinHandle<()>>,
}

impl DecisionSink {
    pub fn new(
        surface: Arc<dyn EnforcementSurface>,
        mirror: Arc<dyn StatusMirror>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            surface,
            mirror,
            mirror_enabled: false,
            device_id: device_id.into(),
            overlay_active: Arc::new(AtomicBool::new(false)),
            active_kind: RestrictionKind::None,
            warning_banner_active: false,
            auto_exit: None,
        }
    }

    /// Remote writes are skipped entirely while the identity pair is unset.
    pub fn set_mirror_enabled(&mut self, enabled: bool) {
        if enabled != self.mirror_enabled {
            debug!("Remote status mirror {}", if enabled { "enabled" } else { "disabled" });
        }
        self.mirror_enabled = enabled;
    }

    pub fn active_kind(&self) -> RestrictionKind {
        self.active_kind
    }

    pub fn overlay_active(&self) -> bool {
        self.overlay_active.load(Ordering::SeqCst)
    }

    /// Apply a freshly computed decision. Transitions derive from the
    /// previous kind held here, never from flags elsewhere.
    pub fn apply(&mut self, decision: &RestrictionDecision) {
        match decision.kind {
            RestrictionKind::None => self.apply_clear(),
            RestrictionKind::BlockedApp => self.apply_blocked_app(decision),
            kind => self.apply_restricted(kind, decision),
        }
    }

    fn apply_clear(&mut self) {
        if self.active_kind == RestrictionKind::None {
            return;
        }

        if self.active_kind == RestrictionKind::ScreenTimeout && self.overlay_active() {
            // Screen-timeout overlays are dismissed by interaction (or the
            // auto-exit), not by the condition re-evaluating to clear.
            return;
        }

        info!("Restriction cleared ({:?})", self.active_kind);
        if self.overlay_active() && self.active_kind.is_persistent() {
            self.hide_overlay();
        }
        self.active_kind = RestrictionKind::None;
        self.cancel_auto_exit();
        self.mirror_lock(false, "", None);
    }

    /// Blocked apps bypass the overlay: detection is an immediate redirect,
    /// mirrored remotely for parent visibility only.
    fn apply_blocked_app(&mut self, decision: &RestrictionDecision) {
        if let Err(e) = self.surface.redirect_home() {
            error!("Home redirect failed for blocked app: {:#}", e);
        }

        if self.active_kind != RestrictionKind::BlockedApp {
            info!("Blocked app in foreground, redirecting home");
            let _ = self.surface.notify("Kid Guard", &decision.reason);
            self.active_kind = RestrictionKind::BlockedApp;
            self.mirror_lock(true, &decision.reason, Some(decision.active_since));
        }
    }

    fn apply_restricted(&mut self, kind: RestrictionKind, decision: &RestrictionDecision) {
        if self.active_kind == kind {
            if self.overlay_active() {
                return;
            }
            // An earlier show failed; keep re-attempting on every
            // evaluation until the overlay sticks.
            self.show_overlay(&decision.reason);
            if kind == RestrictionKind::ScreenTimeout && self.overlay_active() {
                self.arm_auto_exit();
            }
            return;
        }

        info!("Restriction active: {:?} ({})", kind, decision.reason);

        if self.overlay_active() {
            // Overlay already up from another kind: swap the reason.
            if let Err(e) = self.surface.set_overlay(true, &decision.reason) {
                warn!("Failed to update overlay reason: {:#}", e);
            }
        } else {
            self.show_overlay(&decision.reason);
        }

        self.active_kind = kind;

        if kind == RestrictionKind::ScreenTimeout && self.overlay_active() {
            self.arm_auto_exit();
        } else {
            self.cancel_auto_exit();
        }

        self.mirror_lock(true, &decision.reason, Some(decision.active_since));
    }

    /// The inactivity clock was just reset by a user interaction. For the
    /// screen-timeout kind only, interaction is an implicit unlock.
    pub fn interaction_unlock(&mut self) {
        if self.active_kind != RestrictionKind::ScreenTimeout {
            return;
        }

        info!("User interaction dismissed screen-timeout overlay");
        self.hide_overlay();
        self.active_kind = RestrictionKind::None;
        self.cancel_auto_exit();
        self.mirror_lock(false, "", None);
    }

    /// Remote unlock pulse: hide the overlay regardless of kind without
    /// touching the underlying condition. The next evaluation may
    /// legitimately re-show it.
    pub fn force_unlock(&mut self) {
        if self.active_kind == RestrictionKind::None && !self.overlay_active() {
            return;
        }

        info!("Remote unlock received, hiding overlay");
        if self.overlay_active() {
            self.hide_overlay();
        }
        self.active_kind = RestrictionKind::None;
        self.cancel_auto_exit();
        self.mirror_lock(false, "", None);
    }

    /// One-shot countdown banner driven by the resolver's warning latch.
    pub fn apply_warning(&mut self, edge: WarningEdge) {
        match edge {
            WarningEdge::Show { remaining_seconds } => {
                let message =
                    format!("{remaining_seconds} seconds of screen time left, save your progress");
                if let Err(e) = self.surface.notify("Time almost up", &message) {
                    warn!("Failed to show time warning: {:#}", e);
                }
                self.warning_banner_active = true;
            }
            WarningEdge::Clear => {
                debug!("Time-limit warning cleared");
                self.warning_banner_active = false;
            }
            WarningEdge::NoChange => {}
        }
    }

    pub fn warning_banner_active(&self) -> bool {
        self.warning_banner_active
    }

    /// Cancel timers and drop any visible overlay before the engine stops.
    pub fn shutdown(&mut self) {
        self.cancel_auto_exit();
        if self.overlay_active() {
            self.hide_overlay();
        }
    }

    pub fn publish_presence(&self, online: bool) {
        if !self.mirror_enabled {
            return;
        }
        let mirror = self.mirror.clone();
        let device_id = self.device_id.clone();
        tokio::spawn(async move {
            if let Err(e) = mirror.publish_presence(online, &device_id) {
                warn!("Presence mirror write failed: {:#}", e);
            }
        });
    }

    fn show_overlay(&mut self, reason: &str) {
        match self.surface.set_overlay(true, reason) {
            Ok(()) => self.overlay_active.store(true, Ordering::SeqCst),
            Err(e) => {
                // Never leave the device silently unenforced: fall back to
                // the home redirect plus a best-effort notice.
                error!("Overlay could not be shown, falling back to redirect: {:#}", e);
                if let Err(e) = self.surface.redirect_home() {
                    error!("Fallback home redirect also failed: {:#}", e);
                }
                let _ = self.surface.notify("Kid Guard", reason);
            }
        }
    }

    fn hide_overlay(&mut self) {
        if let Err(e) = self.surface.set_overlay(false, "") {
            warn!("Failed to hide overlay: {:#}", e);
        }
        self.overlay_active.store(false, Ordering::SeqCst);
    }

    /// Redirect home if the overlay is still up when the grace lapses.
    /// Rearm always aborts the previous timer first so it can never fire
    /// twice for one entry.
    fn arm_auto_exit(&mut self) {
        self.cancel_auto_exit();

        let surface = self.surface.clone();
        let overlay_active = self.overlay_active.clone();
        self.auto_exit = Some(tokio::spawn(async move {
            tokio::time::sleep(AUTO_EXIT_GRACE).await;
            if overlay_active.load(Ordering::SeqCst) {
                info!("Auto-exit grace elapsed, forcing home screen");
                if let Err(e) = surface.redirect_home() {
                    error!("Auto-exit home redirect failed: {:#}", e);
                }
            }
        }));
    }

    fn cancel_auto_exit(&mut self) {
        if let Some(handle) = self.auto_exit.take() {
            handle.abort();
        }
    }

    /// Fire-and-forget: the evaluation loop never waits on mirror I/O.
    fn mirror_lock(&self, is_locked: bool, reason: &str, locked_at: Option<DateTime<Utc>>) {
        if !self.mirror_enabled {
            return;
        }

        let record = LockStatusRecord {
            is_locked,
            lock_reason: reason.to_string(),
            locked_at,
            device_id: self.device_id.clone(),
        };
        let mirror = self.mirror.clone();
        tokio::spawn(async move {
            if let Err(e) = mirror.publish_lock_state(&record) {
                warn!("Lock-state mirror write failed: {:#}", e);
            }
        });
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn decision(kind: RestrictionKind, reason: &str) -> RestrictionDecision {
        RestrictionDecision {
            kind,
            reason: reason.to_string(),
            active_since: Utc::now(),
        }
    }

    fn sink_with_mocks() -> (DecisionSink, Arc<RecordingSurface>, Arc<RecordingMirror>) {
        let surface = Arc::new(RecordingSurface::default());
        let mirror = Arc::new(RecordingMirror::default());
        let sink = DecisionSink::new(surface.clone(), mirror.clone(), "device-1");
        (sink, surface, mirror)
    }

    /// Let fire-and-forget mirror tasks run to completion.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn entering_sleep_shows_overlay_and_mirrors_lock() {
        let (mut sink, surface, mirror) = sink_with_mocks();
        sink.set_mirror_enabled(true);

        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        settle().await;

        assert!(sink.overlay_active());
        assert_eq!(sink.active_kind(), RestrictionKind::Sleep);
        assert_eq!(
            surface.calls()[0],
            SurfaceCall::Overlay(true, "Bedtime".to_string())
        );

        let records = mirror.lock_records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_locked);
        assert_eq!(records[0].lock_reason, "Bedtime");
        assert!(records[0].locked_at.is_some());
        assert_eq!(records[0].device_id, "device-1");
    }

    #[tokio::test]
    async fn repeated_same_kind_is_a_no_op() {
        let (mut sink, surface, _) = sink_with_mocks();

        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));

        assert_eq!(surface.overlay_shows(), 1);
    }

    #[tokio::test]
    async fn clearing_persistent_kind_hides_overlay_and_mirrors_unlock() {
        let (mut sink, surface, mirror) = sink_with_mocks();
        sink.set_mirror_enabled(true);

        sink.apply(&decision(RestrictionKind::TimeLimit, "Limit reached"));
        sink.apply(&RestrictionDecision::none(Utc::now()));
        settle().await;

        assert!(!sink.overlay_active());
        assert_eq!(sink.active_kind(), RestrictionKind::None);
        assert!(
            surface
                .calls()
                .contains(&SurfaceCall::Overlay(false, String::new()))
        );

        let records = mirror.lock_records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[1].is_locked);
        assert!(records[1].locked_at.is_none());
    }

    #[tokio::test]
    async fn blocked_app_redirects_without_overlay_or_timer() {
        let (mut sink, surface, mirror) = sink_with_mocks();
        sink.set_mirror_enabled(true);

        sink.apply(&decision(RestrictionKind::BlockedApp, "This app is blocked"));
        settle().await;

        assert_eq!(surface.redirects(), 1);
        assert_eq!(surface.overlay_shows(), 0);
        assert!(!sink.overlay_active());
        assert!(sink.auto_exit.is_none());

        let records = mirror.lock_records.lock().unwrap();
        assert!(records[0].is_locked);
    }

    #[tokio::test]
    async fn blocked_app_redirects_on_every_detection() {
        let (mut sink, surface, _) = sink_with_mocks();

        for _ in 0..3 {
            sink.apply(&decision(RestrictionKind::BlockedApp, "blocked"));
        }

        // Foreground events are at-least-once; each detection redirects,
        // but the mirror transition only happens once.
        assert_eq!(surface.redirects(), 3);
    }

    #[tokio::test]
    async fn screen_timeout_arms_auto_exit_and_interaction_unlocks() {
        let (mut sink, surface, _) = sink_with_mocks();

        sink.apply(&decision(RestrictionKind::ScreenTimeout, "Screen idle"));
        assert!(sink.overlay_active());
        assert!(sink.auto_exit.is_some());

        sink.interaction_unlock();
        assert!(!sink.overlay_active());
        assert_eq!(sink.active_kind(), RestrictionKind::None);
        assert!(sink.auto_exit.is_none());
        assert!(
            surface
                .calls()
                .contains(&SurfaceCall::Overlay(false, String::new()))
        );
    }

    #[tokio::test]
    async fn interaction_does_not_unlock_other_kinds() {
        let (mut sink, _, _) = sink_with_mocks();

        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        sink.interaction_unlock();

        assert!(sink.overlay_active());
        assert_eq!(sink.active_kind(), RestrictionKind::Sleep);
    }

    #[tokio::test]
    async fn auto_exit_fires_while_overlay_still_up() {
        tokio::time::pause();
        let (mut sink, surface, _) = sink_with_mocks();

        sink.apply(&decision(RestrictionKind::ScreenTimeout, "Screen idle"));
        assert_eq!(surface.redirects(), 0);

        // Let the spawned auto-exit task register its timer before the
        // paused clock advances.
        settle().await;
        tokio::time::advance(AUTO_EXIT_GRACE + Duration::from_millis(10)).await;
        settle().await;

        assert_eq!(surface.redirects(), 1);
    }

    #[tokio::test]
    async fn auto_exit_cancelled_by_interaction() {
        tokio::time::pause();
        let (mut sink, surface, _) = sink_with_mocks();

        sink.apply(&decision(RestrictionKind::ScreenTimeout, "Screen idle"));
        sink.interaction_unlock();

        tokio::time::advance(AUTO_EXIT_GRACE + Duration::from_millis(10)).await;
        settle().await;

        assert_eq!(surface.redirects(), 0);
    }

    #[tokio::test]
    async fn force_unlock_hides_any_kind() {
        let (mut sink, _, _) = sink_with_mocks();

        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        sink.force_unlock();

        assert!(!sink.overlay_active());
        assert_eq!(sink.active_kind(), RestrictionKind::None);

        // The underlying condition is untouched: the next evaluation may
        // re-show, which is accepted behavior.
        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        assert!(sink.overlay_active());
    }

    #[tokio::test]
    async fn overlay_failure_falls_back_to_redirect() {
        let (mut sink, surface, _) = sink_with_mocks();
        surface.fail_overlay.store(true, Ordering::SeqCst);

        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));

        assert!(!sink.overlay_active());
        assert_eq!(surface.redirects(), 1);
        assert!(
            surface
                .calls()
                .iter()
                .any(|c| matches!(c, SurfaceCall::Notify(_, _)))
        );
    }

    #[tokio::test]
    async fn overlay_failure_is_retried_on_later_evaluations() {
        let (mut sink, surface, _) = sink_with_mocks();
        surface.fail_overlay.store(true, Ordering::SeqCst);

        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        assert!(!sink.overlay_active());
        assert_eq!(surface.redirects(), 1);

        // Still failing: the next evaluation of the same condition falls
        // back to enforcement again instead of going quiet.
        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        assert_eq!(surface.redirects(), 2);

        // Overlay comes back: the same condition finally shows it.
        surface.fail_overlay.store(false, Ordering::SeqCst);
        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        assert!(sink.overlay_active());
        assert_eq!(surface.overlay_shows(), 1);
        assert_eq!(sink.active_kind(), RestrictionKind::Sleep);

        // And once it is up, repeats are no-ops again.
        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        assert_eq!(surface.overlay_shows(), 1);
    }

    #[tokio::test]
    async fn screen_timeout_arms_auto_exit_once_overlay_recovers() {
        let (mut sink, surface, _) = sink_with_mocks();
        surface.fail_overlay.store(true, Ordering::SeqCst);

        sink.apply(&decision(RestrictionKind::ScreenTimeout, "Screen idle"));
        assert!(sink.auto_exit.is_none());

        surface.fail_overlay.store(false, Ordering::SeqCst);
        sink.apply(&decision(RestrictionKind::ScreenTimeout, "Screen idle"));
        assert!(sink.overlay_active());
        assert!(sink.auto_exit.is_some());
    }

    #[tokio::test]
    async fn mirror_skipped_without_identity() {
        let (mut sink, _, mirror) = sink_with_mocks();

        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        settle().await;

        assert!(mirror.lock_records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overlay_reason_swaps_when_kind_changes() {
        let (mut sink, surface, _) = sink_with_mocks();

        sink.apply(&decision(RestrictionKind::Sleep, "Bedtime"));
        sink.apply(&decision(RestrictionKind::Quiet, "Quiet time"));

        let calls = surface.calls();
        assert_eq!(
            calls.last().unwrap(),
            &SurfaceCall::Overlay(true, "Quiet time".to_string())
        );
        assert_eq!(sink.active_kind(), RestrictionKind::Quiet);
        assert!(sink.overlay_active());
    }

    #[tokio::test]
    async fn warning_banner_latches_through_sink() {
        let (mut sink, surface, _) = sink_with_mocks();

        sink.apply_warning(WarningEdge::Show { remaining_seconds: 42 });
        assert!(sink.warning_banner_active());
        assert!(
            surface
                .calls()
                .iter()
                .any(|c| matches!(c, SurfaceCall::Notify(t, m) if t == "Time almost up" && m.contains("42")))
        );

        sink.apply_warning(WarningEdge::Clear);
        assert!(!sink.warning_banner_active());
    }

    #[tokio::test]
    async fn presence_published_when_mirror_enabled() {
        let (mut sink, _, mirror) = sink_with_mocks();
        sink.set_mirror_enabled(true);

        sink.publish_presence(true);
        sink.publish_presence(false);
        settle().await;

        assert_eq!(*mirror.presence.lock().unwrap(), vec![true, false]);
    }
}
