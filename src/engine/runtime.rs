use anyhow::Result;
use chrono::{DateTime, Local, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::blocklist::{self, BlocklistCache};
use crate::engine::resolver::{EvalInputs, RestrictionDecision, RestrictionResolver};
use crate::engine::schedule::ScheduleEvaluator;
use crate::engine::settings::{Settings, TimeOfDay};
use crate::engine::sink::{DecisionSink, EnforcementSurface, StatusMirror};
use crate::engine::sync::SettingsWatcher;
use crate::engine::usage::{UsageAccumulator, format_hours_minutes};

/// Inputs arriving from outside the evaluation loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// The foreground app changed. Delivery is at-least-once; duplicates
    /// are harmless.
    ForegroundApp(String),
    /// The user touched the device; resets the inactivity clock.
    UserInteraction,
    /// Out-of-band unlock (local admin escape hatch).
    UnlockRequested,
    /// The settings file was modified externally; poll it ahead of the
    /// regular cadence. Same handler as the cadenced poll.
    SettingsChanged,
    Shutdown,
}

/// The evaluation loop. All engine state is owned here and mutated from a
/// single task; collaborators communicate through the event channel and
/// the synced files.
pub struct Engine {
    config: EngineConfig,
    watcher: SettingsWatcher,
    usage: UsageAccumulator,
    blocklist: BlocklistCache,
    resolver: RestrictionResolver,
    sink: DecisionSink,
    mirror: Arc<dyn StatusMirror>,
    settings: Settings,
    foreground_package: Option<String>,
    last_activity: DateTime<Utc>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        surface: Arc<dyn EnforcementSurface>,
        mirror: Arc<dyn StatusMirror>,
    ) -> Result<Self> {
        let usage = UsageAccumulator::load(&config.paths.usage_path()?);
        let sink = DecisionSink::new(surface, mirror.clone(), usage.device_id());
        let watcher = SettingsWatcher::new(config.paths.settings_path()?);
        let resolver = RestrictionResolver::new(config.own_package.clone());

        Ok(Self {
            config,
            watcher,
            usage,
            blocklist: BlocklistCache::new(),
            resolver,
            sink,
            mirror,
            settings: Settings::default(),
            foreground_package: None,
            last_activity: Utc::now(),
        })
    }

    /// Run until the event channel closes or a shutdown event arrives.
    pub async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) -> Result<()> {
        info!("Starting evaluation loop");

        self.poll_settings().await;
        self.seed_blocklist().await;

        let refresher = blocklist::spawn_refresher(
            self.blocklist.clone(),
            self.config.paths.blocklist_path()?,
            Duration::from_secs(self.config.cadence.blocklist_refresh_seconds),
        );

        let mut tick = tokio::time::interval(Duration::from_secs(self.config.cadence.tick_seconds));
        let mut settings_poll = tokio::time::interval(Duration::from_secs(
            self.config.cadence.settings_poll_seconds,
        ));
        let mut status_refresh = tokio::time::interval(Duration::from_secs(
            self.config.cadence.status_refresh_seconds,
        ));
        // Missed ticks are dropped, never made up: a suspended device does
        // not accrue usage retroactively.
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        settings_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        status_refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.tick().await;
                }
                _ = settings_poll.tick() => {
                    self.poll_settings().await;
                }
                _ = status_refresh.tick() => {
                    self.refresh_status();
                }
                event = events.recv() => {
                    match event {
                        Some(EngineEvent::ForegroundApp(package)) => {
                            debug!("Foreground app: {}", package);
                            self.foreground_package = Some(package);
                            self.evaluate_and_apply().await;
                        }
                        Some(EngineEvent::UserInteraction) => {
                            self.last_activity = Utc::now();
                            self.sink.interaction_unlock();
                        }
                        Some(EngineEvent::UnlockRequested) => {
                            self.sink.force_unlock();
                        }
                        Some(EngineEvent::SettingsChanged) => {
                            self.poll_settings().await;
                        }
                        Some(EngineEvent::Shutdown) | None => {
                            break;
                        }
                    }
                }
            }
        }

        info!("Stopping evaluation loop");
        refresher.abort();
        self.sink.shutdown();

        if let Err(e) = self.usage.flush() {
            warn!("Final usage flush failed: {:#}", e);
        }
        if self.settings.has_identity() {
            if let Err(e) = self.mirror.publish_presence(false, self.usage.device_id()) {
                warn!("Failed to publish offline status: {:#}", e);
            }
        }

        Ok(())
    }

    /// One accounting second: date rollover first, then the counters, then
    /// a fresh restriction decision.
    async fn tick(&mut self) {
        self.usage.check_date_change();

        let (_, tod) = now_pair();
        let restricted_now = ScheduleEvaluator::is_restricted_time(tod, &self.settings);
        self.usage
            .tick(self.settings.is_child_mode_active, restricted_now);

        self.evaluate_and_apply().await;
    }

    async fn evaluate_and_apply(&mut self) {
        let (now, tod) = now_pair();

        if !self.settings.is_child_mode_active {
            self.sink.apply(&RestrictionDecision::none(now));
            return;
        }

        let snapshot = self.blocklist.snapshot().await;
        let inputs = EvalInputs {
            settings: &self.settings,
            limit_used_seconds: self.usage.limit_used_seconds(),
            blocklist: &snapshot,
            foreground_package: self.foreground_package.as_deref(),
            last_activity: self.last_activity,
            now,
            now_tod: tod,
        };

        let decision = self.resolver.evaluate(&inputs);
        self.sink.apply(&decision);

        let edge = self
            .resolver
            .check_warning(&self.settings, self.usage.limit_used_seconds(), now);
        self.sink.apply_warning(edge);
    }

    async fn poll_settings(&mut self) {
        let Some(update) = self.watcher.poll() else {
            return;
        };

        info!(
            "Applying settings update (child mode {})",
            if update.settings.is_child_mode_active { "on" } else { "off" }
        );
        self.settings = update.settings;
        self.sink.set_mirror_enabled(self.settings.has_identity());

        if update.unlock_requested {
            self.sink.force_unlock();
        }

        self.evaluate_and_apply().await;
    }

    async fn seed_blocklist(&mut self) {
        let path = match self.config.paths.blocklist_path() {
            Ok(path) => path,
            Err(e) => {
                warn!("Could not resolve blocklist path: {:#}", e);
                return;
            }
        };

        match blocklist::load_blocklist(&path) {
            Ok(packages) => {
                debug!("Blocklist seeded: {} packages", packages.len());
                self.blocklist.replace(packages).await;
            }
            Err(e) => warn!("Initial blocklist load failed, starting empty: {:#}", e),
        }
    }

    fn refresh_status(&self) {
        let limit = self.settings.daily_time_limit;
        let limit_text = if limit > 0 {
            format_hours_minutes(limit)
        } else {
            "none".to_string()
        };
        info!(
            "Screen time today: {} (limit: {})",
            format_hours_minutes(self.usage.screen_time_seconds()),
            limit_text
        );

        self.sink.publish_presence(true);
    }
}

fn now_pair() -> (DateTime<Utc>, TimeOfDay) {
    let local = Local::now();
    (Utc::now(), TimeOfDay::new(local.hour(), local.minute()))
}
