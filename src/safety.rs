use crate::config::SafetyConfig;
use crate::dispatcher::SharedDispatcher;
use crate::journal::{Journal, JournalEvent};
use crate::link::CommandLink;
use crate::mission::CancelHandle;
use crate::protocol::{CommandKind, CommandOrigin, CommandOutcome, CommandRequest};
use crate::telemetry::{TelemetryCache, TelemetrySnapshot};
use heapless::Vec;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

const MAX_SAFETY_EVENTS: usize = 32;
pub const MAX_LANDING_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LandingStep {
    StandardLand,
    ManualDescent,
    MotorCutoff,
    /// Landing was refused but telemetry already shows the vehicle down.
    AlreadyGrounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LandingAttempt {
    pub step: LandingStep,
    pub outcome: CommandOutcome,
    pub height_cm: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LandingReport {
    pub resolved_by: LandingStep,
    /// Whether the resolving step was acknowledged or observed.
    pub confirmed: bool,
    pub final_height_cm: Option<f32>,
    pub attempts: Vec<LandingAttempt, MAX_LANDING_ATTEMPTS>,
}

/// Landing cascade: standard land, then manual descent, then motor cutoff.
///
/// Cloned handles share one cascade. The first `safe_land` call runs it;
/// concurrent and later calls wait for and return the same report.
///
/// The cascade needs the dispatcher, so a request already in flight would
/// hold it up for that request's whole retry budget. A controller built
/// with [`SafetyController::with_cancel`] fires the mission's cancel signal
/// first, which abandons the in-flight request and frees the dispatcher.
#[derive(Debug)]
pub struct SafetyController<L> {
    dispatcher: SharedDispatcher<L>,
    telemetry: TelemetryCache,
    config: SafetyConfig,
    journal: Journal,
    landing: Arc<OnceCell<LandingReport>>,
    cancel: Option<CancelHandle>,
}

impl<L> Clone for SafetyController<L> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: Arc::clone(&self.dispatcher),
            telemetry: self.telemetry.clone(),
            config: self.config.clone(),
            journal: self.journal.clone(),
            landing: Arc::clone(&self.landing),
            cancel: self.cancel.clone(),
        }
    }
}

impl<L: CommandLink> SafetyController<L> {
    pub fn new(
        dispatcher: SharedDispatcher<L>,
        telemetry: TelemetryCache,
        config: SafetyConfig,
        journal: Journal,
    ) -> Self {
        Self { dispatcher, telemetry, config, journal, landing: Arc::new(OnceCell::new()), cancel: None }
    }

    /// Cancel the mission owning `cancel` whenever a landing is requested.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn has_landed(&self) -> Option<&LandingReport> {
        self.landing.get()
    }

    pub async fn safe_land(&self) -> LandingReport {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        self.landing.get_or_init(|| self.run_cascade()).await.clone()
    }

    async fn run_cascade(&self) -> LandingReport {
        let mut dispatcher = self.dispatcher.lock().await;
        dispatcher.lock_out();
        let mut attempts: Vec<LandingAttempt, MAX_LANDING_ATTEMPTS> = Vec::new();
        info!("landing cascade started");

        let outcome = dispatcher.dispatch(self.request(CommandKind::Land)).await;
        self.record(&mut attempts, LandingStep::StandardLand, outcome);
        if outcome.is_success() {
            return self.report(LandingStep::StandardLand, true, attempts);
        }
        if self.grounded() {
            info!("land refused but vehicle is already down");
            return self.report(LandingStep::AlreadyGrounded, true, attempts);
        }

        warn!("standard landing unresolved ({:?}), descending manually", outcome);
        dispatcher.resync().await;
        let descend = CommandKind::Rc { lateral: 0, forward: 0, vertical: -self.config.manual_descent_speed, yaw: 0 };
        let outcome = dispatcher.dispatch(self.request(descend)).await;
        let touched_down = outcome.is_success() && self.await_touchdown().await;
        let stop = dispatcher.dispatch(self.request(CommandKind::rc_stop())).await;
        if !stop.is_success() {
            warn!("rc stop after manual descent: {:?}", stop);
        }
        let descent_outcome = if touched_down { outcome } else { CommandOutcome::TimedOutUnconfirmed };
        self.record(&mut attempts, LandingStep::ManualDescent, descent_outcome);
        if touched_down {
            return self.report(LandingStep::ManualDescent, true, attempts);
        }

        error!("vehicle still airborne or unresponsive, cutting motors");
        let outcome = dispatcher.dispatch(self.request(CommandKind::EmergencyStop)).await;
        self.record(&mut attempts, LandingStep::MotorCutoff, outcome);
        self.report(LandingStep::MotorCutoff, outcome.is_success(), attempts)
    }

    fn request(&self, kind: CommandKind) -> CommandRequest {
        CommandRequest::new(kind, CommandOrigin::Safety)
    }

    fn fresh_snapshot(&self) -> Option<TelemetrySnapshot> {
        self.telemetry.fresh(Instant::now(), self.config.telemetry_stale())
    }

    fn grounded(&self) -> bool {
        self.fresh_snapshot().is_some_and(|s| s.height_cm <= self.config.landed_height_cm)
    }

    /// Poll telemetry until the vehicle is down or the descent window closes.
    async fn await_touchdown(&self) -> bool {
        let deadline = Instant::now() + self.config.manual_descent();
        loop {
            if self.grounded() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            time::sleep(self.config.descent_poll()).await;
        }
    }

    fn record(&self, attempts: &mut Vec<LandingAttempt, MAX_LANDING_ATTEMPTS>, step: LandingStep, outcome: CommandOutcome) {
        let height_cm = self.telemetry.latest().map(|s| s.height_cm);
        self.journal.record(JournalEvent::Landing { step, outcome, height_cm });
        let _ = attempts.push(LandingAttempt { step, outcome, height_cm });
    }

    fn report(&self, resolved_by: LandingStep, confirmed: bool, attempts: Vec<LandingAttempt, MAX_LANDING_ATTEMPTS>) -> LandingReport {
        let final_height_cm = self.telemetry.latest().map(|s| s.height_cm);
        info!("landing resolved by {:?} (confirmed: {})", resolved_by, confirmed);
        LandingReport { resolved_by, confirmed, final_height_cm, attempts }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SafetyLevel {
    Normal,
    Caution,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SafetyEvent {
    BatteryLow,
    TelemetryStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub raised_at: Instant,
    pub level: SafetyLevel,
    pub resolved: bool,
}

/// Events raised or escalated by one evaluation.
#[derive(Debug, Clone, Default)]
pub struct SafetyAssessment {
    pub level: Option<SafetyLevel>,
    pub raised: Vec<(SafetyEvent, SafetyLevel, u8), 4>,
}

impl SafetyAssessment {
    pub fn level(&self) -> SafetyLevel {
        self.level.unwrap_or(SafetyLevel::Normal)
    }

    /// Critical vehicle state is handled like an operator cancel.
    pub fn requires_abort(&self) -> bool {
        self.level() >= SafetyLevel::Critical
    }
}

/// Watches battery and telemetry freshness each tick.
#[derive(Debug)]
pub struct SafetyMonitor {
    config: SafetyConfig,
    started: Instant,
    history: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
}

impl SafetyMonitor {
    pub fn new(config: SafetyConfig, started: Instant) -> Self {
        Self { config, started, history: Vec::new() }
    }

    pub fn evaluate(&mut self, snapshot: Option<&TelemetrySnapshot>, now: Instant) -> SafetyAssessment {
        let mut assessment = SafetyAssessment::default();

        let fresh = snapshot.filter(|s| s.age(now) <= self.config.telemetry_stale());
        match fresh {
            Some(s) => {
                self.resolve(SafetyEvent::TelemetryStale);
                if s.battery_pct <= self.config.battery_critical_pct {
                    self.raise(SafetyEvent::BatteryLow, SafetyLevel::Critical, s.battery_pct, now, &mut assessment);
                } else if s.battery_pct <= self.config.battery_warning_pct {
                    self.raise(SafetyEvent::BatteryLow, SafetyLevel::Warning, s.battery_pct, now, &mut assessment);
                }
            }
            None if now.saturating_duration_since(self.started) > self.config.telemetry_stale() => {
                self.raise(SafetyEvent::TelemetryStale, SafetyLevel::Caution, 0, now, &mut assessment);
            }
            None => {}
        }

        assessment.level = self
            .history
            .iter()
            .filter(|r| !r.resolved)
            .map(|r| r.level)
            .max();
        assessment
    }

    fn raise(&mut self, event: SafetyEvent, level: SafetyLevel, value: u8, now: Instant, assessment: &mut SafetyAssessment) {
        if let Some(existing) = self.history.iter_mut().find(|r| r.event == event && !r.resolved) {
            if level > existing.level {
                existing.level = level;
                existing.raised_at = now;
                let _ = assessment.raised.push((event, level, value));
            }
            return;
        }
        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(SafetyEventRecord { event, raised_at: now, level, resolved: false });
        let _ = assessment.raised.push((event, level, value));
    }

    fn resolve(&mut self, event: SafetyEvent) {
        for record in self.history.iter_mut().filter(|r| r.event == event) {
            record.resolved = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Attitude, Velocity};
    use tokio::time::Duration;

    fn snapshot(battery_pct: u8, at: Instant) -> TelemetrySnapshot {
        TelemetrySnapshot {
            height_cm: 90.0,
            battery_pct,
            attitude: Attitude { pitch_deg: 0.0, roll_deg: 0.0, yaw_deg: 0.0 },
            velocity: Velocity { horizontal_cm_s: 0.0, vertical_cm_s: 0.0 },
            captured_at: at,
        }
    }

    #[test]
    fn test_battery_levels_escalate_once() {
        let now = Instant::now();
        let mut monitor = SafetyMonitor::new(SafetyConfig::default(), now);

        let first = monitor.evaluate(Some(&snapshot(28, now)), now);
        assert_eq!(first.level(), SafetyLevel::Warning);
        assert_eq!(first.raised.len(), 1);
        assert!(!first.requires_abort());

        let repeat = monitor.evaluate(Some(&snapshot(27, now)), now);
        assert!(repeat.raised.is_empty());

        let critical = monitor.evaluate(Some(&snapshot(15, now)), now);
        assert_eq!(critical.raised.len(), 1);
        assert!(critical.requires_abort());
    }

    #[test]
    fn test_stale_telemetry_is_a_caution_that_clears() {
        let start = Instant::now();
        let mut monitor = SafetyMonitor::new(SafetyConfig::default(), start);
        assert!(monitor.evaluate(None, start).raised.is_empty());

        let later = start + Duration::from_secs(5);
        let stale = monitor.evaluate(Some(&snapshot(90, start)), later);
        assert_eq!(stale.level(), SafetyLevel::Caution);
        assert!(!stale.requires_abort());

        let recovered = monitor.evaluate(Some(&snapshot(90, later)), later);
        assert_eq!(recovered.level(), SafetyLevel::Normal);
    }
}
