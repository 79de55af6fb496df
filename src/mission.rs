//! Mission loop.
//!
//! One task owns the flight mode and the waypoint index. Each tick reads the
//! freshest detection and telemetry, checks the vehicle's state, then hands
//! the tick to whichever controller owns the current mode. Cancellation is
//! observed at the top of every tick and also pre-empts a tick that is
//! blocked inside the dispatcher; every way out of the loop ends in the
//! landing cascade.

use crate::config::{EngagementPolicy, MissionConfig};
use crate::detection::{Detection, DetectionFeed, FeedReading};
use crate::dispatcher::{DispatchStats, SharedDispatcher};
use crate::engagement::{EngagementController, Release};
use crate::journal::{Journal, JournalCounts, JournalEvent};
use crate::link::CommandLink;
use crate::plan::Plan;
use crate::protocol::{CommandKind, CommandOrigin, CommandOutcome, CommandRequest, MAX_MOVE_CM, MIN_MOVE_CM};
use crate::route::{ChunkedDecomposer, HeadingHold, LegDecomposer, RoutePlayer, RouteStep};
use crate::safety::{LandingReport, SafetyController, SafetyEvent, SafetyMonitor};
use crate::telemetry::TelemetryCache;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// Takeoff leaves the vehicle roughly this far above the ground.
const TAKEOFF_HEIGHT_ALLOWANCE_CM: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlightMode {
    Navigating,
    Engaging,
    Returning,
    Landing,
    Aborted,
}

impl FlightMode {
    pub fn is_terminal(self) -> bool {
        matches!(self, FlightMode::Landing | FlightMode::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    TakeoffFailed,
    LegFailed { waypoint: usize },
    EngagementFailed,
    BatteryCritical { battery_pct: u8 },
}

/// Written only by the mission loop.
#[derive(Debug, Clone)]
pub struct MissionState {
    mode: FlightMode,
    waypoint_index: usize,
    engagements: u32,
    rejected_corrections: u32,
    /// When the last engagement corrections finished; older frames are
    /// not judged against them.
    corrections_settled: Option<Instant>,
    started: Instant,
}

impl MissionState {
    fn new(started: Instant) -> Self {
        Self {
            mode: FlightMode::Navigating,
            waypoint_index: 0,
            engagements: 0,
            rejected_corrections: 0,
            corrections_settled: None,
            started,
        }
    }

    pub fn mode(&self) -> FlightMode {
        self.mode
    }

    pub fn waypoint_index(&self) -> usize {
        self.waypoint_index
    }

    pub fn engagements(&self) -> u32 {
        self.engagements
    }

    pub fn elapsed(&self) -> time::Duration {
        Instant::now().saturating_duration_since(self.started)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionReport {
    pub final_mode: FlightMode,
    pub waypoint_index: usize,
    pub plan_len: usize,
    pub abort_reason: Option<AbortReason>,
    pub landing: LandingReport,
    pub stats: DispatchStats,
    pub journal: JournalCounts,
    pub engagements: u32,
    /// Engagement corrections the vehicle refused.
    pub rejected_corrections: u32,
    pub elapsed_ms: u64,
}

impl MissionReport {
    pub fn completed(&self) -> bool {
        self.abort_reason.is_none() && self.waypoint_index == self.plan_len
    }
}

/// Trigger side of the operator cancel.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancel has been requested. Never resolves if every
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_signal() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Continue,
    Complete,
    Abort(AbortReason),
}

pub struct Mission<L, D = ChunkedDecomposer> {
    config: MissionConfig,
    state: MissionState,
    route: RoutePlayer<D>,
    engagement: Option<EngagementController>,
    detections: Option<DetectionFeed>,
    dispatcher: SharedDispatcher<L>,
    safety: SafetyController<L>,
    monitor: SafetyMonitor,
    telemetry: TelemetryCache,
    cancel: CancelSignal,
    cancel_handle: CancelHandle,
    journal: Journal,
}

impl<L: CommandLink> Mission<L, ChunkedDecomposer> {
    /// Plan metadata (cruise height, speed) overrides the config's flight section.
    pub fn new(
        mut config: MissionConfig,
        plan: Plan,
        dispatcher: SharedDispatcher<L>,
        telemetry: TelemetryCache,
        journal: Journal,
    ) -> Self {
        let meta = plan.meta();
        if let Some(height) = meta.cruise_height_cm {
            config.flight.cruise_height_cm = height;
        }
        if let Some(speed) = meta.speed_cm_s {
            config.flight.speed_cm_s = speed;
        }
        let route = RoutePlayer::chunked(plan, config.route.clone());
        Self::assemble(config, route, dispatcher, telemetry, journal)
    }
}

impl<L: CommandLink, D: LegDecomposer> Mission<L, D> {
    fn assemble(
        config: MissionConfig,
        route: RoutePlayer<D>,
        dispatcher: SharedDispatcher<L>,
        telemetry: TelemetryCache,
        journal: Journal,
    ) -> Self {
        let now = Instant::now();
        let (cancel_handle, cancel) = cancel_signal();
        let safety = SafetyController::new(
            Arc::clone(&dispatcher),
            telemetry.clone(),
            config.safety.clone(),
            journal.clone(),
        )
        .with_cancel(cancel_handle.clone());
        let engagement = (config.engagement.policy != EngagementPolicy::Off)
            .then(|| EngagementController::new(config.engagement.clone(), journal.clone()));
        Self {
            monitor: SafetyMonitor::new(config.safety.clone(), now),
            state: MissionState::new(now),
            config,
            route,
            engagement,
            detections: None,
            dispatcher,
            safety,
            telemetry,
            cancel,
            cancel_handle,
            journal,
        }
    }

    /// Swap the waypoint-to-commands strategy.
    pub fn with_decomposer<D2: LegDecomposer>(self, decomposer: D2) -> Mission<L, D2> {
        let route = RoutePlayer::new(self.route.plan().clone(), decomposer)
            .with_heading_hold(HeadingHold::from_config(&self.config.route));
        Mission::assemble(self.config, route, self.dispatcher, self.telemetry, self.journal)
    }

    pub fn with_detections(mut self, feed: DetectionFeed) -> Self {
        self.detections = Some(feed);
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel_handle.clone()
    }

    /// Handle on the landing cascade shared with the loop. Calling
    /// `safe_land` on it also cancels the mission.
    pub fn safety(&self) -> SafetyController<L> {
        self.safety.clone()
    }

    pub fn state(&self) -> &MissionState {
        &self.state
    }

    pub async fn run(mut self) -> MissionReport {
        let mut cancel = self.cancel.clone();
        info!(
            "mission start: {} waypoints, cruise {} cm at {} cm/s, engagement {:?}",
            self.route.plan().len(),
            self.config.flight.cruise_height_cm,
            self.config.flight.speed_cm_s,
            self.config.engagement.policy
        );

        let preflight = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AbortReason::Cancelled),
            result = self.preflight() => result,
        };
        let end = match preflight {
            Ok(()) => self.fly(&mut cancel).await,
            Err(reason) => TickOutcome::Abort(reason),
        };

        let abort_reason = match end {
            TickOutcome::Abort(reason) => {
                error!("mission aborted: {:?}", reason);
                if let Some(controller) = self.engagement.as_mut() {
                    controller.reset();
                }
                self.set_mode(FlightMode::Aborted, format!("{reason:?}"));
                Some(reason)
            }
            TickOutcome::Complete | TickOutcome::Continue => {
                self.set_mode(FlightMode::Landing, "plan complete".into());
                None
            }
        };

        let landing = self.safety.safe_land().await;
        let stats = self.dispatcher.lock().await.stats();
        self.journal.flush();

        MissionReport {
            final_mode: self.state.mode,
            waypoint_index: self.state.waypoint_index,
            plan_len: self.route.plan().len(),
            abort_reason,
            landing,
            stats,
            journal: self.journal.counts(),
            engagements: self.state.engagements,
            rejected_corrections: self.state.rejected_corrections,
            elapsed_ms: u64::try_from(self.state.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn preflight(&mut self) -> Result<(), AbortReason> {
        let flight = self.config.flight.clone();
        let first = self.telemetry.wait_for(self.config.safety.telemetry_stale(), |_| true).await;
        match first {
            Some(s) if s.battery_pct <= self.config.safety.battery_critical_pct => {
                return Err(AbortReason::BatteryCritical { battery_pct: s.battery_pct });
            }
            Some(s) => info!("battery {}% before takeoff", s.battery_pct),
            None => self.journal.warn("no telemetry before takeoff".to_string()),
        }
        let mut dispatcher = self.dispatcher.lock().await;
        let request = |kind| CommandRequest::new(kind, CommandOrigin::Preflight);

        let outcome = dispatcher.dispatch(request(CommandKind::SetSpeed { cm_s: flight.speed_cm_s })).await;
        if !outcome.is_success() {
            self.journal.warn(format!("set speed {} cm/s failed: {outcome:?}", flight.speed_cm_s));
        }

        let outcome = dispatcher.dispatch(request(CommandKind::Takeoff)).await;
        if !outcome.is_success() {
            return Err(AbortReason::TakeoffFailed);
        }
        if flight.stabilize_secs > 0.0 {
            time::sleep(crate::config::secs(flight.stabilize_secs)).await;
        }

        let climb = flight.cruise_height_cm.saturating_sub(TAKEOFF_HEIGHT_ALLOWANCE_CM);
        let chunk = match flight.climb_chunk_cm {
            0 => MAX_MOVE_CM,
            c => c.clamp(MIN_MOVE_CM, MAX_MOVE_CM),
        };
        let mut remaining = climb;
        while remaining >= MIN_MOVE_CM {
            let step = remaining.min(chunk);
            let outcome = dispatcher.dispatch(request(CommandKind::up(step))).await;
            if !outcome.is_success() {
                self.journal.warn(format!("climb of {step} cm failed ({outcome:?}), continuing at current height"));
                break;
            }
            remaining -= step;
        }
        Ok(())
    }

    async fn fly(&mut self, cancel: &mut CancelSignal) -> TickOutcome {
        let mut interval = time::interval(self.config.flight.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return TickOutcome::Abort(AbortReason::Cancelled),
                _ = interval.tick() => {}
            }
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => TickOutcome::Abort(AbortReason::Cancelled),
                outcome = self.tick() => outcome,
            };
            if outcome != TickOutcome::Continue {
                return outcome;
            }
        }
    }

    async fn tick(&mut self) -> TickOutcome {
        let now = Instant::now();

        let snapshot = self.telemetry.latest();
        let assessment = self.monitor.evaluate(snapshot.as_ref(), now);
        for (event, level, value) in &assessment.raised {
            let message = match event {
                SafetyEvent::BatteryLow => format!("battery {value}% ({level:?})"),
                SafetyEvent::TelemetryStale => format!("telemetry stale ({level:?})"),
            };
            self.journal.warn(message);
        }
        if assessment.requires_abort() {
            let battery_pct = snapshot.map_or(0, |s| s.battery_pct);
            return TickOutcome::Abort(AbortReason::BatteryCritical { battery_pct });
        }

        let detection = match self.read_detection(now) {
            Ok(detection) => detection,
            Err(Some(release)) => return self.resume(release).await,
            Err(None) => None,
        };

        match self.state.mode {
            FlightMode::Navigating | FlightMode::Returning => {
                let engage = match (&self.engagement, &detection) {
                    (Some(controller), Some(d)) => controller.qualifies(d, now),
                    _ => false,
                };
                if engage {
                    self.set_mode(FlightMode::Engaging, "target detected".into());
                    return self.engage(detection.as_ref(), now).await;
                }
                self.navigate().await
            }
            FlightMode::Engaging => {
                let predates = match (&detection, self.state.corrections_settled) {
                    (Some(d), Some(settled)) => d.captured_at <= settled,
                    _ => false,
                };
                if predates {
                    // Wait for a frame taken after the last correction.
                    return TickOutcome::Continue;
                }
                self.engage(detection.as_ref(), now).await
            }
            FlightMode::Landing | FlightMode::Aborted => TickOutcome::Complete,
        }
    }

    /// Freshest usable detection. When the feed turns out to be unavailable
    /// engagement is switched off for good; an open session is released.
    fn read_detection(&mut self, now: Instant) -> Result<Option<Detection>, Option<Release>> {
        if self.engagement.is_none() {
            return Ok(None);
        }
        let Some(feed) = self.detections.as_ref() else {
            return Ok(None);
        };
        match feed.read(now, self.config.sensors.detection_max_age()) {
            FeedReading::Target(detection) => Ok(Some(detection)),
            FeedReading::Clear => Ok(None),
            FeedReading::Unavailable(reason) => {
                self.journal.warn(format!("detector unavailable, engagement disabled: {reason}"));
                self.detections = None;
                let release = self
                    .engagement
                    .take()
                    .and_then(|c| c.session().map(|s| s.applied_yaw_deg))
                    .map(|applied_yaw_deg| Release {
                        reason: crate::engagement::ReleaseReason::TargetLost,
                        applied_yaw_deg,
                    });
                Err(release)
            }
        }
    }

    async fn navigate(&mut self) -> TickOutcome {
        let index = self.state.waypoint_index;
        let step = {
            let mut dispatcher = self.dispatcher.lock().await;
            self.route.advance(index, &mut dispatcher).await
        };
        match step {
            RouteStep::Completed => TickOutcome::Complete,
            RouteStep::Leg(leg) if leg.outcome.is_success() => {
                self.state.waypoint_index = leg.next_index;
                if leg.next_index >= self.route.plan().len() {
                    TickOutcome::Complete
                } else {
                    TickOutcome::Continue
                }
            }
            RouteStep::Leg(_) => TickOutcome::Abort(AbortReason::LegFailed { waypoint: index }),
        }
    }

    async fn engage(&mut self, detection: Option<&Detection>, now: Instant) -> TickOutcome {
        let Some(controller) = self.engagement.as_mut() else {
            self.set_mode(FlightMode::Navigating, "engagement disabled".into());
            return TickOutcome::Continue;
        };
        let step = controller.step(detection, now);

        {
            let mut dispatcher = self.dispatcher.lock().await;
            for kind in &step.corrections {
                let outcome = dispatcher
                    .dispatch(CommandRequest::new(*kind, CommandOrigin::Engagement))
                    .await;
                match outcome {
                    CommandOutcome::Acknowledged | CommandOutcome::TimedOutConfirmed => {
                        controller.record_applied(kind);
                    }
                    CommandOutcome::Rejected => {
                        warn!("engagement correction '{}' rejected, continuing", kind);
                        self.state.rejected_corrections += 1;
                    }
                    CommandOutcome::TimedOutUnconfirmed => {
                        controller.reset();
                        return TickOutcome::Abort(AbortReason::EngagementFailed);
                    }
                }
            }
        }
        if !step.corrections.is_empty() {
            self.state.corrections_settled = Some(Instant::now());
        }

        if let Some(release) = step.release {
            return self.resume(release).await;
        }
        if !controller_active(&self.engagement) {
            self.set_mode(FlightMode::Navigating, "no engagement session".into());
        }
        TickOutcome::Continue
    }

    /// Hand control back to the route at the interrupted waypoint, undoing
    /// the session's heading change first if configured.
    async fn resume(&mut self, release: Release) -> TickOutcome {
        self.state.engagements += 1;
        self.set_mode(FlightMode::Returning, format!("{:?}", release.reason));

        let applied = release.applied_yaw_deg;
        let mut restored = false;
        if self.config.engagement.restore_heading && applied != 0 {
            let request = CommandRequest::new(CommandKind::Rotate { degrees: -applied }, CommandOrigin::Engagement);
            let outcome = self.dispatcher.lock().await.dispatch(request).await;
            match outcome {
                CommandOutcome::Acknowledged | CommandOutcome::TimedOutConfirmed => restored = true,
                CommandOutcome::Rejected => warn!("heading restore rejected, route heading adjusted instead"),
                CommandOutcome::TimedOutUnconfirmed => return TickOutcome::Abort(AbortReason::EngagementFailed),
            }
        }
        if !restored && applied != 0 {
            self.route.adjust_heading(applied as f32);
        }

        let index = self.state.waypoint_index;
        self.set_mode(FlightMode::Navigating, format!("resuming route at waypoint {index}"));
        TickOutcome::Continue
    }

    fn set_mode(&mut self, mode: FlightMode, reason: String) {
        if self.state.mode == mode {
            return;
        }
        self.journal.record(JournalEvent::ModeTransition {
            from: self.state.mode,
            to: mode,
            waypoint: self.state.waypoint_index,
            reason,
        });
        self.state.mode = mode;
    }
}

fn controller_active(engagement: &Option<EngagementController>) -> bool {
    engagement.as_ref().is_some_and(EngagementController::is_active)
}
