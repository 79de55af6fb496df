//! Target engagement state machine.
//!
//! `step` is called once per mission tick with the freshest qualifying
//! detection (or none). It never talks to the vehicle: it returns the
//! corrections to dispatch, at most [`MAX_CORRECTIONS_PER_TICK`], and the
//! mission loop sends them. Lateral (yaw/height) and forward corrections are
//! never returned from the same tick.

use crate::config::{EngagementConfig, EngagementPolicy};
use crate::detection::{Detection, Label};
use crate::dispatcher::wrap_degrees;
use crate::journal::{Journal, JournalEvent};
use crate::protocol::{CommandKind, MIN_MOVE_CM};
use heapless::Vec;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::debug;

pub const MAX_CORRECTIONS_PER_TICK: usize = 2;

pub type Corrections = Vec<CommandKind, MAX_CORRECTIONS_PER_TICK>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngagementPhase {
    Idle,
    Centering,
    Ranging,
    Holding,
    Resuming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Lost for longer than the grace window before reaching the hold.
    TargetLost,
    /// No qualifying detection while holding.
    TargetGone,
    DwellComplete,
}

/// The session ended this tick; the route takes over again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Release {
    pub reason: ReleaseReason,
    /// Net counter-clockwise yaw applied by the session, to be undone.
    pub applied_yaw_deg: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngagementSession {
    pub label: Label,
    pub entered_at: Instant,
    pub phase: EngagementPhase,
    pub last_seen: Instant,
    pub last_confidence: f32,
    pub hold_started: Option<Instant>,
    pub dwell: Duration,
    pub approach_steps: u32,
    pub applied_yaw_deg: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngagementStep {
    pub from: EngagementPhase,
    pub to: EngagementPhase,
    pub corrections: Corrections,
    pub release: Option<Release>,
}

impl EngagementStep {
    fn stay(phase: EngagementPhase) -> Self {
        Self { from: phase, to: phase, corrections: Vec::new(), release: None }
    }
}

/// Offsets and range estimate behind one decision, kept for the journal.
#[derive(Debug, Clone, Copy, Default)]
struct Measurement {
    offset_x: f32,
    offset_y: f32,
    distance_cm: Option<f32>,
    confidence: f32,
}

#[derive(Debug)]
pub struct EngagementController {
    config: EngagementConfig,
    journal: Journal,
    session: Option<EngagementSession>,
    cooldown_until: Option<Instant>,
}

impl EngagementController {
    pub fn new(config: EngagementConfig, journal: Journal) -> Self {
        Self { config, journal, session: None, cooldown_until: None }
    }

    pub fn phase(&self) -> EngagementPhase {
        self.session.as_ref().map_or(EngagementPhase::Idle, |s| s.phase)
    }

    pub fn session(&self) -> Option<&EngagementSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn policy(&self) -> EngagementPolicy {
        self.config.policy
    }

    /// Whether `detection` would open a session right now.
    pub fn qualifies(&self, detection: &Detection, now: Instant) -> bool {
        self.config.policy != EngagementPolicy::Off
            && detection.confidence >= self.config.confidence_threshold
            && self.config.accepts_label(detection.label.as_str())
            && self.cooldown_until.map_or(true, |until| now >= until)
    }

    /// Range estimate from the box width: inversely proportional to the
    /// width observed at the reference distance.
    pub fn estimate_distance_cm(&self, detection: &Detection) -> f32 {
        let width = detection.bbox.width.max(1e-3);
        self.config.reference_distance_cm * self.config.reference_width / width
    }

    /// The mission reports corrections that actually took effect so the
    /// applied heading change can be undone on release.
    pub fn record_applied(&mut self, command: &CommandKind) {
        if let (Some(session), CommandKind::Rotate { degrees }) = (self.session.as_mut(), command) {
            session.applied_yaw_deg += degrees;
        }
    }

    /// Drop the session without a release, e.g. when the mission aborts.
    pub fn reset(&mut self) {
        self.session = None;
    }

    pub fn step(&mut self, detection: Option<&Detection>, now: Instant) -> EngagementStep {
        let Some((phase, label)) = self.session.as_ref().map(|s| (s.phase, s.label)) else {
            return self.begin(detection, now);
        };
        // Only sightings of the session's own label count.
        let threshold = self.config.confidence_threshold;
        let sighting = detection.filter(|d| d.label == label && d.confidence >= threshold);

        match phase {
            EngagementPhase::Centering => self.center(sighting, now),
            EngagementPhase::Ranging => self.range(sighting, now),
            EngagementPhase::Holding => self.hold(sighting, now),
            EngagementPhase::Idle | EngagementPhase::Resuming => {
                // Sessions never rest in these phases.
                self.session = None;
                EngagementStep::stay(EngagementPhase::Idle)
            }
        }
    }

    fn begin(&mut self, detection: Option<&Detection>, now: Instant) -> EngagementStep {
        let Some(detection) = detection.filter(|d| self.qualifies(d, now)) else {
            return EngagementStep::stay(EngagementPhase::Idle);
        };
        self.session = Some(EngagementSession {
            label: detection.label,
            entered_at: now,
            phase: EngagementPhase::Centering,
            last_seen: now,
            last_confidence: detection.confidence,
            hold_started: None,
            dwell: Duration::ZERO,
            approach_steps: 0,
            applied_yaw_deg: 0,
        });
        let mut corrections = Corrections::new();
        let _ = corrections.push(CommandKind::Hover);
        let (offset_x, offset_y) = detection.bbox.offset_from_center();
        let measurement = Measurement {
            offset_x,
            offset_y,
            distance_cm: Some(self.estimate_distance_cm(detection)),
            confidence: detection.confidence,
        };
        self.finish(EngagementPhase::Idle, EngagementPhase::Centering, corrections, None, measurement)
    }

    fn center(&mut self, sighting: Option<&Detection>, now: Instant) -> EngagementStep {
        let Some(detection) = sighting else {
            return self.missing(EngagementPhase::Centering, now);
        };
        let measurement = self.observe(detection, now);
        let tolerance = self.config.center_tolerance;
        let (dx, dy) = (measurement.offset_x, measurement.offset_y);

        if dx.abs() <= tolerance && dy.abs() <= tolerance {
            return self.transition(EngagementPhase::Centering, EngagementPhase::Ranging, Corrections::new(), measurement);
        }

        let mut corrections = Corrections::new();
        if dx.abs() > tolerance {
            let magnitude = (dx.abs() * self.config.horizontal_fov_deg).round() as i32;
            let magnitude = magnitude.clamp(1, self.config.max_yaw_step_deg.max(1) as i32);
            // Target right of center means turn clockwise.
            let degrees = if dx > 0.0 { -magnitude } else { magnitude };
            let _ = corrections.push(CommandKind::Rotate { degrees });
        }
        if dy.abs() > tolerance {
            let distance = measurement.distance_cm.unwrap_or(self.config.standoff_distance_cm);
            let angle = (dy.abs() * self.config.vertical_fov_deg).to_radians();
            let cm = (distance * angle.tan()).round() as u32;
            let cm = cm.clamp(MIN_MOVE_CM, self.config.max_vertical_step_cm.max(MIN_MOVE_CM));
            // Image y grows downwards.
            let _ = corrections.push(if dy > 0.0 { CommandKind::down(cm) } else { CommandKind::up(cm) });
        }
        self.finish(EngagementPhase::Centering, EngagementPhase::Centering, corrections, None, measurement)
    }

    fn range(&mut self, sighting: Option<&Detection>, now: Instant) -> EngagementStep {
        let Some(detection) = sighting else {
            return self.missing(EngagementPhase::Ranging, now);
        };
        let measurement = self.observe(detection, now);
        let tolerance = self.config.center_tolerance;
        if measurement.offset_x.abs() > tolerance || measurement.offset_y.abs() > tolerance {
            return self.transition(EngagementPhase::Ranging, EngagementPhase::Centering, Corrections::new(), measurement);
        }

        let distance = measurement.distance_cm.unwrap_or(self.config.standoff_distance_cm);
        let error = distance - self.config.standoff_distance_cm;
        let budget_spent = self
            .session
            .as_ref()
            .is_some_and(|s| s.approach_steps >= self.config.max_approach_steps);

        if error.abs() <= self.config.range_tolerance_cm || budget_spent {
            if budget_spent {
                debug!("approach budget spent at {:.0} cm", distance);
            }
            if let Some(session) = self.session.as_mut() {
                session.hold_started = Some(now);
            }
            let mut corrections = Corrections::new();
            let _ = corrections.push(CommandKind::Hover);
            return self.transition(EngagementPhase::Ranging, EngagementPhase::Holding, corrections, measurement);
        }

        let step = (error.abs().round() as u32).clamp(MIN_MOVE_CM, self.config.approach_step_cm.max(MIN_MOVE_CM));
        let mut corrections = Corrections::new();
        let _ = corrections.push(if error > 0.0 { CommandKind::forward(step) } else { CommandKind::back(step) });
        if let Some(session) = self.session.as_mut() {
            session.approach_steps += 1;
        }
        self.finish(EngagementPhase::Ranging, EngagementPhase::Ranging, corrections, None, measurement)
    }

    fn hold(&mut self, sighting: Option<&Detection>, now: Instant) -> EngagementStep {
        let dwell = self
            .session
            .as_ref()
            .and_then(|s| s.hold_started)
            .map_or(Duration::ZERO, |start| now.saturating_duration_since(start));
        if let Some(session) = self.session.as_mut() {
            session.dwell = dwell;
        }

        let Some(detection) = sighting else {
            return self.release(ReleaseReason::TargetGone, Measurement::default(), now);
        };
        let measurement = self.observe(detection, now);

        let dwell_done = self.config.policy == EngagementPolicy::ApproachAndHold
            && !self.config.hold_while_visible
            && dwell >= self.config.dwell();
        if dwell_done {
            return self.release(ReleaseReason::DwellComplete, measurement, now);
        }
        EngagementStep::stay(EngagementPhase::Holding)
    }

    fn missing(&mut self, phase: EngagementPhase, now: Instant) -> EngagementStep {
        let lost_for = self
            .session
            .as_ref()
            .map_or(Duration::ZERO, |s| now.saturating_duration_since(s.last_seen));
        if lost_for > self.config.lost_grace() {
            return self.release(ReleaseReason::TargetLost, Measurement::default(), now);
        }
        EngagementStep::stay(phase)
    }

    fn observe(&mut self, detection: &Detection, now: Instant) -> Measurement {
        let (offset_x, offset_y) = detection.bbox.offset_from_center();
        let distance_cm = Some(self.estimate_distance_cm(detection));
        if let Some(session) = self.session.as_mut() {
            session.last_seen = now;
            session.last_confidence = detection.confidence;
        }
        Measurement { offset_x, offset_y, distance_cm, confidence: detection.confidence }
    }

    fn release(&mut self, reason: ReleaseReason, measurement: Measurement, now: Instant) -> EngagementStep {
        let from = self.phase();
        let to = match reason {
            ReleaseReason::TargetLost => EngagementPhase::Idle,
            ReleaseReason::TargetGone | ReleaseReason::DwellComplete => EngagementPhase::Resuming,
        };
        let applied = self.session.as_ref().map_or(0, |s| s.applied_yaw_deg);
        let release = Release { reason, applied_yaw_deg: wrap_degrees(applied as f32).round() as i32 };
        let mut measurement = measurement;
        if let Some(session) = self.session.as_ref() {
            measurement.confidence = session.last_confidence;
        }
        let step = self.finish(from, to, Corrections::new(), Some(release), measurement);
        self.session = None;
        self.cooldown_until = Some(now + self.config.reengage_cooldown());
        step
    }

    fn transition(
        &mut self,
        from: EngagementPhase,
        to: EngagementPhase,
        corrections: Corrections,
        measurement: Measurement,
    ) -> EngagementStep {
        if let Some(session) = self.session.as_mut() {
            session.phase = to;
        }
        self.finish(from, to, corrections, None, measurement)
    }

    fn finish(
        &mut self,
        from: EngagementPhase,
        to: EngagementPhase,
        corrections: Corrections,
        release: Option<Release>,
        measurement: Measurement,
    ) -> EngagementStep {
        if from != to || !corrections.is_empty() {
            let (label, dwell) = self
                .session
                .as_ref()
                .map_or((String::new(), Duration::ZERO), |s| (s.label.to_string(), s.dwell));
            let correction = if corrections.is_empty() {
                None
            } else {
                Some(corrections.iter().map(ToString::to_string).collect::<std::vec::Vec<_>>().join(", "))
            };
            self.journal.record(JournalEvent::Engagement {
                from,
                to,
                label,
                confidence: measurement.confidence,
                offset_x: measurement.offset_x,
                offset_y: measurement.offset_y,
                distance_cm: measurement.distance_cm,
                dwell_ms: u64::try_from(dwell.as_millis()).unwrap_or(u64::MAX),
                correction,
            });
        }
        EngagementStep { from, to, corrections, release }
    }
}
