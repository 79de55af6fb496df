//! Route player.
//!
//! Turns one waypoint at a time into vehicle commands and runs them through
//! the dispatcher. The waypoint index only moves forward once every
//! sub-command of the leg has succeeded; the retry budget lives entirely in
//! the dispatcher and is never replayed here. Between forward steps the
//! reported yaw is compared with the heading the route expects, and drift
//! beyond the tolerance is turned back out.

use crate::config::RouteConfig;
use crate::dispatcher::{wrap_degrees, Dispatcher};
use crate::link::CommandLink;
use crate::plan::{Plan, Waypoint};
use crate::protocol::{
    CommandKind, CommandOrigin, CommandOutcome, CommandRequest, MoveAxis, MAX_MOVE_CM, MIN_MOVE_CM,
};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Commands for one leg plus the heading the vehicle should face after it.
#[derive(Debug, Clone, PartialEq)]
pub struct LegCommands {
    pub commands: Vec<CommandKind>,
    pub heading_after_deg: f32,
    /// Horizontal or vertical travel below the vehicle's minimum move.
    pub dropped_cm: f32,
}

/// Waypoint-to-commands strategy.
pub trait LegDecomposer: Send {
    fn decompose(&self, waypoint: &Waypoint, heading_deg: f32) -> LegCommands;
}

/// Rotate to the leg's bearing, fly forward in fixed steps, adjust height,
/// then turn to the waypoint's yaw if it has one.
#[derive(Debug, Clone)]
pub struct ChunkedDecomposer {
    config: RouteConfig,
}

impl ChunkedDecomposer {
    pub fn new(config: RouteConfig) -> Self {
        Self { config }
    }

    fn push_turn(&self, commands: &mut Vec<CommandKind>, turn_deg: f32) -> i32 {
        let total = turn_deg.round() as i32;
        let threshold = self.config.min_turn_deg.max(1) as i32;
        if total.abs() < threshold {
            return 0;
        }
        let chunk = match self.config.turn_chunk_deg {
            0 => total.abs(),
            c => c as i32,
        };
        let mut remaining = total.abs();
        while remaining > 0 {
            let step = remaining.min(chunk);
            commands.push(CommandKind::Rotate { degrees: step * total.signum() });
            remaining -= step;
        }
        total
    }

    /// Split `distance` into moves of at most `step`; returns what was too
    /// short to send.
    fn push_moves(commands: &mut Vec<CommandKind>, distance: u32, step: u32, make: fn(u32) -> CommandKind) -> u32 {
        let step = step.clamp(MIN_MOVE_CM, MAX_MOVE_CM);
        let mut remaining = distance;
        while remaining >= MIN_MOVE_CM {
            let chunk = remaining.min(step);
            commands.push(make(chunk));
            remaining -= chunk;
        }
        remaining
    }
}

impl LegDecomposer for ChunkedDecomposer {
    fn decompose(&self, waypoint: &Waypoint, heading_deg: f32) -> LegCommands {
        let mut commands = Vec::new();
        let mut heading = heading_deg;
        let mut dropped = 0u32;

        let distance = waypoint.horizontal_distance().round() as u32;
        if distance > 0 {
            let turned = self.push_turn(&mut commands, wrap_degrees(waypoint.bearing_deg() - heading));
            heading = wrap_degrees(heading + turned as f32);
            dropped += Self::push_moves(&mut commands, distance, self.config.forward_step_cm, CommandKind::forward);
        }

        let vertical = waypoint.z_cm.round();
        if vertical != 0.0 {
            let step = match self.config.vertical_chunk_cm {
                0 => MAX_MOVE_CM,
                c => c,
            };
            let make: fn(u32) -> CommandKind = if vertical > 0.0 { CommandKind::up } else { CommandKind::down };
            dropped += Self::push_moves(&mut commands, vertical.abs() as u32, step, make);
        }

        if let Some(yaw) = waypoint.yaw_deg {
            let turned = self.push_turn(&mut commands, wrap_degrees(yaw - heading));
            heading = wrap_degrees(heading + turned as f32);
        }

        LegCommands { commands, heading_after_deg: heading, dropped_cm: dropped as f32 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegResult {
    pub outcome: CommandOutcome,
    /// Equal to the requested index when the leg failed.
    pub next_index: usize,
    pub failed_command: Option<CommandKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStep {
    Leg(LegResult),
    /// The index is past the last waypoint.
    Completed,
}

/// Drift correction knobs taken from [`RouteConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeadingHold {
    pub tolerance_deg: f32,
    pub max_correction_deg: u32,
    pub sample_wait: Duration,
}

impl HeadingHold {
    pub fn from_config(config: &RouteConfig) -> Self {
        Self {
            tolerance_deg: config.drift_tolerance_deg,
            max_correction_deg: config.drift_max_correction_deg,
            sample_wait: config.drift_sample_wait(),
        }
    }

    /// Counter-clockwise turn that takes `drift_deg` back out, if it is
    /// large enough to act on.
    pub fn correction(&self, drift_deg: f32) -> Option<i32> {
        if self.tolerance_deg <= 0.0 || drift_deg.abs() < self.tolerance_deg {
            return None;
        }
        let limit = self.max_correction_deg.max(1) as f32;
        let degrees = (-drift_deg).clamp(-limit, limit).round() as i32;
        (degrees != 0).then_some(degrees)
    }
}

#[derive(Debug)]
pub struct RoutePlayer<D = ChunkedDecomposer> {
    plan: Plan,
    decomposer: D,
    heading_deg: f32,
    hold: Option<HeadingHold>,
    /// Reported yaw at route heading zero.
    yaw_reference: Option<f32>,
}

impl RoutePlayer<ChunkedDecomposer> {
    pub fn chunked(plan: Plan, config: RouteConfig) -> Self {
        let hold = HeadingHold::from_config(&config);
        Self::new(plan, ChunkedDecomposer::new(config)).with_heading_hold(hold)
    }
}

impl<D: LegDecomposer> RoutePlayer<D> {
    pub fn new(plan: Plan, decomposer: D) -> Self {
        Self { plan, decomposer, heading_deg: 0.0, hold: None, yaw_reference: None }
    }

    pub fn with_heading_hold(mut self, hold: HeadingHold) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn heading_deg(&self) -> f32 {
        self.heading_deg
    }

    /// Account for a heading change made outside the route (engagement
    /// corrections that were not undone).
    pub fn adjust_heading(&mut self, delta_deg: f32) {
        self.heading_deg = wrap_degrees(self.heading_deg + delta_deg);
    }

    pub async fn advance<L: CommandLink>(&mut self, index: usize, dispatcher: &mut Dispatcher<L>) -> RouteStep {
        let Some(waypoint) = self.plan.get(index) else {
            return RouteStep::Completed;
        };
        let leg = self.decomposer.decompose(waypoint, self.heading_deg);
        if leg.dropped_cm > 0.0 {
            warn!("waypoint {}: {} cm below the minimum move dropped", index, leg.dropped_cm);
        }
        debug!("waypoint {}: {} commands", index, leg.commands.len());
        if self.yaw_reference.is_none() {
            self.yaw_reference = dispatcher
                .telemetry()
                .latest()
                .map(|s| wrap_degrees(s.attitude.yaw_deg + self.heading_deg));
        }

        let mut outcome = CommandOutcome::Acknowledged;
        let mut expected_heading = self.heading_deg;
        for kind in &leg.commands {
            let result = dispatcher
                .dispatch(CommandRequest::new(*kind, CommandOrigin::Route { waypoint: index }))
                .await;
            if !result.is_success() {
                warn!("waypoint {} leg failed on '{}': {:?}", index, kind, result);
                return RouteStep::Leg(LegResult { outcome: result, next_index: index, failed_command: Some(*kind) });
            }
            if result == CommandOutcome::TimedOutConfirmed {
                outcome = result;
            }
            match *kind {
                CommandKind::Rotate { degrees } => expected_heading = wrap_degrees(expected_heading + degrees as f32),
                CommandKind::Move { axis: MoveAxis::Forward, .. } => {
                    self.hold_heading(index, expected_heading, dispatcher).await;
                }
                _ => {}
            }
        }

        self.heading_deg = leg.heading_after_deg;
        info!("waypoint {} reached", index);
        RouteStep::Leg(LegResult { outcome, next_index: index + 1, failed_command: None })
    }

    /// Turn back toward `expected_deg` when the first telemetry sample taken
    /// after the last move shows the vehicle has yawed away from it.
    async fn hold_heading<L: CommandLink>(&self, index: usize, expected_deg: f32, dispatcher: &mut Dispatcher<L>) {
        let (Some(hold), Some(reference)) = (self.hold, self.yaw_reference) else {
            return;
        };
        let moved_at = Instant::now();
        let Some(sample) = dispatcher.telemetry().wait_for(hold.sample_wait, |s| s.captured_at > moved_at).await
        else {
            debug!("waypoint {}: no telemetry after the move, heading unchecked", index);
            return;
        };
        // Reported yaw grows clockwise; route headings grow counter-clockwise.
        let actual = wrap_degrees(reference - sample.attitude.yaw_deg);
        let drift = wrap_degrees(actual - expected_deg);
        let Some(degrees) = hold.correction(drift) else {
            return;
        };

        warn!("waypoint {}: heading {:.1} deg, expected {:.1}, correcting {:+}", index, actual, expected_deg, degrees);
        let request = CommandRequest::new(CommandKind::Rotate { degrees }, CommandOrigin::Route { waypoint: index });
        let result = dispatcher.dispatch(request).await;
        if !result.is_success() {
            warn!("waypoint {}: drift correction {:?}, carrying on", index, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decomposer() -> ChunkedDecomposer {
        ChunkedDecomposer::new(RouteConfig::default())
    }

    #[test]
    fn test_straight_leg_steps_and_remainder() {
        let leg = decomposer().decompose(&Waypoint::new(130.0, 0.0, 0.0), 0.0);
        assert_eq!(leg.commands, vec![CommandKind::forward(60), CommandKind::forward(60)]);
        assert_eq!(leg.dropped_cm, 10.0);
        assert_eq!(leg.heading_after_deg, 0.0);
    }

    #[test]
    fn test_turn_then_translate_then_climb() {
        let leg = decomposer().decompose(&Waypoint::new(0.0, 50.0, 30.0), 0.0);
        assert_eq!(
            leg.commands,
            vec![CommandKind::Rotate { degrees: 90 }, CommandKind::forward(50), CommandKind::up(30)]
        );
        assert_eq!(leg.heading_after_deg, 90.0);
    }

    #[test]
    fn test_turn_chunking_and_final_yaw() {
        let config = RouteConfig { turn_chunk_deg: 45, ..RouteConfig::default() };
        let leg = ChunkedDecomposer::new(config).decompose(&Waypoint::new(-100.0, 0.0, 0.0).with_yaw(90.0), 0.0);
        assert_eq!(
            &leg.commands[..4],
            &[
                CommandKind::Rotate { degrees: 45 },
                CommandKind::Rotate { degrees: 45 },
                CommandKind::Rotate { degrees: 45 },
                CommandKind::Rotate { degrees: 45 },
            ]
        );
        assert_eq!(&leg.commands[4..6], &[CommandKind::forward(60), CommandKind::forward(40)]);
        assert_eq!(&leg.commands[6..], &[CommandKind::Rotate { degrees: -45 }, CommandKind::Rotate { degrees: -45 }]);
        assert!((leg.heading_after_deg - 90.0).abs() < 1e-3);
    }

    #[test]
    fn test_drift_correction_is_clamped_and_thresholded() {
        let hold = HeadingHold::from_config(&RouteConfig::default());
        assert_eq!(hold.correction(3.0), None);
        assert_eq!(hold.correction(6.0), Some(-6));
        assert_eq!(hold.correction(-25.0), Some(10));
        let off = HeadingHold { tolerance_deg: 0.0, ..hold };
        assert_eq!(off.correction(40.0), None);
    }

    #[test]
    fn test_zero_displacement_waypoint_has_no_commands() {
        let leg = decomposer().decompose(&Waypoint::new(0.0, 0.0, 0.0), 30.0);
        assert!(leg.commands.is_empty());
        assert_eq!(leg.heading_after_deg, 30.0);
    }
}
