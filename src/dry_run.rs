//! Offline plan preview: what the route player would send, without a vehicle.

use crate::config::MissionConfig;
use crate::plan::Plan;
use crate::protocol::{CommandKind, MoveAxis};
use crate::route::{ChunkedDecomposer, LegDecomposer};
use serde::Serialize;

const ROTATE_RATE_DEG_S: f64 = 60.0;
/// Round-trip and settle time charged to every command.
const COMMAND_OVERHEAD_S: f64 = 0.5;
const TAKEOFF_S: f64 = 5.0;
const LAND_S: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegPreview {
    pub index: usize,
    pub commands: Vec<String>,
    pub rotations: usize,
    pub horizontal_moves: usize,
    pub vertical_moves: usize,
    pub distance_cm: u32,
    pub dropped_cm: f32,
    pub heading_after_deg: f32,
    pub estimated_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunReport {
    pub legs: Vec<LegPreview>,
    pub cruise_height_cm: u32,
    pub speed_cm_s: u32,
    pub total_commands: usize,
    pub total_distance_cm: u32,
    pub total_dropped_cm: f32,
    /// Route plus takeoff, climb and landing.
    pub estimated_secs: f64,
}

/// Preview `plan` with the default chunked decomposition.
pub fn preview(plan: &Plan, config: &MissionConfig) -> DryRunReport {
    preview_with(plan, config, &ChunkedDecomposer::new(config.route.clone()))
}

pub fn preview_with<D: LegDecomposer>(plan: &Plan, config: &MissionConfig, decomposer: &D) -> DryRunReport {
    let meta = plan.meta();
    let speed = f64::from(meta.speed_cm_s.unwrap_or(config.flight.speed_cm_s).max(1));
    let cruise_height_cm = meta.cruise_height_cm.unwrap_or(config.flight.cruise_height_cm);

    let mut heading = 0.0;
    let mut legs = Vec::with_capacity(plan.len());
    for (index, waypoint) in plan.waypoints().iter().enumerate() {
        let leg = decomposer.decompose(waypoint, heading);
        heading = leg.heading_after_deg;

        let mut preview = LegPreview {
            index,
            commands: leg.commands.iter().map(ToString::to_string).collect(),
            rotations: 0,
            horizontal_moves: 0,
            vertical_moves: 0,
            distance_cm: 0,
            dropped_cm: leg.dropped_cm,
            heading_after_deg: leg.heading_after_deg,
            estimated_secs: 0.0,
        };
        for command in &leg.commands {
            preview.estimated_secs += COMMAND_OVERHEAD_S + command_secs(command, speed);
            match command {
                CommandKind::Rotate { .. } => preview.rotations += 1,
                CommandKind::Move { axis, distance_cm } => {
                    preview.distance_cm += distance_cm;
                    if matches!(axis, MoveAxis::Up | MoveAxis::Down) {
                        preview.vertical_moves += 1;
                    } else {
                        preview.horizontal_moves += 1;
                    }
                }
                _ => {}
            }
        }
        legs.push(preview);
    }

    let climb_s = f64::from(cruise_height_cm.saturating_sub(20)) / speed;
    let route_s: f64 = legs.iter().map(|l| l.estimated_secs).sum();
    DryRunReport {
        total_commands: legs.iter().map(|l| l.commands.len()).sum(),
        total_distance_cm: legs.iter().map(|l| l.distance_cm).sum(),
        total_dropped_cm: legs.iter().map(|l| l.dropped_cm).sum(),
        estimated_secs: TAKEOFF_S + config.flight.stabilize_secs + climb_s + route_s + LAND_S,
        cruise_height_cm,
        speed_cm_s: speed as u32,
        legs,
    }
}

fn command_secs(command: &CommandKind, speed_cm_s: f64) -> f64 {
    match command {
        CommandKind::Move { distance_cm, .. } => f64::from(*distance_cm) / speed_cm_s,
        CommandKind::Rotate { degrees } => f64::from(degrees.unsigned_abs()) / ROTATE_RATE_DEG_S,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanMeta, Waypoint};

    #[test]
    fn test_preview_counts_and_totals() {
        let plan = Plan::with_meta(
            vec![Waypoint::new(130.0, 0.0, 0.0), Waypoint::new(0.0, 60.0, 40.0)],
            PlanMeta { cruise_height_cm: Some(120), speed_cm_s: Some(20) },
        )
        .unwrap();
        let report = preview(&plan, &MissionConfig::default());

        assert_eq!(report.legs.len(), 2);
        assert_eq!(report.legs[0].horizontal_moves, 2);
        assert_eq!(report.legs[0].dropped_cm, 10.0);
        assert_eq!(report.legs[1].rotations, 1);
        assert_eq!(report.legs[1].vertical_moves, 1);
        assert_eq!(report.total_commands, 5);
        assert_eq!(report.total_distance_cm, 220);
        assert_eq!(report.speed_cm_s, 20);
        assert_eq!(report.cruise_height_cm, 120);
        assert!(report.estimated_secs > 220.0 / 20.0);
    }
}
