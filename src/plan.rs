//! Route plans.
//!
//! Waypoints are displacements in the route frame: x forward along the
//! heading at takeoff, y to the left, z up, headings counter-clockwise
//! positive. A plan file may also list absolute positions, which are turned
//! into displacements on load. The legacy segment format (`"wp"` array of
//! distance + turn pairs) is converted the same way.

use crate::error::PlanError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

pub const NATIVE_PLAN_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub x_cm: f32,
    pub y_cm: f32,
    #[serde(default)]
    pub z_cm: f32,
    /// Heading to face once the waypoint is reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yaw_deg: Option<f32>,
}

impl Waypoint {
    pub fn new(x_cm: f32, y_cm: f32, z_cm: f32) -> Self {
        Self { x_cm, y_cm, z_cm, yaw_deg: None }
    }

    pub fn with_yaw(mut self, yaw_deg: f32) -> Self {
        self.yaw_deg = Some(yaw_deg);
        self
    }

    pub fn horizontal_distance(&self) -> f32 {
        self.x_cm.hypot(self.y_cm)
    }

    /// Bearing of the displacement in the route frame.
    pub fn bearing_deg(&self) -> f32 {
        self.y_cm.atan2(self.x_cm).to_degrees()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointFrame {
    #[default]
    Relative,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanVersion {
    Native(u32),
    LegacySegments,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanMeta {
    #[serde(default, alias = "height_cm")]
    pub cruise_height_cm: Option<u32>,
    #[serde(default)]
    pub speed_cm_s: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    version: PlanVersion,
    waypoints: Vec<Waypoint>,
    meta: PlanMeta,
}

#[derive(Deserialize)]
struct NativePlanFile {
    version: u32,
    #[serde(default)]
    frame: WaypointFrame,
    waypoints: Vec<Waypoint>,
    #[serde(default)]
    meta: PlanMeta,
}

#[derive(Deserialize)]
struct LegacyPlanFile {
    wp: Vec<LegacySegment>,
    #[serde(default)]
    pos: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    meta: PlanMeta,
}

#[derive(Deserialize)]
struct LegacySegment {
    dist_cm: Option<f64>,
    turn_signed_deg: Option<f64>,
    angle_deg: Option<f64>,
}

impl Plan {
    pub fn new(waypoints: Vec<Waypoint>) -> Result<Self, PlanError> {
        Self::with_meta(waypoints, PlanMeta::default())
    }

    pub fn with_meta(waypoints: Vec<Waypoint>, meta: PlanMeta) -> Result<Self, PlanError> {
        if waypoints.is_empty() {
            return Err(PlanError::Empty);
        }
        Ok(Self { version: PlanVersion::Native(NATIVE_PLAN_VERSION), waypoints, meta })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let plan = Self::from_json(&data)?;
        info!(
            "loaded {} waypoint plan from {} ({:?})",
            plan.len(),
            path.display(),
            plan.version
        );
        Ok(plan)
    }

    pub fn from_json(data: &str) -> Result<Self, PlanError> {
        let value: Value = serde_json::from_str(data)?;
        if value.get("wp").is_some() {
            let file: LegacyPlanFile = serde_json::from_value(value)?;
            return Self::from_legacy(file);
        }
        let file: NativePlanFile = serde_json::from_value(value)?;
        if file.version != NATIVE_PLAN_VERSION {
            return Err(PlanError::UnsupportedVersion(file.version));
        }
        let waypoints = match file.frame {
            WaypointFrame::Relative => file.waypoints,
            WaypointFrame::Absolute => absolute_to_relative(&file.waypoints),
        };
        Self::with_meta(waypoints, file.meta)
    }

    fn from_legacy(file: LegacyPlanFile) -> Result<Self, PlanError> {
        if file.wp.is_empty() {
            return Err(PlanError::Empty);
        }
        let distances = file
            .wp
            .iter()
            .enumerate()
            .map(|(index, seg)| seg.dist_cm.map(f64::round).ok_or(PlanError::MissingDistance { index }))
            .collect::<Result<Vec<_>, _>>()?;
        let turns = legacy_turns(&file.wp, file.pos.as_deref());

        let mut heading = 0.0f64;
        let waypoints = distances
            .iter()
            .zip(turns)
            .map(|(&dist, turn)| {
                heading += turn;
                let rad = heading.to_radians();
                Waypoint {
                    x_cm: (dist * rad.cos()) as f32,
                    y_cm: (dist * rad.sin()) as f32,
                    z_cm: 0.0,
                    yaw_deg: Some(heading as f32),
                }
            })
            .collect();

        Ok(Self { version: PlanVersion::LegacySegments, waypoints, meta: file.meta })
    }

    pub fn version(&self) -> PlanVersion {
        self.version
    }

    pub fn meta(&self) -> PlanMeta {
        self.meta
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn get(&self, index: usize) -> Option<&Waypoint> {
        self.waypoints.get(index)
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    /// Always false for a constructed plan; kept for the `len` convention.
    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }
}

/// Relative turns for each legacy segment. Signed turns win; otherwise
/// they are derived from the recorded positions; the unsigned angle field
/// is the last resort.
fn legacy_turns(segments: &[LegacySegment], pos: Option<&[[f64; 2]]>) -> Vec<f64> {
    let round = |v: f64| v.round();
    let mut turns = vec![0.0; segments.len()];
    let pos = pos.filter(|p| p.len() >= 2);

    if segments.iter().any(|s| s.turn_signed_deg.is_some()) {
        for (turn, seg) in turns.iter_mut().zip(segments) {
            *turn = round(seg.turn_signed_deg.unwrap_or(0.0));
        }
        if let (Some(pos), Some(first)) = (pos, turns.first_mut()) {
            if first.abs() < 1.0 {
                *first = round(signed_angle([1.0, 0.0], delta(pos[0], pos[1])));
            }
        }
    } else if let Some(pos) = pos {
        turns[0] = round(signed_angle([1.0, 0.0], delta(pos[0], pos[1])));
        for (i, turn) in turns.iter_mut().enumerate().skip(1) {
            if i + 1 < pos.len() {
                *turn = round(signed_angle(delta(pos[i - 1], pos[i]), delta(pos[i], pos[i + 1])));
            }
        }
    } else {
        for (turn, seg) in turns.iter_mut().zip(segments) {
            *turn = round(seg.angle_deg.unwrap_or(0.0));
        }
    }
    turns
}

fn delta(a: [f64; 2], b: [f64; 2]) -> [f64; 2] {
    [b[0] - a[0], b[1] - a[1]]
}

fn signed_angle(u: [f64; 2], v: [f64; 2]) -> f64 {
    let (mu, mv) = (u[0].hypot(u[1]), v[0].hypot(v[1]));
    if mu == 0.0 || mv == 0.0 {
        return 0.0;
    }
    let cos = ((u[0] * v[0] + u[1] * v[1]) / (mu * mv)).clamp(-1.0, 1.0);
    let unsigned = cos.acos().to_degrees();
    let cross = u[0] * v[1] - u[1] * v[0];
    if cross > 0.0 {
        unsigned
    } else if cross < 0.0 {
        -unsigned
    } else {
        0.0
    }
}

fn absolute_to_relative(points: &[Waypoint]) -> Vec<Waypoint> {
    let mut previous = Waypoint::new(0.0, 0.0, 0.0);
    points
        .iter()
        .map(|p| {
            let rel = Waypoint {
                x_cm: p.x_cm - previous.x_cm,
                y_cm: p.y_cm - previous.y_cm,
                z_cm: p.z_cm - previous.z_cm,
                yaw_deg: p.yaw_deg,
            };
            previous = *p;
            rel
        })
        .collect()
}

/// Most recently modified `*.json` file in `dir`.
pub fn find_latest_plan(dir: impl AsRef<Path>) -> Result<PathBuf, PlanError> {
    let dir = dir.as_ref();
    let io_err = |source| PlanError::Io { path: dir.to_path_buf(), source };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") || !path.is_file() {
            continue;
        }
        let modified = entry.metadata().and_then(|m| m.modified()).map_err(io_err)?;
        debug!("plan candidate {} ({:?})", path.display(), modified);
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, path)| path).ok_or_else(|| PlanError::NoPlanFound(dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_plan() {
        let plan = Plan::from_json(
            r#"{"version":1,"waypoints":[{"x_cm":100,"y_cm":0},{"x_cm":0,"y_cm":50,"z_cm":20,"yaw_deg":90}],"meta":{"speed_cm_s":40}}"#,
        )
        .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.version(), PlanVersion::Native(1));
        assert_eq!(plan.meta().speed_cm_s, Some(40));
        assert_eq!(plan.get(1).and_then(|w| w.yaw_deg), Some(90.0));
    }

    #[test]
    fn test_absolute_frame_becomes_displacements() {
        let plan = Plan::from_json(
            r#"{"version":1,"frame":"absolute","waypoints":[{"x_cm":100,"y_cm":0},{"x_cm":100,"y_cm":80,"z_cm":30}]}"#,
        )
        .unwrap();
        assert_eq!(plan.get(1), Some(&Waypoint::new(0.0, 80.0, 30.0)));
    }

    #[test]
    fn test_empty_and_versioned_plans_rejected() {
        assert!(matches!(Plan::from_json(r#"{"version":1,"waypoints":[]}"#), Err(PlanError::Empty)));
        assert!(matches!(
            Plan::from_json(r#"{"version":7,"waypoints":[{"x_cm":1,"y_cm":1}]}"#),
            Err(PlanError::UnsupportedVersion(7))
        ));
        assert!(matches!(Plan::from_json(r#"{"wp":[]}"#), Err(PlanError::Empty)));
    }

    #[test]
    fn test_legacy_segments_with_signed_turns() {
        let plan = Plan::from_json(
            r#"{"wp":[{"dist_cm":100,"turn_signed_deg":0},{"dist_cm":50,"turn_signed_deg":90}],"meta":{"height_cm":120}}"#,
        )
        .unwrap();
        assert_eq!(plan.version(), PlanVersion::LegacySegments);
        assert_eq!(plan.meta().cruise_height_cm, Some(120));
        let second = plan.get(1).unwrap();
        assert!(second.x_cm.abs() < 1e-3);
        assert!((second.y_cm - 50.0).abs() < 1e-3);
        assert_eq!(second.yaw_deg, Some(90.0));
    }

    #[test]
    fn test_legacy_turns_from_positions() {
        let plan = Plan::from_json(r#"{"wp":[{"dist_cm":100},{"dist_cm":100}],"pos":[[0,0],[100,0],[100,100]]}"#).unwrap();
        assert_eq!(plan.get(0).and_then(|w| w.yaw_deg), Some(0.0));
        assert_eq!(plan.get(1).and_then(|w| w.yaw_deg), Some(90.0));
    }

    #[test]
    fn test_legacy_missing_distance() {
        assert!(matches!(
            Plan::from_json(r#"{"wp":[{"dist_cm":100},{"angle_deg":30}]}"#),
            Err(PlanError::MissingDistance { index: 1 })
        ));
    }
}
