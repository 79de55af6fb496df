use super::vehicle::{SimPose, SimTarget, SimVehicle};
use crate::config::EngagementConfig;
use crate::detection::{BoundingBox, Detection, Detector, Frame, FrameSource};
use crate::error::SensorError;
use tokio::time::Instant;

const FRAME_WIDTH: u32 = 960;
const FRAME_HEIGHT: u32 = 720;
/// Targets closer than this along the optical axis are not rendered.
const MIN_RANGE_CM: f32 = 10.0;

/// Forward camera on the simulated vehicle. Frames carry no pixels; the
/// paired [`SimDetector`] reads the world directly.
#[derive(Debug, Clone)]
pub struct SimCamera {
    vehicle: SimVehicle,
}

impl SimCamera {
    pub fn new(vehicle: SimVehicle) -> Self {
        Self { vehicle }
    }
}

impl FrameSource for SimCamera {
    async fn next_frame(&mut self) -> Result<Frame, SensorError> {
        if !self.vehicle.stream_available() {
            return Err(SensorError::StreamUnavailable("video stream is off".into()));
        }
        Ok(Frame { width: FRAME_WIDTH, height: FRAME_HEIGHT, captured_at: Instant::now(), pixels: Vec::new() })
    }
}

/// Pinhole-ish optics shared with the engagement controller's calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Optics {
    pub horizontal_fov_deg: f32,
    pub vertical_fov_deg: f32,
    pub reference_width: f32,
    pub reference_distance_cm: f32,
}

impl Optics {
    pub fn from_config(config: &EngagementConfig) -> Self {
        Self {
            horizontal_fov_deg: config.horizontal_fov_deg,
            vertical_fov_deg: config.vertical_fov_deg,
            reference_width: config.reference_width,
            reference_distance_cm: config.reference_distance_cm,
        }
    }

    /// Where `target` appears in a frame taken from `pose`, if in view.
    ///
    /// Image offsets are linear in bearing, matching the controller's
    /// centering model, and box width is inversely proportional to range.
    pub fn project(&self, pose: &SimPose, target: &SimTarget) -> Option<BoundingBox> {
        let (sin, cos) = pose.heading_deg.to_radians().sin_cos();
        let dx = target.x_cm - pose.x_cm;
        let dy = target.y_cm - pose.y_cm;
        let ahead = dx * cos + dy * sin;
        let left = -dx * sin + dy * cos;
        let above = target.z_cm - pose.z_cm;
        if ahead < MIN_RANGE_CM {
            return None;
        }

        let azimuth = left.atan2(ahead).to_degrees();
        let elevation = above.atan2(ahead).to_degrees();
        let offset_x = -azimuth / self.horizontal_fov_deg;
        let offset_y = -elevation / self.vertical_fov_deg;
        if offset_x.abs() > 0.5 || offset_y.abs() > 0.5 {
            return None;
        }

        let range = ahead.hypot(left);
        let width = (self.reference_width * self.reference_distance_cm / range).min(1.0);
        let height = width * FRAME_WIDTH as f32 / FRAME_HEIGHT as f32;
        Some(BoundingBox {
            x: 0.5 + offset_x - width * 0.5,
            y: 0.5 + offset_y - height * 0.5,
            width,
            height,
        })
    }
}

/// Detector that projects the vehicle's world targets into the frame.
#[derive(Debug, Clone)]
pub struct SimDetector {
    vehicle: SimVehicle,
    optics: Optics,
}

impl SimDetector {
    pub fn new(vehicle: SimVehicle, optics: Optics) -> Self {
        Self { vehicle, optics }
    }
}

impl Detector for SimDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, SensorError> {
        let pose = self.vehicle.pose();
        Ok(self
            .vehicle
            .targets()
            .iter()
            .filter(|t| t.is_visible(frame.captured_at))
            .filter_map(|t| {
                self.optics
                    .project(&pose, t)
                    .map(|bbox| Detection::new(&t.label, t.confidence, bbox, frame.captured_at))
            })
            .collect())
    }
}
