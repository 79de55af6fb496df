//! Simulated quadcopter.
//!
//! Kinematics are deliberately coarse: discrete moves take `distance / speed`
//! seconds and land all at once when the reply would be sent, stick (rc)
//! velocities integrate continuously. Good enough to exercise timeouts,
//! confirmation and the landing cascade on virtual time.

use super::fault_injection::{LinkFault, LinkFaultConfig, LinkFaultInjector, LinkFaultStats};
use crate::detection::Label;
use crate::dispatcher::wrap_degrees;
use crate::error::LinkError;
use crate::link::CommandLink;
use crate::protocol::{CommandKind, CommandRequest, LinkReply, MoveAxis};
use crate::telemetry::{Attitude, TelemetrySnapshot, TelemetrySource, Velocity};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, trace};

const DEFAULT_SPEED_CM_S: u32 = 30;
const ROTATE_RATE_DEG_S: f32 = 90.0;
const TAKEOFF_HEIGHT_CM: f32 = 80.0;
const TAKEOFF_SECS: f32 = 3.0;
const LAND_RATE_CM_S: f32 = 40.0;
const REPLY_LATENCY_MS: u64 = 30;
const BATTERY_DRAIN_PCT_PER_MIN: f32 = 1.5;
const FROZEN_POLL_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimVehicleConfig {
    pub takeoff_height_cm: f32,
    pub takeoff_secs: f32,
    pub land_rate_cm_s: f32,
    pub rotate_rate_deg_s: f32,
    pub reply_latency_ms: u64,
    pub battery_start_pct: f32,
    pub battery_drain_pct_per_min: f32,
}

impl Default for SimVehicleConfig {
    fn default() -> Self {
        Self {
            takeoff_height_cm: TAKEOFF_HEIGHT_CM,
            takeoff_secs: TAKEOFF_SECS,
            land_rate_cm_s: LAND_RATE_CM_S,
            rotate_rate_deg_s: ROTATE_RATE_DEG_S,
            reply_latency_ms: REPLY_LATENCY_MS,
            battery_start_pct: 100.0,
            battery_drain_pct_per_min: BATTERY_DRAIN_PCT_PER_MIN,
        }
    }
}

/// World-frame pose. x forward at launch, y left, z up; heading CCW from +x.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SimPose {
    pub x_cm: f32,
    pub y_cm: f32,
    pub z_cm: f32,
    pub heading_deg: f32,
}

/// A labelled object placed in the simulated world.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimTarget {
    pub label: Label,
    pub x_cm: f32,
    pub y_cm: f32,
    pub z_cm: f32,
    pub confidence: f32,
    /// Target vanishes at this instant.
    pub visible_until: Option<Instant>,
}

impl SimTarget {
    pub fn new(label: &str, x_cm: f32, y_cm: f32, z_cm: f32, confidence: f32) -> Self {
        let mut bounded = Label::new();
        for ch in label.chars() {
            if bounded.try_push(ch).is_err() {
                break;
            }
        }
        Self { label: bounded, x_cm, y_cm, z_cm, confidence, visible_until: None }
    }

    pub fn visible_until(mut self, until: Instant) -> Self {
        self.visible_until = Some(until);
        self
    }

    pub fn is_visible(&self, at: Instant) -> bool {
        self.visible_until.map_or(true, |until| at < until)
    }
}

#[derive(Debug)]
struct VehicleState {
    pose: SimPose,
    airborne: bool,
    motors_cut: bool,
    speed_cm_s: u32,
    rc: [i8; 4],
    battery_pct: f32,
    battery_pinned: bool,
    updated_at: Instant,
    faults: LinkFaultInjector,
    received: Vec<CommandKind>,
    executed: Vec<CommandKind>,
    telemetry_frozen: bool,
    stream_available: bool,
    /// Heading error picked up by each horizontal move.
    yaw_drift_deg: f32,
    targets: Vec<SimTarget>,
}

impl VehicleState {
    /// Integrate stick velocities and battery drain up to `now`.
    fn advance(&mut self, now: Instant, config: &SimVehicleConfig) {
        let dt = now.saturating_duration_since(self.updated_at).as_secs_f32();
        self.updated_at = now;
        if dt <= 0.0 || !self.airborne {
            return;
        }

        if !self.battery_pinned {
            self.battery_pct = (self.battery_pct - config.battery_drain_pct_per_min * dt / 60.0).max(0.0);
        }

        let [lateral, forward, vertical, yaw] = self.rc.map(f32::from);
        let heading = self.pose.heading_deg.to_radians();
        let (sin, cos) = heading.sin_cos();
        // rc lateral is positive to the right, which is -left
        self.pose.x_cm += (forward * cos + lateral * sin) * dt;
        self.pose.y_cm += (forward * sin - lateral * cos) * dt;
        self.pose.z_cm += vertical * dt;
        self.pose.heading_deg = wrap_degrees(self.pose.heading_deg - yaw * dt);

        if self.pose.z_cm <= 0.0 {
            self.pose.z_cm = 0.0;
            if vertical < 0.0 {
                debug!("sim: touchdown under stick descent");
                self.airborne = false;
                self.rc = [0; 4];
            }
        }
    }

    fn translate(&mut self, axis: MoveAxis, distance: f32) {
        let (sin, cos) = self.pose.heading_deg.to_radians().sin_cos();
        match axis {
            MoveAxis::Forward => {
                self.pose.x_cm += distance * cos;
                self.pose.y_cm += distance * sin;
            }
            MoveAxis::Back => {
                self.pose.x_cm -= distance * cos;
                self.pose.y_cm -= distance * sin;
            }
            MoveAxis::Left => {
                self.pose.x_cm -= distance * sin;
                self.pose.y_cm += distance * cos;
            }
            MoveAxis::Right => {
                self.pose.x_cm += distance * sin;
                self.pose.y_cm -= distance * cos;
            }
            MoveAxis::Up => self.pose.z_cm += distance,
            MoveAxis::Down => self.pose.z_cm = (self.pose.z_cm - distance).max(0.0),
        }
    }

    /// Reason the vehicle refuses `kind` in its current state.
    fn refusal(&self, kind: &CommandKind) -> Option<&'static str> {
        if self.motors_cut && !matches!(kind, CommandKind::EmergencyStop) {
            return Some("Motor stop");
        }
        match kind {
            CommandKind::Move { .. } | CommandKind::Rotate { .. } | CommandKind::Land if !self.airborne => {
                Some("Not flying")
            }
            CommandKind::Takeoff if self.battery_pct < 10.0 => Some("Battery low"),
            _ => None,
        }
    }

    fn apply(&mut self, kind: &CommandKind, config: &SimVehicleConfig) {
        match *kind {
            CommandKind::Takeoff => {
                if !self.airborne {
                    self.airborne = true;
                    self.pose.z_cm = config.takeoff_height_cm;
                }
            }
            CommandKind::Land => {
                self.pose.z_cm = 0.0;
                self.airborne = false;
                self.rc = [0; 4];
            }
            CommandKind::Hover => self.rc = [0; 4],
            CommandKind::EmergencyStop => {
                self.pose.z_cm = 0.0;
                self.airborne = false;
                self.motors_cut = true;
                self.rc = [0; 4];
            }
            CommandKind::Move { axis, distance_cm } => {
                self.translate(axis, distance_cm as f32);
                if !axis.is_vertical() {
                    self.pose.heading_deg = wrap_degrees(self.pose.heading_deg + self.yaw_drift_deg);
                }
            }
            CommandKind::Rotate { degrees } => {
                self.pose.heading_deg = wrap_degrees(self.pose.heading_deg + degrees as f32);
            }
            CommandKind::Rc { lateral, forward, vertical, yaw } => {
                if self.airborne {
                    self.rc = [lateral, forward, vertical, yaw];
                }
            }
            CommandKind::SetSpeed { cm_s } => self.speed_cm_s = cm_s,
        }
        self.executed.push(*kind);
    }

    fn motion_time(&self, kind: &CommandKind, config: &SimVehicleConfig) -> Duration {
        let secs = match *kind {
            CommandKind::Takeoff => config.takeoff_secs,
            CommandKind::Land => self.pose.z_cm / config.land_rate_cm_s.max(1.0),
            CommandKind::Move { distance_cm, .. } => distance_cm as f32 / self.speed_cm_s.max(1) as f32,
            CommandKind::Rotate { degrees } => degrees.unsigned_abs() as f32 / config.rotate_rate_deg_s.max(1.0),
            _ => 0.0,
        };
        Duration::from_secs_f32(secs.max(0.0)) + Duration::from_millis(config.reply_latency_ms)
    }

    fn snapshot(&self, captured_at: Instant) -> TelemetrySnapshot {
        let [lateral, forward, vertical, _] = self.rc.map(f32::from);
        TelemetrySnapshot {
            height_cm: self.pose.z_cm,
            battery_pct: self.battery_pct.round().clamp(0.0, 100.0) as u8,
            // The vehicle reports yaw clockwise-positive.
            attitude: Attitude { pitch_deg: 0.0, roll_deg: 0.0, yaw_deg: wrap_degrees(-self.pose.heading_deg) },
            velocity: Velocity { horizontal_cm_s: forward.hypot(lateral), vertical_cm_s: vertical },
            captured_at,
        }
    }
}

/// Shared handle to one simulated vehicle. Clones drive the same airframe,
/// so one clone can be the command link while another feeds telemetry.
#[derive(Debug, Clone)]
pub struct SimVehicle {
    state: Arc<Mutex<VehicleState>>,
    config: Arc<SimVehicleConfig>,
}

impl SimVehicle {
    pub fn new() -> Self {
        Self::with_config(SimVehicleConfig::default())
    }

    pub fn with_config(config: SimVehicleConfig) -> Self {
        let state = VehicleState {
            pose: SimPose::default(),
            airborne: false,
            motors_cut: false,
            speed_cm_s: DEFAULT_SPEED_CM_S,
            rc: [0; 4],
            battery_pct: config.battery_start_pct,
            battery_pinned: false,
            updated_at: Instant::now(),
            faults: LinkFaultInjector::new(),
            received: Vec::new(),
            executed: Vec::new(),
            telemetry_frozen: false,
            stream_available: true,
            yaw_drift_deg: 0.0,
            targets: Vec::new(),
        };
        Self { state: Arc::new(Mutex::new(state)), config: Arc::new(config) }
    }

    fn lock(&self) -> MutexGuard<'_, VehicleState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.advance(Instant::now(), &self.config);
        state
    }

    /// Fault the next `count` transmissions starting with `keyword`
    /// (`None` for any command; `u32::MAX` for every one).
    pub fn inject(&self, keyword: Option<&'static str>, fault: LinkFault, count: u32) -> bool {
        self.lock().faults.script(keyword, fault, count)
    }

    pub fn set_fault_config(&self, config: LinkFaultConfig) {
        self.lock().faults.set_config(config);
    }

    pub fn fault_stats(&self) -> LinkFaultStats {
        self.lock().faults.stats().clone()
    }

    /// Pin the battery level; drain stops until the vehicle is reset.
    pub fn set_battery(&self, pct: f32) {
        let mut state = self.lock();
        state.battery_pct = pct.clamp(0.0, 100.0);
        state.battery_pinned = true;
    }

    /// While frozen, telemetry polls block and the cache goes stale.
    pub fn freeze_telemetry(&self, frozen: bool) {
        self.lock().telemetry_frozen = frozen;
    }

    pub fn set_stream_available(&self, available: bool) {
        self.lock().stream_available = available;
    }

    pub(crate) fn stream_available(&self) -> bool {
        self.lock().stream_available
    }

    /// Make every horizontal move leave the heading off by `degrees`
    /// (counter-clockwise positive).
    pub fn set_yaw_drift(&self, degrees: f32) {
        self.lock().yaw_drift_deg = degrees;
    }

    pub fn add_target(&self, target: SimTarget) {
        self.lock().targets.push(target);
    }

    pub fn clear_targets(&self) {
        self.lock().targets.clear();
    }

    pub fn targets(&self) -> Vec<SimTarget> {
        self.lock().targets.clone()
    }

    pub fn pose(&self) -> SimPose {
        self.lock().pose
    }

    pub fn is_airborne(&self) -> bool {
        self.lock().airborne
    }

    pub fn motors_cut(&self) -> bool {
        self.lock().motors_cut
    }

    /// Every transmission that reached the vehicle, in order.
    pub fn received(&self) -> Vec<CommandKind> {
        self.lock().received.clone()
    }

    /// Commands whose effect was applied, in order.
    pub fn executed(&self) -> Vec<CommandKind> {
        self.lock().executed.clone()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.lock().snapshot(Instant::now())
    }

    /// Run one command the way the airframe would and produce its reply.
    /// `None` means no reply will ever come for this transmission.
    pub async fn execute(&self, kind: CommandKind) -> Option<LinkReply> {
        let latency = Duration::from_millis(self.config.reply_latency_ms);
        let (fault, refusal, motion) = {
            let mut state = self.lock();
            let fault = state.faults.next_fault(&kind);
            if fault != Some(LinkFault::Blackhole) {
                state.received.push(kind);
            }
            (fault, state.refusal(&kind), state.motion_time(&kind, &self.config))
        };
        trace!("sim: {} ({:?})", kind, fault);

        match fault {
            Some(LinkFault::Blackhole) => return None,
            Some(LinkFault::Reject) => {
                time::sleep(latency).await;
                return Some(LinkReply::Rejected("error Not allowed".into()));
            }
            Some(LinkFault::Busy) => {
                time::sleep(latency).await;
                return Some(LinkReply::Busy("error No valid imu".into()));
            }
            _ => {}
        }
        if let Some(reason) = refusal {
            time::sleep(latency).await;
            return Some(LinkReply::Rejected(format!("error {reason}")));
        }

        time::sleep(motion).await;
        if fault != Some(LinkFault::Ignore) {
            self.lock().apply(&kind, &self.config);
        }
        match fault {
            Some(LinkFault::DropReply) => None,
            _ if kind.expects_reply() => Some(LinkReply::Ack),
            _ => None,
        }
    }
}

impl Default for SimVehicle {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandLink for SimVehicle {
    async fn send(&mut self, request: &CommandRequest) -> Result<LinkReply, LinkError> {
        match self.execute(request.kind).await {
            Some(reply) => Ok(reply),
            None if !request.kind.expects_reply() => Ok(LinkReply::Ack),
            // Lost reply: the caller's timeout decides what happens next.
            None => std::future::pending().await,
        }
    }
}

impl TelemetrySource for SimVehicle {
    async fn poll(&mut self) -> Result<TelemetrySnapshot, LinkError> {
        loop {
            {
                let state = self.lock();
                if !state.telemetry_frozen {
                    return Ok(state.snapshot(Instant::now()));
                }
            }
            time::sleep(Duration::from_millis(FROZEN_POLL_MS)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_takeoff_move_and_rotate() {
        let vehicle = SimVehicle::new();
        assert_eq!(vehicle.execute(CommandKind::Takeoff).await, Some(LinkReply::Ack));
        assert!(vehicle.is_airborne());

        vehicle.execute(CommandKind::Rotate { degrees: 90 }).await;
        vehicle.execute(CommandKind::forward(100)).await;
        let pose = vehicle.pose();
        assert!(pose.x_cm.abs() < 1e-3);
        assert!((pose.y_cm - 100.0).abs() < 1e-3);
        // CCW request shows up as negative clockwise yaw
        assert!((vehicle.snapshot().attitude.yaw_deg + 90.0).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_moves_refused_on_the_ground() {
        let vehicle = SimVehicle::new();
        let reply = vehicle.execute(CommandKind::forward(50)).await;
        assert!(matches!(reply, Some(LinkReply::Rejected(_))));
        assert!(vehicle.executed().is_empty());
        assert_eq!(vehicle.received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_reply_still_moves() {
        let vehicle = SimVehicle::new();
        vehicle.execute(CommandKind::Takeoff).await;
        vehicle.inject(Some("up"), LinkFault::DropReply, 1);
        assert_eq!(vehicle.execute(CommandKind::up(40)).await, None);
        assert!((vehicle.pose().z_cm - 120.0).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stick_descent_touches_down() {
        let vehicle = SimVehicle::new();
        vehicle.execute(CommandKind::Takeoff).await;
        vehicle.execute(CommandKind::Rc { lateral: 0, forward: 0, vertical: -40, yaw: 0 }).await;
        time::sleep(Duration::from_secs(3)).await;
        assert!(!vehicle.is_airborne());
        assert_eq!(vehicle.pose().z_cm, 0.0);
    }
}
