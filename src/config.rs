//! Mission configuration surface.
//!
//! Every section carries `#[serde(default)]` so a config file only needs the
//! values it overrides.

use crate::error::ConfigError;
use crate::protocol::{CommandFamily, MAX_MOVE_CM, MIN_MOVE_CM};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tokio::time::Duration;

// Flight defaults
const CRUISE_HEIGHT_CM: u32 = 90;
const SPEED_CM_S: u32 = 30;
const TICK_MS: u64 = 50;

// Route execution
const FORWARD_STEP_CM: u32 = 60;
const DRIFT_TOLERANCE_DEG: f32 = 5.0;
const DRIFT_MAX_CORRECTION_DEG: u32 = 10;
const DRIFT_SAMPLE_WAIT_MS: u64 = 500;

// Command link
const RESPONSE_TIMEOUT_S: f64 = 7.0;
const MAX_RETRIES: u8 = 2;
const RETRY_BACKOFF_S: f64 = 0.2;
const CONFIRM_TOLERANCE_CM: f32 = 10.0;
const TAKEOFF_CONFIRM_HEIGHT_CM: f32 = 30.0;
const YAW_TOLERANCE_DEG: f32 = 10.0;
const MAX_RETRIES_LIMIT: u8 = 10;
const RC_YAW_SPEED: i8 = 40;
const RC_YAW_DEG_PER_SEC: f32 = 40.0;
const RC_YAW_SETTLE_S: f64 = 0.2;

// Connection
const CONNECT_ATTEMPTS: u32 = 4;
const CONNECT_BACKOFF_S: f64 = 1.0;
const CONNECT_REPLY_TIMEOUT_S: f64 = 2.0;
const FIRST_TELEMETRY_WAIT_S: f64 = 3.0;

// Target engagement
const DETECT_CONFIDENCE: f32 = 0.45;
const CENTER_TOLERANCE: f32 = 0.05; // ~50 px on a 960 px frame
const H_FOV_DEG: f32 = 82.0;
const V_FOV_DEG: f32 = 52.0;
const MAX_YAW_STEP_DEG: u32 = 10;
const MAX_VERTICAL_STEP_CM: u32 = 40;
const REFERENCE_WIDTH: f32 = 0.25;
const REFERENCE_DISTANCE_CM: f32 = 150.0;
const STANDOFF_DISTANCE_CM: f32 = 150.0;
const RANGE_TOLERANCE_CM: f32 = 25.0;
const APPROACH_STEP_CM: u32 = 40;
const MAX_APPROACH_STEPS: u32 = 15;
const LOST_GRACE_MS: u64 = 600;
const DWELL_SECS: f64 = 6.0;
const REENGAGE_COOLDOWN_SECS: f64 = 5.0;

// Safety
const BATTERY_WARNING_PCT: u8 = 30;
const BATTERY_CRITICAL_PCT: u8 = 20;
const TELEMETRY_STALE_MS: u64 = 1500;
const LANDED_HEIGHT_CM: f32 = 10.0;
const MANUAL_DESCENT_SPEED: i8 = 30;
const MANUAL_DESCENT_SECS: f64 = 5.0;
const DESCENT_POLL_MS: u64 = 100;

// Producers
const TELEMETRY_CADENCE_MS: u64 = 100;
const DETECTION_POLL_MS: u64 = 80;
const DETECTION_MAX_AGE_MS: u64 = 700;

pub(crate) fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    pub flight: FlightConfig,
    pub route: RouteConfig,
    pub dispatch: DispatchConfig,
    pub engagement: EngagementConfig,
    pub safety: SafetyConfig,
    pub sensors: SensorConfig,
    pub connect: ConnectConfig,
}

impl MissionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: MissionConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| Err(ConfigError::Invalid { field, reason });

        if self.dispatch.max_retries > MAX_RETRIES_LIMIT {
            return invalid("dispatch.max_retries", format!("must be at most {MAX_RETRIES_LIMIT}"));
        }
        if !(self.dispatch.response_timeout_s.is_finite() && self.dispatch.response_timeout_s > 0.0) {
            return invalid("dispatch.response_timeout_s", "must be a positive number of seconds".into());
        }
        for family in PaddingTable::FAMILIES {
            let rule = self.dispatch.padding.rule(family);
            let ok = |v: f64| v.is_finite() && v >= 0.0;
            if !ok(rule.base_s) || !ok(rule.per_unit_s) {
                return invalid("dispatch.padding", format!("{family:?} padding must be finite and non-negative"));
            }
        }
        if !(MIN_MOVE_CM..=MAX_MOVE_CM).contains(&self.route.forward_step_cm) {
            return invalid("route.forward_step_cm", format!("must be within {MIN_MOVE_CM}..={MAX_MOVE_CM}"));
        }
        if !(1..=180).contains(&self.route.drift_max_correction_deg) {
            return invalid("route.drift_max_correction_deg", "must be within 1..=180".into());
        }
        let rc = &self.dispatch.rc_yaw;
        if !(0..=100).contains(&rc.speed) || !rc.deg_per_s.is_finite() || rc.deg_per_s < 0.0 {
            return invalid("dispatch.rc_yaw", "speed must be within 0..=100 and the rate non-negative".into());
        }
        if self.connect.attempts == 0 {
            return invalid("connect.attempts", "at least one attempt is required".into());
        }
        let e = &self.engagement;
        if !(0.0..=1.0).contains(&e.confidence_threshold) {
            return invalid("engagement.confidence_threshold", "must be within 0..=1".into());
        }
        if !(e.center_tolerance > 0.0 && e.center_tolerance < 0.5) {
            return invalid("engagement.center_tolerance", "must be within (0, 0.5)".into());
        }
        if !(e.reference_width > 0.0 && e.reference_width <= 1.0) {
            return invalid("engagement.reference_width", "must be within (0, 1]".into());
        }
        if e.reference_distance_cm <= 0.0 || e.standoff_distance_cm <= 0.0 {
            return invalid("engagement.standoff_distance_cm", "distances must be positive".into());
        }
        let s = &self.safety;
        if s.battery_critical_pct >= s.battery_warning_pct || s.battery_warning_pct > 100 {
            return invalid(
                "safety.battery_critical_pct",
                "critical must be below warning, warning at most 100".into(),
            );
        }
        if s.manual_descent_speed <= 0 || s.manual_descent_speed > 100 {
            return invalid("safety.manual_descent_speed", "must be within 1..=100".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// Target height above the takeoff point.
    pub cruise_height_cm: u32,
    pub speed_cm_s: u32,
    /// Hover after takeoff before climbing.
    pub stabilize_secs: f64,
    /// 0 climbs in a single command.
    pub climb_chunk_cm: u32,
    pub tick_ms: u64,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            cruise_height_cm: CRUISE_HEIGHT_CM,
            speed_cm_s: SPEED_CM_S,
            stabilize_secs: 0.0,
            climb_chunk_cm: 0,
            tick_ms: TICK_MS,
        }
    }
}

impl FlightConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub forward_step_cm: u32,
    /// 0 disables turn chunking.
    pub turn_chunk_deg: u32,
    /// Turns smaller than this are skipped.
    pub min_turn_deg: u32,
    /// 0 disables vertical chunking.
    pub vertical_chunk_cm: u32,
    /// Heading error tolerated after a forward step; 0 disables drift correction.
    pub drift_tolerance_deg: f32,
    /// Largest single drift correction.
    pub drift_max_correction_deg: u32,
    /// How long to wait for a post-move telemetry sample.
    pub drift_sample_wait_ms: u64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            forward_step_cm: FORWARD_STEP_CM,
            turn_chunk_deg: 0,
            min_turn_deg: 0,
            vertical_chunk_cm: 0,
            drift_tolerance_deg: DRIFT_TOLERANCE_DEG,
            drift_max_correction_deg: DRIFT_MAX_CORRECTION_DEG,
            drift_sample_wait_ms: DRIFT_SAMPLE_WAIT_MS,
        }
    }
}

impl RouteConfig {
    pub fn drift_sample_wait(&self) -> Duration {
        Duration::from_millis(self.drift_sample_wait_ms)
    }
}

/// Extra grace added on top of the base response timeout:
/// `base_s + per_unit_s * |distance or degrees|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddingRule {
    pub base_s: f64,
    pub per_unit_s: f64,
}

impl PaddingRule {
    pub fn seconds(&self, magnitude: f64) -> f64 {
        (self.base_s + self.per_unit_s * magnitude.abs()).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaddingTable {
    pub takeoff: PaddingRule,
    pub land: PaddingRule,
    pub vertical: PaddingRule,
    pub horizontal: PaddingRule,
    pub rotate: PaddingRule,
    pub control: PaddingRule,
}

impl PaddingTable {
    pub const FAMILIES: [CommandFamily; 6] = [
        CommandFamily::Takeoff,
        CommandFamily::Land,
        CommandFamily::Vertical,
        CommandFamily::Horizontal,
        CommandFamily::Rotate,
        CommandFamily::Control,
    ];

    pub fn rule(&self, family: CommandFamily) -> PaddingRule {
        match family {
            CommandFamily::Takeoff => self.takeoff,
            CommandFamily::Land => self.land,
            CommandFamily::Vertical => self.vertical,
            CommandFamily::Horizontal => self.horizontal,
            CommandFamily::Rotate => self.rotate,
            CommandFamily::Control => self.control,
        }
    }
}

impl Default for PaddingTable {
    fn default() -> Self {
        Self {
            takeoff: PaddingRule { base_s: 3.0, per_unit_s: 0.0 },
            land: PaddingRule { base_s: 3.0, per_unit_s: 0.0 },
            vertical: PaddingRule { base_s: 0.5, per_unit_s: 0.05 },
            horizontal: PaddingRule { base_s: 0.5, per_unit_s: 0.05 },
            rotate: PaddingRule { base_s: 0.5, per_unit_s: 0.02 },
            control: PaddingRule::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub response_timeout_s: f64,
    /// Resends after the first attempt.
    pub max_retries: u8,
    /// Pause after an attempt's timeout elapses, before resending.
    pub retry_backoff_s: f64,
    pub padding: PaddingTable,
    pub confirm_tolerance_cm: f32,
    pub takeoff_confirm_height_cm: f32,
    pub yaw_tolerance_deg: f32,
    pub rc_yaw: RcYawConfig,
}

/// Stick-driven turn used when the vehicle keeps refusing a rotation
/// because its IMU is not ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RcYawConfig {
    /// Yaw stick magnitude; 0 disables the fallback.
    pub speed: i8,
    /// Turn rate the vehicle reaches at `speed`.
    pub deg_per_s: f32,
    /// Pause after the stick is released.
    pub settle_s: f64,
}

impl Default for RcYawConfig {
    fn default() -> Self {
        Self { speed: RC_YAW_SPEED, deg_per_s: RC_YAW_DEG_PER_SEC, settle_s: RC_YAW_SETTLE_S }
    }
}

impl RcYawConfig {
    pub fn enabled(&self) -> bool {
        self.speed > 0 && self.deg_per_s > 0.0
    }

    /// Time the stick is held for a turn of `degrees`.
    pub fn hold_for(&self, degrees: u32) -> Duration {
        secs((f64::from(degrees) / f64::from(self.deg_per_s)).max(0.1))
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            response_timeout_s: RESPONSE_TIMEOUT_S,
            max_retries: MAX_RETRIES,
            retry_backoff_s: RETRY_BACKOFF_S,
            padding: PaddingTable::default(),
            confirm_tolerance_cm: CONFIRM_TOLERANCE_CM,
            takeoff_confirm_height_cm: TAKEOFF_CONFIRM_HEIGHT_CM,
            yaw_tolerance_deg: YAW_TOLERANCE_DEG,
            rc_yaw: RcYawConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn base_timeout(&self) -> Duration {
        secs(self.response_timeout_s)
    }

    pub fn max_attempts(&self) -> u8 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngagementPolicy {
    Off,
    /// Hold only while the target stays visible, then resume the route.
    #[default]
    ApproachAndResume,
    /// Hold for the dwell duration, then resume the route.
    ApproachAndHold,
}

impl FromStr for EngagementPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "0" => Ok(EngagementPolicy::Off),
            "approach-and-resume" | "resume" | "1" => Ok(EngagementPolicy::ApproachAndResume),
            "approach-and-hold" | "hold" | "2" => Ok(EngagementPolicy::ApproachAndHold),
            other => Err(ConfigError::Invalid {
                field: "engagement.policy",
                reason: format!("unknown policy '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngagementConfig {
    pub policy: EngagementPolicy,
    /// Empty accepts any label.
    pub target_labels: Vec<String>,
    pub confidence_threshold: f32,
    /// Normalized offset from frame center counted as centered.
    pub center_tolerance: f32,
    pub horizontal_fov_deg: f32,
    pub vertical_fov_deg: f32,
    pub max_yaw_step_deg: u32,
    pub max_vertical_step_cm: u32,
    /// Normalized bounding-box width observed at `reference_distance_cm`.
    pub reference_width: f32,
    pub reference_distance_cm: f32,
    pub standoff_distance_cm: f32,
    pub range_tolerance_cm: f32,
    pub approach_step_cm: u32,
    pub max_approach_steps: u32,
    pub lost_grace_ms: u64,
    pub dwell_secs: f64,
    /// Under approach-and-hold, keep holding past the dwell while the target stays visible.
    pub hold_while_visible: bool,
    pub restore_heading: bool,
    /// Detections are ignored for this long after a session ends.
    pub reengage_cooldown_secs: f64,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            policy: EngagementPolicy::default(),
            target_labels: Vec::new(),
            confidence_threshold: DETECT_CONFIDENCE,
            center_tolerance: CENTER_TOLERANCE,
            horizontal_fov_deg: H_FOV_DEG,
            vertical_fov_deg: V_FOV_DEG,
            max_yaw_step_deg: MAX_YAW_STEP_DEG,
            max_vertical_step_cm: MAX_VERTICAL_STEP_CM,
            reference_width: REFERENCE_WIDTH,
            reference_distance_cm: REFERENCE_DISTANCE_CM,
            standoff_distance_cm: STANDOFF_DISTANCE_CM,
            range_tolerance_cm: RANGE_TOLERANCE_CM,
            approach_step_cm: APPROACH_STEP_CM,
            max_approach_steps: MAX_APPROACH_STEPS,
            lost_grace_ms: LOST_GRACE_MS,
            dwell_secs: DWELL_SECS,
            hold_while_visible: false,
            restore_heading: true,
            reengage_cooldown_secs: REENGAGE_COOLDOWN_SECS,
        }
    }
}

impl EngagementConfig {
    pub fn lost_grace(&self) -> Duration {
        Duration::from_millis(self.lost_grace_ms)
    }

    pub fn dwell(&self) -> Duration {
        secs(self.dwell_secs)
    }

    pub fn reengage_cooldown(&self) -> Duration {
        secs(self.reengage_cooldown_secs)
    }

    pub fn accepts_label(&self, label: &str) -> bool {
        self.target_labels.is_empty() || self.target_labels.iter().any(|l| l == label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub battery_warning_pct: u8,
    /// At or below this the mission aborts.
    pub battery_critical_pct: u8,
    pub telemetry_stale_ms: u64,
    pub landed_height_cm: f32,
    pub manual_descent_speed: i8,
    pub manual_descent_secs: f64,
    pub descent_poll_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            battery_warning_pct: BATTERY_WARNING_PCT,
            battery_critical_pct: BATTERY_CRITICAL_PCT,
            telemetry_stale_ms: TELEMETRY_STALE_MS,
            landed_height_cm: LANDED_HEIGHT_CM,
            manual_descent_speed: MANUAL_DESCENT_SPEED,
            manual_descent_secs: MANUAL_DESCENT_SECS,
            descent_poll_ms: DESCENT_POLL_MS,
        }
    }
}

impl SafetyConfig {
    pub fn telemetry_stale(&self) -> Duration {
        Duration::from_millis(self.telemetry_stale_ms)
    }

    pub fn manual_descent(&self) -> Duration {
        secs(self.manual_descent_secs)
    }

    pub fn descent_poll(&self) -> Duration {
        Duration::from_millis(self.descent_poll_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub telemetry_cadence_ms: u64,
    pub detection_poll_ms: u64,
    /// Detections older than this are ignored.
    pub detection_max_age_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            telemetry_cadence_ms: TELEMETRY_CADENCE_MS,
            detection_poll_ms: DETECTION_POLL_MS,
            detection_max_age_ms: DETECTION_MAX_AGE_MS,
        }
    }
}

impl SensorConfig {
    pub fn telemetry_cadence(&self) -> Duration {
        Duration::from_millis(self.telemetry_cadence_ms.max(1))
    }

    pub fn detection_poll(&self) -> Duration {
        Duration::from_millis(self.detection_poll_ms.max(1))
    }

    pub fn detection_max_age(&self) -> Duration {
        Duration::from_millis(self.detection_max_age_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub attempts: u32,
    pub backoff_s: f64,
    /// Wait for the reply to the command-mode handshake.
    pub reply_timeout_s: f64,
    /// Wait for the first state broadcast before flying.
    pub first_telemetry_s: f64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: CONNECT_ATTEMPTS,
            backoff_s: CONNECT_BACKOFF_S,
            reply_timeout_s: CONNECT_REPLY_TIMEOUT_S,
            first_telemetry_s: FIRST_TELEMETRY_WAIT_S,
        }
    }
}

impl ConnectConfig {
    pub fn backoff(&self) -> Duration {
        secs(self.backoff_s)
    }

    pub fn reply_timeout(&self) -> Duration {
        secs(self.reply_timeout_s)
    }

    pub fn first_telemetry(&self) -> Duration {
        secs(self.first_telemetry_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MissionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MissionConfig =
            serde_json::from_str(r#"{"dispatch": {"max_retries": 4}, "engagement": {"policy": "approach-and-hold"}}"#)
                .unwrap();
        assert_eq!(config.dispatch.max_retries, 4);
        assert_eq!(config.dispatch.max_attempts(), 5);
        assert_eq!(config.engagement.policy, EngagementPolicy::ApproachAndHold);
        assert_eq!(config.route.forward_step_cm, FORWARD_STEP_CM);
    }

    #[test]
    fn test_negative_padding_rejected() {
        let mut config = MissionConfig::default();
        config.dispatch.padding.horizontal.per_unit_s = -0.1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "dispatch.padding", .. })));
    }

    #[test]
    fn test_fallback_and_connect_limits() {
        let mut config = MissionConfig::default();
        config.dispatch.rc_yaw.speed = -20;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "dispatch.rc_yaw", .. })));

        let mut config = MissionConfig::default();
        config.connect.attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "connect.attempts", .. })));

        let rc = RcYawConfig::default();
        assert!(rc.enabled());
        assert_eq!(rc.hold_for(90), Duration::from_secs_f64(2.25));
        assert_eq!(rc.hold_for(1), Duration::from_secs_f64(0.1));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("1".parse::<EngagementPolicy>().unwrap(), EngagementPolicy::ApproachAndResume);
        assert_eq!("hold".parse::<EngagementPolicy>().unwrap(), EngagementPolicy::ApproachAndHold);
        assert!("sideways".parse::<EngagementPolicy>().is_err());
    }
}
