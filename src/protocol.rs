//! Command vocabulary shared by every controller and the link layer.
//!
//! Controllers build [`CommandRequest`]s and receive [`CommandOutcome`]s; the
//! wire form (`to_wire`/`FromStr`) is the vehicle's text SDK and only the
//! link and the simulator ever look at it.

use arrayvec::ArrayString;
use core::fmt::Write;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use tokio::time::{Duration, Instant};

pub const MAX_WIRE_COMMAND_SIZE: usize = 32;
pub const MAX_REPLY_SIZE: usize = 128;

pub type WireCommand = ArrayString<MAX_WIRE_COMMAND_SIZE>;
pub type ReplyBuffer = ArrayString<MAX_REPLY_SIZE>;

// Vehicle SDK limits
pub const MIN_MOVE_CM: u32 = 20;
pub const MAX_MOVE_CM: u32 = 500;
pub const MIN_ROTATE_DEG: u32 = 1;
pub const MAX_ROTATE_DEG: u32 = 360;
pub const MIN_SPEED_CM_S: u32 = 10;
pub const MAX_SPEED_CM_S: u32 = 100;
pub const RC_LIMIT: i8 = 100;

static_assertions::const_assert!(MIN_MOVE_CM < MAX_MOVE_CM);
static_assertions::const_assert!(MIN_ROTATE_DEG < MAX_ROTATE_DEG);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveAxis {
    Forward,
    Back,
    Left,
    Right,
    Up,
    Down,
}

impl MoveAxis {
    pub fn keyword(self) -> &'static str {
        match self {
            MoveAxis::Forward => "forward",
            MoveAxis::Back => "back",
            MoveAxis::Left => "left",
            MoveAxis::Right => "right",
            MoveAxis::Up => "up",
            MoveAxis::Down => "down",
        }
    }

    pub fn is_vertical(self) -> bool {
        matches!(self, MoveAxis::Up | MoveAxis::Down)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    Takeoff,
    Land,
    /// Stop in place and hover.
    Hover,
    /// Unconditional motor cutoff.
    EmergencyStop,
    Move { axis: MoveAxis, distance_cm: u32 },
    /// Positive is counter-clockwise.
    Rotate { degrees: i32 },
    /// Stick-style velocity directive. The vehicle never replies to these.
    Rc { lateral: i8, forward: i8, vertical: i8, yaw: i8 },
    SetSpeed { cm_s: u32 },
}

/// Grouping used to look up timeout padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFamily {
    Takeoff,
    Land,
    Vertical,
    Horizontal,
    Rotate,
    Control,
}

impl CommandKind {
    pub fn forward(distance_cm: u32) -> Self {
        CommandKind::Move { axis: MoveAxis::Forward, distance_cm }
    }

    pub fn back(distance_cm: u32) -> Self {
        CommandKind::Move { axis: MoveAxis::Back, distance_cm }
    }

    pub fn up(distance_cm: u32) -> Self {
        CommandKind::Move { axis: MoveAxis::Up, distance_cm }
    }

    pub fn down(distance_cm: u32) -> Self {
        CommandKind::Move { axis: MoveAxis::Down, distance_cm }
    }

    pub fn rc_stop() -> Self {
        CommandKind::Rc { lateral: 0, forward: 0, vertical: 0, yaw: 0 }
    }

    pub fn family(&self) -> CommandFamily {
        match self {
            CommandKind::Takeoff => CommandFamily::Takeoff,
            CommandKind::Land => CommandFamily::Land,
            CommandKind::Move { axis, .. } if axis.is_vertical() => CommandFamily::Vertical,
            CommandKind::Move { .. } => CommandFamily::Horizontal,
            CommandKind::Rotate { .. } => CommandFamily::Rotate,
            CommandKind::Hover
            | CommandKind::EmergencyStop
            | CommandKind::Rc { .. }
            | CommandKind::SetSpeed { .. } => CommandFamily::Control,
        }
    }

    /// Declared displacement (cm) or rotation (degrees) used for timeout padding.
    pub fn magnitude(&self) -> f64 {
        match self {
            CommandKind::Move { distance_cm, .. } => f64::from(*distance_cm),
            CommandKind::Rotate { degrees } => f64::from(degrees.unsigned_abs()),
            _ => 0.0,
        }
    }

    pub fn expects_reply(&self) -> bool {
        !matches!(self, CommandKind::Rc { .. })
    }

    /// Commands the safety cascade may still issue after lockout.
    pub fn is_landing_cascade(&self) -> bool {
        matches!(
            self,
            CommandKind::Land | CommandKind::Hover | CommandKind::EmergencyStop | CommandKind::Rc { .. }
        )
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        match *self {
            CommandKind::Move { distance_cm, .. } => {
                if !(MIN_MOVE_CM..=MAX_MOVE_CM).contains(&distance_cm) {
                    return Err(ProtocolError::OutOfRange {
                        field: "distance_cm",
                        value: i64::from(distance_cm),
                    });
                }
            }
            CommandKind::Rotate { degrees } => {
                if !(MIN_ROTATE_DEG..=MAX_ROTATE_DEG).contains(&degrees.unsigned_abs()) {
                    return Err(ProtocolError::OutOfRange {
                        field: "degrees",
                        value: i64::from(degrees),
                    });
                }
            }
            CommandKind::SetSpeed { cm_s } => {
                if !(MIN_SPEED_CM_S..=MAX_SPEED_CM_S).contains(&cm_s) {
                    return Err(ProtocolError::OutOfRange {
                        field: "cm_s",
                        value: i64::from(cm_s),
                    });
                }
            }
            CommandKind::Rc { lateral, forward, vertical, yaw } => {
                for value in [lateral, forward, vertical, yaw] {
                    if !(-RC_LIMIT..=RC_LIMIT).contains(&value) {
                        return Err(ProtocolError::OutOfRange {
                            field: "rc",
                            value: i64::from(value),
                        });
                    }
                }
            }
            CommandKind::Takeoff | CommandKind::Land | CommandKind::Hover | CommandKind::EmergencyStop => {}
        }
        Ok(())
    }

    pub fn to_wire(&self) -> WireCommand {
        let mut wire = WireCommand::new();
        // Every encoding fits MAX_WIRE_COMMAND_SIZE.
        let _ = match *self {
            CommandKind::Takeoff => wire.write_str("takeoff"),
            CommandKind::Land => wire.write_str("land"),
            CommandKind::Hover => wire.write_str("stop"),
            CommandKind::EmergencyStop => wire.write_str("emergency"),
            CommandKind::Move { axis, distance_cm } => write!(wire, "{} {}", axis.keyword(), distance_cm),
            CommandKind::Rotate { degrees } if degrees >= 0 => write!(wire, "ccw {degrees}"),
            CommandKind::Rotate { degrees } => write!(wire, "cw {}", degrees.unsigned_abs()),
            CommandKind::Rc { lateral, forward, vertical, yaw } => {
                write!(wire, "rc {lateral} {forward} {vertical} {yaw}")
            }
            CommandKind::SetSpeed { cm_s } => write!(wire, "speed {cm_s}"),
        };
        wire
    }
}

impl core::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl FromStr for CommandKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let keyword = parts.next().ok_or(ProtocolError::Empty)?;
        let mut number = |field: &'static str| -> Result<i64, ProtocolError> {
            parts
                .next()
                .ok_or(ProtocolError::MissingArgument(field))?
                .parse::<i64>()
                .map_err(|_| ProtocolError::MissingArgument(field))
        };

        let axis = match keyword {
            "forward" => Some(MoveAxis::Forward),
            "back" => Some(MoveAxis::Back),
            "left" => Some(MoveAxis::Left),
            "right" => Some(MoveAxis::Right),
            "up" => Some(MoveAxis::Up),
            "down" => Some(MoveAxis::Down),
            _ => None,
        };
        if let Some(axis) = axis {
            let distance = number("distance_cm")?;
            let distance_cm = u32::try_from(distance)
                .map_err(|_| ProtocolError::OutOfRange { field: "distance_cm", value: distance })?;
            return Ok(CommandKind::Move { axis, distance_cm });
        }

        let kind = match keyword {
            "takeoff" => CommandKind::Takeoff,
            "land" => CommandKind::Land,
            "stop" => CommandKind::Hover,
            "emergency" => CommandKind::EmergencyStop,
            "ccw" | "cw" => {
                let value = number("degrees")?;
                let signed = if keyword == "cw" { value.checked_neg() } else { Some(value) };
                let degrees = signed
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or(ProtocolError::OutOfRange { field: "degrees", value })?;
                CommandKind::Rotate { degrees }
            }
            "speed" => {
                let value = number("cm_s")?;
                let cm_s = u32::try_from(value)
                    .map_err(|_| ProtocolError::OutOfRange { field: "cm_s", value })?;
                CommandKind::SetSpeed { cm_s }
            }
            "rc" => {
                let mut axes = [0i8; 4];
                for slot in &mut axes {
                    let value = number("rc")?;
                    *slot = i8::try_from(value).map_err(|_| ProtocolError::OutOfRange { field: "rc", value })?;
                }
                CommandKind::Rc { lateral: axes[0], forward: axes[1], vertical: axes[2], yaw: axes[3] }
            }
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };
        Ok(kind)
    }
}

/// Which component issued a request. Carried into the journal only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum CommandOrigin {
    Preflight,
    Route { waypoint: usize },
    Engagement,
    Safety,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub kind: CommandKind,
    pub origin: CommandOrigin,
}

impl CommandRequest {
    pub fn new(kind: CommandKind, origin: CommandOrigin) -> Self {
        Self { kind, origin }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Acknowledged,
    /// No acknowledgement, but telemetry shows the expected effect.
    TimedOutConfirmed,
    /// Retry budget exhausted without acknowledgement or observable effect.
    TimedOutUnconfirmed,
    Rejected,
}

impl CommandOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, CommandOutcome::Acknowledged | CommandOutcome::TimedOutConfirmed)
    }
}

/// What came back from the vehicle for one transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkReply {
    Ack,
    /// Vehicle refused the command; resending will not help.
    Rejected(String),
    /// Vehicle is temporarily unable to execute (sensors not ready).
    Busy(String),
}

impl LinkReply {
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower == "ok" || lower == "ack" || lower == "ready" {
            LinkReply::Ack
        } else if lower.contains("no valid imu") || lower.contains("not joystick") {
            LinkReply::Busy(trimmed.to_string())
        } else {
            LinkReply::Rejected(trimmed.to_string())
        }
    }

    pub fn to_text(&self) -> ReplyBuffer {
        let mut text = ReplyBuffer::new();
        let written = match self {
            LinkReply::Ack => text.write_str("ok"),
            LinkReply::Rejected(reason) | LinkReply::Busy(reason) => {
                if reason.starts_with("error") {
                    text.write_str(reason)
                } else {
                    write!(text, "error {reason}")
                }
            }
        };
        if written.is_err() {
            // oversized reason
            text.clear();
            let _ = text.write_str("error");
        }
        text
    }
}

/// Bookkeeping for the single command in flight.
#[derive(Debug, Clone, Copy)]
pub struct CommandTracker {
    pub command_id: u32,
    pub request: CommandRequest,
    pub attempts: u8,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub effective_timeout: Duration,
}

impl CommandTracker {
    pub fn new(command_id: u32, request: CommandRequest, now: Instant, effective_timeout: Duration) -> Self {
        Self {
            command_id,
            request,
            attempts: 0,
            first_sent: now,
            last_sent: now,
            effective_timeout,
        }
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_sent = now;
    }

    /// Earliest instant a retry may be sent.
    pub fn retry_not_before(&self) -> Instant {
        self.last_sent + self.effective_timeout
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("missing or invalid argument {0}")]
    MissingArgument(&'static str),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },
}
