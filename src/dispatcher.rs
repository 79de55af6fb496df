//! Command dispatcher.
//!
//! Exactly one request is in flight at a time. Each attempt is bounded by an
//! effective timeout (base + per-family padding). When an attempt goes
//! unanswered the latest telemetry is checked for the command's expected
//! effect before anything is resent, so a relative move whose ack was lost
//! is never applied twice. A turn the vehicle keeps refusing for want of a
//! ready IMU is flown on the yaw stick instead.

use crate::config::{secs, DispatchConfig};
use crate::journal::{Journal, JournalEvent};
use crate::link::CommandLink;
use crate::protocol::{
    CommandKind, CommandOrigin, CommandOutcome, CommandRequest, CommandTracker, LinkReply, MoveAxis,
};
use crate::telemetry::{TelemetryCache, TelemetrySnapshot};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, warn};

/// The dispatcher is shared between the mission loop and the safety
/// controller; holding the lock is what makes a request "in flight".
pub type SharedDispatcher<L> = Arc<Mutex<Dispatcher<L>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub dispatched: u32,
    pub retries: u32,
    pub acknowledged: u32,
    pub confirmed: u32,
    pub unconfirmed: u32,
    pub rejected: u32,
}

#[derive(Debug)]
pub struct Dispatcher<L> {
    link: L,
    telemetry: TelemetryCache,
    journal: Journal,
    config: DispatchConfig,
    next_command_id: u32,
    stats: DispatchStats,
    locked_out: bool,
}

impl<L: CommandLink> Dispatcher<L> {
    pub fn new(link: L, telemetry: TelemetryCache, journal: Journal, config: DispatchConfig) -> Self {
        Self {
            link,
            telemetry,
            journal,
            config,
            next_command_id: 1,
            stats: DispatchStats::default(),
            locked_out: false,
        }
    }

    pub fn into_shared(self) -> SharedDispatcher<L> {
        Arc::new(Mutex::new(self))
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn telemetry(&self) -> &TelemetryCache {
        &self.telemetry
    }

    /// After lockout only landing-cascade commands are transmitted.
    pub fn lock_out(&mut self) {
        if !self.locked_out {
            debug!("dispatcher locked out of motion commands");
        }
        self.locked_out = true;
    }

    pub fn is_locked_out(&self) -> bool {
        self.locked_out
    }

    /// Base response timeout plus the command family's padding. Monotonic
    /// in the command's declared distance or rotation.
    pub fn effective_timeout(&self, kind: &CommandKind) -> Duration {
        let rule = self.config.padding.rule(kind.family());
        self.config.base_timeout() + secs(rule.seconds(kind.magnitude()))
    }

    pub async fn resync(&mut self) -> bool {
        match self.link.resync().await {
            Ok(()) => true,
            Err(e) => {
                warn!("link resync failed: {}", e);
                false
            }
        }
    }

    fn next_id(&mut self) -> u32 {
        let command_id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1);
        self.stats.dispatched += 1;
        command_id
    }

    pub async fn dispatch(&mut self, request: CommandRequest) -> CommandOutcome {
        let command_id = self.next_id();

        if self.locked_out && !request.kind.is_landing_cascade() {
            return self.finish(command_id, request, 0, CommandOutcome::Rejected, Duration::ZERO, Some("locked out".into()));
        }
        if let Err(e) = request.kind.validate() {
            return self.finish(command_id, request, 0, CommandOutcome::Rejected, Duration::ZERO, Some(e.to_string()));
        }

        let timeout = self.effective_timeout(&request.kind);
        let baseline = self.telemetry.latest();
        let mut tracker = CommandTracker::new(command_id, request, Instant::now(), timeout);

        loop {
            tracker.record_attempt(Instant::now());
            let mut busy = false;
            let reason = match time::timeout(timeout, self.link.send(&request)).await {
                Ok(Ok(LinkReply::Ack)) => {
                    return self.finish(command_id, request, tracker.attempts, CommandOutcome::Acknowledged, timeout, None);
                }
                Ok(Ok(LinkReply::Rejected(reason))) => {
                    return self.finish(command_id, request, tracker.attempts, CommandOutcome::Rejected, timeout, Some(reason));
                }
                Ok(Ok(LinkReply::Busy(reason))) => {
                    busy = true;
                    format!("vehicle busy: {reason}")
                }
                Ok(Err(e)) => format!("link error: {e}"),
                Err(_) => format!("no reply within {} ms", timeout.as_millis()),
            };

            if self.effect_observed(&request.kind, baseline.as_ref()) {
                return self.finish(
                    command_id,
                    request,
                    tracker.attempts,
                    CommandOutcome::TimedOutConfirmed,
                    timeout,
                    Some(reason),
                );
            }
            if tracker.attempts >= self.config.max_attempts() {
                if let (true, CommandKind::Rotate { degrees }) = (busy, request.kind) {
                    if let Some(outcome) = self.turn_on_stick(degrees, request.origin, baseline.as_ref()).await {
                        return self.finish(
                            command_id,
                            request,
                            tracker.attempts,
                            outcome,
                            timeout,
                            Some(format!("{reason}; turned on the yaw stick")),
                        );
                    }
                }
                return self.finish(
                    command_id,
                    request,
                    tracker.attempts,
                    CommandOutcome::TimedOutUnconfirmed,
                    timeout,
                    Some(reason),
                );
            }

            // Never resend before the previous attempt's timeout has run out.
            time::sleep_until(tracker.retry_not_before()).await;
            if self.effect_observed(&request.kind, baseline.as_ref()) {
                return self.finish(
                    command_id,
                    request,
                    tracker.attempts,
                    CommandOutcome::TimedOutConfirmed,
                    timeout,
                    Some(reason),
                );
            }
            time::sleep(secs(self.config.retry_backoff_s)).await;

            self.stats.retries += 1;
            self.journal.record(JournalEvent::Retry {
                command_id,
                command: request.kind.to_string(),
                attempt: tracker.attempts + 1,
                reason,
            });
        }
    }

    /// Hold the yaw stick long enough to turn `degrees`, then center it.
    /// `None` when the fallback is off or the stick command never went out.
    async fn turn_on_stick(
        &mut self,
        degrees: i32,
        origin: CommandOrigin,
        baseline: Option<&TelemetrySnapshot>,
    ) -> Option<CommandOutcome> {
        let rc = self.config.rc_yaw.clone();
        if !rc.enabled() {
            return None;
        }
        // Positive yaw stick turns clockwise.
        let yaw = if degrees > 0 { -rc.speed } else { rc.speed };
        warn!("turning {} deg on the yaw stick (rc yaw {})", degrees, yaw);

        let hold = CommandKind::Rc { lateral: 0, forward: 0, vertical: 0, yaw };
        let held = self.send_once(hold, origin).await == CommandOutcome::Acknowledged;
        if held {
            time::sleep(rc.hold_for(degrees.unsigned_abs())).await;
        }
        if self.send_once(CommandKind::rc_stop(), origin).await != CommandOutcome::Acknowledged {
            warn!("yaw stick may still be deflected");
        }
        if !held {
            return None;
        }
        time::sleep(secs(rc.settle_s)).await;

        if self.effect_observed(&CommandKind::Rotate { degrees }, baseline) {
            Some(CommandOutcome::TimedOutConfirmed)
        } else {
            Some(CommandOutcome::Acknowledged)
        }
    }

    /// Single transmission without retries, for commands issued on behalf
    /// of another request.
    async fn send_once(&mut self, kind: CommandKind, origin: CommandOrigin) -> CommandOutcome {
        let command_id = self.next_id();
        let request = CommandRequest::new(kind, origin);
        let timeout = self.effective_timeout(&kind);
        let (outcome, detail) = match time::timeout(timeout, self.link.send(&request)).await {
            Ok(Ok(LinkReply::Ack)) => (CommandOutcome::Acknowledged, None),
            Ok(Ok(LinkReply::Rejected(reason) | LinkReply::Busy(reason))) => (CommandOutcome::Rejected, Some(reason)),
            Ok(Err(e)) => (CommandOutcome::TimedOutUnconfirmed, Some(format!("link error: {e}"))),
            Err(_) => (CommandOutcome::TimedOutUnconfirmed, Some(format!("no reply within {} ms", timeout.as_millis()))),
        };
        self.finish(command_id, request, 1, outcome, timeout, detail)
    }

    /// Whether the freshest telemetry shows the command's effect relative to
    /// the snapshot taken before the first attempt.
    fn effect_observed(&self, kind: &CommandKind, baseline: Option<&TelemetrySnapshot>) -> bool {
        let Some(now) = self.telemetry.latest() else {
            return false;
        };
        if baseline.is_some_and(|b| now.captured_at <= b.captured_at) {
            return false;
        }
        let tolerance = self.config.confirm_tolerance_cm;
        match *kind {
            CommandKind::Takeoff => now.height_cm >= self.config.takeoff_confirm_height_cm,
            CommandKind::Land => now.height_cm <= tolerance,
            CommandKind::Move { axis: MoveAxis::Up, distance_cm } => baseline
                .is_some_and(|b| now.height_cm - b.height_cm >= distance_cm as f32 - tolerance),
            CommandKind::Move { axis: MoveAxis::Down, distance_cm } => baseline
                .is_some_and(|b| b.height_cm - now.height_cm >= distance_cm as f32 - tolerance),
            CommandKind::Rotate { degrees } => baseline.is_some_and(|b| {
                let expected = wrap_degrees(degrees as f32);
                let yaw_tolerance = self.config.yaw_tolerance_deg;
                // Small turns and full revolutions look the same as no turn at all.
                if expected.abs() <= yaw_tolerance {
                    return false;
                }
                // Reported yaw grows clockwise; requests are counter-clockwise positive.
                let turned = wrap_degrees(b.attitude.yaw_deg - now.attitude.yaw_deg);
                wrap_degrees(turned - expected).abs() <= yaw_tolerance
            }),
            _ => false,
        }
    }

    fn finish(
        &mut self,
        command_id: u32,
        request: CommandRequest,
        attempts: u8,
        outcome: CommandOutcome,
        timeout: Duration,
        detail: Option<String>,
    ) -> CommandOutcome {
        match outcome {
            CommandOutcome::Acknowledged => self.stats.acknowledged += 1,
            CommandOutcome::TimedOutConfirmed => self.stats.confirmed += 1,
            CommandOutcome::TimedOutUnconfirmed => self.stats.unconfirmed += 1,
            CommandOutcome::Rejected => self.stats.rejected += 1,
        }
        self.journal.record(JournalEvent::Command {
            command_id,
            command: request.kind.to_string(),
            origin: request.origin,
            attempts,
            outcome,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            detail,
        });
        outcome
    }
}

/// Normalize to (-180, 180].
pub fn wrap_degrees(degrees: f32) -> f32 {
    let wrapped = degrees.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_degrees() {
        assert_eq!(wrap_degrees(190.0), -170.0);
        assert_eq!(wrap_degrees(-190.0), 170.0);
        assert_eq!(wrap_degrees(180.0), 180.0);
        assert_eq!(wrap_degrees(-180.0), 180.0);
        assert_eq!(wrap_degrees(720.0), 0.0);
    }
}
