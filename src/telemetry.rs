//! Telemetry cache: a single-slot, latest-wins snapshot refreshed by an
//! independent producer task.

use crate::error::LinkError;
use serde::Serialize;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Attitude {
    pub pitch_deg: f32,
    pub roll_deg: f32,
    pub yaw_deg: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Velocity {
    /// Horizontal speed estimate, cm/s.
    pub horizontal_cm_s: f32,
    /// Positive is up, cm/s.
    pub vertical_cm_s: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySnapshot {
    pub height_cm: f32,
    pub battery_pct: u8,
    pub attitude: Attitude,
    pub velocity: Velocity,
    pub captured_at: Instant,
}

static_assertions::assert_impl_all!(TelemetrySnapshot: Copy, Send, Sync);

impl TelemetrySnapshot {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.captured_at)
    }

    /// Parse the vehicle's `key:value;` state datagram.
    ///
    /// Unknown keys are ignored. Height and battery are required.
    pub fn parse_state(text: &str, captured_at: Instant) -> Result<Self, LinkError> {
        let mut height = None;
        let mut battery = None;
        let mut attitude = Attitude { pitch_deg: 0.0, roll_deg: 0.0, yaw_deg: 0.0 };
        let (mut vgx, mut vgy, mut vgz) = (0.0f32, 0.0f32, 0.0f32);

        for field in text.trim().split(';').filter(|f| !f.is_empty()) {
            let Some((key, value)) = field.split_once(':') else {
                return Err(LinkError::Malformed(format!("state field '{field}'")));
            };
            let parse = || {
                value
                    .trim()
                    .parse::<f32>()
                    .map_err(|_| LinkError::Malformed(format!("state value '{field}'")))
            };
            match key.trim() {
                "h" => height = Some(parse()?),
                "bat" => battery = Some(parse()?),
                "pitch" => attitude.pitch_deg = parse()?,
                "roll" => attitude.roll_deg = parse()?,
                "yaw" => attitude.yaw_deg = parse()?,
                "vgx" => vgx = parse()?,
                "vgy" => vgy = parse()?,
                "vgz" => vgz = parse()?,
                _ => {}
            }
        }

        let height_cm = height.ok_or_else(|| LinkError::Malformed("state missing h".into()))?;
        let battery = battery.ok_or_else(|| LinkError::Malformed("state missing bat".into()))?;
        Ok(Self {
            height_cm,
            battery_pct: battery.clamp(0.0, 100.0) as u8,
            attitude,
            // The vehicle reports velocity in dm/s with z pointing down.
            velocity: Velocity {
                horizontal_cm_s: vgx.hypot(vgy) * 10.0,
                vertical_cm_s: -vgz * 10.0,
            },
            captured_at,
        })
    }

    pub fn to_state_string(&self) -> String {
        format!(
            "pitch:{:.0};roll:{:.0};yaw:{:.0};vgx:{:.0};vgy:0;vgz:{:.0};h:{:.0};bat:{};\r\n",
            self.attitude.pitch_deg,
            self.attitude.roll_deg,
            self.attitude.yaw_deg,
            self.velocity.horizontal_cm_s / 10.0,
            -self.velocity.vertical_cm_s / 10.0,
            self.height_cm,
            self.battery_pct,
        )
    }
}

/// Read side of the telemetry slot. Cloned freely; never blocks.
#[derive(Debug, Clone)]
pub struct TelemetryCache {
    rx: watch::Receiver<Option<TelemetrySnapshot>>,
}

/// Write side of the telemetry slot; each publish overwrites the previous snapshot.
#[derive(Debug)]
pub struct TelemetryPublisher {
    tx: watch::Sender<Option<TelemetrySnapshot>>,
}

pub fn telemetry_channel() -> (TelemetryPublisher, TelemetryCache) {
    let (tx, rx) = watch::channel(None);
    (TelemetryPublisher { tx }, TelemetryCache { rx })
}

impl TelemetryPublisher {
    pub fn publish(&self, snapshot: TelemetrySnapshot) {
        self.tx.send_replace(Some(snapshot));
    }
}

impl TelemetryCache {
    pub fn latest(&self) -> Option<TelemetrySnapshot> {
        *self.rx.borrow()
    }

    /// Latest snapshot if it is no older than `max_age`.
    pub fn fresh(&self, now: Instant, max_age: Duration) -> Option<TelemetrySnapshot> {
        self.latest().filter(|s| s.age(now) <= max_age)
    }

    /// Wait up to `wait` for a snapshot that satisfies `accept`.
    pub async fn wait_for(
        &self,
        wait: Duration,
        mut accept: impl FnMut(&TelemetrySnapshot) -> bool,
    ) -> Option<TelemetrySnapshot> {
        let mut rx = self.rx.clone();
        let found = time::timeout(wait, rx.wait_for(|slot| slot.as_ref().is_some_and(&mut accept))).await;
        match found {
            Ok(Ok(slot)) => *slot,
            _ => None,
        }
    }
}

/// Anything that can be polled for a telemetry snapshot.
pub trait TelemetrySource: Send + 'static {
    fn poll(&mut self) -> impl Future<Output = Result<TelemetrySnapshot, LinkError>> + Send;
}

/// Poll `source` every `cadence` and publish into the cache until the source
/// reports the link closed.
pub fn spawn_telemetry_feed<S: TelemetrySource>(
    mut source: S,
    publisher: TelemetryPublisher,
    cadence: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(cadence);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match source.poll().await {
                Ok(snapshot) => publisher.publish(snapshot),
                Err(LinkError::Closed) => {
                    debug!("telemetry source closed");
                    break;
                }
                Err(e) => warn!("telemetry poll failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_datagram() {
        let now = Instant::now();
        let text = "mid:-1;x:0;y:0;z:0;pitch:1;roll:-2;yaw:45;vgx:3;vgy:4;vgz:-1;templ:60;temph:62;tof:10;h:80;bat:87;baro:12.3;time:5;agx:0;agy:0;agz:-1000;\r\n";
        let snapshot = TelemetrySnapshot::parse_state(text, now).unwrap();
        assert_eq!(snapshot.height_cm, 80.0);
        assert_eq!(snapshot.battery_pct, 87);
        assert_eq!(snapshot.attitude.yaw_deg, 45.0);
        assert!((snapshot.velocity.horizontal_cm_s - 50.0).abs() < 1e-3);
        assert!((snapshot.velocity.vertical_cm_s - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_parse_state_requires_height_and_battery() {
        let now = Instant::now();
        assert!(TelemetrySnapshot::parse_state("yaw:0;bat:50;", now).is_err());
        assert!(TelemetrySnapshot::parse_state("h:oops;bat:50;", now).is_err());
    }

    #[test]
    fn test_state_string_round_trips_core_fields() {
        let now = Instant::now();
        let snapshot = TelemetrySnapshot {
            height_cm: 120.0,
            battery_pct: 64,
            attitude: Attitude { pitch_deg: 0.0, roll_deg: 0.0, yaw_deg: -90.0 },
            velocity: Velocity { horizontal_cm_s: 0.0, vertical_cm_s: 0.0 },
            captured_at: now,
        };
        let parsed = TelemetrySnapshot::parse_state(&snapshot.to_state_string(), now).unwrap();
        assert_eq!(parsed.height_cm, 120.0);
        assert_eq!(parsed.battery_pct, 64);
        assert_eq!(parsed.attitude.yaw_deg, -90.0);
    }

    #[tokio::test]
    async fn test_cache_keeps_only_latest() {
        let (publisher, cache) = telemetry_channel();
        assert!(cache.latest().is_none());
        let now = Instant::now();
        let mut snapshot = TelemetrySnapshot {
            height_cm: 10.0,
            battery_pct: 90,
            attitude: Attitude { pitch_deg: 0.0, roll_deg: 0.0, yaw_deg: 0.0 },
            velocity: Velocity { horizontal_cm_s: 0.0, vertical_cm_s: 0.0 },
            captured_at: now,
        };
        publisher.publish(snapshot);
        snapshot.height_cm = 20.0;
        publisher.publish(snapshot);
        assert_eq!(cache.latest().map(|s| s.height_cm), Some(20.0));
        assert!(cache.fresh(now + Duration::from_secs(5), Duration::from_secs(1)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_matching_snapshot() {
        let (publisher, cache) = telemetry_channel();
        let start = Instant::now();
        tokio::spawn(async move {
            for height_cm in [10.0, 50.0, 90.0] {
                time::sleep(Duration::from_millis(100)).await;
                publisher.publish(TelemetrySnapshot {
                    height_cm,
                    battery_pct: 80,
                    attitude: Attitude { pitch_deg: 0.0, roll_deg: 0.0, yaw_deg: 0.0 },
                    velocity: Velocity { horizontal_cm_s: 0.0, vertical_cm_s: 0.0 },
                    captured_at: Instant::now(),
                });
            }
        });

        let found = cache.wait_for(Duration::from_secs(1), |s| s.height_cm > 40.0).await;
        assert_eq!(found.map(|s| s.height_cm), Some(50.0));
        assert!(found.is_some_and(|s| s.captured_at > start));

        let never = cache.wait_for(Duration::from_secs(1), |s| s.height_cm > 500.0).await;
        assert!(never.is_none());
    }
}
