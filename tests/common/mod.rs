#![allow(dead_code)]

use sortie::config::MissionConfig;
use sortie::detection::{detection_channel, spawn_detection_feed, DetectionFeed, DetectionFilter};
use sortie::dispatcher::SharedDispatcher;
use sortie::journal::{JournalEntry, JournalEvent};
use sortie::plan::{Plan, Waypoint};
use sortie::protocol::CommandKind;
use sortie::sim::{Optics, SimCamera, SimDetector, SimVehicle};
use sortie::telemetry::{spawn_telemetry_feed, telemetry_channel, TelemetryCache};
use sortie::{Dispatcher, Journal};
use tokio::time::{self, Duration};

/// Simulated vehicle wired to a telemetry cache, a journal and a dispatcher.
pub struct Rig {
    pub vehicle: SimVehicle,
    pub telemetry: TelemetryCache,
    pub journal: Journal,
    pub config: MissionConfig,
}

impl Rig {
    pub async fn new(config: MissionConfig) -> Self {
        let vehicle = SimVehicle::new();
        let (publisher, telemetry) = telemetry_channel();
        spawn_telemetry_feed(vehicle.clone(), publisher, config.sensors.telemetry_cadence());
        // Let the first snapshots land before anything is dispatched.
        time::sleep(Duration::from_millis(250)).await;
        Self { vehicle, telemetry, journal: Journal::new(), config }
    }

    pub async fn airborne(config: MissionConfig) -> Self {
        let rig = Self::new(config).await;
        rig.vehicle.execute(CommandKind::Takeoff).await;
        time::sleep(Duration::from_millis(250)).await;
        rig
    }

    pub fn dispatcher(&self) -> Dispatcher<SimVehicle> {
        Dispatcher::new(self.vehicle.clone(), self.telemetry.clone(), self.journal.clone(), self.config.dispatch.clone())
    }

    pub fn shared_dispatcher(&self) -> SharedDispatcher<SimVehicle> {
        self.dispatcher().into_shared()
    }

    pub fn detections(&self) -> DetectionFeed {
        let (publisher, feed) = detection_channel();
        spawn_detection_feed(
            SimCamera::new(self.vehicle.clone()),
            SimDetector::new(self.vehicle.clone(), Optics::from_config(&self.config.engagement)),
            DetectionFilter::from_config(&self.config.engagement),
            publisher,
            self.config.sensors.detection_poll(),
        );
        feed
    }
}

pub fn plan(points: &[(f32, f32, f32)]) -> Plan {
    Plan::new(points.iter().map(|&(x, y, z)| Waypoint::new(x, y, z)).collect()).unwrap()
}

pub fn count(commands: &[CommandKind], predicate: impl Fn(&CommandKind) -> bool) -> usize {
    commands.iter().filter(|c| predicate(c)).count()
}

pub fn events(journal: &Journal) -> Vec<JournalEvent> {
    journal.entries().into_iter().map(|JournalEntry { event, .. }| event).collect()
}
