mod common;

use common::{count, events, Rig};
use sortie::config::MissionConfig;
use sortie::journal::JournalEvent;
use sortie::protocol::{CommandKind, CommandOrigin, CommandOutcome, CommandRequest};
use sortie::safety::{LandingStep, SafetyController};
use sortie::sim::{LinkFault, SimVehicle};

fn controller(rig: &Rig) -> SafetyController<SimVehicle> {
    SafetyController::new(rig.shared_dispatcher(), rig.telemetry.clone(), rig.config.safety.clone(), rig.journal.clone())
}

fn landing_steps(rig: &Rig) -> Vec<LandingStep> {
    events(&rig.journal)
        .into_iter()
        .filter_map(|e| match e {
            JournalEvent::Landing { step, .. } => Some(step),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_standard_land() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    let safety = controller(&rig);

    let report = safety.safe_land().await;

    assert_eq!(report.resolved_by, LandingStep::StandardLand);
    assert!(report.confirmed);
    assert_eq!(report.attempts.len(), 1);
    assert!(!rig.vehicle.is_airborne());
    assert_eq!(safety.has_landed(), Some(&report));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_cascade() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    let first = controller(&rig);
    let second = first.clone();

    let (a, b) = tokio::join!(first.safe_land(), second.safe_land());

    assert_eq!(a, b);
    assert_eq!(count(&rig.vehicle.received(), |c| *c == CommandKind::Land), 1);
    // Later calls return the settled report without touching the link.
    assert_eq!(first.safe_land().await, a);
    assert_eq!(count(&rig.vehicle.received(), |c| *c == CommandKind::Land), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_land_falls_back_to_manual_descent() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("land"), LinkFault::Blackhole, u32::MAX);
    let safety = controller(&rig);

    let report = safety.safe_land().await;

    assert_eq!(report.resolved_by, LandingStep::ManualDescent);
    assert!(report.confirmed);
    assert_eq!(landing_steps(&rig), vec![LandingStep::StandardLand, LandingStep::ManualDescent]);
    assert!(!rig.vehicle.is_airborne());
    assert!(!rig.vehicle.motors_cut());
    // The sticks are centered again once the descent ends.
    assert_eq!(rig.vehicle.executed().last(), Some(&CommandKind::rc_stop()));
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_vehicle_gets_motor_cutoff() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("land"), LinkFault::Blackhole, u32::MAX);
    rig.vehicle.inject(Some("rc"), LinkFault::Blackhole, u32::MAX);
    let safety = controller(&rig);

    let report = safety.safe_land().await;

    assert_eq!(report.resolved_by, LandingStep::MotorCutoff);
    assert!(report.confirmed);
    assert_eq!(
        landing_steps(&rig),
        vec![LandingStep::StandardLand, LandingStep::ManualDescent, LandingStep::MotorCutoff]
    );
    assert_eq!(report.attempts[1].outcome, CommandOutcome::TimedOutUnconfirmed);
    assert!(rig.vehicle.motors_cut());
}

#[tokio::test(start_paused = true)]
async fn test_refused_land_on_the_ground() {
    let rig = Rig::new(MissionConfig::default()).await;
    let safety = controller(&rig);

    let report = safety.safe_land().await;

    assert_eq!(report.resolved_by, LandingStep::AlreadyGrounded);
    assert!(report.confirmed);
    assert_eq!(report.attempts[0].outcome, CommandOutcome::Rejected);
    assert!(!rig.vehicle.received().contains(&CommandKind::EmergencyStop));
}

#[tokio::test(start_paused = true)]
async fn test_dispatcher_locked_out_after_landing() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    let dispatcher = rig.shared_dispatcher();
    let safety =
        SafetyController::new(dispatcher.clone(), rig.telemetry.clone(), rig.config.safety.clone(), rig.journal.clone());

    safety.safe_land().await;

    let mut dispatcher = dispatcher.lock().await;
    assert!(dispatcher.is_locked_out());
    let takeoff = CommandRequest::new(CommandKind::Takeoff, CommandOrigin::Route { waypoint: 0 });
    assert_eq!(dispatcher.dispatch(takeoff).await, CommandOutcome::Rejected);
    assert_eq!(count(&rig.vehicle.received(), |c| *c == CommandKind::Takeoff), 1);
}
