mod common;

use common::{count, Rig};
use sortie::config::MissionConfig;
use sortie::journal::JournalEvent;
use sortie::protocol::{CommandKind, CommandOrigin, CommandOutcome, CommandRequest, MoveAxis};
use sortie::sim::LinkFault;

fn route(kind: CommandKind) -> CommandRequest {
    CommandRequest::new(kind, CommandOrigin::Route { waypoint: 0 })
}

#[tokio::test(start_paused = true)]
async fn test_acknowledged_command() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    let mut dispatcher = rig.dispatcher();

    let outcome = dispatcher.dispatch(route(CommandKind::forward(60))).await;

    assert_eq!(outcome, CommandOutcome::Acknowledged);
    assert_eq!(dispatcher.stats().acknowledged, 1);
    assert_eq!(dispatcher.stats().retries, 0);
    assert_eq!(rig.journal.counts().commands, 1);
    assert!((rig.vehicle.pose().x_cm - 60.0).abs() < 1e-3);
}

#[tokio::test(start_paused = true)]
async fn test_effective_timeout_is_monotonic_in_distance() {
    let rig = Rig::new(MissionConfig::default()).await;
    let dispatcher = rig.dispatcher();

    let mut previous = dispatcher.effective_timeout(&CommandKind::forward(20));
    for distance in (40..=500).step_by(20) {
        let timeout = dispatcher.effective_timeout(&CommandKind::forward(distance));
        assert!(timeout >= previous, "{distance} cm");
        previous = timeout;
    }
    assert!(
        dispatcher.effective_timeout(&CommandKind::Rotate { degrees: 180 })
            >= dispatcher.effective_timeout(&CommandKind::Rotate { degrees: -30 })
    );
    assert!(dispatcher.effective_timeout(&CommandKind::Hover) >= rig.config.dispatch.base_timeout());
}

#[tokio::test(start_paused = true)]
async fn test_lost_reply_confirmed_by_telemetry_is_not_resent() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("up"), LinkFault::DropReply, 1);
    let mut dispatcher = rig.dispatcher();

    let outcome = dispatcher.dispatch(route(CommandKind::up(40))).await;

    assert_eq!(outcome, CommandOutcome::TimedOutConfirmed);
    let ups = |c: &CommandKind| matches!(c, CommandKind::Move { axis: MoveAxis::Up, .. });
    assert_eq!(count(&rig.vehicle.received(), ups), 1);
    assert_eq!(count(&rig.vehicle.executed(), ups), 1);
    assert_eq!(dispatcher.stats().retries, 0);
    assert!((rig.vehicle.pose().z_cm - 120.0).abs() < 1e-3);
}

#[tokio::test(start_paused = true)]
async fn test_lost_rotate_reply_confirmed_by_yaw() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("ccw"), LinkFault::DropReply, 1);
    let mut dispatcher = rig.dispatcher();

    let outcome = dispatcher.dispatch(route(CommandKind::Rotate { degrees: 90 })).await;

    assert_eq!(outcome, CommandOutcome::TimedOutConfirmed);
    assert_eq!(count(&rig.vehicle.received(), |c| matches!(c, CommandKind::Rotate { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_command_exhausts_retry_budget() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("forward"), LinkFault::Blackhole, u32::MAX);
    let mut dispatcher = rig.dispatcher();

    let outcome = dispatcher.dispatch(route(CommandKind::forward(60))).await;

    assert_eq!(outcome, CommandOutcome::TimedOutUnconfirmed);
    let attempts = u32::from(rig.config.dispatch.max_attempts());
    assert_eq!(rig.vehicle.fault_stats().blackholed, attempts);
    assert_eq!(dispatcher.stats().retries, attempts - 1);
    assert_eq!(rig.journal.counts().retries, attempts - 1);

    let retries: Vec<u8> = rig
        .journal
        .entries()
        .into_iter()
        .filter_map(|e| match e.event {
            JournalEvent::Retry { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmable_move_is_resent_after_lost_reply() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("forward"), LinkFault::DropReply, 1);
    let mut dispatcher = rig.dispatcher();

    let outcome = dispatcher.dispatch(route(CommandKind::forward(40))).await;

    assert_eq!(outcome, CommandOutcome::Acknowledged);
    assert_eq!(dispatcher.stats().retries, 1);
    // Horizontal moves cannot be confirmed, so the lost reply costs a second move.
    assert_eq!(count(&rig.vehicle.executed(), |c| *c == CommandKind::forward(40)), 2);
}

#[tokio::test(start_paused = true)]
async fn test_busy_vehicle_is_retried() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("cw"), LinkFault::Busy, 1);
    let mut dispatcher = rig.dispatcher();

    let outcome = dispatcher.dispatch(route(CommandKind::Rotate { degrees: -30 })).await;

    assert_eq!(outcome, CommandOutcome::Acknowledged);
    assert_eq!(dispatcher.stats().retries, 1);
    assert_eq!(rig.vehicle.executed(), vec![CommandKind::Takeoff, CommandKind::Rotate { degrees: -30 }]);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_rejection_is_not_retried() {
    let rig = Rig::new(MissionConfig::default()).await;
    let mut dispatcher = rig.dispatcher();

    // Still on the ground: the vehicle refuses to move.
    let outcome = dispatcher.dispatch(route(CommandKind::forward(60))).await;

    assert_eq!(outcome, CommandOutcome::Rejected);
    assert_eq!(dispatcher.stats().retries, 0);
    assert_eq!(rig.vehicle.received().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_request_never_transmitted() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    let mut dispatcher = rig.dispatcher();

    assert_eq!(dispatcher.dispatch(route(CommandKind::forward(10))).await, CommandOutcome::Rejected);
    assert_eq!(dispatcher.dispatch(route(CommandKind::forward(900))).await, CommandOutcome::Rejected);
    assert_eq!(
        dispatcher.dispatch(route(CommandKind::SetSpeed { cm_s: 5 })).await,
        CommandOutcome::Rejected
    );
    assert_eq!(rig.vehicle.received(), vec![CommandKind::Takeoff]);
}

#[tokio::test(start_paused = true)]
async fn test_lockout_only_admits_landing_commands() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    let mut dispatcher = rig.dispatcher();
    dispatcher.lock_out();

    assert_eq!(dispatcher.dispatch(route(CommandKind::forward(60))).await, CommandOutcome::Rejected);
    let land = CommandRequest::new(CommandKind::Land, CommandOrigin::Safety);
    assert_eq!(dispatcher.dispatch(land).await, CommandOutcome::Acknowledged);
    assert!(!rig.vehicle.is_airborne());
}

#[tokio::test(start_paused = true)]
async fn test_turns_indistinguishable_from_no_turn_are_never_confirmed() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("ccw"), LinkFault::Blackhole, u32::MAX);
    let mut dispatcher = rig.dispatcher();

    // Within the yaw tolerance, and a full revolution.
    for degrees in [8, 360] {
        let outcome = dispatcher.dispatch(route(CommandKind::Rotate { degrees })).await;
        assert_eq!(outcome, CommandOutcome::TimedOutUnconfirmed, "ccw {degrees}");
    }
    assert_eq!(dispatcher.stats().confirmed, 0);
    assert_eq!(count(&rig.vehicle.executed(), |c| matches!(c, CommandKind::Rotate { .. })), 0);
    assert!(rig.vehicle.pose().heading_deg.abs() < 1e-3);
}

#[tokio::test(start_paused = true)]
async fn test_turn_refused_for_imu_is_flown_on_the_yaw_stick() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("ccw"), LinkFault::Busy, u32::MAX);
    let mut dispatcher = rig.dispatcher();

    let outcome = dispatcher.dispatch(route(CommandKind::Rotate { degrees: 90 })).await;

    assert_eq!(outcome, CommandOutcome::TimedOutConfirmed);
    assert_eq!(dispatcher.stats().retries, u32::from(rig.config.dispatch.max_retries));
    let speed = rig.config.dispatch.rc_yaw.speed;
    assert_eq!(
        rig.vehicle.executed(),
        vec![
            CommandKind::Takeoff,
            CommandKind::Rc { lateral: 0, forward: 0, vertical: 0, yaw: -speed },
            CommandKind::rc_stop(),
        ]
    );
    let heading = rig.vehicle.pose().heading_deg;
    assert!((heading - 90.0).abs() < 3.0, "heading {heading}");
}

#[tokio::test(start_paused = true)]
async fn test_yaw_stick_fallback_can_be_switched_off() {
    let mut config = MissionConfig::default();
    config.dispatch.rc_yaw.speed = 0;
    let rig = Rig::airborne(config).await;
    rig.vehicle.inject(Some("cw"), LinkFault::Busy, u32::MAX);
    let mut dispatcher = rig.dispatcher();

    let outcome = dispatcher.dispatch(route(CommandKind::Rotate { degrees: -45 })).await;

    assert_eq!(outcome, CommandOutcome::TimedOutUnconfirmed);
    assert!(!rig.vehicle.received().iter().any(|c| matches!(c, CommandKind::Rc { .. })));
}
