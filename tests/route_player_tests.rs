mod common;

use common::{count, plan, Rig};
use sortie::config::{MissionConfig, RouteConfig};
use sortie::plan::Waypoint;
use sortie::protocol::{CommandKind, CommandOutcome};
use sortie::route::{LegCommands, LegDecomposer, RoutePlayer, RouteStep};
use sortie::sim::LinkFault;

#[tokio::test(start_paused = true)]
async fn test_every_waypoint_visited_once_in_order() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    let mut dispatcher = rig.dispatcher();
    let mut player = RoutePlayer::chunked(
        plan(&[(100.0, 0.0, 0.0), (0.0, 100.0, 0.0), (-100.0, 0.0, 20.0)]),
        RouteConfig::default(),
    );

    let mut index = 0;
    let mut visited = Vec::new();
    loop {
        match player.advance(index, &mut dispatcher).await {
            RouteStep::Leg(leg) => {
                assert!(leg.outcome.is_success());
                assert_eq!(leg.next_index, index + 1);
                visited.push(index);
                index = leg.next_index;
            }
            RouteStep::Completed => break,
        }
    }

    assert_eq!(visited, vec![0, 1, 2]);
    let pose = rig.vehicle.pose();
    assert!(pose.x_cm.abs() < 0.5, "x {}", pose.x_cm);
    assert!((pose.y_cm - 100.0).abs() < 0.5, "y {}", pose.y_cm);
    assert!((pose.z_cm - 100.0).abs() < 0.5, "z {}", pose.z_cm);
    assert!((player.heading_deg() - 180.0).abs() < 1e-3);
    assert_eq!(dispatcher.stats().retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_leg_keeps_index() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.inject(Some("forward"), LinkFault::Blackhole, u32::MAX);
    let mut dispatcher = rig.dispatcher();
    let mut player = RoutePlayer::chunked(plan(&[(0.0, 80.0, 0.0), (50.0, 0.0, 0.0)]), RouteConfig::default());

    let step = player.advance(0, &mut dispatcher).await;

    let RouteStep::Leg(leg) = step else {
        panic!("expected a leg result, got {step:?}");
    };
    assert_eq!(leg.outcome, CommandOutcome::TimedOutUnconfirmed);
    assert_eq!(leg.next_index, 0);
    assert_eq!(leg.failed_command, Some(CommandKind::forward(60)));
    // The turn went through but the heading is only committed with the leg.
    assert_eq!(player.heading_deg(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_past_the_end_is_completed() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    let mut dispatcher = rig.dispatcher();
    let mut player = RoutePlayer::chunked(plan(&[(50.0, 0.0, 0.0)]), RouteConfig::default());

    assert_eq!(player.advance(1, &mut dispatcher).await, RouteStep::Completed);
    assert_eq!(rig.vehicle.received(), vec![CommandKind::Takeoff]);
}

/// Flies every leg as one sideways-free move: turn, then a single forward.
struct SingleShot;

impl LegDecomposer for SingleShot {
    fn decompose(&self, waypoint: &Waypoint, heading_deg: f32) -> LegCommands {
        let turn = (waypoint.bearing_deg() - heading_deg).round() as i32;
        let mut commands = Vec::new();
        if turn != 0 {
            commands.push(CommandKind::Rotate { degrees: turn });
        }
        commands.push(CommandKind::forward(waypoint.horizontal_distance().round() as u32));
        LegCommands { commands, heading_after_deg: waypoint.bearing_deg(), dropped_cm: 0.0 }
    }
}

#[tokio::test(start_paused = true)]
async fn test_custom_decomposer() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    let mut dispatcher = rig.dispatcher();
    let mut player = RoutePlayer::new(plan(&[(0.0, 150.0, 0.0)]), SingleShot);

    let step = player.advance(0, &mut dispatcher).await;

    assert!(matches!(step, RouteStep::Leg(leg) if leg.next_index == 1));
    assert_eq!(
        rig.vehicle.executed(),
        vec![CommandKind::Takeoff, CommandKind::Rotate { degrees: 90 }, CommandKind::forward(150)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_heading_drift_is_turned_back_out_between_steps() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.set_yaw_drift(6.0);
    let mut dispatcher = rig.dispatcher();
    let mut player = RoutePlayer::chunked(plan(&[(180.0, 0.0, 0.0)]), RouteConfig::default());

    let step = player.advance(0, &mut dispatcher).await;

    assert!(matches!(step, RouteStep::Leg(leg) if leg.next_index == 1));
    let executed = rig.vehicle.executed();
    assert_eq!(count(&executed, |c| *c == CommandKind::forward(60)), 3);
    assert_eq!(count(&executed, |c| *c == CommandKind::Rotate { degrees: -6 }), 3);
    let pose = rig.vehicle.pose();
    assert!(pose.heading_deg.abs() < 0.5, "heading {}", pose.heading_deg);
    assert!((pose.x_cm - 180.0).abs() < 0.5 && pose.y_cm.abs() < 0.5);
    assert_eq!(player.heading_deg(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_drift_below_tolerance_accumulates_before_correction() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.set_yaw_drift(3.0);
    let mut dispatcher = rig.dispatcher();
    let mut player = RoutePlayer::chunked(plan(&[(180.0, 0.0, 0.0)]), RouteConfig::default());

    player.advance(0, &mut dispatcher).await;

    // 3 degrees is tolerated; the second step brings it to 6.
    let turns: Vec<CommandKind> =
        rig.vehicle.executed().into_iter().filter(|c| matches!(c, CommandKind::Rotate { .. })).collect();
    assert_eq!(turns, vec![CommandKind::Rotate { degrees: -6 }]);
    assert!((rig.vehicle.pose().heading_deg - 3.0).abs() < 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_custom_decomposer_flies_without_drift_checks() {
    let rig = Rig::airborne(MissionConfig::default()).await;
    rig.vehicle.set_yaw_drift(8.0);
    let mut dispatcher = rig.dispatcher();
    let mut player = RoutePlayer::new(plan(&[(150.0, 0.0, 0.0)]), SingleShot);

    player.advance(0, &mut dispatcher).await;

    assert_eq!(rig.vehicle.executed(), vec![CommandKind::Takeoff, CommandKind::forward(150)]);
}
