use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use sortie::config::{EngagementPolicy, MissionConfig};
use sortie::detection::{detection_channel, spawn_detection_feed, DetectionFilter};
use sortie::dry_run::{self, DryRunReport};
use sortie::error::MissionError;
use sortie::link::{CommandLink, UdpLink, UdpTelemetry, DEFAULT_VEHICLE_ADDR, STATE_PORT};
use sortie::mission::{Mission, MissionReport};
use sortie::plan::{find_latest_plan, Plan};
use sortie::sim::{LinkFaultConfig, Optics, SimCamera, SimDetector, SimTarget, SimVehicle};
use sortie::telemetry::{spawn_telemetry_feed, telemetry_channel, TelemetryCache};
use sortie::{Dispatcher, Journal};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn, Level};

const DEFAULT_PLAN_DIR: &str = "plans";
const DEFAULT_LOCAL_ADDR: &str = "0.0.0.0:0";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let plan_args = [
        Arg::with_name("plan").help("Plan file (JSON)").index(1),
        Arg::with_name("use-last")
            .long("use-last")
            .help("Use the newest plan in the plan directory")
            .conflicts_with("plan"),
        Arg::with_name("plan-dir")
            .long("plan-dir")
            .value_name("DIR")
            .takes_value(true)
            .default_value(DEFAULT_PLAN_DIR),
        Arg::with_name("config")
            .short("c")
            .long("config")
            .value_name("FILE")
            .help("Mission configuration (JSON)")
            .takes_value(true),
    ];

    let matches = App::new("sortie")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🚁 Waypoint mission runner with target engagement and safe landing")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Debug logging")
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("fly")
                .about("✈️  Fly a plan")
                .args(&plan_args)
                .arg(
                    Arg::with_name("policy")
                        .long("policy")
                        .value_name("POLICY")
                        .takes_value(true)
                        .possible_values(&["off", "approach-and-resume", "approach-and-hold"]),
                )
                .arg(
                    Arg::with_name("journal")
                        .long("journal")
                        .value_name("FILE")
                        .help("Append the mission journal as JSON lines")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("vehicle")
                        .long("vehicle")
                        .value_name("ADDR")
                        .takes_value(true)
                        .default_value(DEFAULT_VEHICLE_ADDR),
                )
                .arg(
                    Arg::with_name("simulate")
                        .long("simulate")
                        .help("Fly an in-process simulated vehicle instead of the real one"),
                )
                .arg(
                    Arg::with_name("target")
                        .long("target")
                        .value_name("LABEL,X,Y,Z[,CONF]")
                        .help("Place a target in the simulated world (cm)")
                        .takes_value(true)
                        .multiple(true)
                        .requires("simulate")
                        .validator(|v| parse_target(&v).map(|_| ())),
                )
                .arg(
                    Arg::with_name("faults")
                        .long("faults")
                        .help("Enable random link faults on the simulated vehicle")
                        .requires("simulate"),
                ),
        )
        .subcommand(
            SubCommand::with_name("dry-run")
                .about("🗺️  Preview the commands a plan would send")
                .args(&plan_args),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
    let format = matches.value_of("format").unwrap_or("table");

    match matches.subcommand() {
        ("fly", Some(sub)) => handle_fly(sub, format).await?,
        ("dry-run", Some(sub)) => handle_dry_run(sub, format)?,
        _ => println!("{}", "No command specified. Use --help for usage information.".yellow()),
    }
    Ok(())
}

fn load_inputs(matches: &ArgMatches<'_>) -> Result<(Plan, MissionConfig), MissionError> {
    let path = match matches.value_of("plan") {
        Some(path) => PathBuf::from(path),
        None if matches.is_present("use-last") => {
            find_latest_plan(matches.value_of("plan-dir").unwrap_or(DEFAULT_PLAN_DIR))?
        }
        None => PathBuf::from(DEFAULT_PLAN_DIR).join("plan.json"),
    };
    let plan = Plan::load(&path)?;
    let config = match matches.value_of("config") {
        Some(path) => MissionConfig::load(path)?,
        None => MissionConfig::default(),
    };
    Ok((plan, config))
}

fn handle_dry_run(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (plan, config) = load_inputs(matches)?;
    let report = dry_run::preview(&plan, &config);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_dry_run(&report),
    }
    Ok(())
}

async fn handle_fly(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (plan, mut config) = load_inputs(matches)?;
    if let Some(policy) = matches.value_of("policy") {
        config.engagement.policy = policy.parse::<EngagementPolicy>()?;
    }
    let journal = match matches.value_of("journal") {
        Some(path) => Journal::with_file(path).map_err(MissionError::Journal)?,
        None => Journal::new(),
    };

    let report = if matches.is_present("simulate") {
        let vehicle = SimVehicle::new();
        for spec in matches.values_of("target").into_iter().flatten() {
            vehicle.add_target(parse_target(spec)?);
        }
        if matches.is_present("faults") {
            vehicle.set_fault_config(LinkFaultConfig { enabled: true, ..LinkFaultConfig::default() });
        }

        let (publisher, telemetry) = telemetry_channel();
        spawn_telemetry_feed(vehicle.clone(), publisher, config.sensors.telemetry_cadence());
        let (detections, feed) = detection_channel();
        spawn_detection_feed(
            SimCamera::new(vehicle.clone()),
            SimDetector::new(vehicle.clone(), Optics::from_config(&config.engagement)),
            DetectionFilter::from_config(&config.engagement),
            detections,
            config.sensors.detection_poll(),
        );

        let dispatcher = Dispatcher::new(vehicle, telemetry.clone(), journal.clone(), config.dispatch.clone());
        let mission = Mission::new(config, plan, dispatcher.into_shared(), telemetry, journal).with_detections(feed);
        run_mission(mission).await
    } else {
        let vehicle: SocketAddr = matches.value_of("vehicle").unwrap_or(DEFAULT_VEHICLE_ADDR).parse()?;
        let local: SocketAddr = DEFAULT_LOCAL_ADDR.parse()?;
        let link = UdpLink::establish(local, vehicle, &config.connect).await?;

        let state_addr = SocketAddr::from(([0, 0, 0, 0], STATE_PORT));
        let (publisher, telemetry) = telemetry_channel();
        spawn_telemetry_feed(UdpTelemetry::bind(state_addr).await?, publisher, config.sensors.telemetry_cadence());
        match telemetry.wait_for(config.connect.first_telemetry(), |_| true).await {
            Some(snapshot) => info!("connected to {}, battery {}%", link.vehicle(), snapshot.battery_pct),
            None => warn!("no state broadcast from {} yet", link.vehicle()),
        }
        if config.engagement.policy != EngagementPolicy::Off {
            warn!("no video decoder on the real link, engagement stays idle");
        }
        run_real(link, telemetry, journal, config, plan).await
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_report(&report),
    }
    Ok(())
}

async fn run_real(
    link: UdpLink,
    telemetry: TelemetryCache,
    journal: Journal,
    config: MissionConfig,
    plan: Plan,
) -> MissionReport {
    let dispatcher = Dispatcher::new(link, telemetry.clone(), journal.clone(), config.dispatch.clone());
    run_mission(Mission::new(config, plan, dispatcher.into_shared(), telemetry, journal)).await
}

/// Run with Ctrl+C wired to the mission's cancel signal.
async fn run_mission<L: CommandLink>(mission: Mission<L>) -> MissionReport {
    let cancel = mission.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, landing");
            cancel.cancel();
        }
    });
    mission.run().await
}

fn parse_target(spec: &str) -> Result<SimTarget, String> {
    let fields: Vec<&str> = spec.split(',').map(str::trim).collect();
    if fields.len() < 4 || fields.len() > 5 || fields[0].is_empty() {
        return Err(format!("target '{spec}' must be LABEL,X,Y,Z[,CONFIDENCE]"));
    }
    let number = |s: &str| s.parse::<f32>().map_err(|_| format!("'{s}' is not a number"));
    let confidence = match fields.get(4) {
        Some(c) => number(c)?,
        None => 0.9,
    };
    Ok(SimTarget::new(fields[0], number(fields[1])?, number(fields[2])?, number(fields[3])?, confidence))
}

fn print_dry_run(report: &DryRunReport) {
    println!("{}", "🗺️  Plan Preview".bright_blue().bold());
    println!(
        "{} {} cm at {} cm/s",
        "Cruise:".bright_white(),
        report.cruise_height_cm,
        report.speed_cm_s
    );
    for leg in &report.legs {
        let dropped = if leg.dropped_cm > 0.0 {
            format!(" ({} cm dropped)", leg.dropped_cm).yellow()
        } else {
            "".normal()
        };
        println!(
            "  {} {:>2}: {} turns, {} moves, {} vertical, {} cm, ~{:.0}s{}",
            "wp".dimmed(),
            leg.index,
            leg.rotations,
            leg.horizontal_moves,
            leg.vertical_moves,
            leg.distance_cm,
            leg.estimated_secs,
            dropped
        );
        println!("       {}", leg.commands.join(" | ").bright_cyan());
    }
    println!(
        "{} {} commands, {} cm, ~{:.0}s including takeoff and landing",
        "Total:".bright_white().bold(),
        report.total_commands,
        report.total_distance_cm,
        report.estimated_secs
    );
}

fn print_report(report: &MissionReport) {
    if report.completed() {
        println!("{} {}", "✅".green(), "Mission complete".bright_green().bold());
    } else {
        println!("{} {}", "❌".red(), format!("Mission aborted: {:?}", report.abort_reason).bright_red().bold());
    }
    println!(
        "{} {}/{} waypoints, {} engagements, {:.1}s",
        "Route:".bright_white(),
        report.waypoint_index,
        report.plan_len,
        report.engagements,
        report.elapsed_ms as f64 / 1000.0
    );
    if report.rejected_corrections > 0 {
        println!(
            "{} {} engagement corrections refused",
            "Warning:".yellow(),
            report.rejected_corrections
        );
    }
    println!(
        "{} {} sent, {} retries, {} confirmed by telemetry, {} unconfirmed, {} rejected",
        "Commands:".bright_white(),
        report.stats.dispatched,
        report.stats.retries,
        report.stats.confirmed,
        report.stats.unconfirmed,
        report.stats.rejected
    );
    let landing = format!("{:?}", report.landing.resolved_by);
    let landing = if report.landing.confirmed { landing.green() } else { landing.red() };
    println!(
        "{} {} (height {})",
        "Landing:".bright_white(),
        landing,
        report
            .landing
            .final_height_cm
            .map_or_else(|| "unknown".to_string(), |h| format!("{h:.0} cm"))
    );
}
