use clap::{App, Arg};
use sortie::link::{COMMAND_PORT, STATE_PORT};
use sortie::protocol::{CommandKind, LinkReply};
use sortie::sim::{LinkFaultConfig, SimTarget, SimVehicle};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, error, info, warn};

const STATE_BROADCAST_MS: u64 = 100;
const DATAGRAM_BUFFER_SIZE: usize = 1518;
/// Executions still pending after this long are abandoned (lost replies).
const EXECUTION_LIMIT: Duration = Duration::from_secs(60);

type Peer = Arc<Mutex<Option<SocketAddr>>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("sortie-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Simulated quadcopter speaking the text SDK over UDP")
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("IP")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("faults")
                .long("faults")
                .help("Randomly drop, swallow and refuse commands"),
        )
        .arg(
            Arg::with_name("target")
                .long("target")
                .value_name("LABEL,X,Y,Z")
                .takes_value(true)
                .multiple(true),
        )
        .get_matches();

    println!("🚁 Simulated Vehicle");
    println!("====================");

    let vehicle = SimVehicle::new();
    if matches.is_present("faults") {
        vehicle.set_fault_config(LinkFaultConfig { enabled: true, ..LinkFaultConfig::default() });
    }
    for spec in matches.values_of("target").into_iter().flatten() {
        match parse_target(spec) {
            Some(target) => vehicle.add_target(target),
            None => warn!("ignoring malformed target '{}'", spec),
        }
    }

    let ip = matches.value_of("bind").unwrap_or("127.0.0.1");
    let socket = Arc::new(UdpSocket::bind(format!("{ip}:{COMMAND_PORT}")).await?);
    info!("command socket listening on {}", socket.local_addr()?);
    let peer: Peer = Arc::new(Mutex::new(None));

    let state_vehicle = vehicle.clone();
    let state_peer = Arc::clone(&peer);
    let state_task = tokio::spawn(async move {
        if let Err(e) = broadcast_state(state_vehicle, state_peer).await {
            error!("state broadcast error: {}", e);
        }
    });

    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
    loop {
        let (len, from) = tokio::select! {
            received = socket.recv_from(&mut buf) => received?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let text = String::from_utf8_lossy(&buf[..len]).trim().to_string();
        debug!("<- {} '{}'", from, text);
        *peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(from);

        if text == "command" {
            socket.send_to(b"ok", from).await?;
            continue;
        }
        let kind = match text.parse::<CommandKind>() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("unknown command '{}': {}", text, e);
                socket.send_to(LinkReply::Rejected("Unknown command".into()).to_text().as_bytes(), from).await?;
                continue;
            }
        };
        if let Err(e) = kind.validate() {
            warn!("refusing '{}': {}", text, e);
            socket.send_to(LinkReply::Rejected("Out of range".into()).to_text().as_bytes(), from).await?;
            continue;
        }

        // Each command runs on its own task so a stuck one never blocks the socket.
        let reply_socket = Arc::clone(&socket);
        let command_vehicle = vehicle.clone();
        tokio::spawn(async move {
            match time::timeout(EXECUTION_LIMIT, command_vehicle.execute(kind)).await {
                Ok(Some(reply)) => {
                    let text = reply.to_text();
                    if let Err(e) = reply_socket.send_to(text.as_bytes(), from).await {
                        warn!("reply to {} failed: {}", from, e);
                    }
                    debug!("-> {} '{}'", from, text);
                }
                Ok(None) => debug!("no reply for '{}'", kind),
                Err(_) => warn!("'{}' abandoned", kind),
            }
        });
    }

    state_task.abort();
    let pose = vehicle.pose();
    println!(
        "🛬 Simulator stopped at ({:.0}, {:.0}, {:.0}) heading {:.0}°, {} faults injected",
        pose.x_cm,
        pose.y_cm,
        pose.z_cm,
        pose.heading_deg,
        vehicle.fault_stats().total_faults_injected
    );
    Ok(())
}

/// Send the state string to the last commanding peer's state port.
async fn broadcast_state(vehicle: SimVehicle, peer: Peer) -> std::io::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut interval = time::interval(Duration::from_millis(STATE_BROADCAST_MS));
    loop {
        interval.tick().await;
        let target = *peer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut target) = target else {
            continue;
        };
        target.set_port(STATE_PORT);
        let state = vehicle.snapshot().to_state_string();
        if let Err(e) = socket.send_to(state.as_bytes(), target).await {
            warn!("state datagram to {} failed: {}", target, e);
        }
    }
}

fn parse_target(spec: &str) -> Option<SimTarget> {
    let mut fields = spec.split(',').map(str::trim);
    let label = fields.next().filter(|l| !l.is_empty())?;
    let mut number = || fields.next().and_then(|v| v.parse::<f32>().ok());
    let (x, y, z) = (number()?, number()?, number()?);
    let confidence = number().unwrap_or(0.9);
    Some(SimTarget::new(label, x, y, z, confidence))
}
