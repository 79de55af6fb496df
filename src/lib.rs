//! # Sortie
//!
//! Mission execution engine for a small quadcopter flown over a lossy,
//! ack-less command link: follows a waypoint plan, optionally breaks off to
//! approach and hold on detected targets, and always finishes with an
//! attempted landing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sortie::{Dispatcher, Journal, Mission, MissionConfig, Plan, SimVehicle};
//! use sortie::telemetry::{spawn_telemetry_feed, telemetry_channel};
//!
//! # async fn fly() -> Result<(), sortie::error::MissionError> {
//! let config = MissionConfig::default();
//! let plan = Plan::load("plans/square.json")?;
//! let vehicle = SimVehicle::new();
//!
//! let (publisher, telemetry) = telemetry_channel();
//! spawn_telemetry_feed(vehicle.clone(), publisher, config.sensors.telemetry_cadence());
//!
//! let journal = Journal::new();
//! let dispatcher = Dispatcher::new(vehicle, telemetry.clone(), journal.clone(), config.dispatch.clone());
//! let report = Mission::new(config, plan, dispatcher.into_shared(), telemetry, journal).run().await;
//! println!("finished in {:?} at waypoint {}", report.final_mode, report.waypoint_index);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`dispatcher`] - one command in flight, timeouts, retries, telemetry confirmation
//! - [`route`] - waypoint legs decomposed into vehicle commands
//! - [`engagement`] - target centering, ranging and holding
//! - [`safety`] - landing cascade and vehicle-state monitor
//! - [`mission`] - the tick loop tying the controllers together
//! - [`telemetry`] / [`detection`] - single-slot feeds filled by producer tasks
//! - [`link`] - UDP transport speaking the vehicle's text SDK
//! - [`sim`] - simulated vehicle, link faults and camera

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod config;
pub mod detection;
pub mod dispatcher;
pub mod dry_run;
pub mod engagement;
pub mod error;
pub mod journal;
pub mod link;
pub mod mission;
pub mod plan;
pub mod protocol;
pub mod route;
pub mod safety;
pub mod sim;
pub mod telemetry;

// Re-export main public types for convenience
pub use config::{EngagementPolicy, MissionConfig};
pub use dispatcher::{Dispatcher, SharedDispatcher};
pub use engagement::{EngagementController, EngagementPhase};
pub use journal::{Journal, JournalEvent};
pub use link::{CommandLink, UdpLink, UdpTelemetry};
pub use mission::{CancelHandle, FlightMode, Mission, MissionReport};
pub use plan::{Plan, Waypoint};
pub use protocol::{CommandKind, CommandOutcome, CommandRequest};
pub use route::{ChunkedDecomposer, LegDecomposer, RoutePlayer};
pub use safety::{LandingReport, LandingStep, SafetyController};
pub use sim::SimVehicle;
