//! Simulated vehicle used by the `sortie-sim` server, `sortie fly --simulate`
//! and the integration tests.

pub mod camera;
pub mod fault_injection;
pub mod vehicle;

pub use camera::{Optics, SimCamera, SimDetector};
pub use fault_injection::{LinkFault, LinkFaultConfig, LinkFaultInjector, LinkFaultStats};
pub use vehicle::{SimPose, SimTarget, SimVehicle, SimVehicleConfig};
