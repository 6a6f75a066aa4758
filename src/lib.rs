//! LiDAR session and mode control on top of a vendor Sensor Link.
//!
//! The crate keeps the bookkeeping a host needs around a LiDAR SDK:
//! which devices were discovered, where each one is in its connection
//! lifecycle, and how to switch a device between its operating modes.
//!
//! # Threading
//!
//! Sensor Link callbacks arrive on the link's own threads. They are forwarded
//! into a channel drained by a single worker that owns every connection state
//! transition, while the foreground thread runs the blocking console loop and
//! only reads the [`Registry`]. Mode changes block until the device has
//! acknowledged them, with a bounded wait.
//!
//! # Example
//!
//! ```no_run
//! use std::io;
//! use std::sync::Arc;
//!
//! use lidar_modectl::{Session, SessionConfig, SimulatedLink, SimulatorConfig};
//!
//! let link = Arc::new(SimulatedLink::new(SimulatorConfig::default()));
//! let session = Session::new(link, SessionConfig::default());
//! let report = session.run(&mut io::stdin().lock(), &mut io::stdout())?;
//! println!("{} mode change(s) on handle {}", report.mode_changes, report.handle);
//! # Ok::<(), lidar_modectl::SessionError>(())
//! ```

pub mod config;
pub mod discovery;
pub mod errors;
pub mod link;
pub mod logging;
pub mod mode;
pub mod registry;
pub mod session;
pub mod simulator;
pub mod state_machine;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use discovery::DiscoveryFilter;
pub use errors::{ControlError, LinkError, SessionError};
pub use link::{
    CommandAck, CommandStatus, DeviceEvent, DeviceInfo, Handle, LidarMode, SensorLink,
    WorkingState, MAX_DEVICES,
};
pub use mode::{ModeController, ModeOutcome, ModeRequest};
pub use registry::{ConnectionState, DeviceRecord, Registry};
pub use session::{Command, Session, SessionConfig, SessionReport};
pub use simulator::{SimDevice, SimulatedLink, SimulatorConfig};
pub use state_machine::{ConnectionStateMachine, LinkEvent};
