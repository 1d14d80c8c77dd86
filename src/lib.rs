//! armctl - G-code motion control for a serial-attached robot arm
//!
//! This library drives a small articulated arm whose controller board speaks
//! a G-code dialect over a serial line. It keeps a model of the arm (assumed
//! position, feed rate, effector and motor state), rejects targets outside
//! the reachable workspace before anything is sent, and records and replays
//! trajectories stored as plain G-code files.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use armctl::{ArmConfig, MotionController, WorkMode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut arm = MotionController::new(ArmConfig::load_from_path("config/default_config.yaml")?)?;
//!     arm.connect()?;
//!
//!     arm.begin_recording("pick")?;
//!     arm.record_step(150.0, 0.0, 20.0, 800.0)?;
//!     arm.set_effector(true)?;
//!     arm.record_step(150.0, 60.0, 20.0, 800.0)?;
//!     arm.end_recording()?;
//!
//!     arm.set_work_mode(WorkMode::Automatic)?;
//!     arm.run_stored("pick")?;
//!     arm.disconnect()?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **SerialTransport**: timeout-bounded request/response over the serial port
//! - **WorkspaceLimits**: reachable-workspace check derived from link geometry
//! - **GCodeParser**: validation and classification of single G-code lines
//! - **MotionController**: connection and work-mode state machine
//! - **TrajectoryStore**: trajectory files on disk
//! - **ArmService** / **Dispatcher**: serialized async access and method table

pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod gcode;
pub mod json_output;
pub mod service;
pub mod stream;
pub mod trajectory;
pub mod transport;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

// High-level exports for easy usage
pub use config::ArmConfig;
pub use controller::{ArmStatus, ConnectionState, MotionController, RunReport, WorkMode, WorkspaceInfo};
pub use dispatch::{CommandRequest, CommandResponse, Dispatcher, ServerContext, SessionStats};
pub use error::{ArmError, Result};
pub use service::ArmService;
pub use stream::CommandStream;

// Core component exports for advanced usage
pub use config::{MotionConfig, SerialConfig, StorageConfig, TimingConfig, WorkspaceConfig};
pub use gcode::{Command, CommandKind, CoordinateMode, GCodeParser, Position};
pub use trajectory::{check_program, ProgramReport, Trajectory, TrajectoryStore};
pub use transport::{Connector, Port, Reply, SerialConnector, SerialTransport, TelemetryFormat};
pub use workspace::{is_in_workspace, WorkspaceLimits};
