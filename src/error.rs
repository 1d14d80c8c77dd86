//! Error types for arm motion control

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArmError>;

#[derive(Error, Debug)]
pub enum ArmError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No acknowledgement for '{command}' within {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("Device rejected '{command}': {response}")]
    DeviceRejected { command: String, response: String },

    #[error("Invalid G-code: {0}")]
    InvalidCommand(String),

    #[error("Target X{x} Y{y} Z{z} outside workspace: {reason}")]
    OutOfWorkspace {
        x: f64,
        y: f64,
        z: f64,
        reason: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Robot not connected")]
    NotConnected,

    #[error("Trajectory step {index} ('{command}') failed: {source}")]
    StepFailed {
        index: usize,
        command: String,
        #[source]
        source: Box<ArmError>,
    },

    #[error("Trajectory error: {0}")]
    Trajectory(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ArmError {
    /// Short machine-readable kind, used in JSON responses
    pub fn kind(&self) -> &'static str {
        match self {
            ArmError::Serial(_) | ArmError::Io(_) => "io",
            ArmError::Timeout { .. } => "timeout",
            ArmError::DeviceRejected { .. } => "device_rejected",
            ArmError::InvalidCommand(_) => "invalid_command",
            ArmError::OutOfWorkspace { .. } => "out_of_workspace",
            ArmError::InvalidRequest(_) => "invalid_request",
            ArmError::IllegalState(_) | ArmError::NotConnected => "illegal_state",
            ArmError::StepFailed { .. } => "step_failed",
            ArmError::Trajectory(_) => "trajectory",
            ArmError::Config(_) | ArmError::Yaml(_) | ArmError::Pattern(_) => "config",
            ArmError::Json(_) => "serialization",
            ArmError::Task(_) => "task",
        }
    }
}
