//! Configuration loading for the arm daemon

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use crate::{Result, ArmError};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ArmConfig {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Preferred device path
    pub device: String,
    /// Tried when the preferred device cannot be opened
    pub fallback_device: Option<String>,
    pub baud_rate: u32,
    /// Length of one polling slice while waiting for a reply
    pub poll_slice_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Device reset time after the port is opened
    pub settle_delay_ms: u64,
    pub welcome_timeout_ms: u64,
    pub home_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub telemetry_timeout_ms: u64,
    /// Pause between trajectory steps during playback
    pub step_pause_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub low_link_length: f64,
    pub high_link_length: f64,
    pub min_angle_cos: f64,
    pub max_angle_cos: f64,
    pub z_min: f64,
    pub z_max: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MotionConfig {
    pub default_feed_rate: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub trajectory_dir: String,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            fallback_device: Some("/dev/ttyACM0".to_string()),
            baud_rate: 19200,
            poll_slice_ms: 80,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 5000,
            welcome_timeout_ms: 2000,
            home_timeout_ms: 5000,
            command_timeout_ms: 1000,
            telemetry_timeout_ms: 1000,
            step_pause_ms: 100,
        }
    }
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            low_link_length: 120.0,
            high_link_length: 120.0,
            min_angle_cos: 0.791436948,
            max_angle_cos: -0.774944489,
            z_min: -115.0,
            // low link length plus tool clearance
            z_max: 150.0,
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self { default_feed_rate: 1000.0 }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { trajectory_dir: "trajectories".to_string() }
    }
}

impl TimingConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.step_pause_ms)
    }
}

impl SerialConfig {
    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms.max(1))
    }

    /// Device paths in the order they should be tried
    pub fn device_paths(&self) -> Vec<String> {
        let mut paths = vec![self.device.clone()];
        if let Some(fallback) = &self.fallback_device {
            if fallback != &self.device {
                paths.push(fallback.clone());
            }
        }
        paths
    }
}

impl ArmConfig {
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        let contents = fs::read_to_string(config_path)
            .map_err(|e| ArmError::Config(format!("Failed to read {}: {}", config_path.display(), e)))?;

        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: ArmConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let ws = &self.workspace;
        if ws.low_link_length <= 0.0 || ws.high_link_length <= 0.0 {
            return Err(ArmError::Config("link lengths must be positive".to_string()));
        }
        if ws.z_min > ws.z_max {
            return Err(ArmError::Config(format!("z_min {} exceeds z_max {}", ws.z_min, ws.z_max)));
        }
        if !(-1.0..=1.0).contains(&ws.min_angle_cos) || !(-1.0..=1.0).contains(&ws.max_angle_cos) {
            return Err(ArmError::Config("angle cosines must lie in [-1, 1]".to_string()));
        }
        if self.serial.baud_rate == 0 {
            return Err(ArmError::Config("baud_rate must be non-zero".to_string()));
        }
        Ok(())
    }
}
