//! Reachable workspace of the two-link arm
//!
//! The XY reach is an annulus whose radii come from the law of cosines
//! evaluated at the elbow's angle limits; Z is a plain interval.

use serde::Serialize;
use crate::{config::WorkspaceConfig, gcode::Position, ArmError, Result};

/// Workspace bounds, fixed for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WorkspaceLimits {
    pub z_min: f64,
    pub z_max: f64,
    pub r_min: f64,
    pub r_max: f64,
}

/// Distance between the shoulder and the wrist for a given elbow angle cosine
pub fn reach_radius(low_link: f64, high_link: f64, angle_cos: f64) -> f64 {
    (low_link * low_link + high_link * high_link - 2.0 * low_link * high_link * angle_cos).sqrt()
}

impl WorkspaceLimits {
    pub fn from_geometry(config: &WorkspaceConfig) -> Self {
        let a = reach_radius(config.low_link_length, config.high_link_length, config.min_angle_cos);
        let b = reach_radius(config.low_link_length, config.high_link_length, config.max_angle_cos);
        Self {
            z_min: config.z_min,
            z_max: config.z_max,
            r_min: a.min(b),
            r_max: a.max(b),
        }
    }

    /// Like [`is_in_workspace`] but explains the rejection
    pub fn check(&self, pos: &Position) -> Result<()> {
        if is_in_workspace(pos, self) {
            return Ok(());
        }

        let mut reasons = Vec::new();
        let squared_radius = pos.x * pos.x + pos.y * pos.y;
        if squared_radius < self.r_min * self.r_min || squared_radius > self.r_max * self.r_max {
            reasons.push(format!(
                "radius {:.2} outside [{:.2}, {:.2}]",
                squared_radius.sqrt(), self.r_min, self.r_max
            ));
        }
        if pos.z < self.z_min || pos.z > self.z_max {
            reasons.push(format!("Z {:.2} outside [{:.2}, {:.2}]", pos.z, self.z_min, self.z_max));
        }

        Err(ArmError::OutOfWorkspace {
            x: pos.x,
            y: pos.y,
            z: pos.z,
            reason: reasons.join(", "),
        })
    }
}

impl Default for WorkspaceLimits {
    fn default() -> Self {
        Self::from_geometry(&WorkspaceConfig::default())
    }
}

/// Squared comparisons only; no square root on the accept path
pub fn is_in_workspace(pos: &Position, limits: &WorkspaceLimits) -> bool {
    let squared_radius = pos.x * pos.x + pos.y * pos.y;
    squared_radius >= limits.r_min * limits.r_min
        && squared_radius <= limits.r_max * limits.r_max
        && pos.z >= limits.z_min
        && pos.z <= limits.z_max
}
