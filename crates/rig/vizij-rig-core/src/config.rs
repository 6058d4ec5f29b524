//! Core configuration for vizij-rig-core.

use serde::{Deserialize, Serialize};

/// Degrees of freedom per joint when scaling rows are kept (tx ty tz rx ry rz sx sy sz).
pub const DOF_WITH_SCALING: usize = 9;
/// Degrees of freedom per joint when scaling rows are discarded.
pub const DOF_WITHOUT_SCALING: usize = 6;

/// Options applied when building the engine tables from a rig definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Keep the three scaling rows per joint. Saving joint deltas requires it.
    pub with_joint_scaling: bool,
    /// Joint matrix values with an absolute value at or below this are dropped at load.
    pub discard_threshold: f64,
    /// Corrective partial derivatives must exceed this to enter the Jacobian.
    pub psd_jacobian_threshold: f64,
}

impl RigConfig {
    #[inline]
    pub fn dof_per_joint(&self) -> usize {
        if self.with_joint_scaling {
            DOF_WITH_SCALING
        } else {
            DOF_WITHOUT_SCALING
        }
    }
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            with_joint_scaling: false,
            discard_threshold: 1e-20,
            psd_jacobian_threshold: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_discard_scaling() {
        let cfg = RigConfig::default();
        assert!(!cfg.with_joint_scaling);
        assert_eq!(cfg.dof_per_joint(), 6);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: RigConfig = serde_json::from_str(r#"{ "with_joint_scaling": true }"#).unwrap();
        assert_eq!(cfg.dof_per_joint(), 9);
        assert_eq!(cfg.discard_threshold, 1e-20);
    }
}
