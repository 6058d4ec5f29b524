//! Contract for the RBF pose-matching collaborator.
//!
//! The engine never inspects pose data: it asks the solver for pose-control
//! values during corrective evaluation and for Euler overrides during joint
//! evaluation.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::diff::DiffData;
use crate::error::RigResult;

/// Drives rotation dofs 3..6 of `joint_index` from the quaternion stored at
/// control indices `(raw_x, raw_y, raw_z, raw_w)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EulerToRawMapping {
    pub raw_x: usize,
    pub raw_y: usize,
    pub raw_z: usize,
    pub raw_w: usize,
    pub joint_index: usize,
}

pub trait RbfSolver: Send + Sync + Debug {
    fn pose_names(&self) -> &[String];

    fn pose_control_names(&self) -> &[String];

    fn euler_control_names(&self) -> &[String];

    /// Pose-control values (and their Jacobian, when `raw` carries one) for a
    /// raw control vector.
    fn evaluate_pose_controls_from_raw(&self, raw: &DiffData) -> RigResult<DiffData>;

    /// Raw controls reconstructed from Euler angle controls.
    fn evaluate_raw_controls_from_euler(&self, euler: &DiffData) -> RigResult<DiffData>;

    fn euler_to_raw(&self) -> &[EulerToRawMapping];

    /// Forget the given joints and re-index the remaining ones. `removed` is
    /// sorted and unique.
    fn remove_joints(&mut self, removed: &[usize]);

    fn clone_box(&self) -> Box<dyn RbfSolver>;
}

impl Clone for Box<dyn RbfSolver> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Re-index a joint after removing the sorted `removed` joints, or `None` when
/// the joint itself is removed.
pub fn remap_joint_after_removal(joint: usize, removed: &[usize]) -> Option<usize> {
    match removed.binary_search(&joint) {
        Ok(_) => None,
        Err(shift) => Some(joint - shift),
    }
}
