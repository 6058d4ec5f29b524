//! Rig description data model (reader contract) and the joint-delta writer contract.
//!
//! The layout mirrors the binary rig format: parallel index/value arrays,
//! `u16` indices, `f32` values, joint rotations in degrees. [`RigLogic::init`]
//! reads it once; [`RigLogic::save_joint_deltas`] writes joint blocks back
//! through [`JointDeltaWriter`].
//!
//! [`RigLogic::init`]: crate::engine::RigLogic::init
//! [`RigLogic::save_joint_deltas`]: crate::engine::RigLogic::save_joint_deltas

use serde::{Deserialize, Serialize};

use crate::error::{RigError, RigResult};
use crate::neural::ActivationFunction;

/// Piecewise-linear mapping segments stored as parallel arrays.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MappingData {
    pub input_indices: Vec<u16>,
    pub output_indices: Vec<u16>,
    pub from_values: Vec<f32>,
    pub to_values: Vec<f32>,
    pub slope_values: Vec<f32>,
    pub cut_values: Vec<f32>,
}

impl MappingData {
    pub fn len(&self) -> usize {
        self.input_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_indices.is_empty()
    }

    fn check_lengths(&self, what: &str) -> RigResult<()> {
        let n = self.input_indices.len();
        let lens = [
            self.output_indices.len(),
            self.from_values.len(),
            self.to_values.len(),
            self.slope_values.len(),
            self.cut_values.len(),
        ];
        if lens.iter().any(|&l| l != n) {
            return Err(RigError::config(format!(
                "{what} arrays have mismatched lengths: {n} inputs vs {lens:?}"
            )));
        }
        Ok(())
    }
}

/// Corrective (PSD) entries: `row` is a control index in the PSD region,
/// `column` the control it multiplies.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PsdData {
    pub row_indices: Vec<u16>,
    pub column_indices: Vec<u16>,
    pub values: Vec<f32>,
}

/// One joint group block. `output_indices` encode `joint * 9 + dof`; `values`
/// is row-major `output_indices.len() x input_indices.len()`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct JointGroupData {
    pub joint_indices: Vec<u16>,
    /// Active output-row prefix per LOD.
    pub lods: Vec<u16>,
    pub input_indices: Vec<u16>,
    pub output_indices: Vec<u16>,
    pub values: Vec<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NeuralNetworkLayerData {
    /// Row-major `outputs x inputs`; the output count is `biases.len()`.
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
    pub activation: ActivationFunction,
    #[serde(default)]
    pub activation_params: Vec<f32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NeuralNetworkData {
    pub input_indices: Vec<u16>,
    pub output_indices: Vec<u16>,
    pub layers: Vec<NeuralNetworkLayerData>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshRegionData {
    pub name: String,
    pub neural_network_indices: Vec<u16>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MeshData {
    pub name: String,
    pub regions: Vec<MeshRegionData>,
}

/// Complete rig description consumed by the engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RigDefinition {
    pub name: String,
    pub lod_count: u16,

    pub gui_control_names: Vec<String>,
    pub raw_control_names: Vec<String>,
    pub psd_count: u16,
    pub ml_control_names: Vec<String>,
    pub rbf_pose_control_count: u16,

    pub gui_to_raw: MappingData,
    pub psd: PsdData,

    pub joint_names: Vec<String>,
    pub joint_row_count: u16,
    pub joint_column_count: u16,
    pub joint_groups: Vec<JointGroupData>,

    pub animated_map_count: u16,
    pub animated_map_lods: Vec<u16>,
    pub animated_maps: MappingData,

    pub neural_networks: Vec<NeuralNetworkData>,
    pub meshes: Vec<MeshData>,
}

impl RigDefinition {
    /// Structural checks that do not depend on control counts: parallel arrays
    /// must agree and joint blocks must match their index lists.
    pub fn validate_basic(&self) -> RigResult<()> {
        self.gui_to_raw.check_lengths("gui to raw")?;
        self.animated_maps.check_lengths("animated map")?;
        if self.psd.row_indices.len() != self.psd.column_indices.len()
            || self.psd.row_indices.len() != self.psd.values.len()
        {
            return Err(RigError::config("psd arrays have mismatched lengths"));
        }
        for (index, group) in self.joint_groups.iter().enumerate() {
            let expected = group.output_indices.len() * group.input_indices.len();
            if group.values.len() != expected {
                return Err(RigError::config(format!(
                    "joint group {index} has {} values, expected {expected}",
                    group.values.len()
                )));
            }
            if group.lods.len() < self.lod_count as usize {
                return Err(RigError::config(format!(
                    "joint group {index} lists {} lods, rig has {}",
                    group.lods.len(),
                    self.lod_count
                )));
            }
        }
        Ok(())
    }
}

/// Parse a rig definition from JSON and run [`RigDefinition::validate_basic`].
pub fn parse_rig_definition_json(s: &str) -> RigResult<RigDefinition> {
    let def: RigDefinition =
        serde_json::from_str(s).map_err(|e| RigError::Parse(e.to_string()))?;
    def.validate_basic()?;
    Ok(def)
}

/// Sink for re-serialized joint deltas.
pub trait JointDeltaWriter {
    fn set_joint_row_count(&mut self, count: u16);
    fn set_joint_column_count(&mut self, count: u16);
    fn clear_joint_groups(&mut self);
    fn set_joint_group_joint_indices(&mut self, group: u16, indices: &[u16]);
    fn set_joint_group_lods(&mut self, group: u16, lods: &[u16]);
    fn set_joint_group_input_indices(&mut self, group: u16, indices: &[u16]);
    fn set_joint_group_output_indices(&mut self, group: u16, indices: &[u16]);
    fn set_joint_group_values(&mut self, group: u16, values: &[f32]);
}

impl RigDefinition {
    fn joint_group_mut(&mut self, group: u16) -> &mut JointGroupData {
        let index = group as usize;
        if self.joint_groups.len() <= index {
            self.joint_groups
                .resize_with(index + 1, JointGroupData::default);
        }
        &mut self.joint_groups[index]
    }
}

impl JointDeltaWriter for RigDefinition {
    fn set_joint_row_count(&mut self, count: u16) {
        self.joint_row_count = count;
    }

    fn set_joint_column_count(&mut self, count: u16) {
        self.joint_column_count = count;
    }

    fn clear_joint_groups(&mut self) {
        self.joint_groups.clear();
    }

    fn set_joint_group_joint_indices(&mut self, group: u16, indices: &[u16]) {
        self.joint_group_mut(group).joint_indices = indices.to_vec();
    }

    fn set_joint_group_lods(&mut self, group: u16, lods: &[u16]) {
        self.joint_group_mut(group).lods = lods.to_vec();
    }

    fn set_joint_group_input_indices(&mut self, group: u16, indices: &[u16]) {
        self.joint_group_mut(group).input_indices = indices.to_vec();
    }

    fn set_joint_group_output_indices(&mut self, group: u16, indices: &[u16]) {
        self.joint_group_mut(group).output_indices = indices.to_vec();
    }

    fn set_joint_group_values(&mut self, group: u16, values: &[f32]) {
        self.joint_group_mut(group).values = values.to_vec();
    }
}
