//! Vizij Rig Core (engine-agnostic)
//!
//! Evaluates facial/body rigs: GUI controls are mapped to raw controls,
//! combined into correctives, ML network outputs and RBF poses, and finally
//! applied to per-LOD joint matrices and animated maps. Every stage can carry
//! an analytic Jacobian with respect to the GUI controls.
//!
//! Rig data comes in as a [`RigDefinition`] (JSON via
//! [`parse_rig_definition_json`]); [`RigLogic::init`] builds the engine tables.

pub mod config;
pub mod definition;
pub mod diff;
pub mod engine;
pub mod error;
pub mod joints;
pub mod mapping;
pub mod neural;
pub mod rbf;
pub mod reduce;
pub mod sparse;
pub mod symmetry;

// Re-exports for consumers (adapters)
pub use config::{RigConfig, DOF_WITHOUT_SCALING, DOF_WITH_SCALING};
pub use definition::{
    parse_rig_definition_json, JointDeltaWriter, JointGroupData, MappingData, MeshData,
    MeshRegionData, NeuralNetworkData, NeuralNetworkLayerData, PsdData, RigDefinition,
};
pub use diff::DiffData;
pub use engine::{quaternion_to_euler_xyz, ControlCounts, RigLogic};
pub use error::{RigError, RigResult};
pub use joints::{JointGroup, DEG_TO_RAD, RAD_TO_DEG};
pub use mapping::MappingEntry;
pub use neural::{ActivationFunction, NetworkOutput, NeuralNetwork};
pub use rbf::{EulerToRawMapping, RbfSolver};
pub use reduce::Expression;
pub use sparse::{SparseMatrix, SparseRowBuilder};
pub use symmetry::{mirror_gui_control_name, mirror_raw_control_candidates};
