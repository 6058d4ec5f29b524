//! Rig evaluation engine.
//!
//! Evaluation runs in stages, each taking and returning a [`DiffData`]:
//!
//! 1. [`RigLogic::evaluate_raw_controls`]: GUI controls to raw controls.
//! 2. [`RigLogic::evaluate_psd`]: raw controls to the full control vector
//!    (raw, correctives, ML outputs, RBF poses).
//! 3. [`RigLogic::evaluate_joints`] and [`RigLogic::evaluate_animated_maps`]:
//!    control vector to joint deltas / animated map values for one LOD.
//!
//! When the GUI input carries a Jacobian every stage premultiplies its local
//! Jacobian so all outputs stay differentiated with respect to the GUI controls.
//!
//! Tables are built once in [`RigLogic::init`]. Only the structural edits
//! (`reduce_*`, `remove_joints`, `mirror_joints`, `set_joint_matrix`) mutate
//! them, and those take `&mut self`.

use std::collections::BTreeMap;
use std::ops::Range;

use nalgebra::{DMatrix, DVector, Quaternion, UnitQuaternion};

use crate::config::RigConfig;
use crate::definition::{JointDeltaWriter, RigDefinition};
use crate::diff::DiffData;
use crate::error::{RigError, RigResult};
use crate::joints::{JointGroup, JointTables};
use crate::mapping::{AnimatedMapTable, GuiToRawTable};
use crate::neural::NeuralNetwork;
use crate::rbf::RbfSolver;
use crate::sparse::{SparseMatrix, SparseRowBuilder};

/// Region sizes of the control vector `raw ++ psd ++ ml ++ rbf_pose`, plus the
/// separate GUI input size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlCounts {
    pub gui: usize,
    pub raw: usize,
    pub psd: usize,
    pub ml: usize,
    pub rbf_pose: usize,
}

impl ControlCounts {
    #[inline]
    pub fn total(&self) -> usize {
        self.raw + self.psd + self.ml + self.rbf_pose
    }

    #[inline]
    pub fn psd_region(&self) -> Range<usize> {
        self.raw..self.raw + self.psd
    }

    #[inline]
    pub fn ml_region(&self) -> Range<usize> {
        let start = self.raw + self.psd;
        start..start + self.ml
    }

    #[inline]
    pub fn rbf_region(&self) -> Range<usize> {
        let start = self.raw + self.psd + self.ml;
        start..start + self.rbf_pose
    }
}

/// XYZ Euler angles (radians) of the rotation `(x, y, z, w)`. A quaternion too
/// close to zero to normalize yields zero angles.
pub fn quaternion_to_euler_xyz(x: f64, y: f64, z: f64, w: f64) -> [f64; 3] {
    match UnitQuaternion::try_new(Quaternion::new(w, x, y, z), f64::EPSILON) {
        Some(rotation) => {
            let (rx, ry, rz) = rotation.euler_angles();
            [rx, ry, rz]
        }
        None => [0.0; 3],
    }
}

#[derive(Clone, Debug)]
pub struct RigLogic {
    pub(crate) config: RigConfig,
    pub(crate) counts: ControlCounts,
    pub(crate) lod_count: usize,

    pub(crate) gui_control_names: Vec<String>,
    pub(crate) raw_control_names: Vec<String>,
    pub(crate) ml_control_names: Vec<String>,
    pub(crate) ml_network_names: Vec<String>,
    pub(crate) joint_names: Vec<String>,

    pub(crate) gui_to_raw: GuiToRawTable,
    /// `(raw + psd) x total`, identity over the raw rows.
    pub(crate) psd_map: SparseMatrix,
    pub(crate) psd_depends_on_ml_or_rbf: bool,
    pub(crate) joints: JointTables,
    pub(crate) animated_maps: AnimatedMapTable,
    pub(crate) networks: Vec<NeuralNetwork>,
    /// `(control index, network, network output)` sorted by control index.
    pub(crate) network_outputs: Vec<(usize, usize, usize)>,

    pub(crate) rbf: Option<Box<dyn RbfSolver>>,
}

impl RigLogic {
    pub fn init(def: &RigDefinition, config: RigConfig) -> RigResult<Self> {
        def.validate_basic()?;

        let counts = ControlCounts {
            gui: def.gui_control_names.len(),
            raw: def.raw_control_names.len(),
            psd: def.psd_count as usize,
            ml: def.ml_control_names.len(),
            rbf_pose: def.rbf_pose_control_count as usize,
        };
        let total = counts.total();
        log::debug!(
            "num controls: [gui {}] [raw {}] [psd {}] [ml {}] [rbf {}] => {}",
            counts.gui,
            counts.raw,
            counts.psd,
            counts.ml,
            counts.rbf_pose,
            total
        );

        let gui_to_raw = GuiToRawTable::build(counts.gui, counts.raw, &def.gui_to_raw)?;
        if counts.gui > 0 {
            let mut raw_used = vec![false; counts.raw];
            for entry in gui_to_raw.entries() {
                raw_used[entry.output] = true;
            }
            let unused: Vec<&str> = raw_used
                .iter()
                .zip(&def.raw_control_names)
                .filter(|(used, _)| !**used)
                .map(|(_, name)| name.as_str())
                .collect();
            if !unused.is_empty() {
                log::debug!(
                    "{} out of {} raw controls are not mapped by gui controls: {:?}",
                    unused.len(),
                    counts.raw,
                    unused
                );
            }
        }

        let (psd_map, psd_depends_on_ml_or_rbf) = build_psd_map(def, &counts)?;
        let joints = JointTables::build(def, &config, total)?;
        let lod_count = def.lod_count as usize;
        let animated_maps = AnimatedMapTable::build(
            total,
            def.animated_map_count as usize,
            lod_count,
            &def.animated_map_lods,
            &def.animated_maps,
        )?;

        log::debug!("number of neural networks in rig: {}", def.neural_networks.len());
        let networks = def
            .neural_networks
            .iter()
            .enumerate()
            .map(|(index, data)| NeuralNetwork::from_data(index, data, total, counts.ml_region()))
            .collect::<RigResult<Vec<_>>>()?;
        let network_outputs = sorted_network_outputs(&networks)?;
        let ml_network_names = ml_network_names(def, networks.len())?;

        Ok(Self {
            config,
            counts,
            lod_count,
            gui_control_names: def.gui_control_names.clone(),
            raw_control_names: def.raw_control_names.clone(),
            ml_control_names: def.ml_control_names.clone(),
            ml_network_names,
            joint_names: def.joint_names.clone(),
            gui_to_raw,
            psd_map,
            psd_depends_on_ml_or_rbf,
            joints,
            animated_maps,
            networks,
            network_outputs,
            rbf: None,
        })
    }

    /// Attach the pose-matching collaborator.
    pub fn with_rbf_solver(mut self, solver: Box<dyn RbfSolver>) -> Self {
        self.set_rbf_solver(Some(solver));
        self
    }

    pub fn set_rbf_solver(&mut self, solver: Option<Box<dyn RbfSolver>>) {
        if let Some(solver) = &solver {
            let poses = solver.pose_control_names().len();
            if poses != self.counts.rbf_pose {
                log::warn!(
                    "rbf solver provides {poses} pose controls, rig expects {}",
                    self.counts.rbf_pose
                );
            }
        }
        self.rbf = solver;
    }

    // --- introspection -------------------------------------------------------

    #[inline]
    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    #[inline]
    pub fn counts(&self) -> ControlCounts {
        self.counts
    }

    #[inline]
    pub fn lod_count(&self) -> usize {
        self.lod_count
    }

    #[inline]
    pub fn num_joints(&self) -> usize {
        self.joints.num_joints()
    }

    #[inline]
    pub fn with_joint_scaling(&self) -> bool {
        self.joints.with_scaling()
    }

    pub fn gui_control_names(&self) -> &[String] {
        &self.gui_control_names
    }

    pub fn raw_control_names(&self) -> &[String] {
        &self.raw_control_names
    }

    pub fn ml_control_names(&self) -> &[String] {
        &self.ml_control_names
    }

    /// Network names taken from the mesh regions that reference them,
    /// `"Unknown"` otherwise.
    pub fn ml_network_names(&self) -> &[String] {
        &self.ml_network_names
    }

    pub fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    /// `[min, max]` domain per GUI control.
    pub fn gui_control_ranges(&self) -> &[[f64; 2]] {
        self.gui_to_raw.ranges()
    }

    pub fn gui_to_raw(&self) -> &GuiToRawTable {
        &self.gui_to_raw
    }

    pub fn psd_to_raw_map(&self) -> &SparseMatrix {
        &self.psd_map
    }

    /// Whether any corrective reads an ML or RBF control.
    pub fn psd_depends_on_ml_or_rbf(&self) -> bool {
        self.psd_depends_on_ml_or_rbf
    }

    pub fn neural_networks(&self) -> &[NeuralNetwork] {
        &self.networks
    }

    pub fn animated_maps(&self) -> &AnimatedMapTable {
        &self.animated_maps
    }

    pub fn rbf_solver(&self) -> Option<&dyn RbfSolver> {
        self.rbf.as_deref()
    }

    pub fn joint_matrix(&self, lod: usize) -> RigResult<&SparseMatrix> {
        self.joints.matrix(lod)
    }

    /// Joint group owning each joint, `None` for joints outside every group.
    pub fn joint_group_index_per_joint(&self) -> &[Option<usize>] {
        self.joints.group_per_joint()
    }

    pub fn joint_groups(&self) -> &[JointGroup] {
        self.joints.groups()
    }

    // --- evaluation ----------------------------------------------------------

    pub fn evaluate_raw_controls(&self, gui: &DiffData) -> RigResult<DiffData> {
        if gui.size() != self.counts.gui {
            return Err(RigError::config(format!(
                "gui control count incorrect: {} instead of {}",
                gui.size(),
                self.counts.gui
            )));
        }
        let output = self.gui_to_raw.evaluate(gui.value());
        let jacobian = if gui.has_jacobian() {
            gui.propagate(&self.gui_to_raw.local_jacobian(gui.value())?)?
        } else {
            None
        };
        DiffData::new(output, jacobian)
    }

    /// Raw controls reconstructed from Euler controls by the RBF solver. Empty
    /// when no solver is attached.
    pub fn evaluate_raw_rbf_controls(&self, euler: &DiffData) -> RigResult<DiffData> {
        match &self.rbf {
            Some(solver) => solver.evaluate_raw_controls_from_euler(euler),
            None => Ok(DiffData::constant(DVector::zeros(0))),
        }
    }

    /// Fill the full control vector from raw controls. `mask_weights[n]` scales
    /// network `n`; missing entries default to 1 and weights `<= 0` skip the
    /// network, leaving its outputs at zero.
    pub fn evaluate_psd(&self, raw: &DiffData, mask_weights: &[f64]) -> RigResult<DiffData> {
        let counts = self.counts;
        if raw.size() != counts.raw {
            return Err(RigError::config(format!(
                "raw control count incorrect: {} instead of {}",
                raw.size(),
                counts.raw
            )));
        }
        let with_jacobian = raw.has_jacobian();
        let mut output = DVector::zeros(counts.total());
        output.rows_mut(0, counts.raw).copy_from(raw.value());

        if let Some(solver) = &self.rbf {
            let poses = solver.evaluate_pose_controls_from_raw(raw)?;
            if poses.size() == counts.rbf_pose {
                output
                    .rows_mut(counts.rbf_region().start, counts.rbf_pose)
                    .copy_from(poses.value());
            } else if poses.size() != 0 {
                log::error!(
                    "invalid rbf pose controls size: {}, expected {}",
                    poses.size(),
                    counts.rbf_pose
                );
            }
        }

        let mut network_jacobians: Vec<Option<DMatrix<f64>>> = vec![None; self.networks.len()];
        for (index, network) in self.networks.iter().enumerate() {
            let mask = mask_weights.get(index).copied().unwrap_or(1.0);
            if mask.is_nan() || mask <= 0.0 {
                continue;
            }
            let result = network.evaluate(index, &output, with_jacobian)?;
            for (net_output, &control) in network.output_indices().iter().enumerate() {
                output[control] = mask * result.values[net_output];
            }
            network_jacobians[index] = result.jacobian.map(|j| j * mask);
        }

        for row in counts.psd_region() {
            output[row] = if self.psd_map.row_nnz(row) > 0 {
                self.psd_map
                    .row(row)
                    .map(|(col, coef)| output[col].clamp(0.0, 1.0) * coef)
                    .product()
            } else {
                0.0
            };
        }

        // The Jacobian sees the correctives before the final clamp.
        let jacobian = if with_jacobian {
            let local = self.psd_local_jacobian(&output, &network_jacobians)?;
            raw.propagate(&local)?
        } else {
            None
        };

        for row in counts.psd_region() {
            output[row] = output[row].clamp(0.0, 1.0);
        }
        DiffData::new(output, jacobian)
    }

    /// Local Jacobian `total x raw` of the control vector: identity over raw
    /// rows and product-rule rows for correctives, both only where the value
    /// lies inside `[0, 1]`. Network rows sit at their control index and RBF
    /// rows stay empty.
    fn psd_local_jacobian(
        &self,
        values: &DVector<f64>,
        network_jacobians: &[Option<DMatrix<f64>>],
    ) -> RigResult<SparseMatrix> {
        let raw_count = self.counts.raw;
        let threshold = self.config.psd_jacobian_threshold;
        let mut builder =
            SparseRowBuilder::with_capacity(self.counts.total(), raw_count, self.psd_map.nnz());

        for row in (0..raw_count).filter(|&r| (0.0..=1.0).contains(&values[r])) {
            builder.begin_row(row)?;
            builder.push(row, 1.0)?;
        }

        for row in self.counts.psd_region() {
            let weight = values[row];
            if self.psd_map.row_nnz(row) == 0 || !(0.0..=1.0).contains(&weight) {
                continue;
            }
            // a zero corrective can still have non-zero partials: d(a*b)/db = a
            let mut partials: BTreeMap<usize, f64> = BTreeMap::new();
            for (col, coef) in self.psd_map.row(row) {
                let others: f64 = self
                    .psd_map
                    .row(row)
                    .filter(|&(c, _)| c != col)
                    .map(|(c, v)| values[c].clamp(0.0, 1.0) * v)
                    .product();
                let partial = others * coef;
                if partial <= threshold {
                    continue;
                }
                if col < raw_count {
                    *partials.entry(col).or_default() += partial;
                } else if let Some((net, net_output)) = self.network_output_at(col) {
                    if let Some(j) = &network_jacobians[net] {
                        for &(control, net_input) in self.networks[net].sorted_inputs() {
                            if control < raw_count {
                                *partials.entry(control).or_default() +=
                                    partial * j[(net_output, net_input)];
                            }
                        }
                    }
                }
            }
            builder.begin_row(row)?;
            for (col, value) in partials {
                if value != 0.0 {
                    builder.push(col, value)?;
                }
            }
        }

        for &(control, net, net_output) in &self.network_outputs {
            let Some(j) = &network_jacobians[net] else {
                continue;
            };
            builder.begin_row(control)?;
            for &(input, net_input) in self.networks[net].sorted_inputs() {
                let value = j[(net_output, net_input)];
                if input < raw_count && value != 0.0 {
                    builder.push(input, value)?;
                }
            }
        }
        builder.finish()
    }

    fn network_output_at(&self, control: usize) -> Option<(usize, usize)> {
        self.network_outputs
            .binary_search_by_key(&control, |&(c, _, _)| c)
            .ok()
            .map(|i| (self.network_outputs[i].1, self.network_outputs[i].2))
    }

    fn check_control_vector(&self, controls: &DiffData) -> RigResult<()> {
        if controls.size() != self.counts.total() {
            return Err(RigError::config(format!(
                "control count incorrect: {} instead of {}",
                controls.size(),
                self.counts.total()
            )));
        }
        Ok(())
    }

    /// Joint deltas for `lod`. Rotation dofs of joints driven by RBF Euler
    /// mappings are overwritten after the matrix product; the Jacobian does not
    /// include that override.
    pub fn evaluate_joints(&self, controls: &DiffData, lod: usize) -> RigResult<DiffData> {
        self.check_control_vector(controls)?;
        let matrix = self.joints.matrix(lod)?;
        let values = controls.value();
        let mut output = matrix.mul_vec(values)?;

        if let Some(solver) = &self.rbf {
            let dof = self.joints.dof_per_joint();
            let read = |index: usize| {
                values.get(index).copied().ok_or_else(|| {
                    RigError::config(format!("euler mapping reads invalid control {index}"))
                })
            };
            for mapping in solver.euler_to_raw() {
                if mapping.joint_index >= self.joints.num_joints() {
                    return Err(RigError::config(format!(
                        "euler mapping drives invalid joint {}",
                        mapping.joint_index
                    )));
                }
                let euler = quaternion_to_euler_xyz(
                    read(mapping.raw_x)?,
                    read(mapping.raw_y)?,
                    read(mapping.raw_z)?,
                    read(mapping.raw_w)?,
                );
                let base = mapping.joint_index * dof + 3;
                output.rows_mut(base, 3).copy_from_slice(&euler);
            }
        }

        let jacobian = controls.propagate(matrix)?;
        DiffData::new(output, jacobian)
    }

    /// Joint deltas for a caller-composed joint matrix.
    pub fn evaluate_joints_with_matrix(
        &self,
        controls: &DiffData,
        matrix: &SparseMatrix,
    ) -> RigResult<DiffData> {
        if controls.size() != matrix.cols() {
            return Err(RigError::config(format!(
                "joint matrix has {} columns for {} controls",
                matrix.cols(),
                controls.size()
            )));
        }
        let output = matrix.mul_vec(controls.value())?;
        let jacobian = controls.propagate(matrix)?;
        DiffData::new(output, jacobian)
    }

    pub fn evaluate_animated_maps(&self, controls: &DiffData, lod: usize) -> RigResult<DiffData> {
        self.check_control_vector(controls)?;
        if lod >= self.lod_count {
            return Err(RigError::config(format!(
                "invalid lod {lod}, rig has {} lods",
                self.lod_count
            )));
        }
        let output = self.animated_maps.evaluate(controls.value(), lod);
        let jacobian = if controls.has_jacobian() {
            controls.propagate(&self.animated_maps.local_jacobian(controls.value(), lod)?)?
        } else {
            None
        };
        DiffData::new(output, jacobian)
    }

    // --- structural edits ----------------------------------------------------

    pub fn set_joint_matrix(&mut self, lod: usize, matrix: SparseMatrix) -> RigResult<()> {
        self.joints.set_matrix(lod, matrix)
    }

    /// Drop every LOD but the first.
    pub fn reduce_to_lod0_only(&mut self) {
        self.lod_count = self.lod_count.min(1);
        self.joints.truncate_lods(self.lod_count);
        self.animated_maps.truncate_lods(self.lod_count);
    }

    /// Write the joint groups of the current matrices back to `writer`.
    /// Requires joint scaling.
    pub fn save_joint_deltas(&self, writer: &mut dyn JointDeltaWriter) -> RigResult<()> {
        self.joints.save_deltas(writer)
    }
}

fn build_psd_map(def: &RigDefinition, counts: &ControlCounts) -> RigResult<(SparseMatrix, bool)> {
    let total = counts.total();
    let psd_rows = counts.psd_region();
    let ml_or_rbf = counts.raw + counts.psd..total;
    let mut triplets: Vec<(usize, usize, f64)> = (0..counts.raw).map(|i| (i, i, 1.0)).collect();
    let mut depends_on_ml_or_rbf = false;
    for ((&row, &col), &value) in def
        .psd
        .row_indices
        .iter()
        .zip(&def.psd.column_indices)
        .zip(&def.psd.values)
    {
        let (row, col) = (row as usize, col as usize);
        if !psd_rows.contains(&row) {
            return Err(RigError::config(format!(
                "psd control mapping invalid: row {row} outside the corrective region {psd_rows:?}"
            )));
        }
        let reads_ml_or_rbf = ml_or_rbf.contains(&col);
        if col >= counts.raw && !reads_ml_or_rbf {
            return Err(RigError::config(format!(
                "psd control mapping invalid: psd {row} uses {col} as input, but max {} raw controls",
                counts.raw
            )));
        }
        depends_on_ml_or_rbf |= reads_ml_or_rbf;
        triplets.push((row, col, value as f64));
    }
    let map = SparseMatrix::from_triplets(counts.raw + counts.psd, total, &triplets)?;
    Ok((map, depends_on_ml_or_rbf))
}

fn sorted_network_outputs(networks: &[NeuralNetwork]) -> RigResult<Vec<(usize, usize, usize)>> {
    let mut outputs: Vec<(usize, usize, usize)> = networks
        .iter()
        .enumerate()
        .flat_map(|(net, network)| {
            network
                .output_indices()
                .iter()
                .enumerate()
                .map(move |(net_output, &control)| (control, net, net_output))
        })
        .collect();
    outputs.sort_unstable();
    if let Some(pair) = outputs.windows(2).find(|pair| pair[0].0 == pair[1].0) {
        return Err(RigError::config(format!(
            "ml control {} is written by networks {} and {}",
            pair[0].0, pair[0].1, pair[1].1
        )));
    }
    Ok(outputs)
}

fn ml_network_names(def: &RigDefinition, network_count: usize) -> RigResult<Vec<String>> {
    let mut names = vec![String::from("Unknown"); network_count];
    for mesh in &def.meshes {
        for (region_index, region) in mesh.regions.iter().enumerate() {
            for &net in &region.neural_network_indices {
                let net = net as usize;
                if net != region_index {
                    log::warn!(
                        "ml network for mesh {}, region {} points to neural net {}",
                        mesh.name,
                        region.name,
                        net
                    );
                }
                let slot = names.get_mut(net).ok_or_else(|| {
                    RigError::config(format!(
                        "mesh {} region {} references missing neural network {net}",
                        mesh.name, region.name
                    ))
                })?;
                *slot = region.name.clone();
            }
        }
    }
    Ok(names)
}
