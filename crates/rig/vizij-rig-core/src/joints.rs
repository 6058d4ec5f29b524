//! Per-LOD joint matrices and the joint-group tables they were assembled from.
//!
//! Rig data stores one row-major value block per joint group with output
//! indices `joint * 9 + dof` and rotations in degrees. At load every LOD gets
//! its own sparse matrix over the full control vector with rotations in
//! radians; without scaling the three scale dofs are dropped and rows are
//! packed as `joint * 6 + dof`.

use hashbrown::HashMap;

use crate::config::{RigConfig, DOF_WITH_SCALING};
use crate::definition::{JointDeltaWriter, RigDefinition};
use crate::error::{RigError, RigResult};
use crate::rbf::remap_joint_after_removal;
use crate::sparse::SparseMatrix;

/// Dofs `3..6` are rotations.
#[inline]
pub(crate) fn is_rotation_dof(dof: usize) -> bool {
    (3..6).contains(&dof)
}

/// Degrees to radians, applied to rotation rows at load.
pub const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;
pub const RAD_TO_DEG: f64 = 180.0 / std::f64::consts::PI;

/// Index lists of one joint group as read from the rig.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JointGroup {
    pub joint_indices: Vec<u16>,
    pub input_indices: Vec<u16>,
    /// `joint * 9 + dof` per block row.
    pub output_indices: Vec<u16>,
    /// Active output-row prefix per LOD.
    pub rows_per_lod: Vec<u16>,
}

#[derive(Clone, Debug)]
pub struct JointTables {
    num_joints: usize,
    dof_per_joint: usize,
    with_scaling: bool,
    matrices: Vec<SparseMatrix>,
    groups: Vec<JointGroup>,
    group_per_joint: Vec<Option<usize>>,
}

impl JointTables {
    pub fn build(def: &RigDefinition, cfg: &RigConfig, total_count: usize) -> RigResult<Self> {
        let num_joints = def.joint_names.len();
        let lod_count = def.lod_count as usize;
        let dof_per_joint = cfg.dof_per_joint();

        if num_joints * DOF_WITH_SCALING != def.joint_row_count as usize {
            log::warn!(
                "number of joints and joint rows not matching: {} vs {}",
                num_joints * DOF_WITH_SCALING,
                def.joint_row_count
            );
        }
        if num_joints > 0 && total_count != def.joint_column_count as usize {
            log::warn!(
                "number of total controls and joint columns not matching: {} vs {}",
                total_count,
                def.joint_column_count
            );
        }

        let mut groups = Vec::with_capacity(def.joint_groups.len());
        for (group_index, data) in def.joint_groups.iter().enumerate() {
            if let Some(&bad) = data.joint_indices.iter().find(|&&j| j as usize >= num_joints) {
                return Err(RigError::config(format!(
                    "joint group {group_index} references joint {bad}, rig has {num_joints} joints"
                )));
            }
            if let Some(&bad) = data.input_indices.iter().find(|&&i| i as usize >= total_count) {
                return Err(RigError::config(format!(
                    "joint group {group_index} reads control {bad}, control count is {total_count}"
                )));
            }
            if let Some(&bad) = data
                .output_indices
                .iter()
                .find(|&&o| o as usize >= num_joints * DOF_WITH_SCALING)
            {
                return Err(RigError::config(format!(
                    "joint group {group_index} writes output {bad} beyond {num_joints} joints"
                )));
            }
            let rows_per_lod = data.lods.get(..lod_count).ok_or_else(|| {
                RigError::config(format!(
                    "joint group {group_index} lists {} lods, rig has {lod_count}",
                    data.lods.len()
                ))
            })?;
            if let Some(&bad) = rows_per_lod
                .iter()
                .find(|&&n| n as usize > data.output_indices.len())
            {
                return Err(RigError::config(format!(
                    "joint group {group_index} activates {bad} rows but only has {} outputs",
                    data.output_indices.len()
                )));
            }
            groups.push(JointGroup {
                joint_indices: data.joint_indices.clone(),
                input_indices: data.input_indices.clone(),
                output_indices: data.output_indices.clone(),
                rows_per_lod: rows_per_lod.to_vec(),
            });
        }

        let mut group_per_joint: Vec<Option<usize>> = vec![None; num_joints];
        let mut scaling_discarded = 0usize;
        let mut matrices = Vec::with_capacity(lod_count);
        for lod in 0..lod_count {
            let mut triplets = Vec::new();
            for (group_index, (group, data)) in groups.iter().zip(&def.joint_groups).enumerate() {
                let inputs = group.input_indices.len();
                for row in 0..group.rows_per_lod[lod] as usize {
                    let output = group.output_indices[row] as usize;
                    let joint = output / DOF_WITH_SCALING;
                    let dof = output % DOF_WITH_SCALING;
                    let current = group_per_joint[joint];
                    match current {
                        None => group_per_joint[joint] = Some(group_index),
                        Some(other) if other != group_index => log::warn!(
                            "joint \"{}\" is part of more than one joint group ({} vs {})",
                            def.joint_names[joint],
                            other,
                            group_index
                        ),
                        Some(_) => {}
                    }
                    if dof >= dof_per_joint {
                        scaling_discarded += 1;
                        continue;
                    }
                    let matrix_row = joint * dof_per_joint + dof;
                    let scale = if is_rotation_dof(dof) { DEG_TO_RAD } else { 1.0 };
                    for (k, &column) in group.input_indices.iter().enumerate() {
                        let value = scale * data.values[row * inputs + k] as f64;
                        if value.abs() > cfg.discard_threshold {
                            triplets.push((matrix_row, column as usize, value));
                        }
                    }
                }
            }
            matrices.push(SparseMatrix::from_triplets(
                num_joints * dof_per_joint,
                total_count,
                &triplets,
            )?);
        }
        if scaling_discarded > 0 {
            log::debug!("discarded {scaling_discarded} joint scaling rows");
        }

        Ok(Self {
            num_joints,
            dof_per_joint,
            with_scaling: cfg.with_joint_scaling,
            matrices,
            groups,
            group_per_joint,
        })
    }

    #[inline]
    pub fn num_joints(&self) -> usize {
        self.num_joints
    }

    #[inline]
    pub fn dof_per_joint(&self) -> usize {
        self.dof_per_joint
    }

    #[inline]
    pub fn with_scaling(&self) -> bool {
        self.with_scaling
    }

    #[inline]
    pub fn lod_count(&self) -> usize {
        self.matrices.len()
    }

    #[inline]
    pub fn groups(&self) -> &[JointGroup] {
        &self.groups
    }

    #[inline]
    pub fn group_per_joint(&self) -> &[Option<usize>] {
        &self.group_per_joint
    }

    pub fn matrix(&self, lod: usize) -> RigResult<&SparseMatrix> {
        self.matrices.get(lod).ok_or_else(|| {
            RigError::config(format!(
                "invalid lod {lod}, rig has {} lods",
                self.matrices.len()
            ))
        })
    }

    pub fn set_matrix(&mut self, lod: usize, matrix: SparseMatrix) -> RigResult<()> {
        let expected_rows = self.num_joints * self.dof_per_joint;
        let expected_cols = self.matrix(lod)?.cols();
        if matrix.rows() != expected_rows || matrix.cols() != expected_cols {
            return Err(RigError::config(format!(
                "joint matrix must be {expected_rows}x{expected_cols}, got {}x{}",
                matrix.rows(),
                matrix.cols()
            )));
        }
        self.matrices[lod] = matrix;
        Ok(())
    }

    pub fn truncate_lods(&mut self, lod_count: usize) {
        self.matrices.truncate(lod_count);
        for group in &mut self.groups {
            group.rows_per_lod.truncate(lod_count);
        }
    }

    /// Joints without a single non-zero entry in any LOD.
    pub fn unmapped_joints(&self) -> Vec<usize> {
        let mut used = vec![false; self.num_joints];
        for matrix in &self.matrices {
            for (row, _, _) in matrix.triplets() {
                used[row / self.dof_per_joint] = true;
            }
        }
        used.iter()
            .enumerate()
            .filter_map(|(joint, &u)| (!u).then_some(joint))
            .collect()
    }

    /// Drop the sorted, unique `removed` joints and re-index the rest.
    pub fn remove_joints(&mut self, removed: &[usize]) -> RigResult<()> {
        if let Some(&bad) = removed.iter().find(|&&j| j >= self.num_joints) {
            return Err(RigError::config(format!(
                "cannot remove joint {bad}, rig has {} joints",
                self.num_joints
            )));
        }
        let dof = self.dof_per_joint;
        let new_count = self.num_joints - removed.len();
        for matrix in &mut self.matrices {
            let triplets: Vec<(usize, usize, f64)> = matrix
                .triplets()
                .filter_map(|(row, col, value)| {
                    remap_joint_after_removal(row / dof, removed)
                        .map(|joint| (joint * dof + row % dof, col, value))
                })
                .collect();
            *matrix = SparseMatrix::from_triplets(new_count * dof, matrix.cols(), &triplets)?;
        }

        let remap = |joint: usize| remap_joint_after_removal(joint, removed);
        for group in &mut self.groups {
            let mut rows_per_lod = Vec::with_capacity(group.rows_per_lod.len());
            for &prefix in &group.rows_per_lod {
                let kept = group.output_indices[..prefix as usize]
                    .iter()
                    .filter(|&&o| remap(o as usize / DOF_WITH_SCALING).is_some())
                    .count();
                rows_per_lod.push(kept as u16);
            }
            group.rows_per_lod = rows_per_lod;
            group.output_indices = group
                .output_indices
                .iter()
                .filter_map(|&o| {
                    let o = o as usize;
                    remap(o / DOF_WITH_SCALING)
                        .map(|joint| (joint * DOF_WITH_SCALING + o % DOF_WITH_SCALING) as u16)
                })
                .collect();
            group.joint_indices = group
                .joint_indices
                .iter()
                .filter_map(|&j| remap(j as usize).map(|joint| joint as u16))
                .collect();
        }
        self.group_per_joint = self
            .group_per_joint
            .iter()
            .enumerate()
            .filter(|(joint, _)| removed.binary_search(joint).is_err())
            .map(|(_, &group)| group)
            .collect();
        self.num_joints = new_count;
        Ok(())
    }

    /// Keep only matrix entries whose column is flagged in `keep`.
    pub fn retain_columns(&mut self, keep: &[bool]) -> RigResult<()> {
        for (lod, matrix) in self.matrices.iter_mut().enumerate() {
            let before = matrix.nnz();
            let triplets: Vec<(usize, usize, f64)> = matrix
                .triplets()
                .filter(|&(_, col, _)| keep.get(col).copied().unwrap_or(false))
                .collect();
            *matrix = SparseMatrix::from_triplets(matrix.rows(), matrix.cols(), &triplets)?;
            log::debug!(
                "reduced lod{lod} joint matrix from {before} to {} entries",
                matrix.nnz()
            );
        }
        Ok(())
    }

    /// Rebuild every LOD with rows moved to the mirrored joint and columns moved
    /// to the mirrored control. Translation x and rotations y/z flip sign.
    pub fn mirror(
        &mut self,
        symmetric_joints: &[usize],
        symmetric_columns: &[usize],
    ) -> RigResult<()> {
        if symmetric_joints.len() != self.num_joints {
            return Err(RigError::symmetry(format!(
                "{} symmetric joint indices for {} joints",
                symmetric_joints.len(),
                self.num_joints
            )));
        }
        if let Some(&bad) = symmetric_joints.iter().find(|&&j| j >= self.num_joints) {
            return Err(RigError::symmetry(format!("symmetric joint index {bad} is invalid")));
        }
        let dof_per_joint = self.dof_per_joint;
        for matrix in &mut self.matrices {
            let mut triplets = Vec::with_capacity(matrix.nnz());
            for (row, col, value) in matrix.triplets() {
                let joint = row / dof_per_joint;
                let dof = row % dof_per_joint;
                let column = symmetric_columns.get(col).copied().ok_or_else(|| {
                    RigError::symmetry(format!("no symmetric index for control {col}"))
                })?;
                let sign = if matches!(dof, 0 | 4 | 5) { -1.0 } else { 1.0 };
                let mirrored_row = symmetric_joints[joint] * dof_per_joint + dof;
                triplets.push((mirrored_row, column, sign * value));
            }
            *matrix = SparseMatrix::from_triplets(matrix.rows(), matrix.cols(), &triplets)?;
        }
        Ok(())
    }

    /// Write the joint groups back as row-major value blocks. LODs are visited
    /// from the sparsest to the densest so that every LOD's rows form a prefix
    /// of the group's output list; values come from the densest LOD.
    pub fn save_deltas(&self, writer: &mut dyn JointDeltaWriter) -> RigResult<()> {
        if !self.with_scaling {
            return Err(RigError::config("only rigs with joint scaling can be saved"));
        }
        let lod_count = self.matrices.len();
        let row_count = |m: &SparseMatrix| (0..m.rows()).filter(|&r| m.row_nnz(r) > 0).count();
        let mut lod_order: Vec<usize> = (0..lod_count).rev().collect();
        lod_order.sort_by_key(|&lod| row_count(&self.matrices[lod]));

        let group_count = self.groups.len();
        let mut outputs: Vec<Vec<u16>> = vec![Vec::new(); group_count];
        let mut output_slot: Vec<HashMap<usize, usize>> = vec![HashMap::new(); group_count];
        let mut rows_per_lod: Vec<Vec<u16>> = vec![vec![0; lod_count]; group_count];
        for &lod in &lod_order {
            let matrix = &self.matrices[lod];
            let mut added: Vec<(usize, usize)> = Vec::new();
            for row in (0..matrix.rows()).filter(|&r| matrix.row_nnz(r) > 0) {
                let group = self.owning_group(row / DOF_WITH_SCALING)?;
                if !output_slot[group].contains_key(&row) {
                    added.push((group, row));
                }
            }
            // Rows new to this LOD keep the order they had in the loaded group.
            added.sort_by_key(|&(group, row)| {
                let original = self.groups[group]
                    .output_indices
                    .iter()
                    .position(|&o| o as usize == row)
                    .unwrap_or(usize::MAX);
                (group, original, row)
            });
            for (group, row) in added {
                output_slot[group].insert(row, outputs[group].len());
                outputs[group].push(row as u16);
            }
            for group in 0..group_count {
                rows_per_lod[group][lod] = outputs[group].len() as u16;
            }
        }

        let mut blocks: Vec<Vec<f32>> = self
            .groups
            .iter()
            .zip(&outputs)
            .map(|(group, rows)| vec![0.0; rows.len() * group.input_indices.len()])
            .collect();
        if let Some(densest) = lod_order.last().map(|&lod| &self.matrices[lod]) {
            for (row, col, value) in densest.triplets() {
                let joint = row / DOF_WITH_SCALING;
                let dof = row % DOF_WITH_SCALING;
                let group = self.owning_group(joint)?;
                let inputs = &self.groups[group].input_indices;
                if !self.groups[group].joint_indices.contains(&(joint as u16)) {
                    return Err(RigError::config(format!(
                        "joint group {group} does not contain joint {joint}"
                    )));
                }
                let block_row = output_slot[group].get(&row).copied().ok_or_else(|| {
                    RigError::config(format!("joint group {group} does not contain output {row}"))
                })?;
                let block_col = inputs.iter().position(|&i| i as usize == col).ok_or_else(|| {
                    RigError::config(format!(
                        "joint group {group} does not contain input index {col}"
                    ))
                })?;
                let scale = if is_rotation_dof(dof) { RAD_TO_DEG } else { 1.0 };
                blocks[group][block_row * inputs.len() + block_col] = (scale * value) as f32;
            }
        }

        writer.set_joint_row_count((self.num_joints * DOF_WITH_SCALING) as u16);
        writer.set_joint_column_count(self.matrices.first().map_or(0, |m| m.cols()) as u16);
        writer.clear_joint_groups();
        for (index, group) in self.groups.iter().enumerate() {
            let id = index as u16;
            writer.set_joint_group_joint_indices(id, &group.joint_indices);
            writer.set_joint_group_lods(id, &rows_per_lod[index]);
            writer.set_joint_group_input_indices(id, &group.input_indices);
            writer.set_joint_group_output_indices(id, &outputs[index]);
            writer.set_joint_group_values(id, &blocks[index]);
        }
        Ok(())
    }

    fn owning_group(&self, joint: usize) -> RigResult<usize> {
        self.group_per_joint
            .get(joint)
            .copied()
            .flatten()
            .ok_or_else(|| {
                RigError::config(format!("joint {joint} is not part of any joint group"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::JointGroupData;

    fn two_joint_rig() -> RigDefinition {
        RigDefinition {
            lod_count: 2,
            joint_names: vec!["jaw".into(), "head".into()],
            joint_row_count: 18,
            joint_column_count: 2,
            joint_groups: vec![JointGroupData {
                joint_indices: vec![0, 1],
                // lod0 has jaw tx and jaw ry, lod1 also the head scale x
                lods: vec![2, 3],
                input_indices: vec![0, 1],
                output_indices: vec![0, 4, 15],
                values: vec![1.0, 0.0, 0.0, 90.0, 0.5, 0.5],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn loads_rows_with_radian_rotations_and_drops_scaling() {
        let tables = JointTables::build(&two_joint_rig(), &RigConfig::default(), 2).unwrap();
        let lod0 = tables.matrix(0).unwrap();
        assert_eq!(lod0.rows(), 12);
        assert_eq!(lod0.get(0, 0), 1.0);
        assert!((lod0.get(4, 1) - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        // zero block value is not stored
        assert_eq!(lod0.nnz(), 2);
        // head scale x needs scaling rows
        assert_eq!(tables.matrix(1).unwrap().nnz(), 2);
        assert!(tables.matrix(2).is_err());
    }

    #[test]
    fn keeps_scaling_rows_when_configured() {
        let cfg = RigConfig {
            with_joint_scaling: true,
            ..Default::default()
        };
        let tables = JointTables::build(&two_joint_rig(), &cfg, 2).unwrap();
        assert_eq!(tables.matrix(1).unwrap().get(15, 1), 0.5);
        assert_eq!(tables.group_per_joint(), &[Some(0), Some(0)]);
    }

    #[test]
    fn lod_prefix_longer_than_outputs_fails() {
        let mut def = two_joint_rig();
        def.joint_groups[0].lods = vec![2, 4];
        assert!(JointTables::build(&def, &RigConfig::default(), 2).is_err());
    }

    #[test]
    fn removing_a_joint_reindexes_rows_and_groups() {
        let cfg = RigConfig {
            with_joint_scaling: true,
            ..Default::default()
        };
        let mut tables = JointTables::build(&two_joint_rig(), &cfg, 2).unwrap();
        tables.remove_joints(&[0]).unwrap();
        assert_eq!(tables.num_joints(), 1);
        let lod1 = tables.matrix(1).unwrap();
        assert_eq!(lod1.rows(), 9);
        assert_eq!(lod1.get(6, 0), 0.5);
        let group = &tables.groups()[0];
        assert_eq!(group.joint_indices, vec![0]);
        assert_eq!(group.output_indices, vec![6]);
        assert_eq!(group.rows_per_lod, vec![0, 1]);
    }

    #[test]
    fn unmapped_joints_lists_joints_without_entries() {
        let tables = JointTables::build(&two_joint_rig(), &RigConfig::default(), 2).unwrap();
        assert_eq!(tables.unmapped_joints(), vec![1]);
    }

    #[test]
    fn mirror_flips_translation_x_and_rotation_yz() {
        let mut tables = JointTables::build(&two_joint_rig(), &RigConfig::default(), 2).unwrap();
        tables.mirror(&[1, 0], &[1, 0]).unwrap();
        let lod0 = tables.matrix(0).unwrap();
        assert_eq!(lod0.get(6, 1), -1.0);
        assert!((lod0.get(10, 0) + std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        assert!(tables.mirror(&[0], &[0, 1]).is_err());
    }

    #[test]
    fn saving_requires_scaling() {
        let tables = JointTables::build(&two_joint_rig(), &RigConfig::default(), 2).unwrap();
        let mut out = RigDefinition::default();
        assert!(tables.save_deltas(&mut out).is_err());
    }
}
