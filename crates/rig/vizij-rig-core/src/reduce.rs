//! Offline queries and structural reductions over the engine tables.

use nalgebra::DVector;

use crate::engine::RigLogic;
use crate::error::{RigError, RigResult};
use crate::sparse::SparseMatrix;

/// A corrective-map row that depends on raw controls only, with the raw
/// values that fully activate it.
#[derive(Clone, Debug, PartialEq)]
pub struct Expression {
    pub control_count: usize,
    pub row: usize,
    /// `1 / coefficient` at every column of the row, zero elsewhere.
    pub raw_controls: DVector<f64>,
}

const INVERSION_TOLERANCE: f64 = 1e-6;

impl RigLogic {
    pub fn gui_control_index(&self, name: &str) -> Option<usize> {
        self.gui_control_names.iter().position(|n| n == name)
    }

    pub fn raw_control_index(&self, name: &str) -> Option<usize> {
        self.raw_control_names.iter().position(|n| n == name)
    }

    /// GUI controls without any mapping segment.
    pub fn unused_gui_controls(&self) -> Vec<usize> {
        self.gui_to_raw
            .use_count()
            .iter()
            .enumerate()
            .filter_map(|(index, &count)| (count == 0).then_some(index))
            .collect()
    }

    /// Raw controls that no GUI control writes.
    pub fn unused_raw_controls(&self) -> Vec<usize> {
        let mut used = vec![false; self.counts.raw];
        for entry in self.gui_to_raw.entries() {
            used[entry.output] = true;
        }
        used.iter()
            .enumerate()
            .filter_map(|(index, &u)| (!u).then_some(index))
            .collect()
    }

    pub fn unmapped_joints(&self) -> Vec<usize> {
        self.joints.unmapped_joints()
    }

    /// Every corrective-map row (raw rows included) that reads raw controls
    /// only, sorted by number of controls and then row.
    pub fn all_expressions(&self) -> Vec<Expression> {
        let raw_count = self.counts.raw;
        let mut expressions: Vec<Expression> = (0..self.psd_map.rows())
            .filter(|&row| self.psd_map.row(row).all(|(col, _)| col < raw_count))
            .map(|row| {
                let mut raw_controls = DVector::zeros(raw_count);
                let mut control_count = 0;
                for (col, value) in self.psd_map.row(row) {
                    raw_controls[col] = 1.0 / value;
                    control_count += 1;
                }
                Expression {
                    control_count,
                    row,
                    raw_controls,
                }
            })
            .collect();
        expressions.sort_by_key(|e| (e.control_count, e.row));
        expressions
    }

    /// Invert the GUI→raw mapping. Each segment whose output range contains
    /// the raw value votes for a GUI value; segments sitting at one of their
    /// boundary values vote for the whole range beyond it. Returns the GUI
    /// vector and the controls that could not be determined uniquely.
    pub fn gui_controls_from_raw_controls(
        &self,
        raw: &DVector<f64>,
    ) -> RigResult<(DVector<f64>, Vec<usize>)> {
        let gui_count = self.counts.gui;
        if raw.len() != self.counts.raw {
            return Err(RigError::config(format!(
                "raw control count incorrect: {} instead of {}",
                raw.len(),
                self.counts.raw
            )));
        }
        let ranges = self.gui_to_raw.ranges();
        let mut candidates: Vec<Vec<f64>> = vec![Vec::new(); gui_count];
        let mut candidate_ranges: Vec<Vec<[f64; 2]>> = vec![Vec::new(); gui_count];
        let mut used = vec![false; gui_count];

        for entry in self.gui_to_raw.entries() {
            let input = entry.input;
            used[input] = true;
            if entry.slope == 0.0 {
                continue;
            }
            let value = raw[entry.output];
            let at_from = entry.eval(entry.from);
            let at_to = entry.eval(entry.to);
            if at_from.min(at_to) < value && value < at_from.max(at_to) {
                let inverted = (value - entry.cut) / entry.slope;
                candidates[input].push(inverted.clamp(entry.from, entry.to));
            } else if (at_from - value).abs() < INVERSION_TOLERANCE {
                candidate_ranges[input].push([ranges[input][0], entry.from]);
            } else if (at_to - value).abs() < INVERSION_TOLERANCE {
                candidate_ranges[input].push([entry.to, ranges[input][1]]);
            }
        }

        let mut gui = DVector::zeros(gui_count);
        let mut inconsistent = Vec::new();
        for index in 0..gui_count {
            let name = &self.gui_control_names[index];
            let points = &candidates[index];
            let spans = &candidate_ranges[index];
            match (points.len(), spans.len()) {
                (0, 0) => {
                    if used[index] {
                        log::warn!("gui control {name} ({index}) is not mapped by any raw control");
                        inconsistent.push(index);
                    }
                }
                (1, 0) => gui[index] = points[0],
                (0, 1) => {
                    let [start, end] = spans[0];
                    if end - start > INVERSION_TOLERANCE {
                        log::warn!("gui control {name} ({index}) is not mapped uniquely");
                        inconsistent.push(index);
                    }
                    gui[index] = 0.5 * (start + end);
                }
                _ => {
                    let (value, ambiguous) = vote(points, spans);
                    if let Some(value) = value {
                        gui[index] = value;
                    }
                    let complex = self.gui_to_raw.use_count()[index] >= 2;
                    if value.is_none() || (ambiguous && (!complex || gui[index] != 0.0)) {
                        log::warn!("gui control {name} ({index}) is not uniquely determined");
                        inconsistent.push(index);
                    }
                }
            }
        }
        Ok((gui, inconsistent))
    }

    /// Sort and deduplicate `joints`, then remove them from every joint table,
    /// the joint names and the RBF solver.
    pub fn remove_joints(&mut self, joints: &[usize]) -> RigResult<()> {
        let mut removed = joints.to_vec();
        removed.sort_unstable();
        removed.dedup();
        log::debug!(
            "remove {} out of {} joints",
            removed.len(),
            self.joints.num_joints()
        );
        self.joints.remove_joints(&removed)?;
        self.joint_names = std::mem::take(&mut self.joint_names)
            .into_iter()
            .enumerate()
            .filter(|(index, _)| removed.binary_search(index).is_err())
            .map(|(_, name)| name)
            .collect();
        if let Some(rbf) = self.rbf.as_mut() {
            rbf.remove_joints(&removed);
        }
        Ok(())
    }

    /// Keep only the mapping segments of `gui_controls`. Correctives reading a
    /// raw control that is no longer driven (or any ML/RBF control) are
    /// dropped, joint entries on dropped corrective or RBF columns are
    /// removed, and the RBF solver is detached. Control counts are unchanged.
    pub fn reduce_to_gui_controls(&mut self, gui_controls: &[usize]) -> RigResult<()> {
        let mut keep_gui = vec![false; self.counts.gui];
        for &index in gui_controls {
            let slot = keep_gui.get_mut(index).ok_or_else(|| {
                RigError::config(format!("gui control {index} is invalid"))
            })?;
            *slot = true;
        }
        let before = self.gui_to_raw.entries().len();
        self.gui_to_raw.retain_inputs(&keep_gui);
        log::debug!(
            "reducing gui to raw control mapping from {before} to {} mappings",
            self.gui_to_raw.entries().len()
        );

        let raw_count = self.counts.raw;
        let mut raw_used = vec![false; raw_count];
        for entry in self.gui_to_raw.entries() {
            raw_used[entry.output] = true;
        }

        let rows = self.psd_map.rows();
        let mut keep_columns = vec![false; self.counts.total()];
        let mut triplets = Vec::with_capacity(self.psd_map.nnz());
        let mut dropped = 0usize;
        for row in 0..rows {
            let row_used = self
                .psd_map
                .row(row)
                .all(|(col, _)| col < raw_count && raw_used[col]);
            if row_used {
                keep_columns[row] = true;
                triplets.extend(self.psd_map.row(row).map(|(col, value)| (row, col, value)));
            } else {
                dropped += 1;
            }
        }
        self.psd_map = SparseMatrix::from_triplets(rows, self.psd_map.cols(), &triplets)?;
        self.psd_depends_on_ml_or_rbf = false;
        log::debug!("reduced psd matrix from {rows} to {} non-zero rows", rows - dropped);

        for column in self.counts.ml_region() {
            keep_columns[column] = true;
        }
        self.joints.retain_columns(&keep_columns)?;
        self.rbf = None;
        Ok(())
    }
}

/// Pick the GUI value with the most votes. Point candidates get one vote per
/// occurrence, range endpoints join as candidates, and every range votes for
/// the candidates it contains. Ties go to the smaller magnitude and are
/// reported as ambiguous.
fn vote(points: &[f64], spans: &[[f64; 2]]) -> (Option<f64>, bool) {
    let mut values: Vec<f64> = Vec::new();
    let mut scores: Vec<usize> = Vec::new();
    for &point in points {
        match values.iter().position(|&v| v == point) {
            Some(slot) => scores[slot] += 1,
            None => {
                values.push(point);
                scores.push(1);
            }
        }
    }
    for span in spans {
        for &end in span {
            if !values.contains(&end) {
                values.push(end);
                scores.push(0);
            }
        }
    }
    for (value, score) in values.iter().zip(scores.iter_mut()) {
        *score += spans
            .iter()
            .filter(|[start, end]| *start <= *value && *value <= *end)
            .count();
    }

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .cmp(&scores[a])
            .then(values[a].abs().total_cmp(&values[b].abs()))
    });
    match order.as_slice() {
        [] => (None, false),
        [only] => {
            log::warn!("single candidate value {}", values[*only]);
            (Some(values[*only]), false)
        }
        [first, second, ..] => (Some(values[*first]), scores[*first] == scores[*second]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_prefers_value_supported_by_ranges() {
        // one segment says 0.5, two clamped segments cover [0.4, 1]
        let (value, ambiguous) = vote(&[0.5], &[[0.4, 1.0], [0.0, 1.0]]);
        assert_eq!(value, Some(0.5));
        assert!(!ambiguous);
    }

    #[test]
    fn vote_breaks_ties_by_magnitude() {
        let (value, ambiguous) = vote(&[0.75, -0.25], &[]);
        assert_eq!(value, Some(-0.25));
        assert!(ambiguous);
    }
}
