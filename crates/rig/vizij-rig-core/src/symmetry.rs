//! Left/right symmetry tables derived from control names and corrective
//! occupancy, and joint mirroring built on top of them.

use crate::engine::RigLogic;
use crate::error::{RigError, RigResult};

/// Raw-control suffix substitutions. Every matching suffix is tried; the last
/// one that resolves wins.
const RAW_SUFFIX_PAIRS: &[(&str, &str)] = &[
    ("L", "R"),
    ("Left", "Right"),
    ("LeftU", "RightU"),
    ("LeftD", "RightD"),
    ("LPh1", "RPh1"),
    ("LPh2", "RPh2"),
    ("LPh3", "RPh3"),
    ("R", "L"),
    ("RPh1", "LPh1"),
    ("RPh2", "LPh2"),
    ("RPh3", "LPh3"),
    ("Right", "Left"),
    ("RightU", "LeftU"),
    ("RightD", "LeftD"),
    // eye look directions swap both side and direction
    ("LookLeftL", "LookRightR"),
    ("LookRightR", "LookLeftL"),
    ("LookLeftR", "LookRightL"),
    ("LookRightL", "LookLeftR"),
];

/// GUI controls whose mirrored motion runs in the opposite direction.
const NEGATED_GUI_CONTROLS: &[&str] = &["CTRL_L_eye.tx", "CTRL_R_eye.tx"];

/// Mirror a GUI control name by swapping `L`/`R` (and `l`/`r`) tokens between
/// underscores.
pub fn mirror_gui_control_name(name: &str) -> String {
    name.split('_')
        .map(|token| match token {
            "L" => "R",
            "R" => "L",
            "l" => "r",
            "r" => "l",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// Candidate mirror names of a raw control, in suffix-table order.
pub fn mirror_raw_control_candidates(name: &str) -> Vec<String> {
    RAW_SUFFIX_PAIRS
        .iter()
        .filter_map(|(from, to)| name.strip_suffix(from).map(|stem| format!("{stem}{to}")))
        .collect()
}

fn index_of(names: &[String], name: &str) -> Option<usize> {
    names.iter().position(|n| n == name)
}

impl RigLogic {
    /// Sorted, unique raw controls written by each GUI control.
    pub fn used_raw_controls(&self) -> Vec<Vec<usize>> {
        let mut used = vec![Vec::new(); self.counts.gui];
        for entry in self.gui_to_raw.entries() {
            used[entry.input].push(entry.output);
        }
        for list in &mut used {
            list.sort_unstable();
            list.dedup();
        }
        used
    }

    /// Mirror index of every raw control. Names without a known side suffix,
    /// or whose mirror is missing, map to themselves.
    pub fn symmetric_raw_control_indices(&self) -> Vec<usize> {
        let names = &self.raw_control_names;
        names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let mut mirror = None;
                for candidate in mirror_raw_control_candidates(name) {
                    match index_of(names, &candidate) {
                        Some(found) => mirror = Some(found),
                        None => log::warn!("no symmetry for {name} (searched {candidate})"),
                    }
                }
                mirror.unwrap_or(index)
            })
            .collect()
    }

    /// Mirror index and value multiplier of every GUI control.
    ///
    /// A control whose mirrored name is itself must only drive self-symmetric
    /// raw controls, unless its range straddles zero: then the two halves drive
    /// mirrored raw controls and the multiplier is `-1`.
    pub fn symmetric_gui_control_indices(&self) -> RigResult<Vec<(usize, f64)>> {
        let symmetric_raw = self.symmetric_raw_control_indices();
        let used_raw = self.used_raw_controls();
        let names = &self.gui_control_names;
        let mut result = Vec::with_capacity(names.len());

        for (index, name) in names.iter().enumerate() {
            let mirror_name = mirror_gui_control_name(name);
            if mirror_name != *name {
                let Some(mirror) = index_of(names, &mirror_name) else {
                    log::warn!("no symmetry for \"{name}\" (searched \"{mirror_name}\")");
                    result.push((index, 1.0));
                    continue;
                };
                if let Some(&raw) = used_raw[index].iter().find(|&&raw| symmetric_raw[raw] == raw) {
                    return Err(RigError::symmetry(format!(
                        "symmetric \"{name}\" uses raw control \"{}\" that is not symmetric",
                        self.raw_control_names[raw]
                    )));
                }
                let multiplier = if NEGATED_GUI_CONTROLS.contains(&name.as_str()) {
                    -1.0
                } else {
                    1.0
                };
                result.push((mirror, multiplier));
                continue;
            }

            let paired: Vec<usize> = used_raw[index]
                .iter()
                .copied()
                .filter(|&raw| symmetric_raw[raw] != raw)
                .collect();
            if paired.is_empty() {
                result.push((index, 1.0));
                continue;
            }
            // every mirrored raw control must come with its partner
            let mut closure: Vec<usize> = paired
                .iter()
                .flat_map(|&raw| [raw, symmetric_raw[raw]])
                .collect();
            closure.sort_unstable();
            closure.dedup();
            if closure.len() != paired.len() {
                return Err(RigError::symmetry(format!(
                    "self-symmetric \"{name}\" uses raw controls that are not self symmetric"
                )));
            }
            let [min, max] = self.gui_to_raw.ranges()[index];
            if !(min < 0.0 && max > 0.0) {
                return Err(RigError::symmetry(format!(
                    "self-symmetric \"{name}\" uses mirrored raw controls but its range [{min}, {max}] does not straddle zero"
                )));
            }
            result.push((index, -1.0));
        }
        Ok(result)
    }

    /// Mirror index of every row of the corrective map (raw rows included),
    /// matched by mirrored column occupancy. Rows without entries map to
    /// themselves.
    pub fn symmetric_psd_indices(&self) -> RigResult<Vec<usize>> {
        if self.psd_depends_on_ml_or_rbf {
            return Err(RigError::symmetry(
                "symmetric psd indices for psds that depend on ML or RBF controls are not supported",
            ));
        }
        let symmetric_raw = self.symmetric_raw_control_indices();
        let rows = self.psd_map.rows();
        let occupancy: Vec<Vec<usize>> = (0..rows)
            .map(|row| self.psd_map.row(row).map(|(col, _)| col).collect())
            .collect();

        let mut symmetric = Vec::with_capacity(rows);
        for (row, columns) in occupancy.iter().enumerate() {
            if columns.is_empty() {
                symmetric.push(row);
                continue;
            }
            let mut mirrored: Vec<usize> = columns.iter().map(|&c| symmetric_raw[c]).collect();
            mirrored.sort_unstable();
            mirrored.dedup();
            let found = occupancy.iter().rposition(|other| *other == mirrored);
            match found {
                Some(k) => symmetric.push(k),
                None => {
                    return Err(RigError::symmetry(format!(
                        "psd control {row} is neither self-symmetric nor has a symmetric match"
                    )))
                }
            }
        }
        for (row, &mirror) in symmetric.iter().enumerate() {
            if symmetric[mirror] != row {
                return Err(RigError::symmetry(format!(
                    "inconsistent symmetry for psd control {row}"
                )));
            }
        }
        Ok(symmetric)
    }

    /// Replace every joint matrix by its mirror image: joint rows move to
    /// `symmetric_joints[joint]` and control columns to their symmetric
    /// corrective index. Applying it twice restores the matrices.
    pub fn mirror_joints(&mut self, symmetric_joints: &[usize]) -> RigResult<()> {
        let symmetric_columns = self.symmetric_psd_indices()?;
        self.joints.mirror(symmetric_joints, &symmetric_columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gui_names_swap_side_tokens_only() {
        assert_eq!(mirror_gui_control_name("CTRL_L_brow_raiseIn"), "CTRL_R_brow_raiseIn");
        assert_eq!(mirror_gui_control_name("CTRL_r_eye"), "CTRL_l_eye");
        assert_eq!(mirror_gui_control_name("CTRL_Lips_L"), "CTRL_Lips_R");
        assert_eq!(mirror_gui_control_name("CTRL_C_jaw"), "CTRL_C_jaw");
    }

    #[test]
    fn raw_candidates_follow_suffix_table_order() {
        assert_eq!(mirror_raw_control_candidates("browDownL"), vec!["browDownR"]);
        assert_eq!(
            mirror_raw_control_candidates("eyeLookLeftL"),
            vec!["eyeLookLeftR", "eyeLookRightR"]
        );
        assert_eq!(
            mirror_raw_control_candidates("mouthPressRightU"),
            vec!["mouthPressLeftU"]
        );
        assert!(mirror_raw_control_candidates("jawOpen").is_empty());
    }
}
