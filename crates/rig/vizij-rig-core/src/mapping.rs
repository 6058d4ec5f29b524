//! Piecewise-linear mapping tables: GUI→raw controls and animated maps.
//!
//! Both tables hold the same segment records but evaluate them with opposite
//! half-open intervals:
//! - GUI→raw is active on `from <= v < to` so the analytic Jacobian at `from`
//!   matches a forward difference; out-of-domain values clamp to the outermost
//!   segment boundary of their input.
//! - Animated maps are active on `from < v <= to` and clamp the accumulated
//!   output to `[0, 1]`. Rigs in the wild depend on this asymmetry.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::definition::MappingData;
use crate::error::{RigError, RigResult};
use crate::sparse::{SparseMatrix, SparseRowBuilder};

/// One linear segment `slope * v + cut` over `[from, to]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub input: usize,
    pub output: usize,
    pub from: f64,
    pub to: f64,
    pub slope: f64,
    pub cut: f64,
}

impl MappingEntry {
    #[inline]
    pub fn eval(&self, value: f64) -> f64 {
        self.slope * value + self.cut
    }
}

fn entries_from_data(
    data: &MappingData,
    input_count: usize,
    output_count: usize,
    what: &str,
) -> RigResult<Vec<MappingEntry>> {
    let mut entries = Vec::with_capacity(data.len());
    for i in 0..data.len() {
        let input = data.input_indices[i] as usize;
        let output = data.output_indices[i] as usize;
        if input >= input_count {
            return Err(RigError::config(format!(
                "{what} input index {input} is invalid (count {input_count})"
            )));
        }
        if output >= output_count {
            return Err(RigError::config(format!(
                "{what} output index {output} is invalid (count {output_count})"
            )));
        }
        entries.push(MappingEntry {
            input,
            output,
            from: data.from_values[i] as f64,
            to: data.to_values[i] as f64,
            slope: data.slope_values[i] as f64,
            cut: data.cut_values[i] as f64,
        });
    }
    Ok(entries)
}

/// Domain handling of a GUI→raw segment for a given input value.
#[derive(Clone, Copy, Debug, PartialEq)]
enum SegmentHit {
    Inside,
    ClampedLow,
    ClampedHigh,
    Outside,
}

/// GUI→raw mapping, sorted by (output, input) so the Jacobian can be emitted
/// row by row without sorting.
#[derive(Clone, Debug, Default)]
pub struct GuiToRawTable {
    entries: Vec<MappingEntry>,
    /// `[min from, max to]` per GUI control.
    ranges: Vec<[f64; 2]>,
    /// Number of segments reading each GUI control.
    use_count: Vec<usize>,
    raw_count: usize,
}

impl GuiToRawTable {
    pub fn build(gui_count: usize, raw_count: usize, data: &MappingData) -> RigResult<Self> {
        let mut entries = entries_from_data(data, gui_count, raw_count, "gui to raw")?;
        for entry in entries.iter_mut() {
            if entry.from > entry.to {
                std::mem::swap(&mut entry.from, &mut entry.to);
            }
        }
        entries.sort_by(|a, b| (a.output, a.input).cmp(&(b.output, b.input)));

        let mut table = Self {
            entries,
            ranges: vec![[1e6, -1e6]; gui_count],
            use_count: vec![0; gui_count],
            raw_count,
        };
        for entry in &table.entries {
            let range = &mut table.ranges[entry.input];
            range[0] = range[0].min(entry.from);
            range[1] = range[1].max(entry.to);
        }
        table.recount();

        if let Some(unused) = table.use_count.iter().position(|&c| c == 0) {
            return Err(RigError::config(format!(
                "not all gui controls are being used: gui control {unused} has no mapping"
            )));
        }
        Ok(table)
    }

    fn recount(&mut self) {
        self.use_count.iter_mut().for_each(|c| *c = 0);
        for entry in &self.entries {
            self.use_count[entry.input] += 1;
        }
    }

    #[inline]
    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    #[inline]
    pub fn ranges(&self) -> &[[f64; 2]] {
        &self.ranges
    }

    #[inline]
    pub fn use_count(&self) -> &[usize] {
        &self.use_count
    }

    #[inline]
    pub fn gui_count(&self) -> usize {
        self.ranges.len()
    }

    fn classify(&self, entry: &MappingEntry, value: f64) -> SegmentHit {
        let [range_start, range_end] = self.ranges[entry.input];
        if entry.from <= value && value < entry.to {
            SegmentHit::Inside
        } else if entry.from == range_start && value < entry.from {
            SegmentHit::ClampedLow
        } else if entry.to == range_end && value >= entry.to {
            SegmentHit::ClampedHigh
        } else {
            SegmentHit::Outside
        }
    }

    /// Raw control values for the given GUI values.
    pub fn evaluate(&self, gui: &DVector<f64>) -> DVector<f64> {
        let mut output = DVector::zeros(self.raw_count);
        for entry in &self.entries {
            let value = gui[entry.input];
            output[entry.output] += match self.classify(entry, value) {
                SegmentHit::Inside => entry.eval(value),
                SegmentHit::ClampedLow => entry.eval(entry.from),
                SegmentHit::ClampedHigh => entry.eval(entry.to),
                SegmentHit::Outside => 0.0,
            };
        }
        output
    }

    /// Local Jacobian `raw x gui`. Clamped segments keep their slope so that an
    /// optimizer still feels a gradient pulling the control back into range;
    /// the optimizer is responsible for enforcing the bounds.
    pub fn local_jacobian(&self, gui: &DVector<f64>) -> RigResult<SparseMatrix> {
        let mut builder =
            SparseRowBuilder::with_capacity(self.raw_count, self.gui_count(), self.entries.len());
        for entry in &self.entries {
            if self.classify(entry, gui[entry.input]) == SegmentHit::Outside {
                continue;
            }
            builder.begin_row(entry.output)?;
            builder.push(entry.input, entry.slope)?;
        }
        builder.finish()
    }

    /// Keep only segments driven by the given GUI controls. Ranges are left untouched.
    pub fn retain_inputs(&mut self, keep: &[bool]) {
        self.entries
            .retain(|entry| keep.get(entry.input).copied().unwrap_or(false));
        self.recount();
    }
}

/// Animated-map segments with per-LOD prefix counts.
#[derive(Clone, Debug, Default)]
pub struct AnimatedMapTable {
    entries: Vec<MappingEntry>,
    per_lod: Vec<usize>,
    map_count: usize,
}

impl AnimatedMapTable {
    pub fn build(
        total_count: usize,
        map_count: usize,
        lod_count: usize,
        lods: &[u16],
        data: &MappingData,
    ) -> RigResult<Self> {
        if map_count == 0 {
            return Ok(Self {
                entries: Vec::new(),
                per_lod: vec![0; lod_count],
                map_count,
            });
        }
        if lods.len() != lod_count {
            return Err(RigError::config(format!(
                "animated map lods incorrect: {} entries for {lod_count} lods",
                lods.len()
            )));
        }
        let entries = entries_from_data(data, total_count, map_count, "animated map")?;
        if let Some(bad) = entries.iter().position(|e| e.from > e.to) {
            return Err(RigError::config(format!(
                "animated map mapping {bad} needs a from-value not larger than its to-value"
            )));
        }
        let per_lod: Vec<usize> = lods.iter().map(|&n| n as usize).collect();
        if let Some(&too_many) = per_lod.iter().find(|&&n| n > entries.len()) {
            return Err(RigError::config(format!(
                "animated map lod count {too_many} exceeds {} mappings",
                entries.len()
            )));
        }
        Ok(Self {
            entries,
            per_lod,
            map_count,
        })
    }

    #[inline]
    pub fn map_count(&self) -> usize {
        self.map_count
    }

    #[inline]
    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    #[inline]
    pub fn per_lod(&self) -> &[usize] {
        &self.per_lod
    }

    fn active_entries(&self, lod: usize) -> &[MappingEntry] {
        let n = self.per_lod.get(lod).copied().unwrap_or(0);
        &self.entries[..n]
    }

    #[inline]
    fn is_active(entry: &MappingEntry, value: f64) -> bool {
        entry.from < value && value <= entry.to
    }

    pub fn evaluate(&self, controls: &DVector<f64>, lod: usize) -> DVector<f64> {
        let mut output = DVector::<f64>::zeros(self.map_count);
        for entry in self.active_entries(lod) {
            let value = controls[entry.input];
            if Self::is_active(entry, value) {
                output[entry.output] += entry.eval(value);
            }
        }
        output.apply(|v| *v = v.clamp(0.0, 1.0));
        output
    }

    /// Local Jacobian `maps x controls`. The post-accumulation clamp is not
    /// differentiated so saturated maps can still be pulled back.
    pub fn local_jacobian(&self, controls: &DVector<f64>, lod: usize) -> RigResult<SparseMatrix> {
        let triplets: Vec<(usize, usize, f64)> = self
            .active_entries(lod)
            .iter()
            .filter(|entry| Self::is_active(entry, controls[entry.input]))
            .map(|entry| (entry.output, entry.input, entry.slope))
            .collect();
        SparseMatrix::from_triplets(self.map_count, controls.len(), &triplets)
    }

    pub fn truncate_lods(&mut self, lod_count: usize) {
        self.per_lod.truncate(lod_count);
    }
}
