//! Row-major sparse linear maps used for corrective, joint and Jacobian matrices.
//!
//! Storage is a `nalgebra_sparse::CsrMatrix<f64>`. Two construction paths exist:
//! - [`SparseMatrix::from_triplets`] sums duplicate `(row, col)` entries and sorts them;
//! - [`SparseRowBuilder`] appends rows in increasing order, the way per-frame
//!   Jacobians are emitted, without any intermediate sort.

use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::error::{RigError, RigResult};

/// Sparse matrix with `rows` outputs and `cols` inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseMatrix {
    inner: CsrMatrix<f64>,
}

impl SparseMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            inner: CsrMatrix::zeros(rows, cols),
        }
    }

    pub fn identity(n: usize) -> Self {
        Self {
            inner: CsrMatrix::identity(n),
        }
    }

    /// Build from `(row, col, value)` triples. Duplicates are summed.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        triplets: &[(usize, usize, f64)],
    ) -> RigResult<Self> {
        let mut coo = CooMatrix::new(rows, cols);
        for &(row, col, value) in triplets {
            if row >= rows || col >= cols {
                return Err(RigError::config(format!(
                    "sparse entry ({row}, {col}) outside {rows}x{cols} matrix"
                )));
            }
            coo.push(row, col, value);
        }
        Ok(Self {
            inner: CsrMatrix::from(&coo),
        })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.inner.nrows()
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.inner.ncols()
    }

    /// Number of stored entries.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.inner.nnz()
    }

    fn row_range(&self, row: usize) -> std::ops::Range<usize> {
        if row >= self.rows() {
            return 0..0;
        }
        let offsets = self.inner.row_offsets();
        offsets[row]..offsets[row + 1]
    }

    /// Stored entries of `row` as `(col, value)` in increasing column order.
    /// Rows outside the matrix are empty.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_range(row);
        self.inner.col_indices()[range.clone()]
            .iter()
            .copied()
            .zip(self.inner.values()[range].iter().copied())
    }

    #[inline]
    pub fn row_nnz(&self, row: usize) -> usize {
        self.row_range(row).len()
    }

    /// All stored entries in row-major order.
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.inner
            .triplet_iter()
            .map(|(row, col, value)| (row, col, *value))
    }

    /// Value at `(row, col)`, zero when not stored.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.row(row)
            .filter(|(c, _)| *c == col)
            .map(|(_, v)| v)
            .sum()
    }

    /// Dense product `self * x`.
    pub fn mul_vec(&self, x: &DVector<f64>) -> RigResult<DVector<f64>> {
        if x.len() != self.cols() {
            return Err(RigError::config(format!(
                "cannot multiply {}x{} matrix with vector of size {}",
                self.rows(),
                self.cols(),
                x.len()
            )));
        }
        let mut out = DVector::zeros(self.rows());
        for (row, slot) in out.iter_mut().enumerate() {
            *slot = self.row(row).map(|(col, value)| value * x[col]).sum();
        }
        Ok(out)
    }

    /// Left-multiplication composition: returns `lhs * self`.
    pub fn premultiply(&self, lhs: &SparseMatrix) -> RigResult<SparseMatrix> {
        if lhs.cols() != self.rows() {
            return Err(RigError::config(format!(
                "cannot compose {}x{} with {}x{}",
                lhs.rows(),
                lhs.cols(),
                self.rows(),
                self.cols()
            )));
        }
        Ok(SparseMatrix {
            inner: &lhs.inner * &self.inner,
        })
    }

    /// Dense copy, mainly for inspection in tests and tools.
    pub fn to_dense(&self) -> nalgebra::DMatrix<f64> {
        let mut dense = nalgebra::DMatrix::zeros(self.rows(), self.cols());
        for (row, col, value) in self.triplets() {
            dense[(row, col)] += value;
        }
        dense
    }
}

/// Appends rows in strictly increasing order, mirroring how Jacobians are
/// produced stage by stage. Skipped rows stay empty.
#[derive(Debug)]
pub struct SparseRowBuilder {
    rows: usize,
    cols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
}

impl SparseRowBuilder {
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut row_offsets = Vec::with_capacity(rows + 1);
        row_offsets.push(0);
        Self {
            rows,
            cols,
            row_offsets,
            col_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn with_capacity(rows: usize, cols: usize, nnz: usize) -> Self {
        let mut builder = Self::new(rows, cols);
        builder.col_indices.reserve(nnz);
        builder.values.reserve(nnz);
        builder
    }

    /// Index of the row currently receiving entries, if any row was started.
    fn current_row(&self) -> Option<usize> {
        (self.row_offsets.len() - 1).checked_sub(1)
    }

    /// Start `row`, closing every row before it. Rows may not go backwards.
    pub fn begin_row(&mut self, row: usize) -> RigResult<()> {
        if row >= self.rows {
            return Err(RigError::config(format!(
                "row {row} outside matrix with {} rows",
                self.rows
            )));
        }
        if let Some(current) = self.current_row() {
            if row < current {
                return Err(RigError::config(format!(
                    "rows must be emitted in increasing order: {row} after {current}"
                )));
            }
            if row == current {
                return Ok(());
            }
        }
        let nnz = self.col_indices.len();
        while self.row_offsets.len() - 1 <= row {
            self.row_offsets.push(nnz);
        }
        Ok(())
    }

    /// Append an entry to the current row. Columns must not decrease; a repeated
    /// column accumulates onto the previous entry.
    pub fn push(&mut self, col: usize, value: f64) -> RigResult<()> {
        if self.current_row().is_none() {
            return Err(RigError::config("entry pushed before any row was started"));
        }
        if col >= self.cols {
            return Err(RigError::config(format!(
                "column {col} outside matrix with {} columns",
                self.cols
            )));
        }
        let row_start = self.row_offsets[self.row_offsets.len() - 2];
        if self.col_indices.len() > row_start {
            let last = self.col_indices.len() - 1;
            match self.col_indices[last].cmp(&col) {
                std::cmp::Ordering::Equal => {
                    self.values[last] += value;
                    return Ok(());
                }
                std::cmp::Ordering::Greater => {
                    return Err(RigError::config(format!(
                        "columns must be emitted in increasing order: {col} after {}",
                        self.col_indices[last]
                    )));
                }
                std::cmp::Ordering::Less => {}
            }
        }
        self.col_indices.push(col);
        self.values.push(value);
        let nnz = self.col_indices.len();
        if let Some(end) = self.row_offsets.last_mut() {
            *end = nnz;
        }
        Ok(())
    }

    pub fn finish(mut self) -> RigResult<SparseMatrix> {
        let nnz = self.col_indices.len();
        while self.row_offsets.len() <= self.rows {
            self.row_offsets.push(nnz);
        }
        let inner = CsrMatrix::try_from_csr_data(
            self.rows,
            self.cols,
            self.row_offsets,
            self.col_indices,
            self.values,
        )
        .map_err(|e| RigError::config(format!("invalid sparse row data: {e}")))?;
        Ok(SparseMatrix { inner })
    }
}
