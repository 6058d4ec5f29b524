//! Values paired with an optional Jacobian.
//!
//! Every evaluation stage consumes and produces a [`DiffData`]. When the input
//! carries a Jacobian (partials with respect to the root variables, usually the
//! GUI controls) the stage builds its local Jacobian and premultiplies it onto
//! the incoming one, so the output Jacobian stays relative to the same roots.

use nalgebra::DVector;

use crate::error::{RigError, RigResult};
use crate::sparse::SparseMatrix;

#[derive(Clone, Debug, PartialEq)]
pub struct DiffData {
    value: DVector<f64>,
    jacobian: Option<SparseMatrix>,
}

impl DiffData {
    pub fn new(value: DVector<f64>, jacobian: Option<SparseMatrix>) -> RigResult<Self> {
        if let Some(jac) = &jacobian {
            if jac.rows() != value.len() {
                return Err(RigError::config(format!(
                    "jacobian has {} rows for a value of size {}",
                    jac.rows(),
                    value.len()
                )));
            }
        }
        Ok(Self { value, jacobian })
    }

    /// A value without derivative tracking.
    pub fn constant(value: DVector<f64>) -> Self {
        Self {
            value,
            jacobian: None,
        }
    }

    /// Treat `value` as the independent variables: the Jacobian is the identity.
    pub fn variable(value: DVector<f64>) -> Self {
        let n = value.len();
        Self {
            value,
            jacobian: Some(SparseMatrix::identity(n)),
        }
    }

    pub fn from_slice(values: &[f64]) -> Self {
        Self::constant(DVector::from_column_slice(values))
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.value.len()
    }

    #[inline]
    pub fn value(&self) -> &DVector<f64> {
        &self.value
    }

    #[inline]
    pub fn has_jacobian(&self) -> bool {
        self.jacobian.is_some()
    }

    #[inline]
    pub fn jacobian(&self) -> Option<&SparseMatrix> {
        self.jacobian.as_ref()
    }

    pub fn into_parts(self) -> (DVector<f64>, Option<SparseMatrix>) {
        (self.value, self.jacobian)
    }

    /// Chain a stage's local Jacobian (`outputs x self.size()`) onto ours.
    /// Returns `None` when this value carries no Jacobian.
    pub fn propagate(&self, local: &SparseMatrix) -> RigResult<Option<SparseMatrix>> {
        match &self.jacobian {
            Some(jac) => jac.premultiply(local).map(Some),
            None => Ok(None),
        }
    }
}
