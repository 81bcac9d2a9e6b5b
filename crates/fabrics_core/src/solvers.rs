//! Numeric solve of `M xddot = -f`.

use crate::error::{EngineError, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Smallest accepted ratio between the smallest and largest LU pivot
    /// magnitudes. Below it the metric counts as singular.
    pub singular_tolerance: f64,
    /// Opt-in damping: when set, a singular `M` is replaced by
    /// `M + regularization * I` and solved again.
    pub regularization: Option<f64>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            singular_tolerance: 1e-12,
            regularization: None,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.singular_tolerance >= 0.0) {
            return Err(EngineError::InvalidSettings(
                "singular_tolerance must be non-negative".to_string(),
            ));
        }
        if let Some(lambda) = self.regularization {
            if !(lambda > 0.0) || !lambda.is_finite() {
                return Err(EngineError::InvalidSettings(
                    "regularization must be positive and finite".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Solves `M xddot = -f` by LU decomposition.
///
/// A non-finite `f` is reported as `NonFiniteForcing` before any
/// factorization, so it never triggers regularization.
pub fn solve_acceleration(
    m: &DMatrix<f64>,
    f: &DVector<f64>,
    settings: &SolverSettings,
) -> Result<DVector<f64>> {
    if !m.is_square() {
        return Err(EngineError::dimension("metric columns", m.nrows(), m.ncols()));
    }
    if m.nrows() != f.len() {
        return Err(EngineError::dimension("forcing length", m.nrows(), f.len()));
    }
    if let Some((index, &value)) = f.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(EngineError::NonFiniteForcing { index, value });
    }
    let rhs = -f;
    match solve_lu(m, &rhs, settings.singular_tolerance) {
        Err(EngineError::SingularMetric { ratio, tolerance }) => match settings.regularization {
            Some(lambda) => {
                warn!(ratio, lambda, "singular metric, solving regularized system");
                let damped = m + DMatrix::identity(m.nrows(), m.ncols()) * lambda;
                solve_lu(&damped, &rhs, settings.singular_tolerance)
            }
            None => Err(EngineError::SingularMetric { ratio, tolerance }),
        },
        other => other,
    }
}

fn solve_lu(m: &DMatrix<f64>, rhs: &DVector<f64>, tolerance: f64) -> Result<DVector<f64>> {
    if m.nrows() == 0 {
        return Ok(DVector::zeros(0));
    }
    let lu = m.clone().lu();
    let ratio = pivot_ratio(&lu.u());
    if !(ratio >= tolerance) || ratio == 0.0 {
        return Err(EngineError::SingularMetric { ratio, tolerance });
    }
    let solution = lu
        .solve(rhs)
        .ok_or(EngineError::SingularMetric { ratio, tolerance })?;
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::SingularMetric { ratio, tolerance });
    }
    Ok(solution)
}

/// min |u_ii| / max |u_ii| of the LU upper factor; NaN for non-finite input.
fn pivot_ratio(u: &DMatrix<f64>) -> f64 {
    let diag = u.diagonal();
    let mut min = f64::INFINITY;
    let mut max: f64 = 0.0;
    for v in diag.iter() {
        if !v.is_finite() {
            return f64::NAN;
        }
        min = min.min(v.abs());
        max = max.max(v.abs());
    }
    if max == 0.0 {
        0.0
    } else {
        min / max
    }
}
