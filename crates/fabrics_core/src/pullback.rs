//! Pullback algebra shared by [`Geometry`](crate::geometry::Geometry) and
//! [`Spec`](crate::spec::Spec).
//!
//! Given a map with `xddot = J qddot + bias`, target dynamics
//! `M xddot + f = 0` become `J^T M J qddot + J^T (f + M bias) = 0` once
//! `x` and `xdot` are replaced by their source-space expressions.

use crate::error::{EngineError, Result};
use crate::expression::Substitution;
use crate::matrix::SymMatrix;
use crate::traits::DifferentialMapping;
use tracing::debug;

/// Prepared substitution and projections for one `(target, map)` pair.
pub(crate) struct Pullback<'a, D: DifferentialMapping + ?Sized> {
    map: &'a D,
    substitution: Substitution,
    jacobian_t: SymMatrix,
    parameters: Vec<SymMatrix>,
}

impl<'a, D: DifferentialMapping + ?Sized> Pullback<'a, D> {
    /// Checks that `map` lands on the space `(x, xdot)` and binds `x` to
    /// `phi` and `xdot` to the map velocity.
    pub(crate) fn new(
        x: &SymMatrix,
        xdot: &SymMatrix,
        inherited: &[SymMatrix],
        map: &'a D,
    ) -> Result<Self> {
        let target = map.target_dimension();
        if x.nrows() != target {
            return Err(EngineError::dimension("pull target dimension", target, x.nrows()));
        }
        let jacobian = map.jacobian();
        if jacobian.nrows() != target {
            return Err(EngineError::dimension("jacobian rows", target, jacobian.nrows()));
        }
        if jacobian.ncols() != map.source_dimension() {
            return Err(EngineError::dimension(
                "jacobian columns",
                map.source_dimension(),
                jacobian.ncols(),
            ));
        }

        let mut substitution = Substitution::new();
        substitution.bind(x, map.phi())?;
        substitution.bind(xdot, map.xdot())?;

        let mut parameters = Vec::new();
        merge_groups(&mut parameters, map.extra_variables());
        merge_groups(&mut parameters, inherited);
        // Groups that collapse onto the new state are no longer parameters.
        parameters.retain(|p| {
            p.entries() != map.q().entries() && p.entries() != map.qdot().entries()
        });

        Ok(Self {
            map,
            substitution,
            jacobian_t: jacobian.transpose(),
            parameters,
        })
    }

    /// Re-expresses a target-space quantity in source-space variables.
    pub(crate) fn substitute(&self, m: &SymMatrix) -> SymMatrix {
        m.substitute(&self.substitution)
    }

    /// `J^T v`
    pub(crate) fn project(&self, v: &SymMatrix) -> Result<SymMatrix> {
        self.jacobian_t.matmul(v)
    }

    /// `J^T M J`
    pub(crate) fn congruence(&self, m: &SymMatrix) -> Result<SymMatrix> {
        self.jacobian_t.matmul(m)?.matmul(self.map.jacobian())
    }

    pub(crate) fn bias(&self) -> &SymMatrix {
        self.map.bias()
    }

    pub(crate) fn source(&self) -> (SymMatrix, SymMatrix) {
        (self.map.q().clone(), self.map.qdot().clone())
    }

    pub(crate) fn finish(self, kind: &str) -> Vec<SymMatrix> {
        debug!(
            kind,
            source = self.map.source_dimension(),
            target = self.map.target_dimension(),
            parameters = self.parameters.len(),
            "pulled back"
        );
        self.parameters
    }
}

/// Appends each group of `extra` not already present in `groups`.
pub(crate) fn merge_groups(groups: &mut Vec<SymMatrix>, extra: &[SymMatrix]) {
    for group in extra {
        if !groups.iter().any(|g| g.entries() == group.entries()) {
            groups.push(group.clone());
        }
    }
}
