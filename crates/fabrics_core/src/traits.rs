use crate::error::Result;
use crate::matrix::SymMatrix;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that compiled programs can run on.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// A differential map `phi: q -> x` as seen by the pullback.
///
/// `xddot = J qddot + bias`, where `bias` collects every acceleration term
/// that does not multiply `qddot` (`Jdot qdot`, plus reference-frame terms
/// for moving maps).
pub trait DifferentialMapping {
    /// Target-space position `x = phi(q, ...)`, a column.
    fn phi(&self) -> &SymMatrix;

    /// Source-space position symbols.
    fn q(&self) -> &SymMatrix;

    /// Source-space velocity symbols.
    fn qdot(&self) -> &SymMatrix;

    /// `d phi / d q`, `target_dimension x source_dimension`.
    fn jacobian(&self) -> &SymMatrix;

    /// Target-space velocity in terms of the source state.
    fn xdot(&self) -> &SymMatrix;

    /// Acceleration terms not proportional to `qddot`.
    fn bias(&self) -> &SymMatrix;

    /// Inputs besides `(q, qdot)` that objects pulled through this map must
    /// receive at evaluation time, in declaration order.
    fn extra_variables(&self) -> &[SymMatrix];

    fn target_dimension(&self) -> usize {
        self.phi().nrows()
    }

    fn source_dimension(&self) -> usize {
        self.q().nrows()
    }
}

/// Second-order dynamics on a space: the shared face of `Geometry` and `Spec`.
pub trait SecondOrderDynamics: Sized {
    /// Numeric result of one evaluation.
    type Evaluation;

    fn x(&self) -> &SymMatrix;

    fn xdot(&self) -> &SymMatrix;

    /// Runtime inputs beyond `(x, xdot)`, e.g. a reference state inherited
    /// from a moving map.
    fn parameters(&self) -> &[SymMatrix];

    fn dimension(&self) -> usize {
        self.x().nrows()
    }

    /// Declared positional argument order of `evaluate`.
    fn variables(&self) -> Vec<&SymMatrix> {
        let mut vars = vec![self.x(), self.xdot()];
        vars.extend(self.parameters());
        vars
    }

    /// Re-expresses these dynamics on the source space of `map`.
    fn pull<D: DifferentialMapping + ?Sized>(&self, map: &D) -> Result<Self>;

    /// Compiles and caches the numeric evaluator. Idempotent.
    fn concretize(&mut self) -> Result<()>;

    fn is_concretized(&self) -> bool;

    /// Evaluates at one state; one slice per declared variable group.
    fn evaluate(&self, args: &[&[f64]]) -> Result<Self::Evaluation>;
}
