pub mod autodiff;
pub mod diff_map;
pub mod equation_engine;
pub mod error;
pub mod evaluator;
pub mod expression;
pub mod geometry;
pub mod maps;
pub mod matrix;
mod pullback;
pub mod solvers;
pub mod spec;
/// The `fabrics_core` crate re-expresses second-order motion behaviors defined on
/// task spaces as equivalent behaviors on a robot's configuration space.
///
/// Key components:
/// - **Expressions**: `Expr` graphs with symbolic differentiation and substitution, and
///   `SymMatrix` for the matrix algebra built on them.
/// - **Maps**: `DifferentialMap` and `VariableDifferentialMap` (maps with a moving reference).
/// - **Dynamics**: `Geometry` (`xddot = -h`) and `Spec` (`M xddot + f = 0`), both
///   `SecondOrderDynamics` that can be pulled back through a map.
/// - **Equation Engine**: A bytecode VM that evaluates concretized objects on `f64` or on
///   Dual numbers.
pub mod traits;

pub use diff_map::{DifferentialMap, MapEvaluation, VariableDifferentialMap};
pub use error::{EngineError, Result};
pub use expression::{Expr, Substitution, Symbol};
pub use geometry::{Geometry, GeometryEvaluation};
pub use matrix::SymMatrix;
pub use solvers::SolverSettings;
pub use spec::{Spec, SpecEvaluation};
pub use traits::{DifferentialMapping, SecondOrderDynamics};
