//! Ready-made task maps built on [`DifferentialMap`].
//!
//! Obstacle and goal arguments may be numeric (constant columns) or
//! symbolic. Symbolic ones are declared as map parameters, so they become
//! runtime inputs of everything pulled through the map.

use crate::diff_map::DifferentialMap;
use crate::error::{EngineError, Result};
use crate::expression::Expr;
use crate::matrix::SymMatrix;

/// Signed clearance `phi = |fk - x_obst| / r_obst - 1`; zero on the
/// obstacle surface, negative inside.
pub fn collision_map(
    q: SymMatrix,
    qdot: SymMatrix,
    fk: &SymMatrix,
    x_obst: &SymMatrix,
    r_obst: impl Into<Expr>,
) -> Result<DifferentialMap> {
    let r_obst = r_obst.into();
    if r_obst.as_constant() == Some(0.0) {
        return Err(EngineError::InvalidSettings(
            "obstacle radius must be nonzero".to_string(),
        ));
    }
    let offset = fk.try_sub(x_obst)?;
    let phi = SymMatrix::scalar(offset.norm() / &r_obst - 1.0);

    let mut parameters = Vec::new();
    push_symbolic(&mut parameters, x_obst.clone());
    push_symbolic(&mut parameters, SymMatrix::scalar(r_obst));
    DifferentialMap::new(phi, q, qdot)?.with_parameters(parameters)
}

/// Task-space error `phi = fk - goal`.
pub fn goal_map(
    q: SymMatrix,
    qdot: SymMatrix,
    fk: &SymMatrix,
    goal: &SymMatrix,
) -> Result<DifferentialMap> {
    let phi = fk.try_sub(goal)?;
    let mut parameters = Vec::new();
    push_symbolic(&mut parameters, goal.clone());
    DifferentialMap::new(phi, q, qdot)?.with_parameters(parameters)
}

fn push_symbolic(parameters: &mut Vec<SymMatrix>, group: SymMatrix) {
    if !group.is_empty() && group.as_symbols().is_ok() {
        parameters.push(group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::{parse_column, Scope};
    use crate::geometry::Geometry;
    use crate::traits::{DifferentialMapping, SecondOrderDynamics};

    fn arm() -> (SymMatrix, SymMatrix, SymMatrix) {
        let q = SymMatrix::symbols("q", 2);
        let qdot = SymMatrix::symbols("qdot", 2);
        let mut scope = Scope::new();
        scope.insert_vector("q", &q);
        let fk = parse_column(
            &["cos(q[0]) + cos(q[0] + q[1])", "sin(q[0]) + sin(q[0] + q[1])"],
            &scope,
        )
        .expect("valid forward kinematics");
        (q, qdot, fk)
    }

    #[test]
    fn collision_clearance_with_fixed_obstacle() -> anyhow::Result<()> {
        let (q, qdot, fk) = arm();
        let obstacle = SymMatrix::constant_column(&[1.0, 1.0]);
        let mut dm = collision_map(q, qdot, &fk, &obstacle, 0.5)?;
        assert!(dm.extra_variables().is_empty());
        assert_eq!(dm.target_dimension(), 1);
        dm.concretize()?;

        // q = (0, pi/2) puts the end effector at (1, 1).
        let out = dm.evaluate(&[&[0.0, std::f64::consts::FRAC_PI_2], &[0.0, 0.0]])?;
        assert!((out.x[0] + 1.0).abs() < 1e-12);

        let out = dm.evaluate(&[&[0.0, 0.0], &[0.0, 0.0]])?;
        let distance = (1.0_f64 + 1.0).sqrt();
        assert!((out.x[0] - (distance / 0.5 - 1.0)).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn symbolic_obstacle_becomes_parameter() -> anyhow::Result<()> {
        let (q, qdot, fk) = arm();
        let obstacle = SymMatrix::symbols("x_obst", 2);
        let radius = SymMatrix::symbols("r_obst", 1);
        let mut dm = collision_map(q, qdot, &fk, &obstacle, radius[0].clone())?;
        assert_eq!(dm.extra_variables(), &[obstacle, radius][..]);

        dm.concretize()?;
        let out = dm.evaluate(&[&[0.0, 0.0], &[0.0, 0.0], &[2.0, 1.0], &[0.25]])?;
        assert!((out.x[0] - (1.0 / 0.25 - 1.0)).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn zero_radius_is_rejected() {
        let (q, qdot, fk) = arm();
        let obstacle = SymMatrix::constant_column(&[1.0, 1.0]);
        assert!(matches!(
            collision_map(q, qdot, &fk, &obstacle, 0.0),
            Err(EngineError::InvalidSettings(_))
        ));
    }

    #[test]
    fn goal_map_error_and_jacobian() -> anyhow::Result<()> {
        let (q, qdot, fk) = arm();
        let goal = SymMatrix::symbols("goal", 2);
        let mut dm = goal_map(q, qdot, &fk, &goal)?;
        assert_eq!(dm.extra_variables().len(), 1);
        dm.concretize()?;

        let (a, b) = (0.3_f64, -0.4_f64);
        let out = dm.evaluate(&[&[a, b], &[1.0, 0.0], &[0.5, 0.5]])?;
        assert!((out.x[0] - (a.cos() + (a + b).cos() - 0.5)).abs() < 1e-12);
        assert!((out.jacobian[(0, 1)] + (a + b).sin()).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn goal_attractor_pulls_toward_goal() -> anyhow::Result<()> {
        let (q, qdot, fk) = arm();
        let goal = SymMatrix::symbols("goal", 2);
        let dm = goal_map(q, qdot, &fk, &goal)?;

        // Damped spring toward x = 0.
        let x = SymMatrix::symbols("x", 2);
        let xdot = SymMatrix::symbols("xdot", 2);
        let h = x.map(|e| 4.0 * e).try_add(&xdot.map(|e| 1.5 * e))?;
        let mut pulled = Geometry::new(h, x, xdot)?.pull(&dm)?;
        assert_eq!(pulled.variables().len(), 3);
        pulled.concretize()?;

        // At rest on the goal nothing moves.
        let out = pulled.evaluate(&[&[0.3, 0.8], &[0.0, 0.0], &[
            0.3_f64.cos() + 1.1_f64.cos(),
            0.3_f64.sin() + 1.1_f64.sin(),
        ]])?;
        assert!(out.xddot.norm() < 1e-12);
        Ok(())
    }
}
