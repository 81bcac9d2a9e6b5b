//! Forced second-order dynamics `M xddot + f = 0`.

use crate::error::{EngineError, Result};
use crate::evaluator::{self, Evaluator};
use crate::geometry::check_space;
use crate::matrix::SymMatrix;
use crate::pullback::{self, Pullback};
use crate::solvers::{solve_acceleration, SolverSettings};
use crate::traits::{DifferentialMapping, SecondOrderDynamics};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecEvaluation {
    pub m: DMatrix<f64>,
    pub f: DVector<f64>,
    /// Solution of `M xddot = -f`.
    pub xddot: DVector<f64>,
}

#[derive(Debug, Clone)]
pub struct Spec {
    m: SymMatrix,
    f: SymMatrix,
    x: SymMatrix,
    xdot: SymMatrix,
    parameters: Vec<SymMatrix>,
    settings: SolverSettings,
    evaluator: Option<Evaluator>,
}

impl Spec {
    pub fn new(m: SymMatrix, f: SymMatrix, x: SymMatrix, xdot: SymMatrix) -> Result<Self> {
        check_space(&x, &xdot)?;
        let n = x.nrows();
        if m.nrows() != n || m.ncols() != n {
            return Err(EngineError::dimension("metric size", n * n, m.len()));
        }
        if !f.is_column() || f.nrows() != n {
            return Err(EngineError::dimension("forcing length", n, f.len()));
        }
        Ok(Self {
            m,
            f,
            x,
            xdot,
            parameters: Vec::new(),
            settings: SolverSettings::default(),
            evaluator: None,
        })
    }

    pub fn with_parameters(mut self, parameters: Vec<SymMatrix>) -> Result<Self> {
        for parameter in &parameters {
            parameter.as_symbols()?;
        }
        pullback::merge_groups(&mut self.parameters, &parameters);
        self.evaluator = None;
        Ok(self)
    }

    pub fn with_settings(mut self, settings: SolverSettings) -> Result<Self> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    pub fn m(&self) -> &SymMatrix {
        &self.m
    }

    pub fn f(&self) -> &SymMatrix {
        &self.f
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Energization sum: `M = M_a + M_b`, `f = f_a + f_b` on one shared space.
    /// Parameters are merged; the settings of `self` are kept.
    pub fn checked_add(&self, other: &Spec) -> Result<Spec> {
        if self.x.entries() != other.x.entries() || self.xdot.entries() != other.xdot.entries() {
            return Err(EngineError::IncompatibleSpaces(format!(
                "cannot add spec on ({}, {}) to spec on ({}, {})",
                describe(&self.x),
                describe(&self.xdot),
                describe(&other.x),
                describe(&other.xdot),
            )));
        }
        let mut parameters = self.parameters.clone();
        pullback::merge_groups(&mut parameters, &other.parameters);
        Ok(Spec {
            m: self.m.try_add(&other.m)?,
            f: self.f.try_add(&other.f)?,
            x: self.x.clone(),
            xdot: self.xdot.clone(),
            parameters,
            settings: self.settings,
            evaluator: None,
        })
    }
}

impl SecondOrderDynamics for Spec {
    type Evaluation = SpecEvaluation;

    fn x(&self) -> &SymMatrix {
        &self.x
    }

    fn xdot(&self) -> &SymMatrix {
        &self.xdot
    }

    fn parameters(&self) -> &[SymMatrix] {
        &self.parameters
    }

    /// `M_q = J^T M J`, `f_q = J^T (f + M bias)`.
    fn pull<D: DifferentialMapping + ?Sized>(&self, map: &D) -> Result<Self> {
        let pullback = Pullback::new(&self.x, &self.xdot, &self.parameters, map)?;
        let m = pullback.substitute(&self.m);
        let f = pullback.substitute(&self.f);
        let f = f.try_add(&m.matmul(pullback.bias())?)?;
        let (q, qdot) = pullback.source();
        Ok(Self {
            m: pullback.congruence(&m)?,
            f: pullback.project(&f)?,
            x: q,
            xdot: qdot,
            settings: self.settings,
            evaluator: None,
            parameters: pullback.finish("spec"),
        })
    }

    fn concretize(&mut self) -> Result<()> {
        if self.evaluator.is_some() {
            return Ok(());
        }
        let evaluator = Evaluator::compile(&self.variables(), &[&self.m, &self.f])?;
        self.evaluator = Some(evaluator);
        Ok(())
    }

    fn is_concretized(&self) -> bool {
        self.evaluator.is_some()
    }

    fn evaluate(&self, args: &[&[f64]]) -> Result<SpecEvaluation> {
        let mut outputs = evaluator::concretized(&self.evaluator)?
            .evaluate(args)?
            .into_iter();
        let (m, f) = match (outputs.next(), outputs.next()) {
            (Some(m), Some(f)) => (m, evaluator::to_vector(&f)),
            _ => return Err(EngineError::dimension("spec outputs", 2, 0)),
        };
        let xddot = solve_acceleration(&m, &f, &self.settings)?;
        Ok(SpecEvaluation { m, f, xddot })
    }
}

fn describe(symbols: &SymMatrix) -> String {
    symbols
        .entries()
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff_map::{DifferentialMap, VariableDifferentialMap};
    use crate::expression::{Expr, Substitution};
    use crate::geometry::Geometry;

    fn space(n: usize) -> (SymMatrix, SymMatrix) {
        (SymMatrix::symbols("x", n), SymMatrix::symbols("xdot", n))
    }

    fn planar_arm() -> DifferentialMap {
        let q = SymMatrix::symbols("q", 2);
        let qdot = SymMatrix::symbols("qdot", 2);
        let phi = SymMatrix::column(vec![
            q[0].cos() + (&q[0] + &q[1]).cos(),
            q[0].sin() + (&q[0] + &q[1]).sin(),
        ]);
        DifferentialMap::new(phi, q, qdot).expect("valid map")
    }

    /// Symmetric, state-dependent metric with a nonlinear forcing term.
    fn curved_spec() -> Spec {
        let (x, xdot) = space(2);
        let m = SymMatrix::new(
            2,
            2,
            vec![
                2.0 + x[0].powi(2),
                &x[0] * &x[1],
                &x[0] * &x[1],
                1.0 + x[1].powi(2),
            ],
        )
        .expect("2x2");
        let f = SymMatrix::column(vec![
            &x[0] * &xdot[1],
            x[1].sin() - xdot[0].powi(2),
        ]);
        Spec::new(m, f, x, xdot).expect("valid spec")
    }

    struct Reference {
        q: SymMatrix,
        qdot: SymMatrix,
        q_p: SymMatrix,
        qdot_p: SymMatrix,
        qddot_p: SymMatrix,
        phi: SymMatrix,
    }

    /// Offset map with coupling between the reference and both coordinates.
    fn offset_from_reference() -> Reference {
        let q = SymMatrix::symbols("q", 2);
        let q_p = SymMatrix::symbols("q_p", 2);
        let d0 = &q[0] - &q_p[0];
        let phi = SymMatrix::column(vec![
            &d0 + 0.3 * q[1].sin(),
            &q[1] - &q_p[1] + 0.2 * d0.powi(2),
        ]);
        Reference {
            q,
            qdot: SymMatrix::symbols("qdot", 2),
            q_p,
            qdot_p: SymMatrix::symbols("qdot_p", 2),
            qddot_p: SymMatrix::symbols("qddot_p", 2),
            phi,
        }
    }

    impl Reference {
        fn variable_map(&self) -> VariableDifferentialMap {
            VariableDifferentialMap::new(
                self.phi.clone(),
                self.q.clone(),
                self.qdot.clone(),
                self.q_p.clone(),
                self.qdot_p.clone(),
                self.qddot_p.clone(),
            )
            .expect("valid map")
        }

        /// The same map with the reference frozen at `at`.
        fn frozen_map(&self, at: &[f64]) -> DifferentialMap {
            let mut fixed = Substitution::new();
            fixed
                .bind(&self.q_p, &SymMatrix::constant_column(at))
                .expect("reference length");
            DifferentialMap::new(self.phi.substitute(&fixed), self.q.clone(), self.qdot.clone())
                .expect("valid map")
        }
    }

    #[test]
    fn rejects_malformed_metric() {
        let (x, xdot) = space(2);
        let err = Spec::new(SymMatrix::identity(3), SymMatrix::zeros(2, 1), x, xdot).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 4, actual: 9, .. }));
    }

    #[test]
    fn evaluate_solves_for_acceleration() -> anyhow::Result<()> {
        let mut spec = curved_spec();
        spec.concretize()?;
        let out = spec.evaluate(&[&[0.5, -1.0], &[0.3, 0.2]])?;
        let residual = &out.m * &out.xddot + &out.f;
        assert!(residual.norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn pulled_metric_is_symmetric() -> anyhow::Result<()> {
        let mut pulled = curved_spec().pull(&planar_arm())?;
        pulled.concretize()?;
        for &q in &[[0.1, 0.4], [-1.2, 2.0], [2.5, -0.3]] {
            for &qdot in &[[0.0, 0.0], [1.0, -0.5]] {
                let out = pulled.evaluate(&[&q, &qdot])?;
                assert!((out.m[(0, 1)] - out.m[(1, 0)]).abs() < 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn pulled_spec_predicts_consistent_acceleration() -> anyhow::Result<()> {
        let dm = {
            let mut dm = planar_arm();
            dm.concretize()?;
            dm
        };
        let target = {
            let mut spec = curved_spec();
            spec.concretize()?;
            spec
        };
        let mut pulled = target.pull(&dm)?;
        pulled.concretize()?;

        let (q, qdot) = ([0.7, 0.9], [0.4, -0.8]);
        let kin = dm.evaluate(&[&q, &qdot])?;
        let source = pulled.evaluate(&[&q, &qdot])?;
        let at_target = target.evaluate(&[kin.x.as_slice(), kin.xdot.as_slice()])?;

        // Projected target equation holds for xddot = J qddot + bias.
        let xddot = &kin.jacobian * &source.xddot + &kin.bias;
        let residual = kin.jacobian.transpose() * (&at_target.m * xddot + &at_target.f);
        assert!(residual.norm() < 1e-10);
        Ok(())
    }

    #[test]
    fn relative_spec_scenario() -> anyhow::Result<()> {
        let q = SymMatrix::symbols("q", 2);
        let qdot = SymMatrix::symbols("qdot", 2);
        let q_p = SymMatrix::symbols("q_p", 2);
        let qdot_p = SymMatrix::symbols("qdot_p", 2);
        let qddot_p = SymMatrix::symbols("qddot_p", 2);
        let dm = VariableDifferentialMap::new(q.try_sub(&q_p)?.abs(), q, qdot, q_p, qdot_p, qddot_p)?;

        let (x, xdot) = space(2);
        let f = x.map(|e| -0.5 / e.powi(2));
        let spec = Spec::new(SymMatrix::identity(2), f, x, xdot)?;
        let mut pulled = spec.pull(&dm)?;
        pulled.concretize()?;

        let (q, qdot) = ([1.0, 0.5], [-0.2, 0.2]);
        let (q_p, qdot_p) = ([0.2, 0.0], [1.0, 0.0]);
        let out = pulled.evaluate(&[&q, &qdot, &q_p, &qdot_p, &[0.0, 0.0]])?;
        assert!((&out.m - DMatrix::<f64>::identity(2, 2)).norm() < 1e-12);
        let f0 = -0.5 / (q[0] - q_p[0]).powi(2);
        assert!((out.f[0] - f0).abs() < 1e-12);

        let direct = out.m.clone().lu().solve(&-&out.f).expect("regular metric");
        assert!((&out.xddot - direct).norm() < 1e-12);
        assert!((out.xddot[0] + f0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn geometry_and_its_spec_accelerate_alike() -> anyhow::Result<()> {
        let (x, xdot) = space(2);
        let h = SymMatrix::column(vec![
            x[0].exp() * &xdot[1],
            &x[0] - x[1].powi(3) + xdot[0].powi(2),
        ]);
        let geo = Geometry::new(h, x, xdot)?;

        let mut plain_geo = geo.clone();
        let mut plain_spec = geo.to_spec()?;
        plain_geo.concretize()?;
        plain_spec.concretize()?;

        // An orthonormal Jacobian keeps J^T J = I after the pullback.
        let q = SymMatrix::symbols("q", 2);
        let qdot = SymMatrix::symbols("qdot", 2);
        let (c, s) = (0.6, 0.8);
        let phi = SymMatrix::column(vec![c * &q[0] - s * &q[1], s * &q[0] + c * &q[1]]);
        let dm = DifferentialMap::new(phi, q, qdot)?;
        let mut pulled_geo = geo.pull(&dm)?;
        let mut pulled_spec = geo.to_spec()?.pull(&dm)?;
        pulled_geo.concretize()?;
        pulled_spec.concretize()?;

        for &state in &[[0.3, -0.4], [1.1, 0.2], [-0.8, -1.5]] {
            for &rate in &[[0.0, 0.0], [0.6, -0.1]] {
                let a = plain_geo.evaluate(&[&state, &rate])?;
                let b = plain_spec.evaluate(&[&state, &rate])?;
                assert!((&a.xddot - &b.xddot).norm() < 1e-12);

                let a = pulled_geo.evaluate(&[&state, &rate])?;
                let b = pulled_spec.evaluate(&[&state, &rate])?;
                assert!((&a.xddot - &b.xddot).norm() < 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn chained_pullback_matches_composed_map() -> anyhow::Result<()> {
        let y = SymMatrix::symbols("y", 2);
        let ydot = SymMatrix::symbols("ydot", 2);
        let outer_phi = SymMatrix::column(vec![&y[0] + y[1].powi(2), y[1].sin()]);
        let outer = DifferentialMap::new(outer_phi.clone(), y.clone(), ydot)?;

        let q = SymMatrix::symbols("q", 2);
        let qdot = SymMatrix::symbols("qdot", 2);
        let inner_phi = SymMatrix::column(vec![&q[0] * &q[1], &q[0] - &q[1]]);
        let inner = DifferentialMap::new(inner_phi.clone(), q.clone(), qdot.clone())?;

        let mut compose = Substitution::new();
        compose.bind(&y, &inner_phi)?;
        let composed = DifferentialMap::new(outer_phi.substitute(&compose), q, qdot)?;

        let spec = curved_spec();
        let mut chained = spec.pull(&outer)?.pull(&inner)?;
        let mut direct = spec.pull(&composed)?;
        chained.concretize()?;
        direct.concretize()?;

        for &state in &[[0.2, 0.5], [-0.9, 1.4]] {
            for &rate in &[[0.3, -0.7], [1.0, 1.0]] {
                let a = chained.evaluate(&[&state, &rate])?;
                let b = direct.evaluate(&[&state, &rate])?;
                assert!((&a.m - &b.m).norm() < 1e-10);
                assert!((&a.f - &b.f).norm() < 1e-10);
            }
        }
        Ok(())
    }

    #[test]
    fn energization_sum() -> anyhow::Result<()> {
        let (x, xdot) = space(1);
        let k = SymMatrix::symbols("k", 1);
        let a = Spec::new(
            SymMatrix::identity(1),
            SymMatrix::scalar(&k[0] * &x[0]),
            x.clone(),
            xdot.clone(),
        )?
        .with_parameters(vec![k.clone()])?;
        let b = Spec::new(
            SymMatrix::scalar(Expr::from(2.0)),
            SymMatrix::scalar(xdot[0].clone()),
            x.clone(),
            xdot.clone(),
        )?
        .with_parameters(vec![k])?;

        let mut sum = a.checked_add(&b)?;
        assert_eq!(sum.parameters().len(), 1);
        sum.concretize()?;
        let out = sum.evaluate(&[&[2.0], &[1.0], &[0.5]])?;
        assert!((out.m[(0, 0)] - 3.0).abs() < 1e-12);
        assert!((out.f[0] - 2.0).abs() < 1e-12);
        assert!((out.xddot[0] + 2.0 / 3.0).abs() < 1e-12);

        let (other_x, other_xdot) = space(1);
        let elsewhere = Spec::new(SymMatrix::identity(1), SymMatrix::zeros(1, 1), other_x, other_xdot)?;
        assert!(matches!(
            a.checked_add(&elsewhere),
            Err(EngineError::IncompatibleSpaces(_))
        ));
        Ok(())
    }

    #[test]
    fn singular_pullback_surfaces() -> anyhow::Result<()> {
        // A 1-D target seen from two coordinates leaves J^T J rank one.
        let q = SymMatrix::symbols("q", 2);
        let qdot = SymMatrix::symbols("qdot", 2);
        let dm = DifferentialMap::new(SymMatrix::scalar(&q[0] + &q[1]), q, qdot)?;
        let (x, xdot) = space(1);
        let spec = Spec::new(SymMatrix::identity(1), SymMatrix::scalar(x[0].clone()), x, xdot)?;

        let mut pulled = spec.pull(&dm)?;
        pulled.concretize()?;
        assert!(matches!(
            pulled.evaluate(&[&[1.0, 2.0], &[0.0, 0.0]]),
            Err(EngineError::SingularMetric { .. })
        ));

        let mut damped = spec
            .with_settings(SolverSettings {
                regularization: Some(1e-3),
                ..SolverSettings::default()
            })?
            .pull(&dm)?;
        damped.concretize()?;
        let out = damped.evaluate(&[&[1.0, 2.0], &[0.0, 0.0]])?;
        assert!(out.xddot.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn concretized_spec_is_shared_across_threads() -> anyhow::Result<()> {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Spec>();
        assert_send_sync::<Geometry>();
        assert_send_sync::<DifferentialMap>();
        assert_send_sync::<VariableDifferentialMap>();

        let mut spec = curved_spec();
        spec.concretize()?;
        let serial = spec.evaluate(&[&[0.4, 0.1], &[0.2, -0.3]])?;
        let shared = &spec;
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(move || shared.evaluate(&[&[0.4, 0.1], &[0.2, -0.3]])))
                .collect();
            for handle in handles {
                let out = handle.join().expect("worker finished").expect("evaluates");
                assert_eq!(out, serial);
            }
        });
        Ok(())
    }

    #[test]
    fn resting_reference_reduces_to_plain_spec_pullback() -> anyhow::Result<()> {
        let reference = offset_from_reference();
        let at = [0.3, -0.6];
        let mut variable = curved_spec().pull(&reference.variable_map())?;
        let mut plain = curved_spec().pull(&reference.frozen_map(&at))?;
        variable.concretize()?;
        plain.concretize()?;

        for &q in &[[0.1, 0.2], [-0.4, 0.7], [0.9, -1.3]] {
            for &qdot in &[[0.0, 0.0], [0.5, -0.25], [-1.2, 0.9]] {
                let a = variable.evaluate(&[&q, &qdot, &at, &[0.0, 0.0], &[0.0, 0.0]])?;
                let b = plain.evaluate(&[&q, &qdot])?;
                assert!((&a.m - &b.m).norm() < 1e-12);
                assert!((&a.f - &b.f).norm() < 1e-12);
                assert!((&a.xddot - &b.xddot).norm() < 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn metric_pulled_through_moving_reference_is_symmetric() -> anyhow::Result<()> {
        let reference = offset_from_reference();
        let mut pulled = curved_spec().pull(&reference.variable_map())?;
        pulled.concretize()?;

        for &q in &[[0.1, 0.4], [-0.8, 1.1]] {
            for &(qdot_p, qddot_p) in &[([0.7, -0.2], [0.3, 1.5]), ([-1.0, 0.4], [-0.6, 0.0])] {
                let out = pulled.evaluate(&[&q, &[0.5, -0.3], &[0.2, -0.1], &qdot_p, &qddot_p])?;
                assert!((out.m[(0, 1)] - out.m[(1, 0)]).abs() < 1e-12);
                let residual = &out.m * &out.xddot + &out.f;
                assert!(residual.norm() < 1e-10);
            }
        }
        Ok(())
    }

    #[test]
    fn infinite_forcing_is_reported_apart_from_the_metric() -> anyhow::Result<()> {
        let (x, xdot) = space(1);
        let f = x.map(|e| -0.5 / e.powi(2));
        let mut spec = Spec::new(SymMatrix::identity(1), f, x, xdot)?.with_settings(SolverSettings {
            regularization: Some(1e-3),
            ..SolverSettings::default()
        })?;
        spec.concretize()?;
        assert!(matches!(
            spec.evaluate(&[&[0.0], &[1.0]]),
            Err(EngineError::NonFiniteForcing { index: 0, .. })
        ));
        Ok(())
    }
}
