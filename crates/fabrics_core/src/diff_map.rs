//! Differential maps between a source space `(q, qdot)` and a target space
//! `(x, xdot)`.
//!
//! Every derivative a pullback needs is built symbolically once, at
//! construction. A map may additionally be concretized to evaluate its
//! forward kinematics numerically.

use crate::error::{EngineError, Result};
use crate::evaluator::{self, Evaluator};
use crate::expression::Symbol;
use crate::matrix::SymMatrix;
use crate::traits::DifferentialMapping;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Numeric forward kinematics at one state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEvaluation {
    pub x: DVector<f64>,
    pub xdot: DVector<f64>,
    pub jacobian: DMatrix<f64>,
    /// Acceleration terms not proportional to `qddot`.
    pub bias: DVector<f64>,
}

impl MapEvaluation {
    fn from_outputs(outputs: Vec<DMatrix<f64>>) -> Result<Self> {
        match <[DMatrix<f64>; 4]>::try_from(outputs) {
            Ok([x, xdot, jacobian, bias]) => Ok(Self {
                x: evaluator::to_vector(&x),
                xdot: evaluator::to_vector(&xdot),
                jacobian,
                bias: evaluator::to_vector(&bias),
            }),
            Err(outputs) => Err(EngineError::dimension("map outputs", 4, outputs.len())),
        }
    }
}

/// `phi: q -> x` with `xdot = J qdot` and `xddot = J qddot + Jdot qdot`.
#[derive(Debug, Clone)]
pub struct DifferentialMap {
    phi: SymMatrix,
    q: SymMatrix,
    qdot: SymMatrix,
    jacobian: SymMatrix,
    jacobian_dot: SymMatrix,
    xdot: SymMatrix,
    bias: SymMatrix,
    parameters: Vec<SymMatrix>,
    evaluator: Option<Evaluator>,
}

impl DifferentialMap {
    pub fn new(phi: SymMatrix, q: SymMatrix, qdot: SymMatrix) -> Result<Self> {
        check_column(&phi, "phi")?;
        let q_symbols = state_symbols(&q, &qdot, "qdot")?;

        let jacobian = phi.jacobian(&q_symbols)?;
        let xdot = jacobian.matmul(&qdot)?;
        let jacobian_dot = jacobian.time_derivative(&q_symbols, qdot.entries())?;
        let bias = jacobian_dot.matmul(&qdot)?;
        debug!(source = q.nrows(), target = phi.nrows(), "built differential map");

        Ok(Self {
            phi,
            q,
            qdot,
            jacobian,
            jacobian_dot,
            xdot,
            bias,
            parameters: Vec::new(),
            evaluator: None,
        })
    }

    /// Declares symbol vectors `phi` depends on besides `q`, e.g. a symbolic
    /// goal. They become runtime inputs of everything pulled through the map.
    pub fn with_parameters(mut self, parameters: Vec<SymMatrix>) -> Result<Self> {
        for parameter in &parameters {
            parameter.as_symbols()?;
        }
        self.parameters.extend(parameters);
        self.evaluator = None;
        Ok(self)
    }

    /// `(x, xdot)` in terms of `(q, qdot)`.
    pub fn forward(&self) -> (&SymMatrix, &SymMatrix) {
        (&self.phi, &self.xdot)
    }

    pub fn jacobian_dot(&self) -> &SymMatrix {
        &self.jacobian_dot
    }

    pub fn parameters(&self) -> &[SymMatrix] {
        &self.parameters
    }

    pub fn concretize(&mut self) -> Result<()> {
        if self.evaluator.is_some() {
            return Ok(());
        }
        let mut variables = vec![&self.q, &self.qdot];
        variables.extend(&self.parameters);
        self.evaluator = Some(Evaluator::compile(
            &variables,
            &[&self.phi, &self.xdot, &self.jacobian, &self.bias],
        )?);
        Ok(())
    }

    /// Arguments: `q, qdot, parameters...`.
    pub fn evaluate(&self, args: &[&[f64]]) -> Result<MapEvaluation> {
        let outputs = evaluator::concretized(&self.evaluator)?.evaluate(args)?;
        MapEvaluation::from_outputs(outputs)
    }
}

impl DifferentialMapping for DifferentialMap {
    fn phi(&self) -> &SymMatrix {
        &self.phi
    }

    fn q(&self) -> &SymMatrix {
        &self.q
    }

    fn qdot(&self) -> &SymMatrix {
        &self.qdot
    }

    fn jacobian(&self) -> &SymMatrix {
        &self.jacobian
    }

    fn xdot(&self) -> &SymMatrix {
        &self.xdot
    }

    fn bias(&self) -> &SymMatrix {
        &self.bias
    }

    fn extra_variables(&self) -> &[SymMatrix] {
        &self.parameters
    }
}

/// A map whose expression also depends on a moving reference `q_p` with
/// known velocity `qdot_p` and acceleration `qddot_p`.
///
/// `xdot = J_q qdot + J_qp qdot_p` and
/// `xddot = J_q qddot + Jdot_q qdot + J_qp qddot_p + Jdot_qp qdot_p`, where
/// the time derivatives follow both `q(t)` and `q_p(t)`.
#[derive(Debug, Clone)]
pub struct VariableDifferentialMap {
    phi: SymMatrix,
    q: SymMatrix,
    qdot: SymMatrix,
    q_p: SymMatrix,
    qdot_p: SymMatrix,
    qddot_p: SymMatrix,
    jacobian: SymMatrix,
    reference_jacobian: SymMatrix,
    jacobian_dot: SymMatrix,
    reference_jacobian_dot: SymMatrix,
    xdot: SymMatrix,
    bias: SymMatrix,
    parameters: Vec<SymMatrix>,
    /// `[q_p, qdot_p, qddot_p, parameters...]`
    extra: Vec<SymMatrix>,
    evaluator: Option<Evaluator>,
}

impl VariableDifferentialMap {
    pub fn new(
        phi: SymMatrix,
        q: SymMatrix,
        qdot: SymMatrix,
        q_p: SymMatrix,
        qdot_p: SymMatrix,
        qddot_p: SymMatrix,
    ) -> Result<Self> {
        check_column(&phi, "phi")?;
        let q_symbols = state_symbols(&q, &qdot, "qdot")?;
        let p_symbols = state_symbols(&q_p, &qdot_p, "qdot_p")?;
        let pdd_symbols = qddot_p.as_symbols()?;
        if pdd_symbols.len() != p_symbols.len() {
            return Err(EngineError::dimension(
                "qddot_p length",
                p_symbols.len(),
                pdd_symbols.len(),
            ));
        }

        let jacobian = phi.jacobian(&q_symbols)?;
        let reference_jacobian = phi.jacobian(&p_symbols)?;
        let xdot = jacobian
            .matmul(&qdot)?
            .try_add(&reference_jacobian.matmul(&qdot_p)?)?;

        let mut positions = q_symbols;
        positions.extend(p_symbols);
        let mut rates = qdot.entries().to_vec();
        rates.extend(qdot_p.entries().iter().cloned());
        let jacobian_dot = jacobian.time_derivative(&positions, &rates)?;
        let reference_jacobian_dot = reference_jacobian.time_derivative(&positions, &rates)?;

        let bias = jacobian_dot
            .matmul(&qdot)?
            .try_add(&reference_jacobian.matmul(&qddot_p)?)?
            .try_add(&reference_jacobian_dot.matmul(&qdot_p)?)?;
        debug!(
            source = q.nrows(),
            reference = q_p.nrows(),
            target = phi.nrows(),
            "built variable differential map"
        );

        let extra = vec![q_p.clone(), qdot_p.clone(), qddot_p.clone()];
        Ok(Self {
            phi,
            q,
            qdot,
            q_p,
            qdot_p,
            qddot_p,
            jacobian,
            reference_jacobian,
            jacobian_dot,
            reference_jacobian_dot,
            xdot,
            bias,
            parameters: Vec::new(),
            extra,
            evaluator: None,
        })
    }

    pub fn with_parameters(mut self, parameters: Vec<SymMatrix>) -> Result<Self> {
        for parameter in &parameters {
            parameter.as_symbols()?;
        }
        self.extra.extend(parameters.iter().cloned());
        self.parameters.extend(parameters);
        self.evaluator = None;
        Ok(self)
    }

    pub fn forward(&self) -> (&SymMatrix, &SymMatrix) {
        (&self.phi, &self.xdot)
    }

    /// Reference state symbols `(q_p, qdot_p, qddot_p)`.
    pub fn reference(&self) -> (&SymMatrix, &SymMatrix, &SymMatrix) {
        (&self.q_p, &self.qdot_p, &self.qddot_p)
    }

    /// `J_qp = d phi / d q_p`.
    pub fn reference_jacobian(&self) -> &SymMatrix {
        &self.reference_jacobian
    }

    pub fn jacobian_dot(&self) -> &SymMatrix {
        &self.jacobian_dot
    }

    pub fn reference_jacobian_dot(&self) -> &SymMatrix {
        &self.reference_jacobian_dot
    }

    pub fn parameters(&self) -> &[SymMatrix] {
        &self.parameters
    }

    pub fn concretize(&mut self) -> Result<()> {
        if self.evaluator.is_some() {
            return Ok(());
        }
        let mut variables = vec![&self.q, &self.qdot];
        variables.extend(&self.extra);
        self.evaluator = Some(Evaluator::compile(
            &variables,
            &[&self.phi, &self.xdot, &self.jacobian, &self.bias],
        )?);
        Ok(())
    }

    /// Arguments: `q, qdot, q_p, qdot_p, qddot_p, parameters...`.
    pub fn evaluate(&self, args: &[&[f64]]) -> Result<MapEvaluation> {
        let outputs = evaluator::concretized(&self.evaluator)?.evaluate(args)?;
        MapEvaluation::from_outputs(outputs)
    }
}

impl DifferentialMapping for VariableDifferentialMap {
    fn phi(&self) -> &SymMatrix {
        &self.phi
    }

    fn q(&self) -> &SymMatrix {
        &self.q
    }

    fn qdot(&self) -> &SymMatrix {
        &self.qdot
    }

    fn jacobian(&self) -> &SymMatrix {
        &self.jacobian
    }

    fn xdot(&self) -> &SymMatrix {
        &self.xdot
    }

    fn bias(&self) -> &SymMatrix {
        &self.bias
    }

    fn extra_variables(&self) -> &[SymMatrix] {
        &self.extra
    }
}

fn check_column(m: &SymMatrix, name: &str) -> Result<()> {
    if !m.is_column() {
        return Err(EngineError::dimension(format!("{name} columns"), 1, m.ncols()));
    }
    Ok(())
}

/// Symbols of a position vector, checked against its velocity vector.
fn state_symbols(position: &SymMatrix, velocity: &SymMatrix, name: &str) -> Result<Vec<Symbol>> {
    let symbols = position.as_symbols()?;
    let rates = velocity.as_symbols()?;
    if rates.len() != symbols.len() {
        return Err(EngineError::dimension(
            format!("{name} length"),
            symbols.len(),
            rates.len(),
        ));
    }
    Ok(symbols)
}
