//! Unforced second-order dynamics `xddot = -h(x, xdot)`.

use crate::error::{EngineError, Result};
use crate::evaluator::{self, Evaluator};
use crate::matrix::SymMatrix;
use crate::pullback::{self, Pullback};
use crate::spec::Spec;
use crate::traits::{DifferentialMapping, SecondOrderDynamics};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryEvaluation {
    pub h: DVector<f64>,
    /// Always `-h`.
    pub xddot: DVector<f64>,
}

#[derive(Debug, Clone)]
pub struct Geometry {
    h: SymMatrix,
    x: SymMatrix,
    xdot: SymMatrix,
    parameters: Vec<SymMatrix>,
    evaluator: Option<Evaluator>,
}

impl Geometry {
    pub fn new(h: SymMatrix, x: SymMatrix, xdot: SymMatrix) -> Result<Self> {
        check_space(&x, &xdot)?;
        if !h.is_column() || h.nrows() != x.nrows() {
            return Err(EngineError::dimension("h length", x.nrows(), h.len()));
        }
        Ok(Self {
            h,
            x,
            xdot,
            parameters: Vec::new(),
            evaluator: None,
        })
    }

    /// Declares symbol vectors `h` depends on besides `x` and `xdot`.
    pub fn with_parameters(mut self, parameters: Vec<SymMatrix>) -> Result<Self> {
        for parameter in &parameters {
            parameter.as_symbols()?;
        }
        pullback::merge_groups(&mut self.parameters, &parameters);
        self.evaluator = None;
        Ok(self)
    }

    pub fn h(&self) -> &SymMatrix {
        &self.h
    }

    /// The same motion as a Spec with `M = I` and `f = h`.
    pub fn to_spec(&self) -> Result<Spec> {
        Spec::new(
            SymMatrix::identity(self.dimension()),
            self.h.clone(),
            self.x.clone(),
            self.xdot.clone(),
        )?
        .with_parameters(self.parameters.clone())
    }
}

impl SecondOrderDynamics for Geometry {
    type Evaluation = GeometryEvaluation;

    fn x(&self) -> &SymMatrix {
        &self.x
    }

    fn xdot(&self) -> &SymMatrix {
        &self.xdot
    }

    fn parameters(&self) -> &[SymMatrix] {
        &self.parameters
    }

    /// `h_q = J^T (h + bias)`, with `x` and `xdot` substituted.
    fn pull<D: DifferentialMapping + ?Sized>(&self, map: &D) -> Result<Self> {
        let pullback = Pullback::new(&self.x, &self.xdot, &self.parameters, map)?;
        let h = pullback.substitute(&self.h).try_add(pullback.bias())?;
        let h = pullback.project(&h)?;
        let (q, qdot) = pullback.source();
        Ok(Self {
            h,
            x: q,
            xdot: qdot,
            parameters: pullback.finish("geometry"),
            evaluator: None,
        })
    }

    fn concretize(&mut self) -> Result<()> {
        if self.evaluator.is_some() {
            return Ok(());
        }
        let evaluator = Evaluator::compile(&self.variables(), &[&self.h])?;
        self.evaluator = Some(evaluator);
        Ok(())
    }

    fn is_concretized(&self) -> bool {
        self.evaluator.is_some()
    }

    fn evaluate(&self, args: &[&[f64]]) -> Result<GeometryEvaluation> {
        let outputs = evaluator::concretized(&self.evaluator)?.evaluate(args)?;
        let h = outputs
            .first()
            .map(evaluator::to_vector)
            .ok_or_else(|| EngineError::dimension("geometry outputs", 1, 0))?;
        let xddot = -&h;
        Ok(GeometryEvaluation { h, xddot })
    }
}

/// `x` and `xdot` must be symbol columns of one length.
pub(crate) fn check_space(x: &SymMatrix, xdot: &SymMatrix) -> Result<()> {
    let n = x.as_symbols()?.len();
    let m = xdot.as_symbols()?.len();
    if n != m {
        return Err(EngineError::dimension("xdot length", n, m));
    }
    Ok(())
}
