//! Compiled numeric evaluators.
//!
//! An [`Evaluator`] fixes a declared input layout (one group per variable
//! vector) and an output layout (one matrix per output), and runs the
//! compiled program through the VM. Evaluation never mutates the evaluator,
//! so a shared reference can be used from several threads.

use crate::autodiff::Dual;
use crate::equation_engine::{Bytecode, Compiler, VM};
use crate::error::{EngineError, Result};
use crate::expression::Expr;
use crate::matrix::SymMatrix;
use nalgebra::{DMatrix, DVector};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Evaluator {
    bytecode: Bytecode,
    input_dims: Vec<usize>,
    output_shapes: Vec<(usize, usize)>,
}

impl Evaluator {
    /// Compiles `outputs` as functions of `variables`.
    pub fn compile(variables: &[&SymMatrix], outputs: &[&SymMatrix]) -> Result<Self> {
        let mut symbols = Vec::new();
        let mut input_dims = Vec::with_capacity(variables.len());
        for variable in variables {
            let group = variable.as_symbols()?;
            input_dims.push(group.len());
            symbols.extend(group);
        }

        let flat: Vec<Expr> = outputs
            .iter()
            .flat_map(|m| m.entries().iter().cloned())
            .collect();
        let bytecode = Compiler::new(&symbols).compile(&flat)?;
        debug!(
            inputs = symbols.len(),
            outputs = flat.len(),
            ops = bytecode.ops.len(),
            slots = bytecode.slot_count,
            "compiled evaluator"
        );

        Ok(Self {
            bytecode,
            input_dims,
            output_shapes: outputs.iter().map(|m| (m.nrows(), m.ncols())).collect(),
        })
    }

    /// Length of each positional argument group.
    pub fn input_dimensions(&self) -> &[usize] {
        &self.input_dims
    }

    pub fn output_shapes(&self) -> &[(usize, usize)] {
        &self.output_shapes
    }

    pub fn instruction_count(&self) -> usize {
        self.bytecode.ops.len()
    }

    /// Buffers sized for this program, for use with [`Evaluator::evaluate_into`].
    pub fn workspace(&self) -> Workspace {
        Workspace {
            inputs: Vec::with_capacity(self.bytecode.input_count),
            slots: Vec::with_capacity(self.bytecode.slot_count),
            stack: Vec::with_capacity(32),
            outputs: vec![0.0; self.bytecode.output_count],
        }
    }

    /// Evaluates every output; one slice per declared variable group.
    pub fn evaluate(&self, args: &[&[f64]]) -> Result<Vec<DMatrix<f64>>> {
        let mut workspace = self.workspace();
        let flat = self.evaluate_into(args, &mut workspace)?;
        Ok(self.split(flat))
    }

    /// Evaluates into caller-owned buffers and returns the outputs flattened
    /// row-major, in declaration order. Once `workspace` has grown to this
    /// program, repeated calls do not allocate.
    pub fn evaluate_into<'w>(
        &self,
        args: &[&[f64]],
        workspace: &'w mut Workspace,
    ) -> Result<&'w [f64]> {
        self.flatten_into(args, &mut workspace.inputs)?;
        workspace.outputs.resize(self.bytecode.output_count, 0.0);
        VM::execute(
            &self.bytecode,
            &workspace.inputs,
            &mut workspace.slots,
            &mut workspace.stack,
            &mut workspace.outputs,
        )?;
        Ok(&workspace.outputs)
    }

    /// Evaluates every output and its directional derivative along
    /// `tangents`, which share the argument layout.
    pub fn evaluate_tangent(
        &self,
        args: &[&[f64]],
        tangents: &[&[f64]],
    ) -> Result<(Vec<DMatrix<f64>>, Vec<DMatrix<f64>>)> {
        let values = self.flatten(args)?;
        let directions = self.flatten(tangents)?;
        let inputs: Vec<Dual> = values
            .iter()
            .zip(&directions)
            .map(|(&v, &d)| Dual::new(v, d))
            .collect();

        let mut out = vec![Dual::constant(0.0); self.bytecode.output_count];
        VM::execute(
            &self.bytecode,
            &inputs,
            &mut Vec::new(),
            &mut Vec::with_capacity(32),
            &mut out,
        )?;
        let values: Vec<f64> = out.iter().map(|d| d.value).collect();
        let tangents: Vec<f64> = out.iter().map(|d| d.tangent).collect();
        Ok((self.split(&values), self.split(&tangents)))
    }

    fn flatten(&self, args: &[&[f64]]) -> Result<Vec<f64>> {
        let mut flat = Vec::with_capacity(self.bytecode.input_count);
        self.flatten_into(args, &mut flat)?;
        Ok(flat)
    }

    fn flatten_into(&self, args: &[&[f64]], flat: &mut Vec<f64>) -> Result<()> {
        if args.len() != self.input_dims.len() {
            return Err(EngineError::ArgumentCount {
                expected: self.input_dims.len(),
                actual: args.len(),
            });
        }
        flat.clear();
        for (i, (arg, &dim)) in args.iter().zip(&self.input_dims).enumerate() {
            if arg.len() != dim {
                return Err(EngineError::dimension(format!("argument {i}"), dim, arg.len()));
            }
            flat.extend_from_slice(arg);
        }
        Ok(())
    }

    fn split(&self, flat: &[f64]) -> Vec<DMatrix<f64>> {
        let mut offset = 0;
        self.output_shapes
            .iter()
            .map(|&(rows, cols)| {
                let m = DMatrix::from_row_slice(rows, cols, &flat[offset..offset + rows * cols]);
                offset += rows * cols;
                m
            })
            .collect()
    }
}

/// Scratch buffers reused across [`Evaluator::evaluate_into`] calls.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    inputs: Vec<f64>,
    slots: Vec<f64>,
    stack: Vec<f64>,
    outputs: Vec<f64>,
}

/// Returns the cached evaluator or the out-of-order error.
pub(crate) fn concretized(evaluator: &Option<Evaluator>) -> Result<&Evaluator> {
    evaluator.as_ref().ok_or(EngineError::UnconcretizedEvaluation)
}

/// Flattens a column output into a vector.
pub(crate) fn to_vector(m: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_column_slice(m.as_slice())
}
