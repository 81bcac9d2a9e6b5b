//! Dense matrices of symbolic expressions.
//!
//! Storage is row-major. Vectors are `n x 1` matrices; a scalar is `1 x 1`.
//! Shape errors are reported as [`EngineError::DimensionMismatch`] instead of
//! panicking, since shapes usually come from caller-built expressions.

use crate::error::{EngineError, Result};
use crate::expression::{Expr, Substitution, Symbol};
use std::collections::HashMap;
use std::ops::Index;

#[derive(Debug, Clone, PartialEq)]
pub struct SymMatrix {
    rows: usize,
    cols: usize,
    data: Vec<Expr>,
}

impl SymMatrix {
    /// Builds a matrix from row-major entries.
    pub fn new(rows: usize, cols: usize, data: Vec<Expr>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(EngineError::dimension(
                format!("{rows}x{cols} matrix entries"),
                rows * cols,
                data.len(),
            ));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> Expr) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            for j in 0..cols {
                data.push(f(i, j));
            }
        }
        Self { rows, cols, data }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::from_fn(rows, cols, |_, _| Expr::zero())
    }

    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |i, j| if i == j { Expr::one() } else { Expr::zero() })
    }

    pub fn column(entries: Vec<Expr>) -> Self {
        Self {
            rows: entries.len(),
            cols: 1,
            data: entries,
        }
    }

    pub fn scalar(entry: Expr) -> Self {
        Self::column(vec![entry])
    }

    pub fn constant_column(values: &[f64]) -> Self {
        Self::column(values.iter().map(|&v| Expr::constant(v)).collect())
    }

    pub fn from_row_slice(rows: usize, cols: usize, values: &[f64]) -> Result<Self> {
        Self::new(rows, cols, values.iter().map(|&v| Expr::constant(v)).collect())
    }

    /// A column of `n` fresh symbols named `name[0]`, `name[1]`, ...
    pub fn symbols(name: &str, n: usize) -> Self {
        Self::column(
            (0..n)
                .map(|i| Expr::symbol(&Symbol::new(format!("{name}[{i}]"))))
                .collect(),
        )
    }

    pub fn from_symbols(symbols: &[Symbol]) -> Self {
        Self::column(symbols.iter().map(Expr::symbol).collect())
    }

    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_column(&self) -> bool {
        self.cols == 1
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    pub fn entries(&self) -> &[Expr] {
        &self.data
    }

    /// Returns the entries as symbols; fails if any entry is a compound
    /// expression or the matrix is not a column.
    pub fn as_symbols(&self) -> Result<Vec<Symbol>> {
        if !self.is_column() {
            return Err(EngineError::dimension("variable vector columns", 1, self.cols));
        }
        self.data
            .iter()
            .map(|e| {
                e.as_symbol()
                    .cloned()
                    .ok_or_else(|| EngineError::NotASymbol(e.to_string()))
            })
            .collect()
    }

    pub fn transpose(&self) -> Self {
        Self::from_fn(self.cols, self.rows, |i, j| self[(j, i)].clone())
    }

    pub fn matmul(&self, rhs: &SymMatrix) -> Result<Self> {
        if self.cols != rhs.rows {
            return Err(EngineError::dimension(
                "matrix product inner dimension",
                self.cols,
                rhs.rows,
            ));
        }
        Ok(Self::from_fn(self.rows, rhs.cols, |i, j| {
            let mut acc = Expr::zero();
            for k in 0..self.cols {
                acc = acc + &self[(i, k)] * &rhs[(k, j)];
            }
            acc
        }))
    }

    pub fn try_add(&self, rhs: &SymMatrix) -> Result<Self> {
        self.zip_map(rhs, "matrix sum", |a, b| a + b)
    }

    pub fn try_sub(&self, rhs: &SymMatrix) -> Result<Self> {
        self.zip_map(rhs, "matrix difference", |a, b| a - b)
    }

    /// Entry-wise combination of two equally shaped matrices.
    pub fn zip_map(
        &self,
        rhs: &SymMatrix,
        context: &str,
        mut f: impl FnMut(&Expr, &Expr) -> Expr,
    ) -> Result<Self> {
        if self.rows != rhs.rows {
            return Err(EngineError::dimension(format!("{context} rows"), self.rows, rhs.rows));
        }
        if self.cols != rhs.cols {
            return Err(EngineError::dimension(format!("{context} columns"), self.cols, rhs.cols));
        }
        Ok(Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().zip(&rhs.data).map(|(a, b)| f(a, b)).collect(),
        })
    }

    pub fn map(&self, f: impl FnMut(&Expr) -> Expr) -> Self {
        Self {
            rows: self.rows,
            cols: self.cols,
            data: self.data.iter().map(f).collect(),
        }
    }

    pub fn neg(&self) -> Self {
        self.map(|e| -e)
    }

    pub fn scale(&self, factor: &Expr) -> Self {
        self.map(|e| e * factor)
    }

    /// Entry-wise absolute value.
    pub fn abs(&self) -> Self {
        self.map(Expr::abs)
    }

    pub fn dot(&self, rhs: &SymMatrix) -> Result<Expr> {
        if self.len() != rhs.len() {
            return Err(EngineError::dimension("dot product", self.len(), rhs.len()));
        }
        Ok(self
            .data
            .iter()
            .zip(&rhs.data)
            .fold(Expr::zero(), |acc, (a, b)| acc + a * b))
    }

    pub fn norm_squared(&self) -> Expr {
        self.data.iter().fold(Expr::zero(), |acc, e| acc + e * e)
    }

    /// Euclidean norm of all entries.
    pub fn norm(&self) -> Expr {
        self.norm_squared().sqrt()
    }

    /// `d self / d wrt` for a column `self`: one row per entry, one column
    /// per symbol.
    pub fn jacobian(&self, wrt: &[Symbol]) -> Result<Self> {
        if !self.is_column() {
            return Err(EngineError::dimension("jacobian operand columns", 1, self.cols));
        }
        let cols = wrt.len();
        let mut data = vec![Expr::zero(); self.rows * cols];
        for (j, symbol) in wrt.iter().enumerate() {
            let mut cache = HashMap::new();
            for (i, entry) in self.data.iter().enumerate() {
                data[i * cols + j] = entry.diff_with_cache(symbol, &mut cache);
            }
        }
        Ok(Self {
            rows: self.rows,
            cols,
            data,
        })
    }

    /// Total time derivative `sum_k d self / d vars[k] * rates[k]`.
    pub fn time_derivative(&self, vars: &[Symbol], rates: &[Expr]) -> Result<Self> {
        if vars.len() != rates.len() {
            return Err(EngineError::dimension("time derivative rates", vars.len(), rates.len()));
        }
        let mut out = vec![Expr::zero(); self.data.len()];
        for (symbol, rate) in vars.iter().zip(rates) {
            let mut cache = HashMap::new();
            for (slot, entry) in out.iter_mut().zip(&self.data) {
                let d = entry.diff_with_cache(symbol, &mut cache);
                if !d.is_zero() {
                    *slot = &*slot + d * rate;
                }
            }
        }
        Ok(Self {
            rows: self.rows,
            cols: self.cols,
            data: out,
        })
    }

    pub fn substitute(&self, substitution: &Substitution) -> Self {
        let mut cache = HashMap::new();
        self.map(|e| e.substitute_with_cache(substitution, &mut cache))
    }

    /// Stacks columns on top of each other.
    pub fn vstack(parts: &[&SymMatrix]) -> Result<Self> {
        let mut data = Vec::new();
        for part in parts {
            if !part.is_column() {
                return Err(EngineError::dimension("stacked part columns", 1, part.cols));
            }
            data.extend(part.data.iter().cloned());
        }
        Ok(Self::column(data))
    }
}

impl Index<(usize, usize)> for SymMatrix {
    type Output = Expr;

    fn index(&self, (i, j): (usize, usize)) -> &Expr {
        &self.data[i * self.cols + j]
    }
}

impl Index<usize> for SymMatrix {
    type Output = Expr;

    fn index(&self, i: usize) -> &Expr {
        &self.data[i]
    }
}

impl Substitution {
    /// Binds each symbol of `variables` to the matching entry of `replacement`.
    pub fn bind(&mut self, variables: &SymMatrix, replacement: &SymMatrix) -> Result<()> {
        let symbols = variables.as_symbols()?;
        if symbols.len() != replacement.len() {
            return Err(EngineError::dimension(
                "substitution replacement",
                symbols.len(),
                replacement.len(),
            ));
        }
        for (symbol, expr) in symbols.iter().zip(replacement.entries()) {
            self.insert(symbol, expr.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(m: &SymMatrix, subs: &Substitution) -> Vec<f64> {
        m.substitute(subs)
            .entries()
            .iter()
            .map(|e| e.as_constant().expect("fully bound"))
            .collect()
    }

    #[test]
    fn new_rejects_wrong_entry_count() {
        let err = SymMatrix::new(2, 2, vec![Expr::one()]).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { expected: 4, actual: 1, .. }));
    }

    #[test]
    fn product_with_identity_is_noop() {
        let a = SymMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]).expect("shape");
        let b = a.matmul(&SymMatrix::identity(2)).expect("conformant");
        assert_eq!(a, b);
        assert!(a.matmul(&SymMatrix::identity(3)).is_err());
    }

    #[test]
    fn transpose_swaps_indices() {
        let a = SymMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("shape");
        let t = a.transpose();
        assert_eq!(t.nrows(), 3);
        assert_eq!(t[(2, 1)].as_constant(), Some(6.0));
    }

    #[test]
    fn jacobian_of_planar_arm() {
        let q = SymMatrix::symbols("q", 2);
        let symbols = q.as_symbols().expect("symbols");
        let fk = SymMatrix::column(vec![
            q[0].cos() + (&q[0] + &q[1]).cos(),
            q[0].sin() + (&q[0] + &q[1]).sin(),
        ]);
        let j = fk.jacobian(&symbols).expect("column");
        assert_eq!((j.nrows(), j.ncols()), (2, 2));

        let mut subs = Substitution::new();
        subs.bind(&q, &SymMatrix::constant_column(&[0.3, -0.5])).expect("bind");
        let values = numeric(&j, &subs);
        let (a, b) = (0.3_f64, -0.2_f64);
        let expected = [
            -a.sin() - b.sin(),
            -b.sin(),
            a.cos() + b.cos(),
            b.cos(),
        ];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-12);
        }
    }

    #[test]
    fn time_derivative_sums_over_rates() {
        let q = SymMatrix::symbols("q", 2);
        let qdot = SymMatrix::symbols("qdot", 2);
        let symbols = q.as_symbols().expect("symbols");
        let m = SymMatrix::scalar(&q[0] * &q[1]);
        let d = m
            .time_derivative(&symbols, qdot.entries())
            .expect("rates match");

        let mut subs = Substitution::new();
        subs.bind(&q, &SymMatrix::constant_column(&[2.0, 3.0])).expect("bind");
        subs.bind(&qdot, &SymMatrix::constant_column(&[0.5, -1.0])).expect("bind");
        assert!((numeric(&d, &subs)[0] - (3.0 * 0.5 + 2.0 * -1.0)).abs() < 1e-12);
        assert!(m.time_derivative(&symbols, &qdot.entries()[..1]).is_err());
    }

    #[test]
    fn as_symbols_rejects_compound_entries() {
        let q = SymMatrix::symbols("q", 1);
        let shifted = q.map(|e| e + 1.0);
        assert!(matches!(shifted.as_symbols(), Err(EngineError::NotASymbol(_))));
    }

    #[test]
    fn norm_and_dot() {
        let v = SymMatrix::constant_column(&[3.0, 4.0]);
        assert_eq!(v.norm().as_constant(), Some(5.0));
        assert_eq!(v.dot(&v).expect("same length").as_constant(), Some(25.0));
    }
}
