//! Immutable symbolic expressions.
//!
//! An [`Expr`] is a node in a directed acyclic graph. Nodes are reference
//! counted and never mutated, so sub-expressions are freely shared between
//! a map, the objects pulled through it, and their derivatives.
//!
//! Constructors apply a handful of local rewrites (constant folding,
//! `x + 0`, `x * 1`, `x * 0`, `x ^ 1`, `x ^ 0`, `--x`). This keeps Jacobians of
//! sparse maps small without a separate simplification pass.

use crate::traits::Scalar;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SYMBOL_ID: AtomicU64 = AtomicU64::new(0);

/// A named scalar variable.
///
/// Identity is the id, not the name: two symbols called `q` are different
/// variables.
#[derive(Debug, Clone)]
pub struct Symbol {
    id: u64,
    name: Arc<str>,
}

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            id: NEXT_SYMBOL_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Single-argument operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Sin,
    Cos,
    Exp,
    Ln,
    Sqrt,
    Abs,
    /// -1, 0 or 1. Derivative of `Abs`.
    Sign,
}

impl UnaryOp {
    pub fn apply<T: Scalar>(self, a: T) -> T {
        match self {
            UnaryOp::Neg => -a,
            UnaryOp::Sin => a.sin(),
            UnaryOp::Cos => a.cos(),
            UnaryOp::Exp => a.exp(),
            UnaryOp::Ln => a.ln(),
            UnaryOp::Sqrt => a.sqrt(),
            UnaryOp::Abs => a.abs(),
            UnaryOp::Sign => {
                if a > T::zero() {
                    T::one()
                } else if a < T::zero() {
                    -T::one()
                } else {
                    T::zero()
                }
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Exp => "exp",
            UnaryOp::Ln => "ln",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Abs => "abs",
            UnaryOp::Sign => "sign",
        }
    }

    /// Looks up a function name as written in text expressions.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(UnaryOp::Sin),
            "cos" => Some(UnaryOp::Cos),
            "exp" => Some(UnaryOp::Exp),
            "ln" | "log" => Some(UnaryOp::Ln),
            "sqrt" => Some(UnaryOp::Sqrt),
            "abs" => Some(UnaryOp::Abs),
            "sign" => Some(UnaryOp::Sign),
            _ => None,
        }
    }
}

/// Two-argument operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn apply<T: Scalar>(self, a: T, b: T) -> T {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }

    pub fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
            BinaryOp::Pow => '^',
        }
    }
}

/// Expression graph node.
#[derive(Debug, PartialEq)]
pub enum Node {
    Constant(f64),
    Symbol(Symbol),
    Unary(UnaryOp, Expr),
    Binary(BinaryOp, Expr, Expr),
}

/// Shared handle to an immutable expression node.
#[derive(Clone, PartialEq)]
pub struct Expr(Arc<Node>);

impl Expr {
    fn from_node(node: Node) -> Self {
        Self(Arc::new(node))
    }

    pub fn constant(value: f64) -> Self {
        Self::from_node(Node::Constant(value))
    }

    pub fn zero() -> Self {
        Self::constant(0.0)
    }

    pub fn one() -> Self {
        Self::constant(1.0)
    }

    pub fn symbol(symbol: &Symbol) -> Self {
        Self::from_node(Node::Symbol(symbol.clone()))
    }

    pub fn node(&self) -> &Node {
        &self.0
    }

    pub fn as_constant(&self) -> Option<f64> {
        match self.node() {
            Node::Constant(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self.node() {
            Node::Symbol(symbol) => Some(symbol),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_constant() == Some(0.0)
    }

    pub fn is_one(&self) -> bool {
        self.as_constant() == Some(1.0)
    }

    /// True when both handles point at the same node.
    pub fn ptr_eq(&self, other: &Expr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Node address, used to memoize traversals of shared sub-graphs.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Builds `op(a)`, folding constants.
    pub fn unary(op: UnaryOp, a: Expr) -> Expr {
        if let Some(value) = a.as_constant() {
            return Expr::constant(op.apply(value));
        }
        match (op, a.node()) {
            (UnaryOp::Neg, Node::Unary(UnaryOp::Neg, inner)) => return inner.clone(),
            (UnaryOp::Abs, Node::Unary(UnaryOp::Abs, _)) => return a,
            (UnaryOp::Sign, Node::Unary(UnaryOp::Sign, _)) => return a,
            _ => {}
        }
        Expr::from_node(Node::Unary(op, a))
    }

    /// Builds `a op b`, folding constants and neutral elements.
    pub fn binary(op: BinaryOp, a: Expr, b: Expr) -> Expr {
        if let (Some(x), Some(y)) = (a.as_constant(), b.as_constant()) {
            return Expr::constant(op.apply(x, y));
        }
        match op {
            BinaryOp::Add => {
                if a.is_zero() {
                    return b;
                }
                if b.is_zero() {
                    return a;
                }
            }
            BinaryOp::Sub => {
                if b.is_zero() {
                    return a;
                }
                if a.is_zero() {
                    return Expr::unary(UnaryOp::Neg, b);
                }
            }
            BinaryOp::Mul => {
                if a.is_zero() || b.is_zero() {
                    return Expr::zero();
                }
                if a.is_one() {
                    return b;
                }
                if b.is_one() {
                    return a;
                }
                if a.as_constant() == Some(-1.0) {
                    return Expr::unary(UnaryOp::Neg, b);
                }
                if b.as_constant() == Some(-1.0) {
                    return Expr::unary(UnaryOp::Neg, a);
                }
            }
            BinaryOp::Div => {
                if a.is_zero() {
                    return Expr::zero();
                }
                if b.is_one() {
                    return a;
                }
            }
            BinaryOp::Pow => {
                if b.is_zero() {
                    return Expr::one();
                }
                if b.is_one() {
                    return a;
                }
            }
        }
        Expr::from_node(Node::Binary(op, a, b))
    }

    pub fn sin(&self) -> Expr {
        Expr::unary(UnaryOp::Sin, self.clone())
    }

    pub fn cos(&self) -> Expr {
        Expr::unary(UnaryOp::Cos, self.clone())
    }

    pub fn exp(&self) -> Expr {
        Expr::unary(UnaryOp::Exp, self.clone())
    }

    pub fn ln(&self) -> Expr {
        Expr::unary(UnaryOp::Ln, self.clone())
    }

    pub fn sqrt(&self) -> Expr {
        Expr::unary(UnaryOp::Sqrt, self.clone())
    }

    pub fn abs(&self) -> Expr {
        Expr::unary(UnaryOp::Abs, self.clone())
    }

    pub fn sign(&self) -> Expr {
        Expr::unary(UnaryOp::Sign, self.clone())
    }

    pub fn powf(&self, exponent: impl Into<Expr>) -> Expr {
        Expr::binary(BinaryOp::Pow, self.clone(), exponent.into())
    }

    pub fn powi(&self, exponent: i32) -> Expr {
        self.powf(Expr::constant(f64::from(exponent)))
    }

    /// Partial derivative with respect to `wrt`.
    pub fn diff(&self, wrt: &Symbol) -> Expr {
        let mut cache = HashMap::new();
        self.diff_with_cache(wrt, &mut cache)
    }

    /// Differentiation memoized on node identity. The cache is only valid
    /// for a single `wrt` and while the differentiated graphs are alive.
    pub(crate) fn diff_with_cache(&self, wrt: &Symbol, cache: &mut HashMap<usize, Expr>) -> Expr {
        if let Some(done) = cache.get(&self.key()) {
            return done.clone();
        }
        let derivative = match self.node() {
            Node::Constant(_) => Expr::zero(),
            Node::Symbol(symbol) => {
                if symbol == wrt {
                    Expr::one()
                } else {
                    Expr::zero()
                }
            }
            Node::Unary(op, a) => {
                let da = a.diff_with_cache(wrt, cache);
                if da.is_zero() {
                    Expr::zero()
                } else {
                    match op {
                        UnaryOp::Neg => -da,
                        UnaryOp::Sin => a.cos() * da,
                        UnaryOp::Cos => -(a.sin() * da),
                        UnaryOp::Exp => self * &da,
                        UnaryOp::Ln => da / a,
                        UnaryOp::Sqrt => da / (2.0 * self),
                        UnaryOp::Abs => a.sign() * da,
                        UnaryOp::Sign => Expr::zero(),
                    }
                }
            }
            Node::Binary(op, a, b) => {
                let da = a.diff_with_cache(wrt, cache);
                let db = b.diff_with_cache(wrt, cache);
                match op {
                    BinaryOp::Add => da + db,
                    BinaryOp::Sub => da - db,
                    BinaryOp::Mul => da * b + a * db,
                    BinaryOp::Div => (da * b - a * db) / b.powi(2),
                    BinaryOp::Pow => {
                        if db.is_zero() {
                            b * a.powf(b - 1.0) * da
                        } else {
                            self * (db * a.ln() + b * da / a)
                        }
                    }
                }
            }
        };
        cache.insert(self.key(), derivative.clone());
        derivative
    }

    /// Replaces every bound symbol by its replacement.
    pub fn substitute(&self, substitution: &Substitution) -> Expr {
        let mut cache = HashMap::new();
        self.substitute_with_cache(substitution, &mut cache)
    }

    pub(crate) fn substitute_with_cache(
        &self,
        substitution: &Substitution,
        cache: &mut HashMap<usize, Expr>,
    ) -> Expr {
        if substitution.is_empty() {
            return self.clone();
        }
        if let Some(done) = cache.get(&self.key()) {
            return done.clone();
        }
        let result = match self.node() {
            Node::Constant(_) => self.clone(),
            Node::Symbol(symbol) => substitution
                .get(symbol)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Node::Unary(op, a) => {
                let new_a = a.substitute_with_cache(substitution, cache);
                if new_a.ptr_eq(a) {
                    self.clone()
                } else {
                    Expr::unary(*op, new_a)
                }
            }
            Node::Binary(op, a, b) => {
                let new_a = a.substitute_with_cache(substitution, cache);
                let new_b = b.substitute_with_cache(substitution, cache);
                if new_a.ptr_eq(a) && new_b.ptr_eq(b) {
                    self.clone()
                } else {
                    Expr::binary(*op, new_a, new_b)
                }
            }
        };
        cache.insert(self.key(), result.clone());
        result
    }

    /// True if `symbol` occurs anywhere in the graph.
    pub fn depends_on(&self, symbol: &Symbol) -> bool {
        let mut visited = HashSet::new();
        self.depends_on_with_cache(symbol, &mut visited)
    }

    /// Shared nodes are visited once; a node already in `visited` is known
    /// not to contain `symbol`.
    fn depends_on_with_cache(&self, symbol: &Symbol, visited: &mut HashSet<usize>) -> bool {
        if !visited.insert(self.key()) {
            return false;
        }
        match self.node() {
            Node::Constant(_) => false,
            Node::Symbol(s) => s == symbol,
            Node::Unary(_, a) => a.depends_on_with_cache(symbol, visited),
            Node::Binary(_, a, b) => {
                a.depends_on_with_cache(symbol, visited) || b.depends_on_with_cache(symbol, visited)
            }
        }
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::constant(value)
    }
}

impl From<&Symbol> for Expr {
    fn from(symbol: &Symbol) -> Self {
        Expr::symbol(symbol)
    }
}

impl From<Symbol> for Expr {
    fn from(symbol: Symbol) -> Self {
        Expr::symbol(&symbol)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            Node::Constant(value) => write!(f, "{value}"),
            Node::Symbol(symbol) => write!(f, "{}", symbol.name()),
            Node::Unary(UnaryOp::Neg, a) => write!(f, "(-{a})"),
            Node::Unary(op, a) => write!(f, "{}({a})", op.name()),
            Node::Binary(op, a, b) => write!(f, "({a} {} {b})", op.symbol()),
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({self})")
    }
}

/// Explicit mapping from symbol identity to replacement expression.
#[derive(Debug, Clone, Default)]
pub struct Substitution {
    bindings: HashMap<u64, Expr>,
}

impl Substitution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: &Symbol, replacement: Expr) {
        self.bindings.insert(symbol.id(), replacement);
    }

    pub fn get(&self, symbol: &Symbol) -> Option<&Expr> {
        self.bindings.get(&symbol.id())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait<Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }

        impl $trait<&Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, self, rhs.clone())
            }
        }

        impl $trait<Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self.clone(), rhs)
            }
        }

        impl $trait<&Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, self.clone(), rhs.clone())
            }
        }

        impl $trait<f64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::binary($op, self, Expr::constant(rhs))
            }
        }

        impl $trait<f64> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                Expr::binary($op, self.clone(), Expr::constant(rhs))
            }
        }

        impl $trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, Expr::constant(self), rhs)
            }
        }

        impl $trait<&Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                Expr::binary($op, Expr::constant(self), rhs.clone())
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Add);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self)
    }
}

impl Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::unary(UnaryOp::Neg, self.clone())
    }
}
