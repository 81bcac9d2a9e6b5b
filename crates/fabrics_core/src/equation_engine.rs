use crate::error::{EngineError, Result};
use crate::expression::{BinaryOp, Expr, Node, Symbol, UnaryOp};
use crate::matrix::SymMatrix;
use crate::traits::Scalar;
use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of an input (by flattened index) onto the stack.
    LoadInput(usize),
    /// Pushes a previously stored shared sub-expression.
    LoadSlot(usize),
    /// Copies the top of the stack into a slot without popping it.
    Store(usize),
    /// Pops the top value into the output at the given index.
    Output(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    Sin,
    Cos,
    Exp,
    Ln,
    Sqrt,
    Abs,
    Sign,
}

impl OpCode {
    fn from_unary(op: UnaryOp) -> Self {
        match op {
            UnaryOp::Neg => OpCode::Neg,
            UnaryOp::Sin => OpCode::Sin,
            UnaryOp::Cos => OpCode::Cos,
            UnaryOp::Exp => OpCode::Exp,
            UnaryOp::Ln => OpCode::Ln,
            UnaryOp::Sqrt => OpCode::Sqrt,
            UnaryOp::Abs => OpCode::Abs,
            UnaryOp::Sign => OpCode::Sign,
        }
    }

    fn from_binary(op: BinaryOp) -> Self {
        match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Pow => OpCode::Pow,
        }
    }
}

/// Represents a compiled sequence of operations computing several outputs.
#[derive(Debug, Clone)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
    pub input_count: usize,
    pub output_count: usize,
    pub slot_count: usize,
}

/// Stack-based Virtual Machine for evaluating compiled outputs.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `inputs`: Flattened input values (read-only).
/// - `slots`, `stack`: Scratch buffers for intermediate values.
/// - `out`: Receives one value per compiled output.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        inputs: &[T],
        slots: &mut Vec<T>,
        stack: &mut Vec<T>,
        out: &mut [T],
    ) -> Result<()> {
        if inputs.len() != bytecode.input_count {
            return Err(EngineError::dimension(
                "program inputs",
                bytecode.input_count,
                inputs.len(),
            ));
        }
        if out.len() != bytecode.output_count {
            return Err(EngineError::dimension(
                "program outputs",
                bytecode.output_count,
                out.len(),
            ));
        }
        stack.clear();
        slots.clear();
        slots.resize(bytecode.slot_count, T::zero());

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => {
                    let val = T::from_f64(val).ok_or(EngineError::InvalidBytecode("constant"))?;
                    stack.push(val);
                }
                OpCode::LoadInput(idx) => {
                    let val = inputs
                        .get(idx)
                        .ok_or(EngineError::InvalidBytecode("input index"))?;
                    stack.push(*val);
                }
                OpCode::LoadSlot(idx) => {
                    let val = slots
                        .get(idx)
                        .ok_or(EngineError::InvalidBytecode("slot index"))?;
                    stack.push(*val);
                }
                OpCode::Store(idx) => {
                    let top = *stack.last().ok_or(EngineError::InvalidBytecode("store"))?;
                    let slot = slots
                        .get_mut(idx)
                        .ok_or(EngineError::InvalidBytecode("slot index"))?;
                    *slot = top;
                }
                OpCode::Output(idx) => {
                    let top = pop(stack)?;
                    let slot = out
                        .get_mut(idx)
                        .ok_or(EngineError::InvalidBytecode("output index"))?;
                    *slot = top;
                }
                OpCode::Add => binary(stack, BinaryOp::Add)?,
                OpCode::Sub => binary(stack, BinaryOp::Sub)?,
                OpCode::Mul => binary(stack, BinaryOp::Mul)?,
                OpCode::Div => binary(stack, BinaryOp::Div)?,
                OpCode::Pow => binary(stack, BinaryOp::Pow)?,
                OpCode::Neg => unary(stack, UnaryOp::Neg)?,
                OpCode::Sin => unary(stack, UnaryOp::Sin)?,
                OpCode::Cos => unary(stack, UnaryOp::Cos)?,
                OpCode::Exp => unary(stack, UnaryOp::Exp)?,
                OpCode::Ln => unary(stack, UnaryOp::Ln)?,
                OpCode::Sqrt => unary(stack, UnaryOp::Sqrt)?,
                OpCode::Abs => unary(stack, UnaryOp::Abs)?,
                OpCode::Sign => unary(stack, UnaryOp::Sign)?,
            }
        }
        Ok(())
    }
}

fn pop<T: Scalar>(stack: &mut Vec<T>) -> Result<T> {
    stack.pop().ok_or(EngineError::InvalidBytecode("stack underflow"))
}

fn unary<T: Scalar>(stack: &mut Vec<T>, op: UnaryOp) -> Result<()> {
    let a = pop(stack)?;
    stack.push(op.apply(a));
    Ok(())
}

fn binary<T: Scalar>(stack: &mut Vec<T>, op: BinaryOp) -> Result<()> {
    let b = pop(stack)?;
    let a = pop(stack)?;
    stack.push(op.apply(a, b));
    Ok(())
}

/// Compiles expression graphs into `Bytecode`.
/// Resolves symbols to flattened input indices.
pub struct Compiler {
    pub input_map: HashMap<u64, usize>,
    pub input_count: usize,
}

impl Compiler {
    pub fn new(inputs: &[Symbol]) -> Self {
        let mut input_map = HashMap::new();
        for (i, symbol) in inputs.iter().enumerate() {
            input_map.insert(symbol.id(), i);
        }
        Self {
            input_map,
            input_count: inputs.len(),
        }
    }

    /// Compiles all outputs into one program. A node reached more than once
    /// (within or across outputs) is computed once and reloaded from a slot.
    pub fn compile(&self, outputs: &[Expr]) -> Result<Bytecode> {
        let mut uses = HashMap::new();
        for expr in outputs {
            count_uses(expr, &mut uses);
        }

        let mut state = CompileState {
            ops: Vec::new(),
            uses,
            slots: HashMap::new(),
        };
        for (idx, expr) in outputs.iter().enumerate() {
            self.compile_recursive(expr, &mut state)?;
            state.ops.push(OpCode::Output(idx));
        }

        Ok(Bytecode {
            slot_count: state.slots.len(),
            ops: state.ops,
            input_count: self.input_count,
            output_count: outputs.len(),
        })
    }

    fn compile_recursive(&self, expr: &Expr, state: &mut CompileState) -> Result<()> {
        if let Some(&slot) = state.slots.get(&expr.key()) {
            state.ops.push(OpCode::LoadSlot(slot));
            return Ok(());
        }
        match expr.node() {
            Node::Constant(value) => {
                state.ops.push(OpCode::LoadConst(*value));
                return Ok(());
            }
            Node::Symbol(symbol) => {
                let idx = self
                    .input_map
                    .get(&symbol.id())
                    .ok_or_else(|| EngineError::UnboundSymbol(symbol.name().to_string()))?;
                state.ops.push(OpCode::LoadInput(*idx));
                return Ok(());
            }
            Node::Unary(op, a) => {
                self.compile_recursive(a, state)?;
                state.ops.push(OpCode::from_unary(*op));
            }
            Node::Binary(op, a, b) => {
                self.compile_recursive(a, state)?;
                self.compile_recursive(b, state)?;
                state.ops.push(OpCode::from_binary(*op));
            }
        }
        if state.uses.get(&expr.key()).copied().unwrap_or(0) > 1 {
            let slot = state.slots.len();
            state.slots.insert(expr.key(), slot);
            state.ops.push(OpCode::Store(slot));
        }
        Ok(())
    }
}

struct CompileState {
    ops: Vec<OpCode>,
    uses: HashMap<usize, usize>,
    slots: HashMap<usize, usize>,
}

/// Counts how many parents reference each node; children are only walked on
/// the first visit.
fn count_uses(expr: &Expr, uses: &mut HashMap<usize, usize>) {
    let count = uses.entry(expr.key()).or_insert(0);
    *count += 1;
    if *count > 1 {
        return;
    }
    match expr.node() {
        Node::Constant(_) | Node::Symbol(_) => {}
        Node::Unary(_, a) => count_uses(a, uses),
        Node::Binary(_, a, b) => {
            count_uses(a, uses);
            count_uses(b, uses);
        }
    }
}

// --- Simple Parser ---

/// Names visible to the parser.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    names: HashMap<String, Expr>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, expr: Expr) {
        self.names.insert(name.into(), expr);
    }

    /// Registers `name[i]` for every entry, and bare `name` for a scalar.
    pub fn insert_vector(&mut self, name: &str, vector: &SymMatrix) {
        for (i, entry) in vector.entries().iter().enumerate() {
            self.insert(format!("{name}[{i}]"), entry.clone());
        }
        if vector.len() == 1 {
            self.insert(name, vector[0].clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Expr> {
        self.names.get(name)
    }
}

/// Parses a string expression, resolving identifiers through `scope`.
pub fn parse(input: &str, scope: &Scope) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        scope,
    };
    let expr = parser.parse_expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::Parse(format!(
            "unexpected trailing input in `{input}`"
        )));
    }
    Ok(expr)
}

/// Parses one expression per entry into a column.
pub fn parse_column(inputs: &[&str], scope: &Scope) -> Result<SymMatrix> {
    let entries = inputs
        .iter()
        .map(|input| parse(input, scope))
        .collect::<Result<Vec<_>>>()?;
    Ok(SymMatrix::column(entries))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains('e') {
                    num_str.push('e');
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '-' || sign == '+' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| EngineError::Parse(format!("invalid number `{num_str}`")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            // Indexed names like `q[1]` are a single identifier.
            if let Some('[') = chars.peek() {
                ident.push('[');
                chars.next();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) if d.is_ascii_digit() => ident.push(d),
                        _ => {
                            return Err(EngineError::Parse(format!(
                                "malformed index after `{ident}`"
                            )))
                        }
                    }
                }
                ident.push(']');
            }
            tokens.push(Token::Identifier(ident));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => {
                    return Err(EngineError::Parse(format!("unexpected character `{other}`")))
                }
            };
            tokens.push(token);
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    scope: &'a Scope,
}

impl Parser<'_> {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_term()
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;

        while let Some(token) = self.peek() {
            match token {
                Token::Plus => {
                    self.consume();
                    let right = self.parse_factor()?;
                    left = left + right;
                }
                Token::Minus => {
                    self.consume();
                    let right = self.parse_factor()?;
                    left = left - right;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            match token {
                Token::Star => {
                    self.consume();
                    let right = self.parse_unary()?;
                    left = left * right;
                }
                Token::Slash => {
                    self.consume();
                    let right = self.parse_unary()?;
                    left = left / right;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(-expr);
        }
        self.parse_power()
    }

    /// `^` is right associative and binds tighter than unary minus.
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::constant(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let op = UnaryOp::from_name(&name)
                        .ok_or_else(|| EngineError::Parse(format!("unknown function `{name}`")))?;
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::unary(op, arg))
                } else {
                    self.scope
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| EngineError::Parse(format!("unknown variable `{name}`")))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(EngineError::Parse(format!("unexpected token {token:?}"))),
            None => Err(EngineError::Parse("unexpected end of input".to_string())),
        }
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(EngineError::Parse("expected ')'".to_string())),
        }
    }
}
