//! Integer expressions used for array sizes, bit widths, and extra data.
//!
//! An expression is compiled once into a flat [Program] (postfix order) with
//! the classic two-stack precedence algorithm, and evaluated many times
//! against an [EvalContext] with a single operand stack.
//!
//! Precedence, from tightest to loosest:
//!
//! | operators | associativity |
//! |---|---|
//! | unary `-` `+` `~` | right |
//! | `*` `/` `%` | left |
//! | `+` `-` | left |
//! | `<<` `>>` `>>>` | left |
//! | `<` `<=` `>` `>=` | left |
//! | `==` `!=` | left |
//! | `&` | left |
//! | `^` | left |
//! | `\|` | left |
//!
//! Arithmetic wraps on overflow, comparisons produce `1` or `0`, shift counts
//! are masked to `0..64`, and `>>>` shifts in zeroes.

use std::fmt;

use crate::errors::ExprError;

/// Reference to an earlier field, resolved by the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    /// Dot-qualified path of the referenced field.
    pub path: String,
    /// Offset of the referenced descriptor in the compiled schema.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    Literal(i64),
    Field(FieldRef),
    /// Name resolved by the caller's [crate::handler::ExternalValueProvider].
    External(String),
    /// Current value of the stream position counter (`$$`).
    Counter,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(value) => write!(f, "{value}"),
            Operand::Field(field) => f.write_str(&field.path),
            Operand::External(name) => write!(f, "${name}"),
            Operand::Counter => f.write_str("$$"),
        }
    }
}

/// Operator symbol as written in the grammar. `+` and `-` are unary or
/// binary depending on their position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    Plus,
    Minus,
    Tilde,
    Star,
    Slash,
    Percent,
    Shl,
    Shr,
    UShr,
    Lt,
    LtEq,
    Gt,
    GtEq,
    EqEq,
    NotEq,
    Amp,
    Caret,
    Pipe,
}

impl Symbol {
    fn binary(self) -> Option<Operator> {
        let op = match self {
            Symbol::Plus => Operator::Add,
            Symbol::Minus => Operator::Sub,
            Symbol::Tilde => return None,
            Symbol::Star => Operator::Mul,
            Symbol::Slash => Operator::Div,
            Symbol::Percent => Operator::Rem,
            Symbol::Shl => Operator::Shl,
            Symbol::Shr => Operator::Shr,
            Symbol::UShr => Operator::UShr,
            Symbol::Lt => Operator::Lt,
            Symbol::LtEq => Operator::Le,
            Symbol::Gt => Operator::Gt,
            Symbol::GtEq => Operator::Ge,
            Symbol::EqEq => Operator::Eq,
            Symbol::NotEq => Operator::Ne,
            Symbol::Amp => Operator::And,
            Symbol::Caret => Operator::Xor,
            Symbol::Pipe => Operator::Or,
        };
        Some(op)
    }
}

/// Token handed to [Program::compile] by the schema compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprToken {
    Operand(Operand),
    Symbol(Symbol),
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Neg,
    Not,
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    UShr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Xor,
    Or,
}

impl Operator {
    pub fn arity(self) -> usize {
        match self {
            Operator::Neg | Operator::Not => 1,
            _ => 2,
        }
    }

    pub fn precedence(self) -> u8 {
        match self {
            Operator::Neg | Operator::Not => 9,
            Operator::Mul | Operator::Div | Operator::Rem => 8,
            Operator::Add | Operator::Sub => 7,
            Operator::Shl | Operator::Shr | Operator::UShr => 6,
            Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge => 5,
            Operator::Eq | Operator::Ne => 4,
            Operator::And => 3,
            Operator::Xor => 2,
            Operator::Or => 1,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Neg => "-",
            Operator::Not => "~",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Rem => "%",
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Shl => "<<",
            Operator::Shr => ">>",
            Operator::UShr => ">>>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::And => "&",
            Operator::Xor => "^",
            Operator::Or => "|",
        }
    }

    fn apply_unary(self, a: i64) -> i64 {
        match self {
            Operator::Neg => a.wrapping_neg(),
            _ => !a,
        }
    }

    fn apply_binary(self, a: i64, b: i64) -> Result<i64, ExprError> {
        let shift = (b & 63) as u32;
        let value = match self {
            Operator::Mul => a.wrapping_mul(b),
            Operator::Div if b == 0 => return Err(ExprError::DivisionByZero),
            Operator::Div => a.wrapping_div(b),
            Operator::Rem if b == 0 => return Err(ExprError::DivisionByZero),
            Operator::Rem => a.wrapping_rem(b),
            Operator::Add => a.wrapping_add(b),
            Operator::Sub => a.wrapping_sub(b),
            Operator::Shl => a.wrapping_shl(shift),
            Operator::Shr => a.wrapping_shr(shift),
            Operator::UShr => ((a as u64) >> shift) as i64,
            Operator::Lt => (a < b) as i64,
            Operator::Le => (a <= b) as i64,
            Operator::Gt => (a > b) as i64,
            Operator::Ge => (a >= b) as i64,
            Operator::Eq => (a == b) as i64,
            Operator::Ne => (a != b) as i64,
            Operator::And => a & b,
            Operator::Xor => a ^ b,
            Operator::Or => a | b,
            Operator::Neg | Operator::Not => self.apply_unary(b),
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instr {
    Push(Operand),
    Apply(Operator),
}

/// Values an expression can see while it is evaluated.
pub trait EvalContext {
    /// Latest value of an already parsed field, `None` if not produced yet.
    fn field_value(&self, field: &FieldRef) -> Option<i64>;
    /// Caller-supplied value for an external name.
    fn external_value(&self, name: &str) -> Option<i64>;
    /// Stream position counter in whole bytes.
    fn counter(&self) -> u64;
}

/// Context that knows nothing; used for constant folding.
struct NoContext;

impl EvalContext for NoContext {
    fn field_value(&self, _field: &FieldRef) -> Option<i64> {
        None
    }

    fn external_value(&self, _name: &str) -> Option<i64> {
        None
    }

    fn counter(&self) -> u64 {
        0
    }
}

/// A compiled, repeatedly evaluable integer expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Program {
    instrs: Vec<Instr>,
}

enum Pending {
    Op(Operator),
    Paren,
}

fn malformed(message: impl Into<String>) -> ExprError {
    ExprError::Malformed(message.into())
}

impl Program {
    /// A program that always yields `value`.
    pub fn constant(value: i64) -> Self {
        Program {
            instrs: vec![Instr::Push(Operand::Literal(value))],
        }
    }

    /// A program that yields a single operand.
    pub fn operand(operand: Operand) -> Self {
        Program {
            instrs: vec![Instr::Push(operand)],
        }
    }

    /// Compiles infix tokens into a program.
    ///
    /// Literal-only programs are folded into a single constant.
    pub fn compile(tokens: Vec<ExprToken>) -> Result<Self, ExprError> {
        if tokens.is_empty() {
            return Err(malformed("empty expression"));
        }

        let mut output: Vec<Instr> = Vec::with_capacity(tokens.len());
        let mut pending: Vec<Pending> = Vec::new();
        let mut expect_operand = true;

        for token in tokens {
            match token {
                ExprToken::Operand(operand) => {
                    if !expect_operand {
                        return Err(malformed(format!("missing operator before '{operand}'")));
                    }
                    output.push(Instr::Push(operand));
                    expect_operand = false;
                }
                ExprToken::LParen => {
                    if !expect_operand {
                        return Err(malformed("missing operator before '('"));
                    }
                    pending.push(Pending::Paren);
                }
                ExprToken::RParen => {
                    if expect_operand {
                        return Err(malformed("missing operand before ')'"));
                    }
                    loop {
                        match pending.pop() {
                            Some(Pending::Op(op)) => output.push(Instr::Apply(op)),
                            Some(Pending::Paren) => break,
                            None => return Err(malformed("unbalanced ')'")),
                        }
                    }
                }
                ExprToken::Symbol(symbol) if expect_operand => match symbol {
                    Symbol::Plus => {}
                    Symbol::Minus => pending.push(Pending::Op(Operator::Neg)),
                    Symbol::Tilde => pending.push(Pending::Op(Operator::Not)),
                    other => {
                        return Err(malformed(format!(
                            "missing left operand for '{}'",
                            other.binary().map_or("?", Operator::symbol)
                        )));
                    }
                },
                ExprToken::Symbol(symbol) => {
                    let op = symbol
                        .binary()
                        .ok_or_else(|| malformed("'~' is a unary operator"))?;

                    while let Some(Pending::Op(top)) = pending.last() {
                        if top.precedence() < op.precedence() {
                            break;
                        }
                        output.push(Instr::Apply(*top));
                        pending.pop();
                    }

                    pending.push(Pending::Op(op));
                    expect_operand = true;
                }
            }
        }

        if expect_operand {
            return Err(malformed("expression ends without an operand"));
        }

        while let Some(entry) = pending.pop() {
            match entry {
                Pending::Op(op) => output.push(Instr::Apply(op)),
                Pending::Paren => return Err(malformed("unbalanced '('")),
            }
        }

        let program = Program { instrs: output };
        program.check_stack()?;

        if program.is_literal_only() {
            return Ok(Program::constant(program.evaluate(&NoContext)?));
        }

        Ok(program)
    }

    /// Verifies that the program reduces to exactly one value.
    fn check_stack(&self) -> Result<(), ExprError> {
        let mut depth = 0usize;
        for instr in &self.instrs {
            match instr {
                Instr::Push(_) => depth += 1,
                Instr::Apply(op) => {
                    if depth < op.arity() {
                        return Err(malformed(format!("operator '{}' lacks operands", op.symbol())));
                    }
                    depth -= op.arity() - 1;
                }
            }
        }

        if depth != 1 {
            return Err(malformed("expression does not reduce to a single value"));
        }

        Ok(())
    }

    fn is_literal_only(&self) -> bool {
        self.instrs
            .iter()
            .all(|instr| !matches!(instr, Instr::Push(operand) if !matches!(operand, Operand::Literal(_))))
    }

    /// Value of a folded constant program.
    pub fn constant_value(&self) -> Option<i64> {
        match self.instrs.as_slice() {
            [Instr::Push(Operand::Literal(value))] => Some(*value),
            _ => None,
        }
    }

    pub fn instructions(&self) -> &[Instr] {
        &self.instrs
    }

    /// Fields referenced by this program.
    pub fn field_refs(&self) -> impl Iterator<Item = &FieldRef> {
        self.instrs.iter().filter_map(|instr| match instr {
            Instr::Push(Operand::Field(field)) => Some(field),
            _ => None,
        })
    }

    /// External names referenced by this program.
    pub fn external_names(&self) -> impl Iterator<Item = &str> {
        self.instrs.iter().filter_map(|instr| match instr {
            Instr::Push(Operand::External(name)) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn uses_counter(&self) -> bool {
        self.instrs
            .iter()
            .any(|instr| matches!(instr, Instr::Push(Operand::Counter)))
    }

    pub fn evaluate(&self, ctx: &dyn EvalContext) -> Result<i64, ExprError> {
        let mut stack: Vec<i64> = Vec::with_capacity(8);

        for instr in &self.instrs {
            match instr {
                Instr::Push(operand) => stack.push(resolve(operand, ctx)?),
                Instr::Apply(op) if op.arity() == 1 => {
                    let a = stack.pop().ok_or_else(|| malformed("operand stack underflow"))?;
                    stack.push(op.apply_unary(a));
                }
                Instr::Apply(op) => {
                    let b = stack.pop().ok_or_else(|| malformed("operand stack underflow"))?;
                    let a = stack.pop().ok_or_else(|| malformed("operand stack underflow"))?;
                    stack.push(op.apply_binary(a, b)?);
                }
            }
        }

        match (stack.pop(), stack.is_empty()) {
            (Some(value), true) => Ok(value),
            _ => Err(malformed("expression does not reduce to a single value")),
        }
    }
}

fn resolve(operand: &Operand, ctx: &dyn EvalContext) -> Result<i64, ExprError> {
    match operand {
        Operand::Literal(value) => Ok(*value),
        Operand::Field(field) => {
            ctx.field_value(field)
                .ok_or_else(|| ExprError::UnresolvedReference {
                    path: field.path.clone(),
                })
        }
        Operand::External(name) => {
            ctx.external_value(name)
                .ok_or_else(|| ExprError::ExternalNameUnresolved { name: name.clone() })
        }
        Operand::Counter => Ok(ctx.counter() as i64),
    }
}

impl fmt::Display for Program {
    /// Renders the program as infix text, parenthesizing nested operations.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stack: Vec<(String, bool)> = Vec::new();

        for instr in &self.instrs {
            match instr {
                Instr::Push(operand) => stack.push((operand.to_string(), false)),
                Instr::Apply(op) => {
                    let Some(b) = stack.pop() else {
                        return Err(fmt::Error);
                    };
                    if op.arity() == 1 {
                        stack.push((format!("{}{}", op.symbol(), wrap(b)), false));
                    } else {
                        let Some(a) = stack.pop() else {
                            return Err(fmt::Error);
                        };
                        stack.push((format!("{} {} {}", wrap(a), op.symbol(), wrap(b)), true));
                    }
                }
            }
        }

        match stack.pop() {
            Some((text, _)) => f.write_str(&text),
            None => Err(fmt::Error),
        }
    }
}

fn wrap((text, compound): (String, bool)) -> String {
    if compound { format!("({text})") } else { text }
}
