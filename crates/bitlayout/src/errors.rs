//! Error types for schema compilation, expression evaluation, and bit reading.

use thiserror::Error;

use crate::lexer::Position;

/// Errors produced while compiling grammar text into a [crate::compiled::CompiledSchema].
///
/// Compilation stops at the first error; no partial schema is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The grammar text is malformed.
    #[error("syntax error at {position}: {message}")]
    Syntax { position: Position, message: String },

    /// Two fields in the same structure share a name.
    #[error("duplicate field name '{name}' at {position}")]
    DuplicateFieldName { name: String, position: Position },

    /// A type keyword is neither a primitive nor a registered custom type.
    #[error("unknown type '{name}' at {position}")]
    UnknownType { name: String, position: Position },

    /// A literal array size is negative.
    #[error("invalid array size {size} for field '{field}' at {position}")]
    InvalidArraySize {
        field: String,
        size: i64,
        position: Position,
    },

    /// A literal bit width is outside `1..=64`.
    #[error("invalid bit width {width} for field '{field}' at {position}")]
    InvalidBitWidth {
        field: String,
        width: i64,
        position: Position,
    },

    /// The custom type handler refused the field declaration.
    #[error("custom type '{name}' rejected for field '{field}' at {position}")]
    CustomTypeRejected {
        name: String,
        field: String,
        position: Position,
    },

    /// A size, width, or extra-data expression failed to compile.
    #[error("broken expression in field '{field}' at {position}: {source}")]
    BrokenExpression {
        field: String,
        position: Position,
        #[source]
        source: ExprError,
    },
}

/// Errors produced by the expression model, at compile or evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExprError {
    /// Operator arity, parentheses, or emptiness problem.
    #[error("malformed expression: {0}")]
    Malformed(String),

    /// A referenced field has not been produced in the current parse.
    #[error("unresolved reference to field '{path}'")]
    UnresolvedReference { path: String },

    /// No value was supplied for an external name.
    #[error("no value provided for external name '{name}'")]
    ExternalNameUnresolved { name: String },

    /// Division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero,
}

/// Errors produced by the bit stream engine.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The source ended in the middle of a read.
    #[error("input truncated at byte {position}")]
    TruncatedInput { position: u64 },

    /// Sub-byte reads accept widths `1..=8` only.
    #[error("invalid bit count {0}, expected 1..=8")]
    InvalidBitCount(u8),

    /// Multi-byte reads accept sizes `1..=8` only.
    #[error("invalid byte count {0}, expected 1..=8")]
    InvalidByteCount(usize),

    /// The underlying source failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors produced while executing a compiled schema against a byte source.
///
/// Parsing is all-or-nothing: any error aborts and no partial tree is returned.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The stream failed while reading `field`.
    #[error("read failed in field '{field}' at byte {position}: {source}")]
    Read {
        field: String,
        position: u64,
        #[source]
        source: ReadError,
    },

    /// An array size, bit width or action argument could not be evaluated.
    #[error("expression failed in field '{field}' at byte {position}: {source}")]
    Expression {
        field: String,
        position: u64,
        #[source]
        source: ExprError,
    },

    /// Structure markers are not properly paired.
    #[error("structural violation at descriptor {offset}: {message}")]
    StructuralViolation { offset: usize, message: String },

    /// An array size expression evaluated below zero.
    #[error("negative array length {length} for field '{field}'")]
    NegativeArrayLength { field: String, length: i64 },

    /// A computed bit width fell outside `1..=64`.
    #[error("invalid bit width {width} for field '{field}'")]
    InvalidBitWidth { field: String, width: i64 },

    /// An `align` or `skip` argument evaluated below zero.
    #[error("negative argument {value} for {action} directive")]
    InvalidActionArgument { action: &'static str, value: i64 },

    /// A custom or var field was reached but no handler is configured.
    #[error("no {kind} handler configured for field '{field}'")]
    MissingHandler { kind: &'static str, field: String },

    /// A custom or var handler reported a failure of its own.
    #[error("handler failed in field '{field}': {message}")]
    Handler { field: String, message: String },
}

impl ParseError {
    /// True when retrying with a different external value provider may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ParseError::Expression {
                source: ExprError::ExternalNameUnresolved { .. },
                ..
            }
        )
    }

    /// True when the failure was caused by the source running out of bytes.
    pub fn is_truncated_input(&self) -> bool {
        matches!(
            self,
            ParseError::Read {
                source: ReadError::TruncatedInput { .. },
                ..
            }
        )
    }
}

/// Errors reported by custom-type and var-field handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler's own stream read failed.
    #[error(transparent)]
    Read(#[from] ReadError),

    /// The data or the request made no sense to the handler.
    #[error("{0}")]
    Invalid(String),
}
