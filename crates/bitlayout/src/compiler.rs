//! Schema compiler: grammar text to [CompiledSchema].
//!
//! A single left-to-right pass over the token stream with bounded
//! lookahead. Opening a structure pushes a naming scope, closing pops it.
//! Size, width, and extra-data clauses are compiled into [Program]s on the
//! spot; nothing is evaluated except literal-only constants.
//!
//! ```text
//! schema      := item*
//! item        := field ';' | struct_open | '}' | action ';'
//! field       := ['<' | '>'] type [':' arg] ['[' size ']'] [name]
//! struct_open := [name] ['[' size ']'] '{'
//! action      := align [':' arg] | skip [':' arg] | reset$$
//! size        := '_' | expression
//! arg         := number | path | '$' name | '$$' | '(' expression ')'
//! ```

use std::collections::HashSet;

use tracing::debug;

use crate::{
    compiled::{CompiledSchema, Symbol, SymbolKind, SymbolTable},
    errors::{CompileError, ExprError},
    expr::{ExprToken, FieldRef, Operand, Program, Symbol as OpSymbol},
    field::{
        ActionKind, ArraySize, FieldDescriptor, FieldKind, FieldTypeInfo, NamedFieldInfo,
        PrimitiveKind,
    },
    handler::CustomTypeHandler,
    lexer::{Position, Token, TokenKind, tokenize},
    order::ByteOrder,
};

/// Compiles grammar text. `custom_types` declares which extra type names exist.
pub fn compile(
    grammar: &str,
    custom_types: Option<&dyn CustomTypeHandler>,
) -> Result<CompiledSchema, CompileError> {
    let tokens = tokenize(grammar)?;
    let schema = Compiler::new(tokens, custom_types).run()?;

    debug!(
        descriptors = schema.len(),
        symbols = schema.symbols().len(),
        "schema compiled"
    );

    Ok(schema)
}

/// Naming scope opened by a structure.
struct Scope {
    /// Offset of the structure start marker, `None` for the root.
    start: Option<usize>,
    /// Path prefix for members; anonymous structures reuse their parent's.
    path: String,
    names: HashSet<String>,
    is_array: bool,
    whole_stream: bool,
    position: Position,
}

impl Scope {
    fn root() -> Self {
        Scope {
            start: None,
            path: String::new(),
            names: HashSet::new(),
            is_array: false,
            whole_stream: false,
            position: Position::default(),
        }
    }
}

/// Plain name compiled as external because no field matched it yet.
struct Unresolved {
    /// Paths it would have resolved to, one per scope visible at the reference.
    candidates: Vec<String>,
    field: String,
    position: Position,
}

/// Type of a declaration after keyword lookup.
enum DeclaredType {
    Primitive(PrimitiveKind),
    Bits,
    Var,
    Val,
    Custom(String),
}

struct Compiler<'a> {
    tokens: Vec<Token>,
    pos: usize,
    custom_types: Option<&'a dyn CustomTypeHandler>,

    fields: Vec<FieldDescriptor>,
    symbols: SymbolTable,
    scopes: Vec<Scope>,

    anonymous_counter: u32,
    /// Where a `[_]` array was completed; nothing may follow it.
    stream_consumed_at: Option<Position>,
    /// A later declaration matching one of these is a forward reference.
    unresolved: Vec<Unresolved>,
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl<'a> Compiler<'a> {
    fn new(tokens: Vec<Token>, custom_types: Option<&'a dyn CustomTypeHandler>) -> Self {
        Compiler {
            tokens,
            pos: 0,
            custom_types,
            fields: Vec::new(),
            symbols: SymbolTable::default(),
            scopes: vec![Scope::root()],
            anonymous_counter: 0,
            stream_consumed_at: None,
            unresolved: Vec::new(),
        }
    }

    fn peek(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.pos.min(last)]
    }

    fn peek_kind_at(&self, ahead: usize) -> &TokenKind {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + ahead).min(last)].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn syntax(&self, position: Position, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            position,
            message: message.into(),
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, CompileError> {
        let token = self.advance();
        if token.kind != kind {
            return Err(self.syntax(
                token.position,
                format!("expected {what}, found {}", token.kind.describe()),
            ));
        }
        Ok(token)
    }

    fn scope(&self) -> &Scope {
        // The root scope is never popped.
        &self.scopes[self.scopes.len() - 1]
    }

    fn run(mut self) -> Result<CompiledSchema, CompileError> {
        loop {
            let token = self.peek().clone();
            match &token.kind {
                TokenKind::Eof => break,
                TokenKind::RBrace => {
                    self.advance();
                    self.close_struct(token.position)?;
                }
                TokenKind::LBrace => {
                    self.advance();
                    self.open_struct(None, None, token.position)?;
                }
                TokenKind::LBracket => {
                    let size = self.array_clause()?;
                    self.expect(TokenKind::LBrace, "'{' after anonymous structure array")?;
                    self.open_struct(None, Some(size), token.position)?;
                }
                TokenKind::Lt | TokenKind::Gt => {
                    self.advance();
                    let order = if token.kind == TokenKind::Lt {
                        ByteOrder::LittleEndian
                    } else {
                        ByteOrder::BigEndian
                    };
                    let type_token = self.advance();
                    let type_name = match type_token.kind {
                        TokenKind::Ident(name) => name,
                        other => {
                            return Err(self.syntax(
                                type_token.position,
                                format!("expected type after byte order, found {}", other.describe()),
                            ));
                        }
                    };
                    self.field(Some(order), type_name, token.position, None)?;
                }
                TokenKind::Ident(word) => self.item_from_ident(word.clone(), token.position)?,
                other => {
                    return Err(self.syntax(
                        token.position,
                        format!("unexpected {}", other.describe()),
                    ));
                }
            }
        }

        if let Some(open) = self.scopes.last().filter(|scope| scope.start.is_some()) {
            return Err(self.syntax(open.position, "structure is not closed"));
        }

        Ok(CompiledSchema::new(self.fields, self.symbols))
    }

    fn item_from_ident(&mut self, word: String, position: Position) -> Result<(), CompileError> {
        let next = self.peek_kind_at(1).clone();

        match (word.as_str(), &next) {
            ("align", TokenKind::Colon | TokenKind::Semicolon) => {
                self.advance();
                return self.action(ActionKind::Align, position);
            }
            ("skip", TokenKind::Colon | TokenKind::Semicolon) => {
                self.advance();
                return self.action(ActionKind::Skip, position);
            }
            ("reset", TokenKind::Counter) => {
                self.advance();
                self.advance();
                return self.action(ActionKind::ResetCounter, position);
            }
            _ => {}
        }

        self.advance();
        match next {
            TokenKind::LBrace => {
                self.advance();
                self.open_struct(Some(word), None, position)
            }
            TokenKind::LBracket => {
                let size = self.array_clause()?;
                if *self.peek_kind_at(0) == TokenKind::LBrace {
                    self.advance();
                    self.open_struct(Some(word), Some(size), position)
                } else {
                    self.field(None, word, position, Some(size))
                }
            }
            _ => self.field(None, word, position, None),
        }
    }

    fn check_not_after_whole_stream(&self, position: Position) -> Result<(), CompileError> {
        match self.stream_consumed_at {
            Some(at) => Err(self.syntax(
                position,
                format!("declaration after the read-to-end array at {at}"),
            )),
            None => Ok(()),
        }
    }

    fn next_anonymous_id(&mut self) -> u32 {
        let id = self.anonymous_counter;
        self.anonymous_counter += 1;
        id
    }

    /// Registers `name` in the current scope and the symbol table.
    fn register(
        &mut self,
        name: &str,
        position: Position,
        kind: SymbolKind,
    ) -> Result<NamedFieldInfo, CompileError> {
        let offset = self.fields.len();
        let path = join_path(&self.scope().path, name);

        if self.scope().names.contains(name) || self.symbols.contains(&path) {
            return Err(CompileError::DuplicateFieldName {
                name: path,
                position,
            });
        }

        if let Some(pending) = self.unresolved.iter().find(|pending| pending.candidates.contains(&path)) {
            return Err(CompileError::BrokenExpression {
                field: pending.field.clone(),
                position: pending.position,
                source: ExprError::UnresolvedReference { path },
            });
        }

        let array_scope = self
            .scopes
            .iter()
            .rev()
            .find(|scope| scope.is_array)
            .and_then(|scope| scope.start);

        let ordinal = self.symbols.len();
        self.symbols.insert(Symbol {
            path: path.clone(),
            offset,
            ordinal,
            kind,
            array_scope,
        });

        let last = self.scopes.len() - 1;
        self.scopes[last].names.insert(name.to_string());

        Ok(NamedFieldInfo {
            name: name.to_string(),
            path,
            offset,
        })
    }

    fn open_struct(
        &mut self,
        name: Option<String>,
        array: Option<RawArray>,
        position: Position,
    ) -> Result<(), CompileError> {
        self.check_not_after_whole_stream(position)?;

        let label = name.clone().unwrap_or_else(|| "{}".to_string());
        let array = match array {
            Some(raw) => Some(self.array_size(raw, &label)?),
            None => None,
        };

        let offset = self.fields.len();
        let (info, anonymous_id) = match &name {
            Some(name) => (Some(self.register(name, position, SymbolKind::Struct)?), None),
            None => (None, Some(self.next_anonymous_id())),
        };

        let path = match &info {
            Some(info) => info.path.clone(),
            None => self.scope().path.clone(),
        };

        self.scopes.push(Scope {
            start: Some(offset),
            path,
            names: HashSet::new(),
            is_array: array.is_some(),
            whole_stream: matches!(array, Some(ArraySize::WholeStream)),
            position,
        });

        self.fields.push(FieldDescriptor {
            kind: FieldKind::StructStart { end: offset },
            name: info,
            anonymous_id,
            byte_order: None,
            array,
            position,
        });

        Ok(())
    }

    fn close_struct(&mut self, position: Position) -> Result<(), CompileError> {
        let start = match self.scopes.last().and_then(|scope| scope.start) {
            Some(start) => start,
            None => return Err(self.syntax(position, "'}' without an open structure")),
        };
        let Some(scope) = self.scopes.pop() else {
            return Err(self.syntax(position, "'}' without an open structure"));
        };

        let end = self.fields.len();
        self.fields[start].kind = FieldKind::StructStart { end };
        let name = self.fields[start].name.clone();

        self.fields.push(FieldDescriptor {
            kind: FieldKind::StructEnd { start },
            name,
            anonymous_id: None,
            byte_order: None,
            array: None,
            position,
        });

        if scope.whole_stream {
            self.stream_consumed_at = Some(scope.position);
        }

        Ok(())
    }

    fn action(&mut self, kind: ActionKind, position: Position) -> Result<(), CompileError> {
        self.check_not_after_whole_stream(position)?;

        let argument = if kind != ActionKind::ResetCounter && *self.peek_kind_at(0) == TokenKind::Colon {
            self.advance();
            let raw = self.argument()?;
            let program = self.expression(raw, kind.keyword(), position)?;
            if let Some(value) = program.constant_value() {
                if value < 0 {
                    return Err(self.syntax(
                        position,
                        format!("{} argument must not be negative", kind.keyword()),
                    ));
                }
            }
            Some(program)
        } else {
            None
        };

        self.expect(TokenKind::Semicolon, "';'")?;

        self.fields.push(FieldDescriptor {
            kind: FieldKind::Action { kind, argument },
            name: None,
            anonymous_id: None,
            byte_order: None,
            array: None,
            position,
        });

        Ok(())
    }

    fn declared_type(&self, name: &str, position: Position) -> Result<DeclaredType, CompileError> {
        if let Some(kind) = PrimitiveKind::from_keyword(name) {
            return Ok(DeclaredType::Primitive(kind));
        }

        match name {
            "bit" => return Ok(DeclaredType::Bits),
            "var" => return Ok(DeclaredType::Var),
            "val" => return Ok(DeclaredType::Val),
            _ => {}
        }

        let known = self
            .custom_types
            .is_some_and(|handler| handler.type_names().iter().any(|known| *known == name));
        if known {
            Ok(DeclaredType::Custom(name.to_string()))
        } else {
            Err(CompileError::UnknownType {
                name: name.to_string(),
                position,
            })
        }
    }

    fn field(
        &mut self,
        byte_order: Option<ByteOrder>,
        type_name: String,
        position: Position,
        array: Option<RawArray>,
    ) -> Result<(), CompileError> {
        self.check_not_after_whole_stream(position)?;
        let declared = self.declared_type(&type_name, position)?;

        let argument = if array.is_none() && *self.peek_kind_at(0) == TokenKind::Colon {
            let colon = self.advance();
            if matches!(declared, DeclaredType::Primitive(_)) {
                return Err(self.syntax(
                    colon.position,
                    format!("type '{type_name}' does not take an argument"),
                ));
            }
            Some(self.argument()?)
        } else {
            None
        };

        let array = match array {
            Some(raw) => Some(raw),
            None if *self.peek_kind_at(0) == TokenKind::LBracket => Some(self.array_clause()?),
            None => None,
        };

        let name = match self.peek_kind_at(0).clone() {
            TokenKind::Ident(name) => {
                let token = self.advance();
                Some((name, token.position))
            }
            _ => None,
        };
        self.expect(TokenKind::Semicolon, "';' after field declaration")?;

        let label = name
            .as_ref()
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| type_name.clone());

        let array = match array {
            Some(raw) => Some(self.array_size(raw, &label)?),
            None => None,
        };
        let argument = match argument {
            Some(raw) => Some(self.expression(raw, &label, position)?),
            None => None,
        };

        let kind = match declared {
            DeclaredType::Primitive(kind) => FieldKind::Primitive(kind),
            DeclaredType::Bits => {
                let width = argument.unwrap_or_else(|| Program::constant(1));
                if let Some(value) = width.constant_value() {
                    if !(1..=64).contains(&value) {
                        return Err(CompileError::InvalidBitWidth {
                            field: label,
                            width: value,
                            position,
                        });
                    }
                }
                FieldKind::Bits { width }
            }
            DeclaredType::Var => FieldKind::Var { extra: argument },
            DeclaredType::Val => {
                let Some(expr) = argument else {
                    return Err(self.syntax(position, "'val' needs an expression, e.g. val:(a+1) name"));
                };
                if array.is_some() {
                    return Err(self.syntax(position, "'val' fields cannot be arrays"));
                }
                if name.is_none() {
                    return Err(self.syntax(position, "'val' fields must be named"));
                }
                FieldKind::Val { expr }
            }
            DeclaredType::Custom(type_name) => {
                let type_info = FieldTypeInfo {
                    type_name,
                    byte_order,
                };
                if let Some(handler) = self.custom_types {
                    if !handler.is_allowed(&type_info, argument.as_ref(), array.is_some()) {
                        return Err(CompileError::CustomTypeRejected {
                            name: type_info.type_name,
                            field: label,
                            position,
                        });
                    }
                }
                FieldKind::Custom {
                    type_info,
                    extra: argument,
                }
            }
        };

        let symbol_kind = if array.is_some() {
            SymbolKind::Array
        } else {
            SymbolKind::Value
        };
        let (info, anonymous_id) = match &name {
            Some((name, name_position)) => (Some(self.register(name, *name_position, symbol_kind)?), None),
            None => (None, Some(self.next_anonymous_id())),
        };

        let whole_stream = matches!(array, Some(ArraySize::WholeStream));
        self.fields.push(FieldDescriptor {
            kind,
            name: info,
            anonymous_id,
            byte_order,
            array,
            position,
        });

        if whole_stream {
            self.stream_consumed_at = Some(position);
        }

        Ok(())
    }

    /// Collects the tokens of `[ ... ]`.
    fn array_clause(&mut self) -> Result<RawArray, CompileError> {
        let open = self.expect(TokenKind::LBracket, "'['")?;
        let mut tokens = Vec::new();

        loop {
            let token = self.advance();
            match token.kind {
                TokenKind::RBracket => break,
                TokenKind::LBracket
                | TokenKind::LBrace
                | TokenKind::RBrace
                | TokenKind::Semicolon
                | TokenKind::Eof => {
                    return Err(self.syntax(open.position, "unterminated array size"));
                }
                _ => tokens.push(token),
            }
        }

        if tokens.is_empty() {
            return Err(self.syntax(open.position, "empty array size"));
        }
        let whole_stream = matches!(
            tokens.as_slice(),
            [Token { kind: TokenKind::Ident(word), .. }] if word == "_"
        );

        if whole_stream {
            Ok(RawArray::WholeStream)
        } else {
            Ok(RawArray::Expr(tokens, open.position))
        }
    }

    /// Collects the tokens of an argument after `:`.
    fn argument(&mut self) -> Result<Vec<Token>, CompileError> {
        let first = self.advance();
        match &first.kind {
            TokenKind::LParen => {
                let mut depth = 1usize;
                let mut tokens = vec![first];
                while depth > 0 {
                    let token = self.advance();
                    match token.kind {
                        TokenKind::LParen => depth += 1,
                        TokenKind::RParen => depth -= 1,
                        TokenKind::Semicolon | TokenKind::Eof => {
                            return Err(self.syntax(tokens[0].position, "unterminated '('"));
                        }
                        _ => {}
                    }
                    tokens.push(token);
                }
                Ok(tokens)
            }
            TokenKind::Number(_) | TokenKind::External(_) | TokenKind::Counter => Ok(vec![first]),
            TokenKind::Ident(_) => {
                let mut tokens = vec![first];
                while *self.peek_kind_at(0) == TokenKind::Dot {
                    tokens.push(self.advance());
                    let segment = self.advance();
                    if !matches!(segment.kind, TokenKind::Ident(_)) {
                        return Err(self.syntax(segment.position, "expected name after '.'"));
                    }
                    tokens.push(segment);
                }
                Ok(tokens)
            }
            other => Err(self.syntax(
                first.position,
                format!("expected number, name, or '(' after ':', found {}", other.describe()),
            )),
        }
    }

    fn array_size(&mut self, raw: RawArray, label: &str) -> Result<ArraySize, CompileError> {
        match raw {
            RawArray::WholeStream => Ok(ArraySize::WholeStream),
            RawArray::Expr(tokens, position) => {
                let program = self.expression(tokens, label, position)?;
                if let Some(size) = program.constant_value() {
                    if size < 0 {
                        return Err(CompileError::InvalidArraySize {
                            field: label.to_string(),
                            size,
                            position,
                        });
                    }
                }
                Ok(ArraySize::Expr(program))
            }
        }
    }

    fn expression(
        &mut self,
        tokens: Vec<Token>,
        label: &str,
        position: Position,
    ) -> Result<Program, CompileError> {
        let broken = |source: ExprError| CompileError::BrokenExpression {
            field: label.to_string(),
            position,
            source,
        };

        let mut converted = Vec::with_capacity(tokens.len());
        let mut iter = tokens.into_iter().peekable();

        while let Some(token) = iter.next() {
            let expr_token = match token.kind {
                TokenKind::Number(value) => ExprToken::Operand(Operand::Literal(value)),
                TokenKind::External(name) => ExprToken::Operand(Operand::External(name)),
                TokenKind::Counter => ExprToken::Operand(Operand::Counter),
                TokenKind::Ident(first) => {
                    let mut path = first;
                    while iter.peek().is_some_and(|next| next.kind == TokenKind::Dot) {
                        iter.next();
                        match iter.next().map(|segment| segment.kind) {
                            Some(TokenKind::Ident(segment)) => {
                                path.push('.');
                                path.push_str(&segment);
                            }
                            _ => return Err(broken(ExprError::Malformed("expected name after '.'".into()))),
                        }
                    }
                    let operand = self.resolve(&path).map_err(broken)?;
                    if matches!(operand, Operand::External(_)) {
                        let candidates = self.scopes.iter().map(|scope| join_path(&scope.path, &path)).collect();
                        self.unresolved.push(Unresolved {
                            candidates,
                            field: label.to_string(),
                            position,
                        });
                    }
                    ExprToken::Operand(operand)
                }
                TokenKind::LParen => ExprToken::LParen,
                TokenKind::RParen => ExprToken::RParen,
                TokenKind::Plus => ExprToken::Symbol(OpSymbol::Plus),
                TokenKind::Minus => ExprToken::Symbol(OpSymbol::Minus),
                TokenKind::Tilde => ExprToken::Symbol(OpSymbol::Tilde),
                TokenKind::Star => ExprToken::Symbol(OpSymbol::Star),
                TokenKind::Slash => ExprToken::Symbol(OpSymbol::Slash),
                TokenKind::Percent => ExprToken::Symbol(OpSymbol::Percent),
                TokenKind::Shl => ExprToken::Symbol(OpSymbol::Shl),
                TokenKind::Shr => ExprToken::Symbol(OpSymbol::Shr),
                TokenKind::UShr => ExprToken::Symbol(OpSymbol::UShr),
                TokenKind::Lt => ExprToken::Symbol(OpSymbol::Lt),
                TokenKind::LtEq => ExprToken::Symbol(OpSymbol::LtEq),
                TokenKind::Gt => ExprToken::Symbol(OpSymbol::Gt),
                TokenKind::GtEq => ExprToken::Symbol(OpSymbol::GtEq),
                TokenKind::EqEq => ExprToken::Symbol(OpSymbol::EqEq),
                TokenKind::NotEq => ExprToken::Symbol(OpSymbol::NotEq),
                TokenKind::Amp => ExprToken::Symbol(OpSymbol::Amp),
                TokenKind::Caret => ExprToken::Symbol(OpSymbol::Caret),
                TokenKind::Pipe => ExprToken::Symbol(OpSymbol::Pipe),
                other => {
                    return Err(broken(ExprError::Malformed(format!(
                        "unexpected {} in expression",
                        other.describe()
                    ))));
                }
            };
            converted.push(expr_token);
        }

        Program::compile(converted).map_err(broken)
    }

    /// Resolves a name against the visible scopes, innermost first.
    ///
    /// Names that match no visible field become external names; declaring
    /// one of them later is rejected in [Compiler::register].
    fn resolve(&self, path: &str) -> Result<Operand, ExprError> {
        for scope in self.scopes.iter().rev() {
            let candidate = join_path(&scope.path, path);
            let Some(symbol) = self.symbols.get(&candidate) else {
                continue;
            };

            match symbol.kind {
                SymbolKind::Struct => {
                    return Err(ExprError::Malformed(format!(
                        "structure '{candidate}' cannot be used as a value"
                    )));
                }
                SymbolKind::Array => {
                    return Err(ExprError::Malformed(format!(
                        "array '{candidate}' cannot be used as a value"
                    )));
                }
                SymbolKind::Value => {}
            }

            if let Some(array_start) = symbol.array_scope {
                let visible = self.scopes.iter().any(|scope| scope.start == Some(array_start));
                if !visible {
                    return Err(ExprError::Malformed(format!(
                        "field '{candidate}' lives inside a structure array"
                    )));
                }
            }

            return Ok(Operand::Field(FieldRef {
                path: candidate,
                offset: symbol.offset,
            }));
        }

        Ok(Operand::External(path.to_string()))
    }
}

/// Array clause before its expression is compiled.
enum RawArray {
    WholeStream,
    Expr(Vec<Token>, Position),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FloatTypes;

    fn compile_ok(grammar: &str) -> CompiledSchema {
        compile(grammar, None).unwrap()
    }

    #[test]
    fn test_flat_fields() {
        let schema = compile_ok("ubyte regI; <ushort altHL; int [2] pair; bit:3 flags;");
        let fields = schema.fields();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].kind, FieldKind::Primitive(PrimitiveKind::UByte));
        assert_eq!(fields[1].byte_order, Some(ByteOrder::LittleEndian));
        assert_eq!(fields[1].name.as_ref().unwrap().name, "althl");
        assert_eq!(fields[2].array, Some(ArraySize::Expr(Program::constant(2))));
        assert_eq!(
            fields[3].kind,
            FieldKind::Bits {
                width: Program::constant(3)
            }
        );
    }

    #[test]
    fn test_nested_struct_paths() {
        let schema = compile_ok("header { ubyte len; flags { bit:1 ack; } } byte [header.len] body;");
        assert!(schema.symbols().contains("header"));
        assert!(schema.symbols().contains("header.len"));
        assert!(schema.symbols().contains("header.flags.ack"));

        let body = schema.find("body").unwrap();
        let Some(ArraySize::Expr(program)) = &body.array else {
            panic!("body should have a sized array");
        };
        assert_eq!(
            program.field_refs().next().map(|field| field.path.as_str()),
            Some("header.len")
        );
    }

    #[test]
    fn test_struct_markers_are_paired() {
        let schema = compile_ok("a { b { int x; } } int y;");
        let fields = schema.fields();
        assert_eq!(fields[0].kind, FieldKind::StructStart { end: 4 });
        assert_eq!(fields[1].kind, FieldKind::StructStart { end: 3 });
        assert_eq!(fields[3].kind, FieldKind::StructEnd { start: 1 });
        assert_eq!(fields[4].kind, FieldKind::StructEnd { start: 0 });
        assert_eq!(fields[4].name.as_ref().unwrap().path, "a");
    }

    #[test]
    fn test_inner_names_resolve_relative_to_scope() {
        let schema = compile_ok("int n; items [n] { ubyte len; byte [len] data; }");
        let data = schema.find("items.data").unwrap();
        let Some(ArraySize::Expr(program)) = &data.array else {
            panic!("data should have a sized array");
        };
        assert_eq!(program.to_string(), "items.len");
    }

    #[test]
    fn test_unknown_names_become_external() {
        let schema = compile_ok("byte [$count + size] a; int other;");
        let a = schema.find("a").unwrap();
        let Some(ArraySize::Expr(program)) = &a.array else {
            panic!("a should have a sized array");
        };
        assert_eq!(program.external_names().collect::<Vec<_>>(), vec!["count", "size"]);
        assert!(schema.has_external_names());
    }

    #[test]
    fn test_forward_references_rejected() {
        let err = compile("ubyte [later] a; ubyte later;", None).unwrap_err();
        assert!(matches!(
            err,
            CompileError::BrokenExpression {
                ref field,
                source: ExprError::UnresolvedReference { ref path },
                ..
            } if field == "a" && path == "later"
        ));

        assert!(matches!(
            compile("s { bit:(n) v; } ubyte n;", None),
            Err(CompileError::BrokenExpression { .. })
        ));
        assert!(matches!(
            compile("ubyte [a] a;", None),
            Err(CompileError::BrokenExpression { .. })
        ));

        // only scopes visible at the reference count
        assert!(compile("s { ubyte [n] v; } t { ubyte n; }", None).is_ok());
        // explicit external names never clash with fields
        assert!(compile("ubyte [$later] a; ubyte later;", None).is_ok());
    }

    #[test]
    fn test_actions() {
        let schema = compile_ok("byte a; align:4; skip:(a*2); reset$$; align; skip;");
        let kinds: Vec<_> = schema
            .fields()
            .iter()
            .filter_map(|field| match &field.kind {
                FieldKind::Action { kind, argument } => {
                    Some((*kind, argument.as_ref().and_then(Program::constant_value)))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ActionKind::Align, Some(4)),
                (ActionKind::Skip, None),
                (ActionKind::ResetCounter, None),
                (ActionKind::Align, None),
                (ActionKind::Skip, None),
            ]
        );
    }

    #[test]
    fn test_anonymous_fields_get_counter_ids() {
        let schema = compile_ok("byte; int named; bit:2;");
        assert_eq!(schema.fields()[0].anonymous_id, Some(0));
        assert_eq!(schema.fields()[1].anonymous_id, None);
        assert_eq!(schema.fields()[2].display_name(), "_afield1");
    }

    #[test]
    fn test_compile_is_deterministic() {
        let grammar = "int n; h [n] { bit:(n+1) b; } byte [_] rest;";
        assert_eq!(compile_ok(grammar), compile_ok(grammar));
    }

    #[test]
    fn test_duplicate_field_name() {
        let err = compile("int a; byte A;", None).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateFieldName { name, .. } if name == "a"));

        // same name in different structures is fine
        assert!(compile("int a; s { int a; }", None).is_ok());
    }

    #[test]
    fn test_unknown_type() {
        let err = compile("float f;", None).unwrap_err();
        assert!(matches!(err, CompileError::UnknownType { name, .. } if name == "float"));
        assert!(compile("float f;", Some(&FloatTypes)).is_ok());
    }

    #[test]
    fn test_custom_type_rejected() {
        let err = compile("float:2 f;", Some(&FloatTypes)).unwrap_err();
        assert!(matches!(err, CompileError::CustomTypeRejected { .. }));
    }

    #[test]
    fn test_negative_array_size() {
        let err = compile("byte [-1] a;", None).unwrap_err();
        assert!(matches!(err, CompileError::InvalidArraySize { size: -1, .. }));
    }

    #[test]
    fn test_invalid_bit_width() {
        assert!(matches!(
            compile("bit:0 a;", None),
            Err(CompileError::InvalidBitWidth { width: 0, .. })
        ));
        assert!(matches!(
            compile("bit:65 a;", None),
            Err(CompileError::InvalidBitWidth { width: 65, .. })
        ));
    }

    #[test]
    fn test_broken_expression() {
        let err = compile("byte [2 *] a;", None).unwrap_err();
        assert!(matches!(
            err,
            CompileError::BrokenExpression { field, source: ExprError::Malformed(_), .. } if field == "a"
        ));

        let err = compile("bit:(1+(2) a;", None).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));
    }

    #[test]
    fn test_array_and_struct_references_rejected() {
        assert!(matches!(
            compile("byte [2] a; byte [a] b;", None),
            Err(CompileError::BrokenExpression { .. })
        ));
        assert!(matches!(
            compile("s { int x; } byte [s] b;", None),
            Err(CompileError::BrokenExpression { .. })
        ));
        assert!(matches!(
            compile("s [2] { int x; } byte [s.x] b;", None),
            Err(CompileError::BrokenExpression { .. })
        ));
    }

    #[test]
    fn test_syntax_errors() {
        let err = compile("int a", None).unwrap_err();
        assert!(matches!(err, CompileError::Syntax { .. }));

        let err = compile("s { int a;", None).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Syntax { position, .. } if position == Position::new(1, 1)
        ));

        assert!(matches!(compile("}", None), Err(CompileError::Syntax { .. })));
        assert!(matches!(compile("int:3 a;", None), Err(CompileError::Syntax { .. })));
        assert!(matches!(compile("byte [] a;", None), Err(CompileError::Syntax { .. })));
        assert!(matches!(compile("val:(1) ;", None), Err(CompileError::Syntax { .. })));
        assert!(matches!(compile("val v;", None), Err(CompileError::Syntax { .. })));
    }

    #[test]
    fn test_nothing_after_read_to_end_array() {
        assert!(matches!(
            compile("byte [_] rest; int tail;", None),
            Err(CompileError::Syntax { .. })
        ));
        assert!(matches!(
            compile("items [_] { byte a; } align;", None),
            Err(CompileError::Syntax { .. })
        ));
        assert!(compile("s { byte [_] rest; }", None).is_ok());
    }

    #[test]
    fn test_val_and_var() {
        let schema = compile_ok("ubyte a; val:(a*2) twice; var:3 [a] custom;");
        assert!(matches!(schema.find("twice").unwrap().kind, FieldKind::Val { .. }));
        assert!(matches!(
            schema.find("custom").unwrap().kind,
            FieldKind::Var { ref extra } if extra.as_ref().and_then(Program::constant_value) == Some(3)
        ));
        assert!(schema.has_var_fields());
    }

    #[test]
    fn test_keywords_usable_as_struct_names() {
        let schema = compile_ok("align { byte skip; } reset { int x; }");
        assert!(schema.symbols().contains("align.skip"));
        assert!(schema.symbols().contains("reset.x"));
    }
}
