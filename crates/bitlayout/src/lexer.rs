//! Tokenizer for schema grammar text.
//!
//! Identifiers and keywords are case-insensitive and are normalized to
//! lowercase. `//` starts a comment that runs to the end of the line.

use std::{fmt, iter::Peekable, str::Chars};

use crate::errors::CompileError;

/// Line/column location in grammar text, both starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Position { line, column }
    }
}

impl Default for Position {
    fn default() -> Self {
        Position { line: 1, column: 1 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Number(i64),
    /// `$name`
    External(String),
    /// `$$`
    Counter,

    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Semicolon,
    Colon,
    Dot,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    UShr,
    Lt,
    LtEq,
    Gt,
    GtEq,
    EqEq,
    NotEq,

    Eof,
}

impl TokenKind {
    /// Human-readable token text used in syntax error messages.
    pub fn describe(&self) -> String {
        let text = match self {
            TokenKind::Ident(name) => return format!("'{name}'"),
            TokenKind::Number(value) => return format!("'{value}'"),
            TokenKind::External(name) => return format!("'${name}'"),
            TokenKind::Counter => "$$",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::Dot => ".",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Amp => "&",
            TokenKind::Pipe => "|",
            TokenKind::Caret => "^",
            TokenKind::Tilde => "~",
            TokenKind::Shl => "<<",
            TokenKind::Shr => ">>",
            TokenKind::UShr => ">>>",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Eof => return "end of input".to_string(),
        };
        format!("'{text}'")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub position: Position,
}

/// Splits grammar text into tokens. The result always ends with [TokenKind::Eof].
pub fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek() == Some(&expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn run(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();

        loop {
            self.skip_trivia();
            let position = self.position();
            let Some(c) = self.bump() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    position,
                });
                return Ok(tokens);
            };

            let kind = match c {
                '{' => TokenKind::LBrace,
                '}' => TokenKind::RBrace,
                '[' => TokenKind::LBracket,
                ']' => TokenKind::RBracket,
                '(' => TokenKind::LParen,
                ')' => TokenKind::RParen,
                ';' => TokenKind::Semicolon,
                ':' => TokenKind::Colon,
                '.' => TokenKind::Dot,
                '+' => TokenKind::Plus,
                '-' => TokenKind::Minus,
                '*' => TokenKind::Star,
                '/' => TokenKind::Slash,
                '%' => TokenKind::Percent,
                '&' => TokenKind::Amp,
                '|' => TokenKind::Pipe,
                '^' => TokenKind::Caret,
                '~' => TokenKind::Tilde,
                '<' => {
                    if self.eat('<') {
                        TokenKind::Shl
                    } else if self.eat('=') {
                        TokenKind::LtEq
                    } else {
                        TokenKind::Lt
                    }
                }
                '>' => {
                    if self.eat('>') {
                        if self.eat('>') {
                            TokenKind::UShr
                        } else {
                            TokenKind::Shr
                        }
                    } else if self.eat('=') {
                        TokenKind::GtEq
                    } else {
                        TokenKind::Gt
                    }
                }
                '=' if self.eat('=') => TokenKind::EqEq,
                '!' if self.eat('=') => TokenKind::NotEq,
                '$' => {
                    if self.eat('$') {
                        TokenKind::Counter
                    } else {
                        match self.chars.peek() {
                            Some(&n) if is_ident_start(n) => {
                                let first = self.bump().unwrap_or(n);
                                TokenKind::External(self.ident_tail(first))
                            }
                            _ => {
                                return Err(syntax(position, "expected name or '$' after '$'"));
                            }
                        }
                    }
                }
                c if c.is_ascii_digit() => TokenKind::Number(self.number(c, position)?),
                c if is_ident_start(c) => TokenKind::Ident(self.ident_tail(c)),
                other => {
                    return Err(syntax(position, format!("unexpected character '{other}'")));
                }
            };

            tokens.push(Token { kind, position });
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    if lookahead.peek() != Some(&'/') {
                        return;
                    }
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn ident_tail(&mut self, first: char) -> String {
        let mut text = String::new();
        text.push(first.to_ascii_lowercase());
        while let Some(&c) = self.chars.peek() {
            if !is_ident_continue(c) {
                break;
            }
            text.push(c.to_ascii_lowercase());
            self.bump();
        }
        text
    }

    fn number(&mut self, first: char, position: Position) -> Result<i64, CompileError> {
        let mut text = String::new();
        text.push(first);
        while let Some(&c) = self.chars.peek() {
            if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            text.push(c);
            self.bump();
        }

        let digits = text.replace('_', "");
        let parsed = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            Some(hex) => i64::from_str_radix(hex, 16),
            None => digits.parse::<i64>(),
        };

        parsed.map_err(|_| syntax(position, format!("invalid number literal '{text}'")))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn syntax(position: Position, message: impl Into<String>) -> CompileError {
    CompileError::Syntax {
        position,
        message: message.into(),
    }
}
