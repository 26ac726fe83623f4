//! Reader for the literal syntax used by the `routes` column.
//!
//! Exports encode each trip's route as a Python-style literal, for example
//! `[['2023/05/01', '00:00:17.660', 47.6, -122.3], ...]`. This module reads
//! the small subset of that syntax that appears in practice:
//!
//! - lists `[...]` and tuples `(...)`, trailing commas allowed,
//! - single- or double-quoted strings with backslash escapes,
//! - integers and floats with optional sign, fraction and exponent,
//! - the bare words `None`, `True` and `False`.
//!
//! Anything else is a [`RouteSyntaxError`] pointing at the byte offset where
//! reading stopped. Sequences nested deeper than [`MAX_NESTING`] are rejected
//! too.

use snafu::prelude::*;

/// Deepest sequence nesting accepted. Real routes use two levels.
pub const MAX_NESTING: usize = 32;

/// A value read from a route literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// `[...]` or `(...)`.
    List(Vec<Literal>),
    /// A quoted string.
    Str(String),
    /// An integer that fits in `i64`.
    Int(i64),
    /// Any other number.
    Float(f64),
    /// `True` / `False`.
    Bool(bool),
    /// `None`.
    None,
}

impl Literal {
    /// Numeric value of an `Int` or `Float`, `None` otherwise.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(v) => Some(*v as f64),
            Literal::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrow the string value of a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Literal::Str(s) => write!(f, "'{s}'"),
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v}"),
            Literal::Bool(true) => write!(f, "True"),
            Literal::Bool(false) => write!(f, "False"),
            Literal::None => write!(f, "None"),
        }
    }
}

/// The route text could not be read as a literal.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("invalid route literal at byte {offset}: {message}"))]
pub struct RouteSyntaxError {
    /// Byte offset into the input where reading failed.
    pub offset: usize,
    /// What was expected or found.
    pub message: String,
}

/// Read a complete literal from `src`. Trailing non-whitespace is an error.
pub fn parse_literal(src: &str) -> Result<Literal, RouteSyntaxError> {
    let mut reader = Reader {
        src,
        pos: 0,
        depth: 0,
    };
    let value = reader.value()?;
    reader.skip_ws();
    if reader.pos < src.len() {
        return reader.fail("unexpected trailing characters");
    }
    Ok(value)
}

struct Reader<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl Reader<'_> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn fail<T>(&self, message: impl Into<String>) -> Result<T, RouteSyntaxError> {
        RouteSyntaxSnafu {
            offset: self.pos,
            message: message.into(),
        }
        .fail()
    }

    fn value(&mut self) -> Result<Literal, RouteSyntaxError> {
        self.skip_ws();
        match self.peek() {
            Some('[') => self.sequence(']'),
            Some('(') => self.sequence(')'),
            Some(q @ ('\'' | '"')) => self.string(q),
            Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.') => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.word(),
            Some(c) => self.fail(format!("unexpected character {c:?}")),
            None => self.fail("unexpected end of input"),
        }
    }

    fn sequence(&mut self, close: char) -> Result<Literal, RouteSyntaxError> {
        if self.depth >= MAX_NESTING {
            return self.fail("nesting too deep");
        }
        self.depth += 1;
        let items = self.items(close);
        self.depth -= 1;
        items
    }

    fn items(&mut self, close: char) -> Result<Literal, RouteSyntaxError> {
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(Literal::List(items));
            }

            items.push(self.value()?);

            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(c) if c == close => return Ok(Literal::List(items)),
                Some(c) => {
                    self.pos -= c.len_utf8();
                    return self.fail(format!("expected ',' or '{close}', found {c:?}"));
                }
                None => return self.fail(format!("unterminated sequence, expected '{close}'")),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<Literal, RouteSyntaxError> {
        let start = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some(c) => out.push(c),
                    None => break,
                },
                Some(c) if c == quote => return Ok(Literal::Str(out)),
                Some(c) => out.push(c),
                None => break,
            }
        }
        RouteSyntaxSnafu {
            offset: start,
            message: "unterminated string",
        }
        .fail()
    }

    fn number(&mut self) -> Result<Literal, RouteSyntaxError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-' | '+')) {
            self.bump();
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' | '_' => {}
                '.' => is_float = true,
                'e' | 'E' => {
                    is_float = true;
                    self.bump();
                    if matches!(self.peek(), Some('-' | '+')) {
                        self.bump();
                    }
                    continue;
                }
                _ => break,
            }
            self.bump();
        }

        let text: String = self.src[start..self.pos]
            .chars()
            .filter(|c| *c != '_')
            .collect();

        if !is_float {
            if let Ok(v) = text.parse::<i64>() {
                return Ok(Literal::Int(v));
            }
        }
        match text.parse::<f64>() {
            Ok(v) => Ok(Literal::Float(v)),
            Err(_) => RouteSyntaxSnafu {
                offset: start,
                message: format!("invalid number {text:?}"),
            }
            .fail(),
        }
    }

    fn word(&mut self) -> Result<Literal, RouteSyntaxError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.bump();
        }
        match &self.src[start..self.pos] {
            "None" => Ok(Literal::None),
            "True" => Ok(Literal::Bool(true)),
            "False" => Ok(Literal::Bool(false)),
            other => RouteSyntaxSnafu {
                offset: start,
                message: format!("unknown name {other:?}"),
            }
            .fail(),
        }
    }
}
