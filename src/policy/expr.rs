//! Condition language for policy rules.
//!
//! A small, allow-listed expression grammar evaluated over JSON values. Conditions
//! are parsed into an AST once and never interpreted as code.

use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

pub const MAX_EXPRESSION_LEN: usize = 1024;
pub const MAX_DEPTH: usize = 32;

/// Variable roots a condition may reference.
pub const ROOTS: &[&str] = &["action", "resource", "user", "context", "data"];

const ALLOWED_PUNCTUATION: &str = "_.'\"=!<>&|()[],-:/@";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("expression is empty")]
    Empty,
    #[error("expression exceeds 1024 characters")]
    TooLong,
    #[error("character {0:?} is not allowed")]
    ForbiddenCharacter(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("unknown variable root {0:?}")]
    UnknownRoot(String),
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("expression nests deeper than 32 levels")]
    TooDeep,
    #[error("type mismatch: {0}")]
    TypeMismatch(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(BinaryOp),
    And,
    Or,
    Not,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s:?}"),
            Token::Str(_) => f.write_str("string"),
            Token::Num(n) => write!(f, "{n}"),
            Token::Op(op) => write!(f, "{op:?}"),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Not => f.write_str("!"),
            Token::Dot => f.write_str("."),
            Token::Comma => f.write_str(","),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(BinaryOp, Box<Expr>, Box<Expr>),
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c.is_ascii_whitespace() || ALLOWED_PUNCTUATION.contains(c)
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    if let Some(bad) = src.chars().find(|c| !is_allowed(*c)) {
        return Err(ExprError::ForbiddenCharacter(bad));
    }

    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_ascii_whitespace() => i += 1,
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or(ExprError::UnterminatedString)?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(BinaryOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(BinaryOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let inclusive = next == Some('=');
                let op = match (c, inclusive) {
                    ('<', false) => BinaryOp::Lt,
                    ('<', true) => BinaryOp::Le,
                    ('>', false) => BinaryOp::Gt,
                    _ => BinaryOp::Ge,
                };
                tokens.push(Token::Op(op));
                i += if inclusive { 2 } else { 1 };
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "in" => Token::Op(BinaryOp::In),
                    "contains" => Token::Op(BinaryOp::Contains),
                    "startsWith" => Token::Op(BinaryOp::StartsWith),
                    "endsWith" => Token::Op(BinaryOp::EndsWith),
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(ExprError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        match self.bump() {
            Some(t) if t == expected => Ok(()),
            Some(t) => Err(ExprError::UnexpectedToken(t.to_string())),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.primary()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.bump();
            let rhs = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump().ok_or(ExprError::UnexpectedEnd)? {
            Token::Num(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                self.descend()?;
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Token::LBracket => {
                self.descend()?;
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.primary()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                self.depth -= 1;
                Ok(Expr::List(items))
            }
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                root if ROOTS.contains(&root) => {
                    let mut path = vec![word];
                    while self.peek() == Some(&Token::Dot) {
                        self.bump();
                        match self.bump() {
                            Some(Token::Ident(seg)) => path.push(seg),
                            Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => {
                                path.push((n as u64).to_string())
                            }
                            Some(t) => return Err(ExprError::UnexpectedToken(t.to_string())),
                            None => return Err(ExprError::UnexpectedEnd),
                        }
                    }
                    Ok(Expr::Path(path))
                }
                _ => Err(ExprError::UnknownRoot(word)),
            },
            other => Err(ExprError::UnexpectedToken(other.to_string())),
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Parse a condition. Rejects anything outside the allow-listed grammar.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let src = src.trim();
    if src.is_empty() {
        return Err(ExprError::Empty);
    }
    if src.chars().count() > MAX_EXPRESSION_LEN {
        return Err(ExprError::TooLong);
    }
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    match parser.bump() {
        None => Ok(expr),
        Some(t) => Err(ExprError::UnexpectedToken(t.to_string())),
    }
}

/// Variables visible to a condition.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: Map<String, Value>,
}

impl Scope {
    pub fn new(action: &str, resource: &str, user: Value, context: Value, data: Value) -> Self {
        let mut vars = Map::new();
        vars.insert("action".into(), Value::String(action.to_string()));
        vars.insert("resource".into(), Value::String(resource.to_string()));
        vars.insert("user".into(), user);
        vars.insert("context".into(), context);
        vars.insert("data".into(), data);
        Self { vars }
    }

    fn lookup(&self, path: &[String]) -> Value {
        let Some((root, rest)) = path.split_first() else {
            return Value::Null;
        };
        let mut current = match self.vars.get(root) {
            Some(v) => v,
            None => return Value::Null,
        };
        for seg in rest {
            let next = match current {
                Value::Object(map) => map.get(seg),
                Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

fn as_bool(v: &Value) -> Result<bool, ExprError> {
    v.as_bool().ok_or(ExprError::TypeMismatch("logical operand must be boolean"))
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .ok_or(ExprError::TypeMismatch("numbers are not comparable")),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(ExprError::TypeMismatch("ordering needs two numbers or two strings")),
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<bool, ExprError> {
    use std::cmp::Ordering::*;
    Ok(match op {
        BinaryOp::Eq => json_eq(lhs, rhs),
        BinaryOp::Ne => !json_eq(lhs, rhs),
        BinaryOp::Lt => ordering(lhs, rhs)? == Less,
        BinaryOp::Le => ordering(lhs, rhs)? != Greater,
        BinaryOp::Gt => ordering(lhs, rhs)? == Greater,
        BinaryOp::Ge => ordering(lhs, rhs)? != Less,
        BinaryOp::In => return compare(BinaryOp::Contains, rhs, lhs),
        BinaryOp::Contains => match (lhs, rhs) {
            (Value::Array(items), needle) => items.iter().any(|i| json_eq(i, needle)),
            (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            (Value::Null, _) => false,
            _ => return Err(ExprError::TypeMismatch("contains needs a list, string or map")),
        },
        BinaryOp::StartsWith | BinaryOp::EndsWith => match (lhs, rhs) {
            (Value::String(s), Value::String(affix)) if op == BinaryOp::StartsWith => {
                s.starts_with(affix.as_str())
            }
            (Value::String(s), Value::String(affix)) => s.ends_with(affix.as_str()),
            (Value::Null, _) => false,
            _ => return Err(ExprError::TypeMismatch("affix tests need strings")),
        },
    })
}

impl Expr {
    pub fn evaluate(&self, scope: &Scope) -> Result<Value, ExprError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(path) => Ok(scope.lookup(path)),
            Expr::List(items) => items
                .iter()
                .map(|i| i.evaluate(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Not(inner) => Ok(Value::Bool(!as_bool(&inner.evaluate(scope)?)?)),
            Expr::And(a, b) => {
                if !as_bool(&a.evaluate(scope)?)? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(as_bool(&b.evaluate(scope)?)?))
            }
            Expr::Or(a, b) => {
                if as_bool(&a.evaluate(scope)?)? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(as_bool(&b.evaluate(scope)?)?))
            }
            Expr::Compare(op, a, b) => {
                Ok(Value::Bool(compare(*op, &a.evaluate(scope)?, &b.evaluate(scope)?)?))
            }
        }
    }
}

/// A compiled rule condition. Anything that fails to compile or evaluate, or
/// evaluates to something other than `true`, does not match.
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    compiled: Result<Expr, ExprError>,
}

impl Condition {
    pub fn compile(source: &str) -> Self {
        Self {
            source: source.to_string(),
            compiled: parse(source),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn error(&self) -> Option<&ExprError> {
        self.compiled.as_ref().err()
    }

    pub fn matches(&self, scope: &Scope) -> bool {
        match &self.compiled {
            Ok(expr) => matches!(expr.evaluate(scope), Ok(Value::Bool(true))),
            Err(_) => false,
        }
    }
}
