//! Sandboxed predicate expressions for `if` / `assume` / `fail_if` /
//! `guarantee` and transition `when` clauses.
//!
//! Expressions evaluate against a scope of named JSON values (`output`,
//! `outputs`, `outputs_raw`, `issues`, `env`, `memory`, `item`). The
//! language is deliberately small: literals, paths, comparison, boolean and
//! arithmetic operators, and a handful of helper functions. Unknown paths
//! resolve to `null`; truthiness follows JavaScript conventions.

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExprError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("evaluation error: {0}")]
    Eval(String),
}

fn eval_err(message: impl Into<String>) -> ExprError {
    ExprError::Eval(message.into())
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    AndAnd,
    OrOr,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            '[' => {
                tokens.push((i, Token::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push((i, Token::RBracket));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            '.' => {
                tokens.push((i, Token::Dot));
                i += 1;
            }
            '+' => {
                tokens.push((i, Token::Plus));
                i += 1;
            }
            '-' => {
                tokens.push((i, Token::Minus));
                i += 1;
            }
            '*' => {
                tokens.push((i, Token::Star));
                i += 1;
            }
            '/' => {
                tokens.push((i, Token::Slash));
                i += 1;
            }
            '%' => {
                tokens.push((i, Token::Percent));
                i += 1;
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push((i, Token::AndAnd));
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        offset: i,
                        message: "expected '&&'".to_string(),
                    });
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push((i, Token::OrOr));
                    i += 2;
                } else {
                    return Err(ExprError::Parse {
                        offset: i,
                        message: "expected '||'".to_string(),
                    });
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Eq));
                    i += 2;
                    // tolerate the strict-equality spelling
                    if bytes.get(i) == Some(&b'=') {
                        i += 1;
                    }
                } else {
                    return Err(ExprError::Parse {
                        offset: i,
                        message: "expected '=='".to_string(),
                    });
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Ne));
                    i += 2;
                    if bytes.get(i) == Some(&b'=') {
                        i += 1;
                    }
                } else {
                    tokens.push((i, Token::Not));
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Le));
                    i += 2;
                } else {
                    tokens.push((i, Token::Lt));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((i, Token::Ge));
                    i += 2;
                } else {
                    tokens.push((i, Token::Gt));
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    let Some(&b) = bytes.get(i) else {
                        return Err(ExprError::Parse {
                            offset: start,
                            message: "unterminated string".to_string(),
                        });
                    };
                    let ch = b as char;
                    if ch == quote {
                        i += 1;
                        break;
                    }
                    if ch == '\\' {
                        let Some(&escaped) = bytes.get(i + 1) else {
                            return Err(ExprError::Parse {
                                offset: i,
                                message: "dangling escape".to_string(),
                            });
                        };
                        value.push(match escaped as char {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    } else {
                        value.push(ch);
                        i += 1;
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    // A dot followed by a non-digit is path syntax, not a decimal.
                    if bytes[i] == b'.'
                        && !bytes
                            .get(i + 1)
                            .map(|b| (*b as char).is_ascii_digit())
                            .unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let raw = &input[start..i];
                let parsed: f64 = raw.parse().map_err(|_| ExprError::Parse {
                    offset: start,
                    message: format!("invalid number '{raw}'"),
                })?;
                tokens.push((start, Token::Num(parsed)));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let word = &input[start..i];
                tokens.push((
                    start,
                    match word {
                        "true" => Token::True,
                        "false" => Token::False,
                        "null" | "undefined" => Token::Null,
                        _ => Token::Ident(word.to_string()),
                    },
                ));
            }
            other => {
                return Err(ExprError::Parse {
                    offset: i,
                    message: format!("unexpected character '{other}'"),
                })
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser → AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Literal(Value),
    Var(String),
    Array(Vec<Ast>),
    Member(Box<Ast>, String),
    Index(Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
    Unary(UnaryOp, Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(usize::MAX)
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExprError::Parse {
                offset: self.offset(),
                message: format!("expected {token:?}"),
            })
        }
    }

    fn parse_expr(&mut self) -> Result<Ast, ExprError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Ast::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.pos += 1;
            let right = self.parse_equality()?;
            left = Ast::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Ast, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Ast::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ast, ExprError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Ast::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Ast::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Ast, ExprError> {
        let mut node = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let Some(Token::Ident(name)) = self.advance() else {
                        return Err(ExprError::Parse {
                            offset: self.offset(),
                            message: "expected property name after '.'".to_string(),
                        });
                    };
                    node = Ast::Member(Box::new(node), name);
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    node = Ast::Index(Box::new(node), Box::new(index));
                }
                Some(Token::LParen) => {
                    let Ast::Var(name) = node else {
                        return Err(ExprError::Parse {
                            offset: self.offset(),
                            message: "only named helpers are callable".to_string(),
                        });
                    };
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    node = Ast::Call(name, args);
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<Ast, ExprError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Num(n)) => Ok(Ast::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Token::True) => Ok(Ast::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Ast::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Ast::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Ast::Var(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut elements = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        elements.push(self.parse_expr()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Ast::Array(elements))
            }
            other => Err(ExprError::Parse {
                offset,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// JS-like truthiness: `false`, `null`, `0`, `""` and `[]` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn eval(ast: &Ast, scope: &Map<String, Value>) -> Result<Value, ExprError> {
    match ast {
        Ast::Literal(value) => Ok(value.clone()),
        Ast::Var(name) => Ok(scope.get(name).cloned().unwrap_or(Value::Null)),
        Ast::Array(elements) => {
            let mut out = Vec::with_capacity(elements.len());
            for element in elements {
                out.push(eval(element, scope)?);
            }
            Ok(Value::Array(out))
        }
        Ast::Member(base, name) => {
            let base = eval(base, scope)?;
            Ok(match &base {
                Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
                Value::Array(items) if name == "length" => Value::from(items.len()),
                Value::String(s) if name == "length" => Value::from(s.chars().count()),
                _ => Value::Null,
            })
        }
        Ast::Index(base, index) => {
            let base = eval(base, scope)?;
            let index = eval(index, scope)?;
            Ok(match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            })
        }
        Ast::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, scope)?);
            }
            call_helper(name, &values)
        }
        Ast::Unary(op, inner) => {
            let value = eval(inner, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                UnaryOp::Neg => as_number(&value)
                    .map(|n| number_value(-n))
                    .ok_or_else(|| eval_err("cannot negate a non-number")),
            }
        }
        Ast::Binary(op, left, right) => eval_binary(*op, left, right, scope),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Ast,
    right: &Ast,
    scope: &Map<String, Value>,
) -> Result<Value, ExprError> {
    // Short-circuit forms first.
    match op {
        BinaryOp::And => {
            let l = eval(left, scope)?;
            if !is_truthy(&l) {
                return Ok(Value::Bool(false));
            }
            let r = eval(right, scope)?;
            return Ok(Value::Bool(is_truthy(&r)));
        }
        BinaryOp::Or => {
            let l = eval(left, scope)?;
            if is_truthy(&l) {
                return Ok(Value::Bool(true));
            }
            let r = eval(right, scope)?;
            return Ok(Value::Bool(is_truthy(&r)));
        }
        _ => {}
    }

    let l = eval(left, scope)?;
    let r = eval(right, scope)?;
    let result = match op {
        BinaryOp::Eq => Value::Bool(loose_eq(&l, &r)),
        BinaryOp::Ne => Value::Bool(!loose_eq(&l, &r)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&l, &r)?;
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        BinaryOp::Add => match (&l, &r) {
            (Value::String(a), b) => Value::String(format!("{a}{}", stringify(b))),
            (a, Value::String(b)) => Value::String(format!("{}{b}", stringify(a))),
            _ => arithmetic(&l, &r, |a, b| a + b)?,
        },
        BinaryOp::Sub => arithmetic(&l, &r, |a, b| a - b)?,
        BinaryOp::Mul => arithmetic(&l, &r, |a, b| a * b)?,
        BinaryOp::Div => {
            let divisor = as_number(&r).ok_or_else(|| eval_err("non-numeric divisor"))?;
            if divisor == 0.0 {
                return Err(eval_err("division by zero"));
            }
            arithmetic(&l, &r, |a, b| a / b)?
        }
        BinaryOp::Rem => arithmetic(&l, &r, |a, b| a % b)?,
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    };
    Ok(result)
}

fn arithmetic(l: &Value, r: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    match (as_number(l), as_number(r)) {
        (Some(a), Some(b)) => Ok(number_value(f(a, b))),
        _ => Err(eval_err("arithmetic on non-numbers")),
    }
}

fn compare(l: &Value, r: &Value) -> Result<std::cmp::Ordering, ExprError> {
    if let (Some(a), Some(b)) = (as_number(l), as_number(r)) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| eval_err("incomparable numbers"));
    }
    if let (Value::String(a), Value::String(b)) = (l, r) {
        return Ok(a.cmp(b));
    }
    Err(eval_err(format!("cannot compare {l} with {r}")))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn call_helper(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        "always" => Ok(Value::Bool(true)),
        "length" => {
            let value = args.first().unwrap_or(&Value::Null);
            Ok(match value {
                Value::Array(items) => Value::from(items.len()),
                Value::String(s) => Value::from(s.chars().count()),
                Value::Object(map) => Value::from(map.len()),
                _ => Value::from(0),
            })
        }
        "contains" | "includes" => {
            let (hay, needle) = (args.first(), args.get(1));
            let (Some(hay), Some(needle)) = (hay, needle) else {
                return Err(eval_err(format!("{name} expects two arguments")));
            };
            Ok(Value::Bool(match hay {
                Value::String(s) => match needle {
                    Value::String(n) => s.contains(n.as_str()),
                    other => s.contains(&stringify(other)),
                },
                Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
                _ => false,
            }))
        }
        "startsWith" | "endsWith" => {
            let (Some(Value::String(s)), Some(Value::String(prefix))) =
                (args.first(), args.get(1))
            else {
                return Err(eval_err(format!("{name} expects two strings")));
            };
            Ok(Value::Bool(if name == "startsWith" {
                s.starts_with(prefix.as_str())
            } else {
                s.ends_with(prefix.as_str())
            }))
        }
        other => Err(eval_err(format!("unknown helper '{other}'"))),
    }
}

/// Parse and evaluate `input` against `scope`.
pub fn evaluate(input: &str, scope: &Map<String, Value>) -> Result<Value, ExprError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ExprError::Parse {
            offset: 0,
            message: "empty expression".to_string(),
        });
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse {
            offset: parser.offset(),
            message: "trailing input".to_string(),
        });
    }
    eval(&ast, scope)
}

/// Evaluate and coerce to a boolean.
pub fn evaluate_truthy(input: &str, scope: &Map<String, Value>) -> Result<bool, ExprError> {
    Ok(is_truthy(&evaluate(input, scope)?))
}
