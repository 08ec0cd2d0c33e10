//! # Where-Clause Filters
//!
//! A small boolean expression language evaluated against query rows.
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := cmp (("&&" | "and") cmp)*
//! cmp     := sum (("==" | "!=" | "<" | "<=" | ">" | ">=") sum)?
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/" | "%") unary)*
//! unary   := ("!" | "not" | "-") unary | postfix
//! postfix := primary ("." ident | "[" (string | int) "]")*
//! primary := int | float | string | true | false | nil | ident | "(" expr ")"
//! ```
//!
//! Identifiers resolve against the row; missing keys evaluate to `nil`.
//! Parentheses and unary operators nest at most [`MAX_NESTING`] deep.
//! Integers stay integers end to end, so `ledger.balance == 9007199254740993`
//! compares exactly.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::error::QueryError;

/// Deepest nesting of parentheses and unary operators a clause may use.
pub const MAX_NESTING: usize = 128;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i128),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
}

const OPERATORS: [&str; 19] = [
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%", "(", ")", "[", "]", ".",
];

fn parse_error(position: usize, message: impl Into<String>) -> QueryError {
    QueryError::Parse {
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, QueryError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        let start = pos;

        if c.is_ascii_digit() {
            while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'_') {
                pos += 1;
            }
            let mut is_float = false;
            if pos + 1 < bytes.len() && bytes[pos] == b'.' && bytes[pos + 1].is_ascii_digit() {
                is_float = true;
                pos += 1;
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
            }
            if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
                is_float = true;
                pos += 1;
                if pos < bytes.len() && (bytes[pos] == b'+' || bytes[pos] == b'-') {
                    pos += 1;
                }
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
            }
            let text: String = source[start..pos].chars().filter(|&c| c != '_').collect();
            let token = if is_float {
                text.parse().map(Token::Float).ok()
            } else {
                text.parse().map(Token::Int).ok()
            };
            let token = token.ok_or_else(|| parse_error(start, format!("invalid number {text}")))?;
            tokens.push((start, token));
            continue;
        }

        if c == b'"' || c == b'\'' {
            pos += 1;
            let mut text = String::new();
            loop {
                let Some(&b) = bytes.get(pos) else {
                    return Err(parse_error(start, "unterminated string"));
                };
                if b == c {
                    pos += 1;
                    break;
                }
                if b == b'\\' {
                    let escaped = source[pos + 1..]
                        .chars()
                        .next()
                        .ok_or_else(|| parse_error(pos, "dangling escape"))?;
                    text.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    pos += 1 + escaped.len_utf8();
                    continue;
                }
                // Copy one UTF-8 scalar
                let ch = source[pos..]
                    .chars()
                    .next()
                    .ok_or_else(|| parse_error(pos, "invalid character"))?;
                text.push(ch);
                pos += ch.len_utf8();
            }
            tokens.push((start, Token::Str(text)));
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' || c == b'$' {
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_' || bytes[pos] == b'$') {
                pos += 1;
            }
            tokens.push((start, Token::Ident(source[start..pos].to_string())));
            continue;
        }

        let op = OPERATORS
            .iter()
            .find(|op| source[pos..].starts_with(**op))
            .ok_or_else(|| parse_error(start, format!("unexpected character {:?}", char::from(c))))?;
        pos += op.len();
        tokens.push((start, Token::Op(*op)));
    }
    Ok(tokens)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinaryOp {
    Or,
    And,
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

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    next: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.next).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.next).map_or(self.end, |(p, _)| *p)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.next).map(|(_, t)| t.clone());
        self.next += 1;
        token
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.next += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.next += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), QueryError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(parse_error(self.position(), format!("expected {op}")))
        }
    }

    fn nested(
        &mut self,
        position: usize,
        parse: impl FnOnce(&mut Self) -> Result<Expr, QueryError>,
    ) -> Result<Expr, QueryError> {
        if self.depth >= MAX_NESTING {
            return Err(parse_error(position, "nesting too deep"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn or(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.and()?;
        while self.eat_op("||") || self.eat_word("or") {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.comparison()?;
        while self.eat_op("&&") || self.eat_word("and") {
            let rhs = self.comparison()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, QueryError> {
        let lhs = self.sum()?;
        let op = match self.peek() {
            Some(Token::Op("==")) => BinaryOp::Eq,
            Some(Token::Op("!=")) => BinaryOp::Ne,
            Some(Token::Op("<")) => BinaryOp::Lt,
            Some(Token::Op("<=")) => BinaryOp::Le,
            Some(Token::Op(">")) => BinaryOp::Gt,
            Some(Token::Op(">=")) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.next += 1;
        let rhs = self.sum()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn sum(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.product()?;
        loop {
            let op = if self.eat_op("+") {
                BinaryOp::Add
            } else if self.eat_op("-") {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn product(&mut self) -> Result<Expr, QueryError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat_op("*") {
                BinaryOp::Mul
            } else if self.eat_op("/") {
                BinaryOp::Div
            } else if self.eat_op("%") {
                BinaryOp::Rem
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, QueryError> {
        let position = self.position();
        if self.eat_op("!") || self.eat_word("not") {
            let inner = self.nested(position, Self::unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        if self.eat_op("-") {
            let inner = self.nested(position, Self::unary)?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, QueryError> {
        let position = self.position();
        let expr = self.primary()?;
        let mut segments = match expr {
            Expr::Path(segments) => segments,
            other => {
                if matches!(self.peek(), Some(Token::Op("." | "["))) {
                    return Err(parse_error(position, "only fields can be indexed"));
                }
                return Ok(other);
            }
        };
        loop {
            if self.eat_op(".") {
                match self.advance() {
                    Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                    _ => return Err(parse_error(self.position(), "expected field name after .")),
                }
            } else if self.eat_op("[") {
                let position = self.position();
                match self.advance() {
                    Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                    Some(Token::Int(index)) => {
                        let index = usize::try_from(index).map_err(|_| parse_error(position, "negative index"))?;
                        segments.push(Segment::Index(index));
                    }
                    _ => return Err(parse_error(position, "expected string or integer index")),
                }
                self.expect_op("]")?;
            } else {
                return Ok(Expr::Path(segments));
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, QueryError> {
        let position = self.position();
        match self.advance() {
            Some(Token::Int(i)) => Ok(Expr::Literal(int_value(i).ok_or_else(|| parse_error(position, "integer out of range"))?)),
            Some(Token::Float(f)) => Ok(Expr::Literal(
                Number::from_f64(f).map(Value::Number).ok_or_else(|| parse_error(position, "invalid float"))?,
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "nil" | "null" => Expr::Literal(Value::Null),
                _ => Expr::Path(vec![Segment::Key(word)]),
            }),
            Some(Token::Op("(")) => self.nested(position, |parser| {
                let expr = parser.or()?;
                parser.expect_op(")")?;
                Ok(expr)
            }),
            Some(token) => Err(parse_error(position, format!("unexpected {token:?}"))),
            None => Err(parse_error(position, "unexpected end of expression")),
        }
    }
}

/// A compiled where clause.
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    root: Expr,
}

impl Filter {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// [`QueryError::Parse`] with the byte offset of the first problem.
    pub fn parse(source: &str) -> Result<Self, QueryError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            next: 0,
            end: source.len(),
            depth: 0,
        };
        let root = parser.or()?;
        if parser.next < parser.tokens.len() {
            return Err(parse_error(parser.position(), "unexpected trailing input"));
        }
        Ok(Self { root })
    }

    /// Evaluates the filter against one row.
    ///
    /// # Errors
    ///
    /// [`QueryError::Eval`] on type errors or a non-boolean result.
    pub fn matches(&self, row: &Value) -> Result<bool, QueryError> {
        match eval(&self.root, row)? {
            Value::Bool(b) => Ok(b),
            other => Err(QueryError::Eval(format!("expression produced {other}, expected a boolean"))),
        }
    }
}

fn eval_error(message: impl Into<String>) -> QueryError {
    QueryError::Eval(message.into())
}

fn int_value(i: i128) -> Option<Value> {
    if let Ok(u) = u64::try_from(i) {
        Some(Value::Number(u.into()))
    } else {
        i64::try_from(i).ok().map(|i| Value::Number(i.into()))
    }
}

enum Num {
    Int(i128),
    Float(f64),
}

fn as_num(value: &Value) -> Option<Num> {
    let Value::Number(n) = value else {
        return None;
    };
    if let Some(u) = n.as_u64() {
        Some(Num::Int(i128::from(u)))
    } else if let Some(i) = n.as_i64() {
        Some(Num::Int(i128::from(i)))
    } else {
        n.as_f64().map(Num::Float)
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(n: &Num) -> f64 {
    match *n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

fn truthy(value: &Value, op: &str) -> Result<bool, QueryError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(eval_error(format!("{op} expects booleans, got {other}"))),
    }
}

fn lookup<'r>(row: &'r Value, segments: &[Segment]) -> Option<&'r Value> {
    segments.iter().try_fold(row, |value, segment| match segment {
        Segment::Key(key) => value.get(key.as_str()),
        Segment::Index(index) => value.get(*index),
    })
}

fn eval(expr: &Expr, row: &Value) -> Result<Value, QueryError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(lookup(row, segments).cloned().unwrap_or(Value::Null)),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, row)?, "!")?)),
        Expr::Neg(inner) => {
            let value = eval(inner, row)?;
            match as_num(&value) {
                Some(Num::Int(i)) => int_value(-i).ok_or_else(|| eval_error("integer overflow")),
                Some(Num::Float(f)) => Ok(float_value(-f)?),
                None => Err(eval_error(format!("cannot negate {value}"))),
            }
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !truthy(&eval(lhs, row)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(rhs, row)?, "&&")?))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if truthy(&eval(lhs, row)?, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(rhs, row)?, "||")?))
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, row)?;
            let rhs = eval(rhs, row)?;
            binary(*op, &lhs, &rhs)
        }
    }
}

fn float_value(f: f64) -> Result<Value, QueryError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| eval_error("arithmetic produced a non-finite number"))
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (as_num(lhs)?, as_num(rhs)?) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => to_f64(&a).partial_cmp(&to_f64(&b)),
        },
    }
}

fn equal(lhs: &Value, rhs: &Value) -> bool {
    match (as_num(lhs), as_num(rhs)) {
        (Some(_), Some(_)) => compare(lhs, rhs) == Some(Ordering::Equal),
        _ => lhs == rhs,
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, QueryError> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(equal(lhs, rhs))),
        BinaryOp::Ne => return Ok(Value::Bool(!equal(lhs, rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            // Ordering against nil or across types is false
            let result = compare(lhs, rhs).is_some_and(|ordering| match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            });
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if let (BinaryOp::Add, Value::String(a), Value::String(b)) = (op, lhs, rhs) {
        return Ok(Value::String(format!("{a}{b}")));
    }
    let (Some(a), Some(b)) = (as_num(lhs), as_num(rhs)) else {
        return Err(eval_error(format!("invalid operands {lhs} and {rhs} for {op:?}")));
    };

    match (op, a, b) {
        (BinaryOp::Div, a, b) => {
            let divisor = to_f64(&b);
            if divisor == 0.0 {
                return Err(eval_error("division by zero"));
            }
            float_value(to_f64(&a) / divisor)
        }
        (BinaryOp::Rem, Num::Int(a), Num::Int(b)) => {
            let r = a.checked_rem(b).ok_or_else(|| eval_error("modulo by zero"))?;
            int_value(r).ok_or_else(|| eval_error("integer overflow"))
        }
        (BinaryOp::Rem, _, _) => Err(eval_error("% expects integers")),
        (op, Num::Int(a), Num::Int(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                _ => a.checked_mul(b),
            };
            result
                .and_then(int_value)
                .ok_or_else(|| eval_error("integer overflow"))
        }
        (op, a, b) => {
            let (a, b) = (to_f64(&a), to_f64(&b));
            float_value(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                _ => a * b,
            })
        }
    }
}
