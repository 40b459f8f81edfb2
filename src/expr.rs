// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A small expression language for `APPLY`/`FILTER` steps.
//!
//! Grammar (loosest-binding first):
//! ```text
//! expr    := or
//! or      := and ("||" and)*
//! and     := cmp ("&&" cmp)*
//! cmp     := add (("=="|"!="|"<"|"<="|">"|">=") add)?
//! add     := mul (("+"|"-") mul)*
//! mul     := unary (("*"|"/") unary)*
//! unary   := ("!"|"-")? primary
//! primary := number | string | "true" | "false" | "null" | "@" ident | ident "(" args ")" | "(" expr ")"
//! ```

use std::fmt;

use crate::lookup::Lookup;
use crate::{ErrorKind, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    String(String),
    Bool(bool),
    Null,
    Field(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

pub fn parse(text: &str) -> Result<Expr> {
    let tokens = lex(text)?;
    let mut p = ExprParser { tokens, pos: 0 };
    let expr = p.parse_or()?;
    if p.pos != p.tokens.len() {
        return Err(ErrorKind::ParseArgs.with_message(format!(
            "unexpected trailing input in expression '{text}'"
        )));
    }
    Ok(expr)
}

/// Walks `expr`, collecting the names of every `@field` reference.
pub fn referenced_fields(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Field(name) => out.push(name.clone()),
        Expr::Unary(_, e) => referenced_fields(e, out),
        Expr::Binary(_, l, r) => {
            referenced_fields(l, out);
            referenced_fields(r, out);
        }
        Expr::Call(_, args) => {
            for a in args {
                referenced_fields(a, out);
            }
        }
        _ => {}
    }
}

pub fn eval(expr: &Expr, lookup: &Lookup, row: &[Option<serde_json::Value>]) -> Result<serde_json::Value> {
    use serde_json::Value;
    match expr {
        Expr::Number(n) => Ok(serde_json::json!(n)),
        Expr::String(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Field(name) => {
            let idx = lookup
                .find(name)
                .ok_or_else(|| ErrorKind::NoProperty.with_message(format!("no such property '@{name}'")))?;
            Ok(row.get(idx).and_then(|v| v.clone()).unwrap_or(Value::Null))
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, lookup, row)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                UnaryOp::Neg => Ok(serde_json::json!(-as_number(&v)?)),
            }
        }
        Expr::Binary(op, l, r) => {
            match op {
                BinaryOp::And => {
                    let lv = eval(l, lookup, row)?;
                    if !truthy(&lv) {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(truthy(&eval(r, lookup, row)?)))
                }
                BinaryOp::Or => {
                    let lv = eval(l, lookup, row)?;
                    if truthy(&lv) {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(truthy(&eval(r, lookup, row)?)))
                }
                _ => {
                    let lv = eval(l, lookup, row)?;
                    let rv = eval(r, lookup, row)?;
                    eval_binary(*op, &lv, &rv)
                }
            }
        }
        Expr::Call(name, args) => {
            let values: Result<Vec<_>> = args.iter().map(|a| eval(a, lookup, row)).collect();
            eval_call(name, &values?)
        }
    }
}

fn eval_binary(op: BinaryOp, l: &serde_json::Value, r: &serde_json::Value) -> Result<serde_json::Value> {
    use serde_json::Value;
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            let (a, b) = (as_number(l)?, as_number(r)?);
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                _ => unreachable!(),
            };
            Ok(serde_json::json!(result))
        }
        BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let (a, b) = (as_number(l)?, as_number(r)?);
            let result = match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                BinaryOp::Ge => a >= b,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled by short-circuit path in eval"),
    }
}

fn eval_call(name: &str, args: &[serde_json::Value]) -> Result<serde_json::Value> {
    use serde_json::Value;
    match name.to_ascii_lowercase().as_str() {
        "upper" => Ok(Value::String(as_string(args.first())?.to_uppercase())),
        "lower" => Ok(Value::String(as_string(args.first())?.to_lowercase())),
        "length" => match args.first() {
            Some(Value::String(s)) => Ok(serde_json::json!(s.chars().count() as f64)),
            Some(Value::Array(a)) => Ok(serde_json::json!(a.len() as f64)),
            _ => Ok(serde_json::json!(0.0)),
        },
        "exists" => Ok(Value::Bool(!matches!(args.first(), None | Some(Value::Null)))),
        other => Err(ErrorKind::InvalidArgument.with_message(format!("unknown function '{other}'"))),
    }
}

fn as_string(v: Option<&serde_json::Value>) -> Result<String> {
    match v {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Ok(String::new()),
    }
}

fn as_number(v: &serde_json::Value) -> Result<f64> {
    v.as_f64()
        .ok_or_else(|| ErrorKind::InvalidArgument.with_message(format!("expected a number, got {v}")))
}

pub fn truthy(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(l: &serde_json::Value, r: &serde_json::Value) -> bool {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return a == b;
    }
    l == r
}

// --- lexer -----------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    String(String),
    Ident(String),
    Field(String),
    Symbol(&'static str),
}

fn lex(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '@' {
            let start = i + 1;
            let mut j = start;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            if j == start {
                return Err(ErrorKind::ParseArgs.with_message("expected a field name after '@'"));
            }
            tokens.push(Token::Field(chars[start..j].iter().collect()));
            i = j;
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let mut j = i + 1;
            let mut s = String::new();
            while j < chars.len() && chars[j] != quote {
                s.push(chars[j]);
                j += 1;
            }
            if j >= chars.len() {
                return Err(ErrorKind::ParseArgs.with_message("unterminated string literal"));
            }
            tokens.push(Token::String(s));
            i = j + 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit())) {
            let start = i;
            let mut j = i;
            while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                j += 1;
            }
            let s: String = chars[start..j].iter().collect();
            let n: f64 = s
                .parse()
                .map_err(|_| ErrorKind::ParseArgs.with_message(format!("invalid number '{s}'")))?;
            tokens.push(Token::Number(n));
            i = j;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            let mut j = i;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            tokens.push(Token::Ident(chars[start..j].iter().collect()));
            i = j;
            continue;
        }

        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        if let Some(sym) = ["==", "!=", "<=", ">=", "&&", "||"].iter().find(|s| **s == two) {
            tokens.push(Token::Symbol(sym));
            i += 2;
            continue;
        }
        let sym = match c {
            '(' => "(",
            ')' => ")",
            ',' => ",",
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '<' => "<",
            '>' => ">",
            '!' => "!",
            _ => return Err(ErrorKind::ParseArgs.with_message(format!("unexpected character '{c}'"))),
        };
        tokens.push(Token::Symbol(sym));
        i += 1;
    }
    Ok(tokens)
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_symbol(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Token::Symbol(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat_symbol("||") {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_cmp()?;
        while self.eat_symbol("&&") {
            let rhs = self.parse_cmp()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::Symbol("==")) => Some(BinaryOp::Eq),
            Some(Token::Symbol("!=")) => Some(BinaryOp::Ne),
            Some(Token::Symbol("<=")) => Some(BinaryOp::Le),
            Some(Token::Symbol(">=")) => Some(BinaryOp::Ge),
            Some(Token::Symbol("<")) => Some(BinaryOp::Lt),
            Some(Token::Symbol(">")) => Some(BinaryOp::Gt),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.parse_add()?;
            return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Symbol("+")) => BinaryOp::Add,
                Some(Token::Symbol("-")) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Symbol("*")) => BinaryOp::Mul,
                Some(Token::Symbol("/")) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat_symbol("!") {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)));
        }
        if self.eat_symbol("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::String(s)) => Ok(Expr::String(s)),
            Some(Token::Field(f)) => Ok(Expr::Field(f)),
            Some(Token::Ident(id)) => match id.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ if self.eat_symbol("(") => {
                    let mut args = Vec::new();
                    if !self.eat_symbol(")") {
                        loop {
                            args.push(self.parse_or()?);
                            if self.eat_symbol(",") {
                                continue;
                            }
                            break;
                        }
                        if !self.eat_symbol(")") {
                            return Err(ErrorKind::ParseArgs
                                .with_message(format!("expected ')' after arguments to '{id}'")));
                        }
                    }
                    Ok(Expr::Call(id, args))
                }
                _ => Ok(Expr::Field(id)),
            },
            Some(Token::Symbol("(")) => {
                let inner = self.parse_or()?;
                if !self.eat_symbol(")") {
                    return Err(ErrorKind::ParseArgs.with_message("expected closing ')'"));
                }
                Ok(inner)
            }
            other => Err(ErrorKind::ParseArgs.with_message(format!("unexpected token {other:?} in expression"))),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{KeyFlags, KeyOpenMode};

    #[test]
    fn parses_and_evaluates_function_call_on_field() {
        let expr = parse("upper(@title)").unwrap();
        let mut lookup = Lookup::new();
        lookup.get_key("title", KeyFlags::NONE, KeyOpenMode::CreateOrOpen);
        let row = vec![Some(serde_json::json!("hello"))];
        let result = eval(&expr, &lookup, &row).unwrap();
        assert_eq!(result, serde_json::json!("HELLO"));
    }

    #[test]
    fn comparison_and_boolean_short_circuit() {
        let expr = parse("@t == \"FOO\" && length(@t) > 0").unwrap();
        let mut lookup = Lookup::new();
        lookup.get_key("t", KeyFlags::NONE, KeyOpenMode::CreateOrOpen);
        let row = vec![Some(serde_json::json!("FOO"))];
        assert_eq!(eval(&expr, &lookup, &row).unwrap(), serde_json::json!(true));
    }

    #[test]
    fn referenced_fields_collects_all_field_names() {
        let expr = parse("@a + length(@b)").unwrap();
        let mut fields = Vec::new();
        referenced_fields(&expr, &mut fields);
        assert_eq!(fields, vec!["a", "b"]);
    }

    #[test]
    fn unknown_field_is_no_property_error() {
        let expr = parse("@missing").unwrap();
        let lookup = Lookup::new();
        let err = eval(&expr, &lookup, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoProperty);
    }
}
