// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A positional cursor over a command's argument tokens, plus a small declarative
//! matcher (`ArgSpec`) for the keyword-prefixed sub-argument groups (`MAXIDLE n`,
//! `COUNT n`, ...) that show up throughout the aggregation command grammar.

use std::collections::HashMap;

use crate::{Error, ErrorKind, Result};

/// A cursor over a borrowed slice of argument tokens.
///
/// Cloning an `ArgCursor` is cheap (it's just a slice and an index), which makes it easy to
/// probe ahead (e.g. to look for a trailing `MAX n`) and roll back by discarding the clone.
#[derive(Clone, Copy, Debug)]
pub struct ArgCursor<'a> {
    tokens: &'a [String],
    pos: usize,
}

impl<'a> ArgCursor<'a> {
    pub fn new(tokens: &'a [String]) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.pos
    }

    pub fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).map(String::as_str)
    }

    /// Consumes the next token if it case-insensitively equals `keyword`.
    pub fn advance_if_match(&mut self, keyword: &str) -> bool {
        if self
            .peek()
            .is_some_and(|t| t.eq_ignore_ascii_case(keyword))
        {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_args_err(msg: impl Into<String>) -> Error {
        ErrorKind::ParseArgs.with_message(msg.into())
    }

    pub fn get_string(&mut self) -> Result<&'a str> {
        let t = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| Self::parse_args_err("expected an argument, found none"))?;
        self.pos += 1;
        Ok(t.as_str())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let t = self.get_string()?;
        t.parse()
            .map_err(|_| Self::parse_args_err(format!("expected an unsigned integer, got '{t}'")))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        let t = self.get_string()?;
        t.parse()
            .map_err(|_| Self::parse_args_err(format!("expected an integer, got '{t}'")))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        let t = self.get_string()?;
        t.parse()
            .map_err(|_| Self::parse_args_err(format!("expected a number, got '{t}'")))
    }

    /// Reads `n` tokens as a sub-cursor without copying.
    pub fn get_slice(&mut self, n: usize) -> Result<&'a [String]> {
        if self.remaining() < n {
            return Err(Self::parse_args_err(format!(
                "expected {n} more arguments, only {} remain",
                self.remaining()
            )));
        }
        let slice = &self.tokens[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads a count-prefixed group (`n arg1 .. argn`) and returns a cursor over just that group.
    pub fn get_var_args(&mut self) -> Result<ArgCursor<'a>> {
        let n = self.get_u64()? as usize;
        Ok(ArgCursor::new(self.get_slice(n)?))
    }

    pub fn rest(&self) -> &'a [String] {
        &self.tokens[self.pos..]
    }
}

/// The shape a single keyword-prefixed argument takes.
#[derive(Clone, Copy, Debug)]
pub enum ArgSpecKind {
    String,
    U64,
    I64,
    /// A bare keyword with no associated value; presence alone is the signal.
    Flag,
}

#[derive(Clone, Copy, Debug)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgSpecKind,
}

impl ArgSpec {
    pub const fn new(name: &'static str, kind: ArgSpecKind) -> Self {
        Self { name, kind }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    String(String),
    U64(u64),
    I64(i64),
    Flag,
}

impl ArgValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ArgValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgSpecOutcome {
    /// No entry in the table matched the next token; the cursor was not advanced.
    NotFound,
    /// A spec matched and its value was consumed.
    Handled,
}

/// Applies one pass of `specs` against the next token in `cursor`.
///
/// Stops as soon as one spec matches. Returns [`ArgSpecOutcome::NotFound`] without advancing
/// the cursor if nothing matches, so callers can fall through to their own keyword dispatch.
pub fn parse_arg_spec(
    cursor: &mut ArgCursor,
    specs: &[ArgSpec],
    out: &mut HashMap<&'static str, ArgValue>,
) -> Result<ArgSpecOutcome> {
    for spec in specs {
        if cursor.advance_if_match(spec.name) {
            let value = match spec.kind {
                ArgSpecKind::String => ArgValue::String(cursor.get_string()?.to_string()),
                ArgSpecKind::U64 => ArgValue::U64(cursor.get_u64()?),
                ArgSpecKind::I64 => ArgValue::I64(cursor.get_i64()?),
                ArgSpecKind::Flag => ArgValue::Flag,
            };
            out.insert(spec.name, value);
            return Ok(ArgSpecOutcome::Handled);
        }
    }
    Ok(ArgSpecOutcome::NotFound)
}
