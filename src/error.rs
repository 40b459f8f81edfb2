// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{borrow::Cow, fmt::Display};

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The token stream did not match the shape an argument spec expected (wrong arity, unparsable number, missing sub-arg count).
    ParseArgs,

    /// The arguments were individually well-formed but conflict with each other or with the request's current mode
    /// (e.g. mixing `GROUPBY` with `SUMMARIZE`, issuing `LOAD` after a projection).
    InvalidArgument,

    /// A count, offset or field-list length exceeded a configured ceiling.
    Limit,

    /// A step referenced a field name that does not exist in the prevailing lookup.
    NoProperty,

    /// A `REDUCE` referenced a reducer name that is not registered.
    NoReducer,

    /// A `SCORER` referenced a scoring function name that is not registered.
    NoScorer,

    /// A `LANGUAGE` referenced a language tag the index does not support.
    NoLanguage,

    /// Reading from or writing to the fork GC pipe, or another OS-level resource, failed.
    Io,

    /// The request's concurrent-search budget was exhausted before execution completed.
    Timeout,

    /// An allocation could not be satisfied under the configured memory ceiling.
    Oom,

    /// An invariant that should always hold was violated; this indicates a bug in this crate.
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::ParseArgs => write!(f, "could not parse arguments"),
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::Limit => write!(f, "requested limit exceeds what is allowed"),
            ErrorKind::NoProperty => write!(f, "property not in result"),
            ErrorKind::NoReducer => write!(f, "invalid reducer"),
            ErrorKind::NoScorer => write!(f, "invalid scorer"),
            ErrorKind::NoLanguage => write!(f, "invalid language"),
            ErrorKind::Io => write!(f, "i/o error"),
            ErrorKind::Timeout => write!(f, "timeout exceeded"),
            ErrorKind::Oom => write!(f, "memory limit exceeded"),
            ErrorKind::Internal => write!(f, "internal error"),
        }
    }
}

impl ErrorKind {
    pub fn with_source(self, source: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::from(self).with_source(source)
    }

    pub fn with_message(self, message: impl Into<Cow<'static, str>>) -> Error {
        Error::from(self).with_message(message)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    message: Option<Cow<'static, str>>,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            message: None,
        }
    }
}

impl Error {
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn into_source(self) -> Option<Box<dyn std::error::Error + Send + Sync>> {
        self.source
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message}"),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = self.source.as_ref()?;
        Some(&**source)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io.with_source(err)
    }
}
