//! NUL-joined command payloads.
//!
//! A request is `target\0operation\0arg1\0arg2...`; a response is `OK`,
//! `OK\0result`, `FAIL` or `FAIL\0error`. There is no escaping: an argument
//! that itself contains NUL splits into extra arguments on the other side.

use crate::error::{IpcError, Result};
use std::fmt;

/// Token separator
pub const SEPARATOR: char = '\0';

const STATUS_OK: &str = "OK";
const STATUS_FAIL: &str = "FAIL";

/// A decoded command request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub target: String,
    pub operation: String,
    pub args: Vec<String>,
}

impl Request {
    pub fn new<I, S>(target: impl Into<String>, operation: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into(),
            operation: operation.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Join all tokens with NUL
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            self.target.len()
                + self.operation.len()
                + self.args.iter().map(|a| a.len() + 1).sum::<usize>()
                + 1,
        );
        out.push_str(&self.target);
        out.push(SEPARATOR);
        out.push_str(&self.operation);
        for arg in &self.args {
            out.push(SEPARATOR);
            out.push_str(arg);
        }
        out
    }

    /// Split on NUL; fewer than two tokens is malformed
    pub fn decode(text: &str) -> Result<Self> {
        let mut tokens = text.split(SEPARATOR);
        match (tokens.next(), tokens.next()) {
            (Some(target), Some(operation)) => Ok(Self {
                target: target.to_string(),
                operation: operation.to_string(),
                args: tokens.map(str::to_string).collect(),
            }),
            _ => Err(IpcError::MalformedRequest(text.to_string())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.target, self.operation, self.args.join(", "))
    }
}

/// A command outcome as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Success, with the operation's result if it produced one
    Ok(Option<String>),
    /// Failure, with a description if one is available
    Fail(Option<String>),
}

impl Response {
    pub fn encode(&self) -> String {
        let (status, detail) = match self {
            Response::Ok(detail) => (STATUS_OK, detail),
            Response::Fail(detail) => (STATUS_FAIL, detail),
        };
        match detail {
            Some(detail) => format!("{status}{SEPARATOR}{detail}"),
            None => status.to_string(),
        }
    }

    /// Classify a reply. `None` means "no answer": the reply was empty or its
    /// status was neither `OK` nor `FAIL`.
    ///
    /// Everything after the first NUL is the detail, so a result that itself
    /// contains NUL arrives intact.
    pub fn decode(text: &str) -> Option<Self> {
        let mut parts = text.splitn(2, SEPARATOR);
        let status = parts.next()?;
        let detail = parts.next().map(str::to_string);
        match status {
            STATUS_OK => Some(Response::Ok(detail)),
            STATUS_FAIL => Some(Response::Fail(detail)),
            _ => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}
