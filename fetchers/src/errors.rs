use std::io;

use ferrix_compat::nixhash;
use thiserror::Error;
use tokio::task::JoinError;

/// Coarse classification of an [Error], deciding how callers react to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unparseable URLs, hashes or attributes. Never retried.
    Malformed,
    /// Conflicting parts of a request, rejected before any I/O.
    Contradictory,
    /// The requested source doesn't exist.
    NotFound,
    /// The source couldn't be reached right now. A stale cached result may
    /// be used instead.
    Transient,
    /// Hash mismatches and policy violations. Always fatal.
    Integrity,
    Fatal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid URL '{url}': {reason}")]
    BadUrl { url: String, reason: String },

    #[error("{0}")]
    Malformed(String),

    #[error("invalid hash: {0}")]
    BadHash(#[from] nixhash::Error),

    #[error("attribute '{0}' is missing")]
    MissingAttribute(String),

    #[error("attribute '{name}' should be {expected} but is {got}")]
    AttributeType {
        name: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("input attribute '{attr}' not supported by scheme '{scheme}'")]
    UnsupportedAttribute { scheme: String, attr: String },

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("{0}")]
    Contradictory(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Integrity(String),

    #[error("{0} is not supported by this input")]
    Unsupported(String),

    #[error("command '{command}' failed with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("store error: {0}")]
    Store(#[from] ferrix_store::Error),

    #[error("fetch cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Fatal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadUrl { .. }
            | Error::Malformed(_)
            | Error::BadHash(_)
            | Error::MissingAttribute(_)
            | Error::AttributeType { .. }
            | Error::UnsupportedAttribute { .. }
            | Error::UnsupportedInput(_) => ErrorKind::Malformed,
            Error::Contradictory(_) => ErrorKind::Contradictory,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Integrity(_) | Error::Store(ferrix_store::Error::HashMismatch { .. }) => {
                ErrorKind::Integrity
            }
            Error::Unsupported(_)
            | Error::Command { .. }
            | Error::Store(_)
            | Error::Cache(_)
            | Error::Io(_)
            | Error::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub(crate) fn bad_url(url: impl ToString, reason: impl ToString) -> Self {
        Error::BadUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::Fatal(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Malformed(format!("invalid JSON: {value}"))
    }
}

/// The result of an operation against the outside world (a subprocess, an
/// HTTP server), telling apart the ways it can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    NotFound(String),
    Transient(String),
    Fatal(String),
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(v) => Outcome::Success(f(v)),
            Outcome::NotFound(msg) => Outcome::NotFound(msg),
            Outcome::Transient(msg) => Outcome::Transient(msg),
            Outcome::Fatal(msg) => Outcome::Fatal(msg),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Outcome::Success(v) => Ok(v),
            Outcome::NotFound(msg) => Err(Error::NotFound(msg)),
            Outcome::Transient(msg) => Err(Error::Transient(msg)),
            Outcome::Fatal(msg) => Err(Error::Fatal(msg)),
        }
    }
}
