//! Error types for flowload-core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failure, shared by run-level errors and
/// per-iteration stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid or missing configuration
    Config,
    /// Input resource could not be read
    Input,
    /// Network-level fault (connect, reset, timeout)
    Transport,
    /// Remote service answered with a 5xx status
    Server,
    /// Remote service rejected the request (4xx)
    Client,
    /// Response body did not have the expected shape
    InvalidResponse,
    /// Credentials were refused
    Authentication,
    /// A wait exceeded its window
    Timeout,
    /// Remote job reported failure
    RemoteFailure,
    /// Nothing to work on yet (e.g. empty input, empty artifact pool)
    NotReady,
    /// The run is stopping
    Shutdown,
    /// Coordination or bookkeeping fault inside the engine
    Orchestration,
}

impl ErrorKind {
    /// Whether an actor hitting this kind of fault must leave the run
    pub fn is_fatal_for_actor(&self) -> bool {
        matches!(self, ErrorKind::Authentication | ErrorKind::Config)
    }
}

/// Engine error: a kind plus a human readable message
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} error: {message}")]
pub struct LoadError {
    /// Failure classification
    pub kind: ErrorKind,
    /// Detail
    pub message: String,
}

impl LoadError {
    /// Create an error of an arbitrary kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// A required builder field was not provided
    pub fn missing_config(field: &str) -> Self {
        Self::config(format!("missing required field: {field}"))
    }

    /// Input read failure
    pub fn input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Input, message)
    }

    /// Authentication failure
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    /// Orchestration failure
    pub fn orchestration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Orchestration, message)
    }

    /// The run is shutting down
    pub fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "run is stopping")
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        Self::input(err.to_string())
    }
}

/// Result alias for engine operations
pub type LoadResult<T> = Result<T, LoadError>;
