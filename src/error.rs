//! Unified error model for the fragment curator.
//! Every failure inside a single fragment's collection is converted into one of these
//! variants and classified as recoverable (retry on a later scheduler tick) or not.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CuratorError {
    /// The fragment lock could not be taken within the configured acquisition timeout.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },
    /// The fragment generator (query executor) could not be reached or refused the pattern.
    #[error("fragment generator unavailable: {0}")]
    ExecutorUnavailable(String),
    #[error("cannot load sink for request {request_id}: {message}")]
    SinkLoad { request_id: String, message: String },
    #[error("fragment store error: {0}")]
    Store(String),
    /// The row stream failed after it had started.
    #[error("row stream failed: {0}")]
    Stream(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Internal(String),
}

impl CuratorError {
    pub fn code_str(&self) -> &'static str {
        match self {
            CuratorError::LockTimeout { .. } => "lock_timeout",
            CuratorError::ExecutorUnavailable(_) => "executor_unavailable",
            CuratorError::SinkLoad { .. } => "sink_load",
            CuratorError::Store(_) => "store_error",
            CuratorError::Stream(_) => "stream_error",
            CuratorError::Config(_) => "config_error",
            CuratorError::Io(_) => "io_error",
            CuratorError::Serde(_) => "serde_error",
            CuratorError::Internal(_) => "internal_error",
        }
    }

    /// Recoverable errors leave the fragment unsynced so the scheduler retries it on a later tick.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CuratorError::LockTimeout { .. }
            | CuratorError::ExecutorUnavailable(_)
            | CuratorError::SinkLoad { .. }
            | CuratorError::Store(_)
            | CuratorError::Stream(_)
            | CuratorError::Io(_) => true,
            CuratorError::Config(_) | CuratorError::Serde(_) | CuratorError::Internal(_) => false,
        }
    }

    pub fn store<S: Into<String>>(msg: S) -> Self { CuratorError::Store(msg.into()) }
    pub fn stream<S: Into<String>>(msg: S) -> Self { CuratorError::Stream(msg.into()) }
    pub fn executor<S: Into<String>>(msg: S) -> Self { CuratorError::ExecutorUnavailable(msg.into()) }
    pub fn config<S: Into<String>>(msg: S) -> Self { CuratorError::Config(msg.into()) }
    pub fn internal<S: Into<String>>(msg: S) -> Self { CuratorError::Internal(msg.into()) }
}

pub type CuratorResult<T> = Result<T, CuratorError>;

impl From<anyhow::Error> for CuratorError {
    fn from(err: anyhow::Error) -> Self {
        // Default mapping: treat as internal unless downcasted elsewhere
        CuratorError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
