use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("device is offline")]
    Offline,

    #[error("no auth token available")]
    AuthMissing,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Parse(String),

    #[error("outbox cannot admit operation: {0}")]
    QueueFull(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns a stable error code for this error variant.
    /// These codes are stable and can be used by callers for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Offline => "OFFLINE",
            Error::AuthMissing => "AUTH_MISSING",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::QueueFull(_) => "QUEUE_FULL",
            Error::Io(_) => "IO_ERROR",
            Error::Corruption(_) => "CORRUPTION",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if this error is potentially retryable.
    ///
    /// Transient failures like transport or IO errors are retryable.
    /// `Offline` and `AuthMissing` are precondition failures: the operation
    /// goes straight to the offline outbox instead of being retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Io(_) => true,

            Error::Offline => false,
            Error::AuthMissing => false,
            Error::Parse(_) => false,
            Error::QueueFull(_) => false,
            Error::Corruption(_) => false,
            Error::InvalidArgument(_) => false,
            Error::Internal(_) => false,
        }
    }

    /// Adds context to an error by wrapping it in an Internal error.
    pub fn with_context(self, context: &str) -> Error {
        Error::Internal(format!("{}: {}", context, self))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
