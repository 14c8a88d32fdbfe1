use std::fmt;

/// Closed set of error kinds propagated across subsystem boundaries.
///
/// Wrappers may add context to the message but never change the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Failed,
    Runtime,
    NoMemory,
    OutOfRange,
    NotFound,
    AlreadyExist,
    InvalidArgument,
    WrongState,
    InvalidChecksum,
    Timeout,
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Failed => "failed",
            ErrorKind::Runtime => "runtime error",
            ErrorKind::NoMemory => "not enough memory",
            ErrorKind::OutOfRange => "out of range",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExist => "already exist",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::WrongState => "wrong state",
            ErrorKind::InvalidChecksum => "invalid checksum",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotSupported => "not supported",
        };

        f.write_str(s)
    }
}

/// Crate-wide error: a kind from the closed set plus a human-readable context
/// message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns a copy with extra context prepended; the kind is preserved.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Self { kind: self.kind, message: format!("{}: {}", context, self.message) }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn no_memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoMemory, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exist(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExist, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn wrong_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WrongState, message)
    }

    pub fn invalid_checksum(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidChecksum, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExist,
            std::io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Runtime,
        };

        Self::new(kind, err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found("row not found"),
            other => Self::runtime(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::runtime(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
