use std::fmt;

/// Result type used throughout the crate.
pub type CResult<T> = Result<T, Error>;

/// All errors surfaced by the engine. Storage faults propagate to the caller;
/// only trigger/listener handler failures are swallowed (logged and counted).
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Malformed key, path, option, or oversize input. Maps to HTTP 400.
    InvalidArgument(String),

    /// Missing key, DLQ id, or FTS index. Maps to HTTP 404.
    NotFound(String),

    /// An atomic check failed or a transaction conflicted. The transaction
    /// facade retries these; everyone else decides for themselves.
    Conflict,

    /// Operation on a transaction handle that already committed.
    TransactionClosed,

    /// Stored key bytes failed to decode.
    CorruptKey(String),

    /// Stored value bytes failed to decode.
    CorruptValue(String),

    /// Row store fault. Atomic commits leave no partial state behind these.
    Io(String),

    /// A trigger or listener handler failed. Never reaches the caller of the
    /// mutation that fired it.
    Handler(String),

    /// Serialization / deserialization failure on user-facing data.
    Parse(String),

    /// Catch-all for internal invariant violations.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::Conflict => write!(f, "conflict"),
            Error::TransactionClosed => write!(f, "transaction closed"),
            Error::CorruptKey(msg) => write!(f, "corrupt key: {}", msg),
            Error::CorruptValue(msg) => write!(f, "corrupt value: {}", msg),
            Error::Io(msg) => write!(f, "io error: {}", msg),
            Error::Handler(msg) => write!(f, "handler error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
