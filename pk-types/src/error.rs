use std::fmt;

/// Error taxonomy from the chunk-store design (spec §7). Every fallible
/// operation in the `pk-*` crates returns a [`PkError`] so callers can
/// dispatch on `kind()` instead of matching error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    BadPadding,
    BadFormat,
    BufferOverflow,
    NoStreaming,
    NotFound,
    TagMismatch,
    KeyMismatch,
    Busy,
    NetFail,
    Interrupted,
    CallFail,
    IoErr,
    Sql,
}

impl ErrorKind {
    /// Whether the spec's propagation policy (§7) retries this kind locally
    /// rather than surfacing it to the caller.
    pub fn is_locally_retryable(self) -> bool {
        matches!(self, ErrorKind::Busy | ErrorKind::NetFail | ErrorKind::BufferOverflow)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::BadPadding => "BAD_PADDING",
            ErrorKind::BadFormat => "BAD_FORMAT",
            ErrorKind::BufferOverflow => "BUFFER_OVERFLOW",
            ErrorKind::NoStreaming => "NO_STREAMING",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::TagMismatch => "TAG_MISMATCH",
            ErrorKind::KeyMismatch => "KEY_MISMATCH",
            ErrorKind::Busy => "BUSY",
            ErrorKind::NetFail => "NETFAIL",
            ErrorKind::Interrupted => "INTERRUPTED",
            ErrorKind::CallFail => "CALLFAIL",
            ErrorKind::IoErr => "IOERR",
            ErrorKind::Sql => "SQL",
        };
        f.write_str(s)
    }
}

/// The crate-wide error type: a [`ErrorKind`] plus free-form context.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PkError {
    pub kind: ErrorKind,
    message: String,
    #[source]
    source: Option<anyhow::Error>,
}

impl PkError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub type PkResult<T> = Result<T, PkError>;

/// Convenience macro mirroring `anyhow::bail!` but tagging a [`ErrorKind`].
#[macro_export]
macro_rules! pk_bail {
    ($kind:expr, $($arg:tt)*) => {
        return Err($crate::error::PkError::new($kind, format!($($arg)*)))
    };
}

impl From<std::io::Error> for PkError {
    fn from(err: std::io::Error) -> Self {
        PkError::with_source(ErrorKind::IoErr, "I/O error", err.into())
    }
}
