//! Error types for the request engine.
//!
//! Every failure raised by a request, a stream or a worker is an [`Error`].
//! Errors are `Clone` because a failure stored in an
//! [`AsyncHandle`](crate::AsyncHandle) is handed to every observer, not just
//! the first one.

use std::io;
use std::sync::Arc;

use thiserror::Error as ThisError;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A body was attached to a request that cannot carry one.
    ProtocolViolation,
    /// An operation was called in a state that does not allow it.
    InvalidState,
    /// A wait exceeded its deadline.
    Timeout,
    /// The request was aborted.
    Cancelled,
    /// The underlying resource failed.
    Transport,
    /// Input could not be interpreted (locators, headers, text, config).
    InvalidInput,
}

/// Errors raised by the request engine.
#[derive(ThisError, Debug, Clone)]
pub enum Error {
    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("request cancelled")]
    Cancelled,

    #[error("transport failure: {message}")]
    Transport {
        message: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("invalid locator: {message}")]
    InvalidLocator { message: String },

    #[error("invalid header: {message}")]
    InvalidHeader { message: String },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("worker pool unavailable: {message}")]
    Dispatch { message: String },

    #[error("config error: {message}")]
    Config { message: String },
}

impl Error {
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState {
            message: message.into(),
        }
    }

    /// Wrap a failure of the primitive resource, keeping it as the source.
    pub fn transport(message: impl Into<String>, source: io::Error) -> Self {
        Error::Transport {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            Error::InvalidState { .. } | Error::Dispatch { .. } => ErrorKind::InvalidState,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::InvalidLocator { .. }
            | Error::InvalidHeader { .. }
            | Error::Decode { .. }
            | Error::Config { .. } => ErrorKind::InvalidInput,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Recover an [`Error`] that travelled through an `io::Error`.
    ///
    /// Errors produced by this crate's `Read`/`Write` impls come back as the
    /// original variant; any other I/O failure becomes [`Error::Transport`].
    pub fn from_io(context: &str, error: io::Error) -> Self {
        if error.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = error.into_inner() {
                if let Ok(engine_error) = inner.downcast::<Error>() {
                    return *engine_error;
                }
            }
            return Error::invalid_state(format!("{}: unreadable inner error", context));
        }
        let message = format!("{}: {}", context, error);
        Error::transport(message, error)
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        let kind = match error.kind() {
            // never Interrupted: std's read/write loops retry on it
            ErrorKind::Cancelled => io::ErrorKind::Other,
            ErrorKind::Timeout => io::ErrorKind::TimedOut,
            ErrorKind::InvalidInput => io::ErrorKind::InvalidInput,
            ErrorKind::Transport => match &error {
                Error::Transport { source, .. } => source.kind(),
                _ => io::ErrorKind::Other,
            },
            ErrorKind::ProtocolViolation | ErrorKind::InvalidState => io::ErrorKind::Other,
        };
        io::Error::new(kind, error)
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::InvalidLocator {
            message: error.to_string(),
        }
    }
}

impl From<http::header::InvalidHeaderName> for Error {
    fn from(error: http::header::InvalidHeaderName) -> Self {
        Error::InvalidHeader {
            message: error.to_string(),
        }
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(error: http::header::InvalidHeaderValue) -> Self {
        Error::InvalidHeader {
            message: error.to_string(),
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn cancelled_display_has_no_cause() {
        let e = Error::Cancelled;
        assert_eq!(format!("{}", e), "request cancelled");
        assert!(StdError::source(&e).is_none());
    }

    #[test]
    fn transport_keeps_source() {
        let e = Error::transport(
            "open file:///tmp/x",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert_eq!(e.kind(), ErrorKind::Transport);
        let source = StdError::source(&e).unwrap();
        assert!(source.to_string().contains("missing"));
    }

    #[test]
    fn timeout_display_names_operation() {
        let e = Error::Timeout {
            operation: "response",
        };
        assert_eq!(format!("{}", e), "response timed out");
        assert!(e.is_timeout());
    }

    #[test]
    fn io_round_trip_preserves_variant() {
        let io_error: io::Error = Error::Cancelled.into();
        assert_eq!(io_error.kind(), io::ErrorKind::Other);
        let back = Error::from_io("write", io_error);
        assert!(back.is_cancelled());
    }

    #[test]
    fn io_round_trip_preserves_transport_kind() {
        let original = Error::transport(
            "read",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let io_error: io::Error = original.into();
        assert_eq!(io_error.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(Error::from_io("read", io_error).kind(), ErrorKind::Transport);
    }

    #[test]
    fn foreign_io_error_becomes_transport() {
        let e = Error::from_io("read", io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        match e {
            Error::Transport { message, source } => {
                assert!(message.starts_with("read:"));
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn url_error_conversion() {
        let e: Error = url::Url::parse("not a url").unwrap_err().into();
        assert_eq!(e.kind(), ErrorKind::InvalidInput);
        assert!(format!("{}", e).contains("invalid locator"));
    }

    #[test]
    fn header_error_conversion() {
        let e: Error = http::header::HeaderName::from_bytes(b"bad header")
            .unwrap_err()
            .into();
        assert!(matches!(e, Error::InvalidHeader { .. }));
    }

    #[test]
    fn errors_are_cloneable() {
        let e = Error::invalid_state("already running");
        let copy = e.clone();
        assert_eq!(format!("{}", e), format!("{}", copy));
    }
}
