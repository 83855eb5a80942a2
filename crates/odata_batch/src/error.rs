// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::sync::Arc;

use thiserror::Error;

/// Any error raised by the batch readers and writers, their operation sub-streams or the
/// entry readers in this crate.
///
/// The variants follow the distinction callers care about: misuse of the API
/// ([`Sequencing`][Error::Sequencing], [`InvalidArgument`][Error::InvalidArgument],
/// [`Unsupported`][Error::Unsupported], [`Disposed`][Error::Disposed]) versus problems with the
/// payload or the underlying transport ([`Format`][Error::Format],
/// [`Transport`][Error::Transport]) versus configured limits being hit
/// ([`RecursionDepthExceeded`][Error::RecursionDepthExceeded],
/// [`QuotaExceeded`][Error::QuotaExceeded]).
///
/// The type is cheap to clone so that a batch that failed can report the same failure to every
/// subsequent call.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// An argument was outside the range the operation accepts, e.g. an offset/count pair that
    /// does not fit in the provided buffer. Detected before any I/O takes place.
    #[error("invalid argument `{name}`: {message}")]
    InvalidArgument {
        /// Name of the offending parameter.
        name: &'static str,
        /// What is wrong with it.
        message: Cow<'static, str>,
    },

    /// An operation was invoked in a state that does not allow it, e.g. asking for the next
    /// operation while the previous operation's content stream is still live.
    #[error("`{operation}` cannot be called in the {state} state")]
    Sequencing {
        /// The rejected operation.
        operation: &'static str,
        /// Name of the state the object was in.
        state: &'static str,
    },

    /// The capability is not offered by this kind of stream, e.g. seeking on a read stream.
    #[error("`{0}` is not supported by this stream")]
    Unsupported(&'static str),

    /// The operation stream was already disposed.
    #[error("the operation stream has been disposed")]
    Disposed,

    /// Nested structures went deeper than the configured maximum.
    #[error("recursion depth exceeded: the maximum nesting depth is {max}")]
    RecursionDepthExceeded {
        /// The configured maximum depth.
        max: usize,
    },

    /// A message quota was exceeded.
    #[error("the {quota} quota of {limit} was exceeded")]
    QuotaExceeded {
        /// Name of the quota.
        quota: &'static str,
        /// The configured limit.
        limit: usize,
    },

    /// The payload does not follow the expected format.
    #[error("malformed payload: {0}")]
    Format(Cow<'static, str>),

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(Arc<std::io::Error>),

    /// An internal invariant was violated. This indicates a defect, not caller misuse.
    #[error("internal error: {0}")]
    Internal(Cow<'static, str>),
}

impl Error {
    pub(crate) fn invalid_argument(name: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument {
            name,
            message: message.into(),
        }
    }

    pub(crate) fn format(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Format(message.into())
    }

    pub(crate) fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal(message.into())
    }

    /// Classifies a JSON failure: I/O failures are transport errors, anything else is a format error.
    pub(crate) fn json(error: serde_json::Error) -> Self {
        if error.is_io() {
            std::io::Error::from(error).into()
        } else {
            Self::format(format!("invalid JSON: {error}"))
        }
    }

    /// Whether this error leaves the owning batch unusable.
    ///
    /// Transport and payload format failures are fatal: once the byte cursor is in an unknown
    /// position there is no way to find the next operation again.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Format(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::Transport(Arc::new(error))
    }
}

/// Represents the error as a standard I/O error, for use by the `std::io` adapters of the
/// operation streams.
impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Transport(error) => Self::new(error.kind(), Error::Transport(error)),
            Error::InvalidArgument { .. } => Self::new(std::io::ErrorKind::InvalidInput, value),
            Error::Unsupported(_) => Self::new(std::io::ErrorKind::Unsupported, value),
            Error::Format(_) => Self::new(std::io::ErrorKind::InvalidData, value),
            _ => Self::other(value),
        }
    }
}

/// A specialized `Result` for operations of this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn assert_types() {
        static_assertions::assert_impl_all!(Error: Send, Sync, Clone);
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::from(std::io::Error::other("boom")).is_fatal());
        assert!(Error::format("bad").is_fatal());
        assert!(
            !Error::Sequencing {
                operation: "read",
                state: "Completed"
            }
            .is_fatal()
        );
        assert!(!Error::RecursionDepthExceeded { max: 3 }.is_fatal());
        assert!(!Error::Disposed.is_fatal());
    }

    #[test]
    fn transport_error_keeps_kind() {
        let error = Error::from(std::io::Error::new(ErrorKind::BrokenPipe, "pipe"));
        let io: std::io::Error = error.into();

        assert_eq!(io.kind(), ErrorKind::BrokenPipe);
        assert_eq!(io.to_string(), "pipe");
    }

    #[test]
    fn display_messages() {
        let error = Error::Sequencing {
            operation: "read_next_operation_body",
            state: "OperationStreamActive",
        };
        assert_eq!(
            error.to_string(),
            "`read_next_operation_body` cannot be called in the OperationStreamActive state"
        );

        let error = Error::invalid_argument("count", "exceeds the buffer");
        assert_eq!(error.to_string(), "invalid argument `count`: exceeds the buffer");

        let io: std::io::Error = Error::Unsupported("seek").into();
        assert_eq!(io.kind(), ErrorKind::Unsupported);
    }
}
