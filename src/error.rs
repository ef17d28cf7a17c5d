//! Error types for safer-compose.
//!
//! Two kinds of failure flow through the crate:
//!
//! - [`ErrorCode`] is the copyable status delivered to completion handlers
//!   together with the transfer count. It is what the reactor reports for a
//!   primitive operation and what a composed operation passes through.
//! - [`ComposeError`] is returned by fallible APIs (setup, the fiber driver,
//!   the synchronous-style adapter) through the [`Result`] alias.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for safer-compose operations.
pub type Result<T> = std::result::Result<T, ComposeError>;

/// Completion status handed to a [`CompletionHandler`](crate::CompletionHandler).
///
/// Operating-system failures keep their raw error number so that they can be
/// compared exactly; failures without one keep their [`io::ErrorKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    /// The operation succeeded.
    #[default]
    Success,
    /// The operation failed with a raw OS error number.
    Os(i32),
    /// The operation failed with an error that carries no OS error number.
    Kind(io::ErrorKind),
}

impl ErrorCode {
    /// Status of a successful operation.
    pub const fn success() -> Self {
        Self::Success
    }

    /// Status reported when the peer closed the stream before the operation
    /// could finish.
    pub const fn eof() -> Self {
        Self::Kind(io::ErrorKind::UnexpectedEof)
    }

    /// Status reported for an operation that was aborted before completion.
    pub const fn aborted() -> Self {
        Self::Os(libc::ECANCELED)
    }

    /// Returns true if this status carries an error.
    #[inline]
    pub const fn is_err(&self) -> bool {
        !matches!(self, Self::Success)
    }

    /// Returns true if this status is a success.
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The error kind, or `None` on success.
    pub fn kind(&self) -> Option<io::ErrorKind> {
        match *self {
            Self::Success => None,
            Self::Os(code) => Some(io::Error::from_raw_os_error(code).kind()),
            Self::Kind(kind) => Some(kind),
        }
    }

    /// Convert into an [`io::Error`], or `None` on success.
    pub fn to_io_error(self) -> Option<io::Error> {
        match self {
            Self::Success => None,
            Self::Os(code) => Some(io::Error::from_raw_os_error(code)),
            Self::Kind(kind) => Some(io::Error::from(kind)),
        }
    }
}

impl From<&io::Error> for ErrorCode {
    fn from(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Self::Os(code),
            None => Self::Kind(err.kind()),
        }
    }
}

impl From<io::Error> for ErrorCode {
    fn from(err: io::Error) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_io_error() {
            None => write!(f, "success"),
            Some(err) => write!(f, "{err}"),
        }
    }
}

/// Error type for fallible safer-compose APIs.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// A composed or primitive operation completed with an error.
    ///
    /// Raised by the synchronous-style adapter when the caller did not opt
    /// into receiving the error code as data.
    #[error("operation failed after {bytes_transferred} bytes: {source}")]
    Operation {
        /// The error reported to the completion handler
        source: io::Error,
        /// Transfer count reported alongside the error
        bytes_transferred: usize,
    },

    /// The completion handler holding a pending result was dropped without
    /// being invoked.
    #[error("completion handler dropped before delivering a result")]
    Abandoned,

    /// The fiber driver has suspended fibers but nothing left that could
    /// resume them.
    #[error("fiber driver stalled: {fibers} fibers suspended with no outstanding reactor work")]
    Stalled {
        /// Number of fibers that were still suspended
        fibers: usize,
    },

    /// The fiber driver exceeded its configured deadline.
    #[error("fiber driver exceeded its deadline of {0:?}")]
    Timeout(Duration),

    /// A configuration value was rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The mock peer failed.
    #[error("echo server failed: {0}")]
    Peer(String),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ComposeError {
    /// Build the error raised for a failed completion.
    pub(crate) fn from_completion(ec: ErrorCode, bytes_transferred: usize) -> Self {
        let source = ec
            .to_io_error()
            .unwrap_or_else(|| io::Error::other("operation reported failure without a cause"));
        Self::Operation {
            source,
            bytes_transferred,
        }
    }
}

static_assertions::assert_impl_all!(ComposeError: Send, Sync);
static_assertions::assert_impl_all!(ErrorCode: Send, Sync, Copy);
