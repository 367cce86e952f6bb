//! Error types for netlink and database operations.

use std::io;
use std::time::Duration;

/// Result type for netlink and database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the kernel or committing changes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel (positive).
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Kernel error with operation context.
    #[error("{operation}: {message} (errno {errno})")]
    KernelWithContext {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel (positive).
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// A fixed-size structure did not fit in the buffer.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected length.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// A datagram did not fit in the receive buffer.
    #[error("datagram of {size} bytes truncated to {capacity}")]
    MessageTruncated {
        /// Size reported by the kernel.
        size: usize,
        /// Bytes actually read.
        capacity: usize,
    },

    /// The codec could not parse a message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Invalid message for the requested operation.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute name or value.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// Operation not supported.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Parse error in human-friendly input.
    #[error("parse error: {0}")]
    Parse(String),

    /// Interface not found.
    #[error("interface not found: {name}")]
    InterfaceNotFound {
        /// The interface name or index that was not found.
        name: String,
    },

    /// Namespace not found.
    #[error("namespace not found: {name}")]
    NamespaceNotFound {
        /// The namespace name that was not found.
        name: String,
    },

    /// The connection was closed.
    #[error("socket closed")]
    SocketClosed,

    /// A reply or a target did not arrive in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The namespace worker was shut down.
    #[error("namespace worker cancelled")]
    Cancelled,

    /// A field did not converge to its target during commit.
    #[error("target missed for field {field}")]
    TargetMissed {
        /// The field (or linked set) name.
        field: String,
    },

    /// A port did not report the expected master during commit.
    #[error("port {port} did not reach its master target")]
    PortTargetMissed {
        /// The port ifindex.
        port: u32,
    },

    /// Commit failed and was rolled back.
    #[error("commit failed: {reason}")]
    CommitFailed {
        /// What went wrong.
        reason: String,
        /// Underlying error, if any.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Commit failed and the rollback failed too.
    #[error("rollback failed: {rollback} (original error: {original})")]
    Broken {
        /// The error that triggered the rollback.
        original: Box<Error>,
        /// The error raised by the rollback.
        rollback: Box<Error>,
    },

    /// Mutation attempted without an open transaction in explicit mode.
    #[error("no open transaction")]
    NoTransaction,

    /// Mutation attempted on a read-only snapshot.
    #[error("object is read-only")]
    ReadOnly,
}

impl Error {
    /// Create a kernel error from a (negative) errno value.
    pub fn from_errno(errno: i32) -> Self {
        let errno = errno.abs();
        let message = io::Error::from_raw_os_error(errno).to_string();
        Self::Kernel { errno, message }
    }

    /// Create a kernel error with operation context.
    pub fn from_errno_with_context(errno: i32, operation: impl Into<String>) -> Self {
        Self::from_errno(errno).with_context(operation)
    }

    /// Wrap an error as a commit failure.
    pub fn commit_failed(reason: impl Into<String>, source: Option<Error>) -> Self {
        Self::CommitFailed {
            reason: reason.into(),
            source: source.map(Box::new),
        }
    }

    /// Add context to this error.
    ///
    /// Wraps kernel errors with operation context. Other errors are returned unchanged.
    pub fn with_context(self, operation: impl Into<String>) -> Self {
        match self {
            Self::Kernel { errno, message } => Self::KernelWithContext {
                operation: operation.into(),
                errno,
                message,
            },
            other => other,
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Get the errno of the kernel error at the root of a commit failure chain.
    pub fn root_errno(&self) -> Option<i32> {
        match self {
            Self::CommitFailed {
                source: Some(inner),
                ..
            } => inner.root_errno(),
            Self::Broken { original, .. } => original.root_errno(),
            other => other.errno(),
        }
    }

    /// Check for a specific errno.
    pub fn is_errno(&self, code: i32) -> bool {
        self.errno() == Some(code)
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV, ESRCH).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } | Self::KernelWithContext { errno, .. } => {
                matches!(*errno, libc::ENOENT | libc::ENODEV | libc::ESRCH)
            }
            Self::InterfaceNotFound { .. } | Self::NamespaceNotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(libc::EPERM | libc::EACCES))
    }

    /// Check if this is an "already exists" error (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        self.is_errno(libc::EEXIST)
    }

    /// Check if this is an "operation not supported" error.
    pub fn is_not_supported(&self) -> bool {
        self.is_errno(libc::EOPNOTSUPP)
    }
}
