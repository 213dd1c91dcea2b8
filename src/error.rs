//! Error types for the engine and its requests
//!
//! Construction and submission failures are reported synchronously through
//! `AioError`. Per-request IO failures are not errors of the engine: they
//! arrive later as a negative result on the completed `Op` and only become an
//! `AioError::OperationFailed` if the caller asks for that conversion.

use crate::engine::op::{OpKind, OpState};
use thiserror::Error;

/// Result type used by the engine
pub type Result<T> = std::result::Result<T, AioError>;

/// Engine and request errors
#[derive(Debug, Error)]
pub enum AioError {
    /// An `Op` or engine was used in the wrong lifecycle state
    #[error("{op} not allowed in state {state}")]
    InvalidState {
        /// The attempted operation
        op: &'static str,
        /// The state the request was in
        state: OpState,
    },

    /// Malformed request or retrieval parameters
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Capacity exceeded on submit, or the kernel refused a context
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A completed request carried a kernel-reported error
    #[error("{kind} failed: {}", std::io::Error::from_raw_os_error(*errno))]
    OperationFailed {
        /// Kind of the failed request
        kind: OpKind,
        /// Positive errno value
        errno: i32,
    },

    /// Pollable-only call on an engine built without a readiness descriptor
    #[error("engine was not constructed in pollable mode")]
    NotPollable,

    /// Unexpected system call failure
    #[error("{context}")]
    Os {
        /// What the engine was doing
        context: String,
        /// The underlying OS error
        #[source]
        source: std::io::Error,
    },
}

impl AioError {
    pub(crate) fn from_io(source: std::io::Error, context: impl Into<String>) -> Self {
        AioError::Os {
            context: context.into(),
            source,
        }
    }

    /// Map a synchronous submission failure onto the error taxonomy
    pub(crate) fn from_submit(source: std::io::Error, kind: OpKind) -> Self {
        match source.raw_os_error() {
            Some(libc::EAGAIN) => {
                AioError::ResourceExhausted(format!("kernel rejected {} submission: {}", kind, source))
            }
            Some(libc::EINVAL) | Some(libc::EBADF) | Some(libc::EFAULT) => {
                AioError::InvalidArgument(format!("{} rejected at submission: {}", kind, source))
            }
            _ => Self::from_io(source, format!("io_submit failed for {} operation", kind)),
        }
    }

    /// The errno behind this error, if there is one
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            AioError::OperationFailed { errno, .. } => Some(*errno),
            AioError::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_errno_mapping() {
        let err = AioError::from_submit(std::io::Error::from_raw_os_error(libc::EAGAIN), OpKind::Read);
        assert!(matches!(err, AioError::ResourceExhausted(_)));

        let err = AioError::from_submit(std::io::Error::from_raw_os_error(libc::EBADF), OpKind::Write);
        assert!(matches!(err, AioError::InvalidArgument(_)));

        let err = AioError::from_submit(std::io::Error::from_raw_os_error(libc::EIO), OpKind::Read);
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }

    #[test]
    fn test_operation_failed_display() {
        let err = AioError::OperationFailed { kind: OpKind::Read, errno: libc::EIO };
        let msg = err.to_string();
        assert!(msg.starts_with("read failed"), "unexpected message: {}", msg);
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = AioError::InvalidState { op: "result", state: OpState::Pending };
        assert_eq!(err.to_string(), "result not allowed in state pending");
    }
}
