//! CSI error types.
//!
//! All errors in the `libvmcsi` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.  Each variant maps onto a gRPC-style
//! [`ErrorCode`] so callers can choose a retry policy without parsing
//! messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::infra::InfraError;

/// Status codes surfaced to CSI callers, matching the gRPC code space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    Unimplemented,
    Internal,
    Unavailable,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// No VM in the infra cluster carries the given node id.
    #[error("no VM with firmware uuid {0}")]
    NodeNotFound(String),

    /// No local block device carries the expected serial number.
    #[error("no block device with serial {0}")]
    DeviceNotFound(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The infra cluster API rejected or failed a request.
    #[error("infra cluster: {context}: {message}")]
    InfraApi {
        /// What the driver was doing when the call failed.
        context: String,
        /// Message reported by the infra API client.
        message: String,
        /// Whether the failure looks transient (connection, 5xx).
        transient: bool,
    },

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The RPC is deliberately not supported by this driver.
    #[error("{0} is not implemented")]
    Unimplemented(String),

    /// The request did not finish before its deadline.
    #[error("deadline exceeded after {0} ms")]
    DeadlineExceeded(u64),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Wrap an infra API failure with the operation that triggered it.
    pub fn infra(context: impl Into<String>, err: InfraError) -> Self {
        Self::InfraApi {
            context: context.into(),
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Status code reported to the caller.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NodeNotFound(_) | Self::DeviceNotFound(_) => ErrorCode::NotFound,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Unimplemented(_) => ErrorCode::Unimplemented,
            Self::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Self::InfraApi { transient: true, .. } | Self::TransportError(_) => {
                ErrorCode::Unavailable
            }
            Self::InfraApi { .. }
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::DeviceNotFound("vol-123".into());
        assert_eq!(err.to_string(), "no block device with serial vol-123");

        let err = CsiError::Unimplemented("ListVolumes".into());
        assert_eq!(err.to_string(), "ListVolumes is not implemented");
    }

    #[test]
    fn not_found_is_distinct_from_upstream_failures() {
        let missing = CsiError::NodeNotFound("uuid-1".into());
        assert_eq!(missing.code(), ErrorCode::NotFound);
        assert!(missing.is_not_found());

        let upstream = CsiError::infra(
            "list VMs",
            InfraError::Transport("connection refused".into()),
        );
        assert_eq!(upstream.code(), ErrorCode::Unavailable);
        assert!(!upstream.is_not_found());

        let rejected = CsiError::infra(
            "create disk image vol-1",
            InfraError::Api {
                status: 422,
                message: "bad spec".into(),
            },
        );
        assert_eq!(rejected.code(), ErrorCode::Internal);
    }

    #[test]
    fn infra_error_keeps_context() {
        let err = CsiError::infra(
            "delete disk image vol-1",
            InfraError::Api {
                status: 500,
                message: "etcd timeout".into(),
            },
        );
        let text = err.to_string();
        assert!(text.contains("delete disk image vol-1"), "{text}");
        assert!(text.contains("etcd timeout"), "{text}");
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err, de);
    }
}
