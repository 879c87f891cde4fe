//! Transfer error taxonomy and retry classification.
//!
//! Transport implementations map their own failures (HTTP statuses, gRPC
//! codes, IO errors) into these kinds; the retry policy only ever sees the
//! classification, never the underlying error type.

use thiserror::Error;

/// High-level classification of a transfer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferErrorKind {
    /// Network-level failure (connection reset, DNS, etc.).
    Network,
    /// Operation timed out.
    Timeout,
    /// Remote-side internal error.
    Internal,
    /// Service temporarily unavailable.
    Unavailable,
    /// Operation was cancelled.
    Cancelled,
    /// Operation was aborted mid-flight.
    Aborted,
    /// Caller lacks permission for the destination.
    PermissionDenied,
    /// Malformed request (bad destination, bad reference).
    InvalidArgument,
    /// Destination or source does not exist.
    NotFound,
    /// Destination already exists and may not be overwritten.
    AlreadyExists,
    /// Remote storage quota exhausted.
    QuotaExceeded,
    /// Missing or invalid credentials.
    Unauthenticated,
    /// Unclassified failure.
    Unknown,
}

impl TransferErrorKind {
    /// Whether errors of this kind are worth retrying.
    ///
    /// `Some(true)` = known-retryable, `Some(false)` = known-permanent,
    /// `None` = unclassified (retry only under good network conditions).
    pub fn is_retryable(self) -> Option<bool> {
        match self {
            TransferErrorKind::Network
            | TransferErrorKind::Timeout
            | TransferErrorKind::Internal
            | TransferErrorKind::Unavailable
            | TransferErrorKind::Cancelled
            | TransferErrorKind::Aborted => Some(true),
            TransferErrorKind::PermissionDenied
            | TransferErrorKind::InvalidArgument
            | TransferErrorKind::NotFound
            | TransferErrorKind::AlreadyExists
            | TransferErrorKind::QuotaExceeded
            | TransferErrorKind::Unauthenticated => Some(false),
            TransferErrorKind::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferErrorKind::Network => "network",
            TransferErrorKind::Timeout => "timeout",
            TransferErrorKind::Internal => "internal",
            TransferErrorKind::Unavailable => "unavailable",
            TransferErrorKind::Cancelled => "cancelled",
            TransferErrorKind::Aborted => "aborted",
            TransferErrorKind::PermissionDenied => "permission-denied",
            TransferErrorKind::InvalidArgument => "invalid-argument",
            TransferErrorKind::NotFound => "not-found",
            TransferErrorKind::AlreadyExists => "already-exists",
            TransferErrorKind::QuotaExceeded => "quota-exceeded",
            TransferErrorKind::Unauthenticated => "unauthenticated",
            TransferErrorKind::Unknown => "unknown",
        }
    }
}

/// A classified transfer failure as reported by a transport handle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}: {}", .kind.as_str(), .message)]
pub struct TransferError {
    pub kind: TransferErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert_eq!(TransferErrorKind::Network.is_retryable(), Some(true));
        assert_eq!(TransferErrorKind::Timeout.is_retryable(), Some(true));
        assert_eq!(TransferErrorKind::Cancelled.is_retryable(), Some(true));
    }

    #[test]
    fn permanent_classes() {
        assert_eq!(
            TransferErrorKind::PermissionDenied.is_retryable(),
            Some(false)
        );
        assert_eq!(TransferErrorKind::QuotaExceeded.is_retryable(), Some(false));
        assert_eq!(TransferErrorKind::NotFound.is_retryable(), Some(false));
    }

    #[test]
    fn unknown_is_unclassified() {
        assert_eq!(TransferErrorKind::Unknown.is_retryable(), None);
    }

    #[test]
    fn display_includes_kind() {
        let e = TransferError::new(TransferErrorKind::Timeout, "connect deadline");
        assert_eq!(e.to_string(), "timeout: connect deadline");
    }
}
