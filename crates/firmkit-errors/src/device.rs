//! Device operation errors.
//!
//! Every fallible device operation returns a [`DeviceError`]. The variant
//! communicates the *kind* of failure; the payload is a human-readable
//! message with enough context to debug the failing device.

use serde::{Deserialize, Serialize};

use crate::common::ErrorSeverity;

/// Device and lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Capability absent or operation inapplicable to this device or mode
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Lookup miss: instance, event, parent, registered type
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input, e.g. a bad type name or missing instance key
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Firmware size or content violates declared bounds
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// Invariant violation inside the core itself
    #[error("internal error: {0}")]
    Internal(String),

    /// Redundant operation, e.g. closing an already-closed device
    #[error("nothing to do: {0}")]
    NothingToDo(String),

    /// Authentication failed in a lower layer
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Device is busy, retrying later may succeed
    #[error("busy: {0}")]
    Busy(String),

    /// An interactive step is required before the operation can continue
    #[error("user action required: {0}")]
    NeedsUserAction(String),
}

/// The bare kind of a [`DeviceError`], without the message.
///
/// Used as the key of retry-recovery tables and as the serializable form
/// when an error is recorded into an emulation event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// See [`DeviceError::NotSupported`]
    NotSupported,
    /// See [`DeviceError::NotFound`]
    NotFound,
    /// See [`DeviceError::InvalidData`]
    InvalidData,
    /// See [`DeviceError::InvalidFile`]
    InvalidFile,
    /// See [`DeviceError::Internal`]
    Internal,
    /// See [`DeviceError::NothingToDo`]
    NothingToDo,
    /// See [`DeviceError::AuthFailed`]
    AuthFailed,
    /// See [`DeviceError::Busy`]
    Busy,
    /// See [`DeviceError::NeedsUserAction`]
    NeedsUserAction,
}

impl ErrorKind {
    /// Reconstruct an error of this kind with the given message.
    ///
    /// Replaying a recorded error must raise an error equal in kind and
    /// message to the one observed against real hardware.
    pub fn into_error(self, message: impl Into<String>) -> DeviceError {
        let message = message.into();
        match self {
            ErrorKind::NotSupported => DeviceError::NotSupported(message),
            ErrorKind::NotFound => DeviceError::NotFound(message),
            ErrorKind::InvalidData => DeviceError::InvalidData(message),
            ErrorKind::InvalidFile => DeviceError::InvalidFile(message),
            ErrorKind::Internal => DeviceError::Internal(message),
            ErrorKind::NothingToDo => DeviceError::NothingToDo(message),
            ErrorKind::AuthFailed => DeviceError::AuthFailed(message),
            ErrorKind::Busy => DeviceError::Busy(message),
            ErrorKind::NeedsUserAction => DeviceError::NeedsUserAction(message),
        }
    }
}

impl DeviceError {
    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::NotSupported(_) => ErrorKind::NotSupported,
            DeviceError::NotFound(_) => ErrorKind::NotFound,
            DeviceError::InvalidData(_) => ErrorKind::InvalidData,
            DeviceError::InvalidFile(_) => ErrorKind::InvalidFile,
            DeviceError::Internal(_) => ErrorKind::Internal,
            DeviceError::NothingToDo(_) => ErrorKind::NothingToDo,
            DeviceError::AuthFailed(_) => ErrorKind::AuthFailed,
            DeviceError::Busy(_) => ErrorKind::Busy,
            DeviceError::NeedsUserAction(_) => ErrorKind::NeedsUserAction,
        }
    }

    /// Get the message of this error, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            DeviceError::NotSupported(m)
            | DeviceError::NotFound(m)
            | DeviceError::InvalidData(m)
            | DeviceError::InvalidFile(m)
            | DeviceError::Internal(m)
            | DeviceError::NothingToDo(m)
            | DeviceError::AuthFailed(m)
            | DeviceError::Busy(m)
            | DeviceError::NeedsUserAction(m) => m,
        }
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DeviceError::NothingToDo(_) => ErrorSeverity::Info,
            DeviceError::Busy(_) | DeviceError::NeedsUserAction(_) => ErrorSeverity::Warning,
            DeviceError::Internal(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Check if retrying the operation might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeviceError::Busy(_))
    }

    /// Prefix the message, keeping the kind.
    ///
    /// Mirrors how call sites annotate a propagated failure with the
    /// operation that triggered it, e.g. `failed to probe: <inner>`.
    pub fn prefixed(self, prefix: &str) -> Self {
        let kind = self.kind();
        kind.into_error(format!("{prefix}{}", self.message()))
    }

    /// Create a not-supported error.
    pub fn not_supported(message: impl Into<String>) -> Self {
        DeviceError::NotSupported(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        DeviceError::NotFound(message.into())
    }

    /// Create an invalid-data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        DeviceError::InvalidData(message.into())
    }

    /// Create an invalid-file error.
    pub fn invalid_file(message: impl Into<String>) -> Self {
        DeviceError::InvalidFile(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        DeviceError::Internal(message.into())
    }

    /// Create a nothing-to-do error.
    pub fn nothing_to_do(message: impl Into<String>) -> Self {
        DeviceError::NothingToDo(message.into())
    }

    /// Create a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        DeviceError::Busy(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        let err = DeviceError::not_found("no event with ID GetContents");
        let kind = err.kind();
        let rebuilt = kind.into_error(err.message().to_string());
        assert_eq!(err, rebuilt);
    }

    #[test]
    fn test_severity() {
        assert_eq!(
            DeviceError::nothing_to_do("x").severity(),
            ErrorSeverity::Info
        );
        assert_eq!(DeviceError::internal("x").severity(), ErrorSeverity::Critical);
        assert_eq!(DeviceError::not_found("x").severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_is_retryable() {
        assert!(DeviceError::busy("claimed by kernel").is_retryable());
        assert!(!DeviceError::not_supported("no hook").is_retryable());
    }

    #[test]
    fn test_prefixed_keeps_kind() {
        let err = DeviceError::not_supported("not probing").prefixed("failed to probe: ");
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert_eq!(err.message(), "failed to probe: not probing");
    }

    #[test]
    fn test_display() {
        let err = DeviceError::invalid_file("firmware is 0x0100 bytes larger than allowed");
        assert!(err.to_string().starts_with("invalid file: "));
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::NotSupported).unwrap();
        assert_eq!(json, "\"not-supported\"");
        let kind: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(kind, ErrorKind::NotSupported);
    }

    #[test]
    fn test_is_std_error() {
        let err = DeviceError::not_found("test");
        let _: &dyn std::error::Error = &err;
    }
}
