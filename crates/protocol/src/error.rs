//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering viewer frame failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to serialize a frame.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A recognized control frame carried invalid fields.
    #[error("invalid {kind} frame: {reason}")]
    InvalidControl {
        /// The control frame `type` that was recognized.
        kind: &'static str,
        /// Why the frame was rejected.
        reason: String,
    },

    /// Terminal dimensions outside the accepted range.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize {
        /// Requested columns.
        cols: u64,
        /// Requested rows.
        rows: u64,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_control_display() {
        let err = ProtocolError::InvalidControl {
            kind: "resize",
            reason: "missing cols".to_string(),
        };
        assert_eq!(err.to_string(), "invalid resize frame: missing cols");
    }

    #[test]
    fn test_invalid_size_display() {
        let err = ProtocolError::InvalidSize { cols: 0, rows: 24 };
        assert_eq!(err.to_string(), "invalid terminal size 0x24");
    }
}
