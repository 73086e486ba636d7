//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering codec and control-message failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    // Frame encoding errors
    /// Channel kind byte is not stdin, stdout or stderr.
    #[error("invalid channel kind: {0}")]
    InvalidChannelKind(u8),

    /// Session ID does not fit in the one-byte length prefix.
    #[error("session ID too long: {len} bytes exceeds maximum of 255 bytes")]
    SessionIdTooLong {
        /// Encoded length of the offending session ID.
        len: usize,
    },

    /// Session ID is empty.
    #[error("session ID cannot be empty")]
    EmptySessionId,

    /// Frames must always carry data.
    #[error("payload cannot be empty")]
    EmptyPayload,

    /// Payload exceeds the codec's configured maximum.
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Frame decoding errors
    /// Frame header fields are inconsistent or corrupt.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    // Control message errors
    /// Failed to serialize a control message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a control envelope.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Envelope named an operation this agent does not implement.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// Envelope was valid but its payload did not match the operation.
    #[error("invalid payload for {operation}: {reason}")]
    InvalidPayload {
        /// Operation whose payload failed to decode.
        operation: String,
        /// Decoder error text.
        reason: String,
    },

    /// Control message exceeds the maximum allowed size.
    #[error("control message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Declared message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

impl ProtocolError {
    /// Short, stable label used in logs and control events.
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolError::InvalidChannelKind(_) => "invalid_channel_kind",
            ProtocolError::SessionIdTooLong { .. } => "session_id_too_long",
            ProtocolError::EmptySessionId => "empty_session_id",
            ProtocolError::EmptyPayload => "empty_payload",
            ProtocolError::PayloadTooLarge { .. } => "payload_too_large",
            ProtocolError::MalformedFrame(_) => "malformed_frame",
            ProtocolError::Serialization(_) => "serialization",
            ProtocolError::Deserialization(_) => "malformed_envelope",
            ProtocolError::UnknownOperation(_) => "unknown_operation",
            ProtocolError::InvalidPayload { .. } => "invalid_payload",
            ProtocolError::MessageTooLarge { .. } => "message_too_large",
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}
