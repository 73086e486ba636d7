//! Control-channel message definitions.
//!
//! Control messages travel on a side-channel separate from the framed data
//! stream. Every message is a MessagePack map with two named fields:
//!
//! ```text
//! { "operation": "<name>", "payload": { ... operation specific ... } }
//! ```
//!
//! On the wire each message is prefixed by its length as a big-endian u32
//! (see [`length_prefixed`]).
//!
//! Decoding happens in two passes: the envelope's `operation` is read first,
//! then the payload is decoded into the type that operation expects. This
//! keeps "not an envelope at all", "unknown operation" and "wrong payload"
//! apart so the dispatcher can log each precisely.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Largest control message accepted, excluding the length prefix.
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

/// Size of the control message length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Operation names understood by the agent.
pub mod operation {
    /// Open a new remote shell session.
    pub const CONNECT: &str = "connect";
    /// Tear a session down.
    pub const TERMINATE: &str = "terminate";
    /// Change a session's terminal size.
    pub const RESIZE: &str = "resize";
    /// Liveness probe.
    pub const PING: &str = "ping";

    /// A connect request could not be carried out.
    pub const CONNECT_FAILED: &str = "connect_failed";
    /// A session's shell is running and accepts input.
    pub const SESSION_READY: &str = "session_ready";
    /// A session has fully closed.
    pub const SESSION_CLOSED: &str = "session_closed";
    /// Reply to a ping.
    pub const PONG: &str = "pong";
}

/// Generic envelope with a typed payload.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    operation: String,
    payload: T,
}

/// Envelope with the payload left undecoded.
#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    operation: String,
}

/// Payload of a `connect` command.
///
/// Missing fields decode to their empty value so validation can name the
/// field that is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Controller-assigned session ID.
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    /// Host to open the shell on.
    #[serde(default)]
    pub hostname: String,
    /// Remote user name.
    #[serde(default)]
    pub username: String,
    /// Remote SSH port.
    #[serde(default)]
    pub port: u16,
}

/// Payload of a `terminate` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminateRequest {
    /// Session to tear down.
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
}

/// Payload of a `resize` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Session to resize.
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    /// Terminal height in rows.
    #[serde(default)]
    pub rows: u16,
    /// Terminal width in columns.
    #[serde(default)]
    pub cols: u16,
}

/// A decoded control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Open a session.
    Connect(ConnectRequest),
    /// Close a session.
    Terminate(TerminateRequest),
    /// Resize a session's terminal.
    Resize(ResizeRequest),
    /// Liveness probe; the payload is ignored.
    Ping,
}

impl ControlMessage {
    /// The operation name for this message.
    pub fn operation(&self) -> &'static str {
        match self {
            ControlMessage::Connect(_) => operation::CONNECT,
            ControlMessage::Terminate(_) => operation::TERMINATE,
            ControlMessage::Resize(_) => operation::RESIZE,
            ControlMessage::Ping => operation::PING,
        }
    }

    /// The session this message addresses, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ControlMessage::Connect(req) => Some(&req.session_id),
            ControlMessage::Terminate(req) => Some(&req.session_id),
            ControlMessage::Resize(req) => Some(&req.session_id),
            ControlMessage::Ping => None,
        }
    }

    /// Decode a control message from its MessagePack body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header: EnvelopeHeader = rmp_serde::from_slice(bytes)?;

        match header.operation.as_str() {
            operation::CONNECT => Ok(ControlMessage::Connect(decode_payload(
                bytes,
                operation::CONNECT,
            )?)),
            operation::TERMINATE => Ok(ControlMessage::Terminate(decode_payload(
                bytes,
                operation::TERMINATE,
            )?)),
            operation::RESIZE => Ok(ControlMessage::Resize(decode_payload(
                bytes,
                operation::RESIZE,
            )?)),
            operation::PING => Ok(ControlMessage::Ping),
            other => Err(ProtocolError::UnknownOperation(other.to_string())),
        }
    }

    /// Encode this message as a MessagePack body (without length prefix).
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            ControlMessage::Connect(req) => encode_envelope(operation::CONNECT, req),
            ControlMessage::Terminate(req) => encode_envelope(operation::TERMINATE, req),
            ControlMessage::Resize(req) => encode_envelope(operation::RESIZE, req),
            ControlMessage::Ping => encode_envelope(operation::PING, &Empty {}),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Empty {}

#[derive(Debug, Serialize, Deserialize)]
struct SessionPayload {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConnectFailedPayload {
    #[serde(rename = "sessionID")]
    session_id: String,
    error: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct PongPayload {
    sessions: u64,
}

/// An event reported back to the controller on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A connect command was rejected or failed.
    ConnectFailed {
        /// Session the connect was for.
        session_id: String,
        /// Stable failure label (e.g. `dial_failed`).
        error: String,
    },
    /// A session's shell started.
    SessionReady {
        /// The session now accepting input.
        session_id: String,
    },
    /// A session reached its closed state.
    SessionClosed {
        /// The session that closed.
        session_id: String,
    },
    /// Reply to a ping.
    Pong {
        /// Number of registered sessions.
        sessions: u64,
    },
}

impl ControlEvent {
    /// The operation name for this event.
    pub fn operation(&self) -> &'static str {
        match self {
            ControlEvent::ConnectFailed { .. } => operation::CONNECT_FAILED,
            ControlEvent::SessionReady { .. } => operation::SESSION_READY,
            ControlEvent::SessionClosed { .. } => operation::SESSION_CLOSED,
            ControlEvent::Pong { .. } => operation::PONG,
        }
    }

    /// Encode this event as a MessagePack body (without length prefix).
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            ControlEvent::ConnectFailed { session_id, error } => encode_envelope(
                operation::CONNECT_FAILED,
                &ConnectFailedPayload {
                    session_id: session_id.clone(),
                    error: error.clone(),
                },
            ),
            ControlEvent::SessionReady { session_id } => encode_envelope(
                operation::SESSION_READY,
                &SessionPayload {
                    session_id: session_id.clone(),
                },
            ),
            ControlEvent::SessionClosed { session_id } => encode_envelope(
                operation::SESSION_CLOSED,
                &SessionPayload {
                    session_id: session_id.clone(),
                },
            ),
            ControlEvent::Pong { sessions } => encode_envelope(
                operation::PONG,
                &PongPayload {
                    sessions: *sessions,
                },
            ),
        }
    }

    /// Decode an event from its MessagePack body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header: EnvelopeHeader = rmp_serde::from_slice(bytes)?;

        match header.operation.as_str() {
            operation::CONNECT_FAILED => {
                let payload: ConnectFailedPayload =
                    decode_payload(bytes, operation::CONNECT_FAILED)?;
                Ok(ControlEvent::ConnectFailed {
                    session_id: payload.session_id,
                    error: payload.error,
                })
            }
            operation::SESSION_READY => {
                let payload: SessionPayload = decode_payload(bytes, operation::SESSION_READY)?;
                Ok(ControlEvent::SessionReady {
                    session_id: payload.session_id,
                })
            }
            operation::SESSION_CLOSED => {
                let payload: SessionPayload = decode_payload(bytes, operation::SESSION_CLOSED)?;
                Ok(ControlEvent::SessionClosed {
                    session_id: payload.session_id,
                })
            }
            operation::PONG => {
                let payload: PongPayload = decode_payload(bytes, operation::PONG)?;
                Ok(ControlEvent::Pong {
                    sessions: payload.sessions,
                })
            }
            other => Err(ProtocolError::UnknownOperation(other.to_string())),
        }
    }
}

/// Prefix a message body with its big-endian u32 length.
pub fn length_prefixed(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_CONTROL_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: body.len(),
            max: MAX_CONTROL_MESSAGE_SIZE,
        });
    }

    let mut output = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    output.extend_from_slice(&(body.len() as u32).to_be_bytes());
    output.extend_from_slice(body);
    Ok(output)
}

fn encode_envelope<T: Serialize>(operation: &str, payload: &T) -> Result<Vec<u8>> {
    let envelope = Envelope {
        operation: operation.to_string(),
        payload,
    };
    // Named encoding so field names appear on the wire
    Ok(rmp_serde::to_vec_named(&envelope)?)
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8], operation: &str) -> Result<T> {
    rmp_serde::from_slice::<Envelope<T>>(bytes)
        .map(|envelope| envelope.payload)
        .map_err(|e| ProtocolError::InvalidPayload {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
}
