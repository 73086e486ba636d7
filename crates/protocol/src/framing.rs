//! Session frame codec for multiplexing many shell sessions over one byte stream.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 4 bytes: magic bytes "SMUX"
//! - 1 byte: format version (currently 1)
//! - 1 byte: session ID length (S, 1..=255)
//! - S bytes: session ID (UTF-8)
//! - 1 byte: channel kind (0 = stdin, 1 = stdout, 2 = stderr)
//! - 4 bytes: payload length (P, big-endian, at least 1)
//! - P bytes: payload
//!
//! The magic prefix is what lets a [`FrameDecoder`] find its footing again
//! after corrupt bytes on the stream.

use std::fmt;

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a session frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SMUX";

/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Longest session ID the one-byte length prefix can describe.
pub const MAX_SESSION_ID_LEN: usize = 255;

/// Default payload cap (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Fixed bytes in every frame: 4 (magic) + 1 (version) + 1 (SID length)
/// + 1 (channel) + 4 (payload length) = 11 bytes.
pub const FRAME_OVERHEAD: usize = 11;

/// Offset of the session ID length byte.
const SID_LEN_OFFSET: usize = 5;

/// Offset of the first session ID byte.
const SID_OFFSET: usize = 6;

/// Which of a session's three data streams a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelKind {
    /// Input flowing to the remote shell.
    Stdin = 0,
    /// Output flowing back from the remote shell.
    Stdout = 1,
    /// Error output flowing back from the remote shell.
    Stderr = 2,
}

impl ChannelKind {
    /// Get the wire byte for this channel kind.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Lowercase name, used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Stdin => "stdin",
            ChannelKind::Stdout => "stdout",
            ChannelKind::Stderr => "stderr",
        }
    }
}

impl TryFrom<u8> for ChannelKind {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(ChannelKind::Stdin),
            1 => Ok(ChannelKind::Stdout),
            2 => Ok(ChannelKind::Stderr),
            other => Err(ProtocolError::InvalidChannelKind(other)),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One chunk of session data tagged with its channel and session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this payload belongs to.
    pub channel: ChannelKind,
    /// Session the payload is addressed to.
    pub session_id: String,
    /// The data bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(
        channel: ChannelKind,
        session_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            channel,
            session_id: session_id.into(),
            payload: payload.into(),
        }
    }

    /// Number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.session_id.len() + self.payload.len()
    }
}

/// Encoder and decoder for session frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Largest payload accepted in either direction.
    max_payload_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with the default payload cap.
    pub fn new() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Create a codec with a custom payload cap.
    ///
    /// The cap is clamped to what a 32-bit length field can describe.
    pub fn with_max_payload_size(max_payload_size: usize) -> Self {
        Self {
            max_payload_size: max_payload_size.min(u32::MAX as usize),
        }
    }

    /// The largest payload this codec accepts.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        self.encode_parts(frame.channel.as_byte(), &frame.session_id, &frame.payload)
    }

    /// Encode a frame from its raw parts.
    ///
    /// Fails with [`ProtocolError::InvalidChannelKind`] for an unknown channel
    /// byte, [`ProtocolError::EmptySessionId`] or
    /// [`ProtocolError::SessionIdTooLong`] for a session ID outside 1..=255
    /// bytes, and [`ProtocolError::EmptyPayload`] for an empty payload.
    pub fn encode_parts(&self, channel: u8, session_id: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let channel = ChannelKind::try_from(channel)?;

        let sid = session_id.as_bytes();
        if sid.is_empty() {
            return Err(ProtocolError::EmptySessionId);
        }
        if sid.len() > MAX_SESSION_ID_LEN {
            return Err(ProtocolError::SessionIdTooLong { len: sid.len() });
        }

        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        if payload.len() > self.max_payload_size {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload_size,
            });
        }

        let mut output = Vec::with_capacity(FRAME_OVERHEAD + sid.len() + payload.len());

        // Magic bytes and version
        output.extend_from_slice(&FRAME_MAGIC);
        output.push(FRAME_VERSION);

        // Session ID
        output.push(sid.len() as u8);
        output.extend_from_slice(sid);

        // Channel kind
        output.push(channel.as_byte());

        // Payload length (big-endian u32) and payload
        output.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        output.extend_from_slice(payload);

        Ok(output)
    }

    /// Try to decode a frame from the start of `data`.
    ///
    /// Returns `Ok(None)` when `data` holds a strict prefix of a valid frame
    /// (the caller should wait for more bytes), `Ok(Some((frame, consumed)))`
    /// for a complete frame, and [`ProtocolError::MalformedFrame`] as soon as
    /// the available bytes can no longer begin a valid frame.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        // Every prefix of the magic must match, even a partial one
        let magic_len = data.len().min(FRAME_MAGIC.len());
        if data[..magic_len] != FRAME_MAGIC[..magic_len] {
            return Err(ProtocolError::MalformedFrame(format!(
                "invalid frame magic: {:02x?}",
                &data[..magic_len]
            )));
        }

        if data.len() <= FRAME_MAGIC.len() {
            return Ok(None);
        }
        if data[4] != FRAME_VERSION {
            return Err(ProtocolError::MalformedFrame(format!(
                "unsupported frame version: {}",
                data[4]
            )));
        }

        if data.len() <= SID_LEN_OFFSET {
            return Ok(None);
        }
        let sid_len = data[SID_LEN_OFFSET] as usize;
        if sid_len == 0 {
            return Err(ProtocolError::MalformedFrame(
                "session ID length is zero".to_string(),
            ));
        }

        let channel_offset = SID_OFFSET + sid_len;
        if data.len() <= channel_offset {
            return Ok(None);
        }

        let session_id = std::str::from_utf8(&data[SID_OFFSET..channel_offset])
            .map_err(|e| ProtocolError::MalformedFrame(format!("session ID is not UTF-8: {}", e)))?;

        let channel = ChannelKind::try_from(data[channel_offset]).map_err(|_| {
            ProtocolError::MalformedFrame(format!("invalid channel kind: {}", data[channel_offset]))
        })?;

        let length_offset = channel_offset + 1;
        let payload_offset = length_offset + 4;
        if data.len() < payload_offset {
            return Ok(None);
        }

        let payload_len = u32::from_be_bytes([
            data[length_offset],
            data[length_offset + 1],
            data[length_offset + 2],
            data[length_offset + 3],
        ]) as usize;

        if payload_len == 0 {
            return Err(ProtocolError::MalformedFrame(
                "payload length is zero".to_string(),
            ));
        }
        if payload_len > self.max_payload_size {
            return Err(ProtocolError::MalformedFrame(format!(
                "declared payload of {} bytes exceeds maximum of {} bytes",
                payload_len, self.max_payload_size
            )));
        }

        let total = payload_offset + payload_len;
        if data.len() < total {
            return Ok(None);
        }

        let frame = Frame {
            channel,
            session_id: session_id.to_string(),
            payload: data[payload_offset..total].to_vec(),
        };

        Ok(Some((frame, total)))
    }

    /// Decode a frame from a buffer that is expected to hold a whole frame.
    ///
    /// Unlike [`FrameCodec::try_decode`], a truncated buffer is an error here.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        self.try_decode(data)?.ok_or_else(|| {
            ProtocolError::MalformedFrame(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))
        })
    }
}

/// Accumulating decoder for a continuous frame stream.
///
/// Bytes are appended as they arrive; complete frames are pulled out in
/// order. Partial frames stay buffered until the rest arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a stream decoder on top of `codec`.
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete frame, if any.
    ///
    /// On a malformed header the offending bytes are discarded up to the next
    /// magic prefix and the error is returned; calling again continues with
    /// whatever follows.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.codec.try_decode(&self.buffer) {
            Ok(Some((frame, consumed))) => {
                self.buffer.advance(consumed);
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.resync();
                Err(e)
            }
        }
    }

    /// Skip at least one byte, then up to the next position that could start a frame.
    fn resync(&mut self) {
        let len = self.buffer.len();
        let next = (1..len)
            .find(|&pos| {
                let tail = &self.buffer[pos..];
                let n = tail.len().min(FRAME_MAGIC.len());
                tail[..n] == FRAME_MAGIC[..n]
            })
            .unwrap_or(len);
        self.buffer.advance(next);
    }
}
