//! # shellmux Protocol Library
//!
//! Wire formats shared by the shellmux agent and its controller.
//!
//! ## Overview
//!
//! A controller and an agent talk over two independent channels:
//!
//! - **Data channel**: a byte stream carrying [`Frame`]s. Each frame tags a
//!   chunk of stdin/stdout/stderr with the session it belongs to, so any
//!   number of shell sessions share one pipe.
//! - **Control channel**: length-prefixed MessagePack envelopes carrying
//!   [`ControlMessage`]s (connect, resize, terminate) and the
//!   [`ControlEvent`]s the agent sends back.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Shell sessions (stdin/stdout/stderr)  │
//! ├───────────────────┬─────────────────────┤
//! │   Frame codec     │  Control messages   │  SMUX v1 / MessagePack
//! ├───────────────────┼─────────────────────┤
//! │   Data pipe       │  Control pipe       │
//! └───────────────────┴─────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ChannelKind, Frame, FrameCodec, FrameDecoder};
//!
//! let codec = FrameCodec::new();
//! let bytes = codec
//!     .encode(&Frame::new(ChannelKind::Stdin, "sess-1", b"ls\n".to_vec()))
//!     .unwrap();
//!
//! // Frames survive arbitrary read boundaries
//! let mut decoder = FrameDecoder::new(codec);
//! decoder.extend(&bytes[..5]);
//! assert!(decoder.next_frame().unwrap().is_none());
//! decoder.extend(&bytes[5..]);
//! let frame = decoder.next_frame().unwrap().unwrap();
//! assert_eq!(frame.payload, b"ls\n");
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Session frame codec and stream decoder
//! - [`messages`]: Control-channel messages and events
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    ChannelKind, Frame, FrameCodec, FrameDecoder, DEFAULT_MAX_PAYLOAD_SIZE, FRAME_MAGIC,
    FRAME_OVERHEAD, FRAME_VERSION, MAX_SESSION_ID_LEN,
};
pub use messages::{
    length_prefixed, ConnectRequest, ControlEvent, ControlMessage, ResizeRequest,
    TerminateRequest, LENGTH_PREFIX_SIZE, MAX_CONTROL_MESSAGE_SIZE,
};
