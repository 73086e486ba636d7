//! Session management module.
//!
//! This module provides remote shell sessions, the registry that tracks
//! them, and the multiplexing of their I/O over the shared data channel.

pub mod manager;
pub mod multiplexer;
pub mod shell;

pub use manager::SessionRegistry;
pub use multiplexer::{DispatchError, InboundDemux, OutboundMux};
pub use shell::{
    PtySize, RemoteShell, ResizeOutcome, SessionDriver, SessionError, SessionId, SessionOptions,
    SessionOutput, SessionState, ShellConnector, ShellEvent, ShellSession, ShellTarget,
};
