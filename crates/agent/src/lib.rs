//! # shellmux Agent Library
//!
//! This crate provides the agent that multiplexes many interactive remote
//! shell sessions over a single pair of data pipes inherited from a parent
//! controller process.
//!
//! ## Overview
//!
//! The agent speaks over four streams:
//!
//! - **Control in** (stdin): length-prefixed `connect`, `terminate`,
//!   `resize` and `ping` commands
//! - **Control out** (stdout): `session_ready`, `session_closed`,
//!   `connect_failed` and `pong` events
//! - **Data in** (fd 3): frames carrying keystrokes for each session
//! - **Data out** (fd 4): frames carrying stdout and stderr of each session
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Agent Orchestrator                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │   Control    │  │   Session    │  │     Inbound Demux     │  │
//! │  │   Router     │─▶│   Registry   │◀─│     (data in)         │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │          │                 │                                    │
//! │          ▼                 ▼                                    │
//! │  ┌──────────────┐  ┌──────────────────────────────────────────┐ │
//! │  │ SSH backend  │  │          Outbound Mux (data out)          │ │
//! │  └──────────────┘  └──────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent::config::Config;
//! use agent::network::{SshConnector, TcpDialer, TrustPolicy};
//! use agent::orchestrator::{AgentChannels, AgentOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let connector = SshConnector::new(TcpDialer::new(), TrustPolicy::from(&config.trust));
//!     let orchestrator = AgentOrchestrator::new(config, connector);
//!
//!     let (data_in, data_out) = tokio::io::duplex(64 * 1024);
//!     let (data_in, _) = tokio::io::split(data_in);
//!     let (_, data_out) = tokio::io::split(data_out);
//!     orchestrator
//!         .run(AgentChannels {
//!             control_in: tokio::io::stdin(),
//!             control_out: tokio::io::stdout(),
//!             data_in,
//!             data_out,
//!         })
//!         .await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Remote shell sessions, registry and data multiplexing
//! - [`network`]: Dialing and the SSH backend
//! - [`router`]: Control message dispatch
//! - [`orchestrator`]: Main agent coordinator

pub mod config;
pub mod network;
pub mod orchestrator;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    DispatchError, InboundDemux, OutboundMux, PtySize, RemoteShell, ResizeOutcome, SessionError,
    SessionId, SessionOptions, SessionRegistry, SessionState, ShellConnector, ShellEvent,
    ShellSession, ShellTarget,
};

// Re-export network types for convenience
pub use network::{Dialer, SshConnector, TcpDialer, TrustPolicy};

// Re-export router types for convenience
pub use router::{ControlRouter, EventReceiver, EventSender};

// Re-export orchestrator types for convenience
pub use orchestrator::{AgentChannels, AgentOrchestrator};
