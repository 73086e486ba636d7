//! Agent orchestrator for wiring together all components.
//!
//! This module provides the `AgentOrchestrator` that builds the session
//! registry, the outbound multiplexer, the control router and the inbound
//! demultiplexer, runs them over the four channels handed to the agent, and
//! tears every session down when any of them stops.

use std::sync::Arc;

use anyhow::Result;
use protocol::FrameCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::router::{write_events, ControlRouter};
use crate::session::{
    DispatchError, InboundDemux, OutboundMux, SessionOptions, SessionRegistry, ShellConnector,
};

/// The four byte streams the agent speaks over.
pub struct AgentChannels<CI, CO, DI, DO> {
    /// Control messages from the controller.
    pub control_in: CI,
    /// Control events to the controller.
    pub control_out: CO,
    /// Frames carrying session input.
    pub data_in: DI,
    /// Frames carrying session output.
    pub data_out: DO,
}

/// Coordinates the agent's channels and sessions.
pub struct AgentOrchestrator<C: ShellConnector> {
    /// Configuration.
    config: Config,
    /// Live sessions.
    registry: Arc<SessionRegistry>,
    /// Opens remote shells.
    connector: Arc<C>,
    /// Cancelled to stop the agent.
    shutdown_token: CancellationToken,
}

fn flatten(joined: Result<Result<(), DispatchError>, JoinError>) -> Result<(), DispatchError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(DispatchError::FatalTransport(std::io::Error::other(e))),
    }
}

impl<C: ShellConnector> AgentOrchestrator<C> {
    /// Create a new orchestrator.
    pub fn new(config: Config, connector: C) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            connector: Arc::new(connector),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Request a graceful stop.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown_token.cancel();
    }

    /// Serve the channels until the controller goes away, a shutdown is
    /// requested, or a channel fails.
    ///
    /// Every session is closed before returning. A channel failure is
    /// returned as an error so the process exits non-zero.
    pub async fn run<CI, CO, DI, DO>(&self, channels: AgentChannels<CI, CO, DI, DO>) -> Result<()>
    where
        CI: AsyncRead + Unpin + Send + 'static,
        CO: AsyncWrite + Unpin + Send + 'static,
        DI: AsyncRead + Unpin + Send + 'static,
        DO: AsyncWrite + Unpin + Send + 'static,
    {
        let AgentChannels {
            control_in,
            control_out,
            data_in,
            data_out,
        } = channels;

        let codec = FrameCodec::with_max_payload_size(self.config.channels.max_payload_size);
        let outbound = OutboundMux::new(data_out, codec.clone(), self.config.shell.read_buffer_size);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let router = ControlRouter::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.connector),
            outbound.clone(),
            events_tx,
            SessionOptions::from(&self.config.shell),
        );
        let demux = InboundDemux::new(Arc::clone(&self.registry), codec);

        let mut inbound_task = tokio::spawn(demux.run(data_in));
        let mut events_task = tokio::spawn(write_events(events_rx, control_out));

        info!("Agent running");

        let outcome: Result<&'static str, DispatchError> = tokio::select! {
            result = router.run(control_in) => result.map(|_| "control channel closed"),
            joined = &mut inbound_task => flatten(joined).map(|_| "data channel closed"),
            joined = &mut events_task => flatten(joined).map(|_| "event queue closed"),
            e = outbound.failed() => Err(e),
            _ = self.shutdown_token.cancelled() => Ok("shutdown requested"),
        };

        self.registry.close_all();
        inbound_task.abort();
        events_task.abort();

        match outcome {
            Ok(reason) => {
                info!(reason, "Agent stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Agent stopped on transport failure");
                Err(anyhow::Error::new(e).context("agent transport failed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PtySize, RemoteShell, SessionError, ShellEvent, ShellTarget};
    use protocol::{ControlMessage, MAX_CONTROL_MESSAGE_SIZE};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};

    struct RefusingConnector;

    struct NoShell;

    impl RemoteShell for NoShell {
        async fn request_pty(&mut self, _term: &str, _size: PtySize) -> Result<(), SessionError> {
            Ok(())
        }
        async fn start_shell(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
        async fn window_change(&mut self, _size: PtySize) -> Result<(), SessionError> {
            Ok(())
        }
        async fn send(&mut self, _data: &[u8]) -> Result<(), SessionError> {
            Ok(())
        }
        async fn next_event(&mut self) -> Option<ShellEvent> {
            None
        }
        async fn close(&mut self) {}
    }

    impl ShellConnector for RefusingConnector {
        type Shell = NoShell;

        async fn connect(&self, target: &ShellTarget) -> Result<NoShell, SessionError> {
            Err(SessionError::Dial(target.address()))
        }
    }

    #[tokio::test]
    async fn test_stops_when_control_channel_closes() {
        let orchestrator = AgentOrchestrator::new(Config::default(), RefusingConnector);
        let (control, agent_control) = duplex(1024);
        let (_data, agent_data) = duplex(1024);
        let (control_in, control_out) = tokio::io::split(agent_control);
        let (data_in, data_out) = tokio::io::split(agent_data);

        drop(control);
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            orchestrator.run(AgentChannels {
                control_in,
                control_out,
                data_in,
                data_out,
            }),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let orchestrator = AgentOrchestrator::new(Config::default(), RefusingConnector);
        let (_control, agent_control) = duplex(1024);
        let (_data, agent_data) = duplex(1024);
        let (control_in, control_out) = tokio::io::split(agent_control);
        let (data_in, data_out) = tokio::io::split(agent_data);

        orchestrator.shutdown();
        let result = orchestrator
            .run(AgentChannels {
                control_in,
                control_out,
                data_in,
                data_out,
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(orchestrator.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_survives_oversized_control_message() {
        let orchestrator = AgentOrchestrator::new(Config::default(), RefusingConnector);
        let (mut control, agent_control) = duplex(128 * 1024);
        let (_data, agent_data) = duplex(1024);
        let (control_in, control_out) = tokio::io::split(agent_control);
        let (data_in, data_out) = tokio::io::split(agent_data);

        let oversized = MAX_CONTROL_MESSAGE_SIZE + 16;
        control.write_all(&(oversized as u32).to_be_bytes()).await.unwrap();
        control.write_all(&vec![0u8; oversized]).await.unwrap();
        let ping = protocol::length_prefixed(&ControlMessage::Ping.encode().unwrap()).unwrap();
        control.write_all(&ping).await.unwrap();

        let token = orchestrator.shutdown_token();
        let run = orchestrator.run(AgentChannels {
            control_in,
            control_out,
            data_in,
            data_out,
        });
        let probe = async {
            use tokio::io::AsyncReadExt;
            let len = control.read_u32().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            control.read_exact(&mut body).await.unwrap();
            token.cancel();
            protocol::ControlEvent::decode(&body).unwrap()
        };

        let (result, event) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(run, probe)
        })
        .await
        .unwrap();
        assert!(result.is_ok());
        assert_eq!(event, protocol::ControlEvent::Pong { sessions: 0 });
    }
}
