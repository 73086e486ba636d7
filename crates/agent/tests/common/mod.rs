//! Shared fixtures for agent integration tests.
//!
//! `FakeConnector` hands out in-memory shells whose inputs, pty requests and
//! resizes are recorded, and whose output is scripted through `FakeRemote`.
//! `Harness` runs a full `AgentOrchestrator` over in-memory pipes.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent::config::Config;
use agent::orchestrator::{AgentChannels, AgentOrchestrator};
use agent::session::{
    PtySize, RemoteShell, SessionError, SessionRegistry, ShellConnector, ShellEvent, ShellTarget,
};
use bytes::Bytes;
use protocol::{length_prefixed, ControlEvent, ControlMessage, Frame, FrameCodec, FrameDecoder};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single wait in these tests.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a fake shell was asked to do.
#[derive(Debug, Default)]
pub struct ShellLog {
    pub pty: Option<(String, PtySize)>,
    pub shell_started: bool,
    pub resizes: Vec<PtySize>,
    pub input: Vec<u8>,
    pub closed: bool,
}

/// The in-memory shell produced by [`FakeConnector`].
pub struct FakeShell {
    log: Arc<Mutex<ShellLog>>,
    events: mpsc::UnboundedReceiver<ShellEvent>,
}

impl RemoteShell for FakeShell {
    async fn request_pty(&mut self, term: &str, size: PtySize) -> Result<(), SessionError> {
        self.log.lock().unwrap().pty = Some((term.to_string(), size));
        Ok(())
    }

    async fn start_shell(&mut self) -> Result<(), SessionError> {
        self.log.lock().unwrap().shell_started = true;
        Ok(())
    }

    async fn window_change(&mut self, size: PtySize) -> Result<(), SessionError> {
        self.log.lock().unwrap().resizes.push(size);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.log.lock().unwrap().input.extend_from_slice(data);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ShellEvent> {
        self.events.recv().await
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().closed = true;
    }
}

/// Test-side handle to one fake shell.
#[derive(Clone)]
pub struct FakeRemote {
    pub target: ShellTarget,
    log: Arc<Mutex<ShellLog>>,
    events: mpsc::UnboundedSender<ShellEvent>,
}

impl FakeRemote {
    /// Emit bytes on the shell's stdout.
    pub fn stdout(&self, data: &[u8]) {
        let _ = self
            .events
            .send(ShellEvent::Stdout(Bytes::copy_from_slice(data)));
    }

    /// Emit bytes on the shell's stderr.
    pub fn stderr(&self, data: &[u8]) {
        let _ = self
            .events
            .send(ShellEvent::Stderr(Bytes::copy_from_slice(data)));
    }

    /// Exit the remote shell.
    pub fn exit(&self, status: u32) {
        let _ = self.events.send(ShellEvent::ExitStatus(status));
        let _ = self.events.send(ShellEvent::Eof);
    }

    pub fn input(&self) -> Vec<u8> {
        self.log.lock().unwrap().input.clone()
    }

    pub fn pty(&self) -> Option<(String, PtySize)> {
        self.log.lock().unwrap().pty.clone()
    }

    pub fn resizes(&self) -> Vec<PtySize> {
        self.log.lock().unwrap().resizes.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }

    /// Wait until the shell has received exactly `expected` as input.
    pub async fn wait_for_input(&self, expected: &[u8]) {
        let result = tokio::time::timeout(TIMEOUT, async {
            loop {
                if self.input() == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "expected input {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(&self.input())
        );
    }

    /// Wait until the shell has been closed.
    pub async fn wait_closed(&self) {
        wait_until(|| self.is_closed()).await;
    }
}

#[derive(Default)]
struct ConnectorState {
    remotes: Mutex<Vec<FakeRemote>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    refused: Mutex<HashSet<String>>,
}

/// Connector producing [`FakeShell`]s.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<ConnectorState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold connects to `hostname` until the returned gate is notified.
    pub fn gate(&self, hostname: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state
            .gates
            .lock()
            .unwrap()
            .insert(hostname.to_string(), gate.clone());
        gate
    }

    /// Fail connects to `hostname` with a dial error.
    pub fn refuse(&self, hostname: &str) {
        self.state
            .refused
            .lock()
            .unwrap()
            .insert(hostname.to_string());
    }

    /// Number of shells handed out so far.
    pub fn connect_count(&self) -> usize {
        self.state.remotes.lock().unwrap().len()
    }

    /// The most recent shell opened to `hostname`.
    pub async fn remote(&self, hostname: &str) -> FakeRemote {
        let found = tokio::time::timeout(TIMEOUT, async {
            loop {
                let remote = self
                    .state
                    .remotes
                    .lock()
                    .unwrap()
                    .iter()
                    .rev()
                    .find(|r| r.target.hostname == hostname)
                    .cloned();
                if let Some(remote) = remote {
                    return remote;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        found.unwrap_or_else(|_| panic!("no shell was opened to {hostname}"))
    }
}

impl ShellConnector for FakeConnector {
    type Shell = FakeShell;

    async fn connect(&self, target: &ShellTarget) -> Result<FakeShell, SessionError> {
        let gate = self.state.gates.lock().unwrap().get(&target.hostname).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let refused = self.state.refused.lock().unwrap().contains(&target.hostname);
        if refused {
            return Err(SessionError::Dial(format!(
                "{}: connection refused",
                target.address()
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(ShellLog::default()));
        self.state.remotes.lock().unwrap().push(FakeRemote {
            target: target.clone(),
            log: log.clone(),
            events: tx,
        });
        Ok(FakeShell { log, events: rx })
    }
}

/// Poll `condition` until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met in time");
}

pub fn connect(session_id: &str, hostname: &str) -> ControlMessage {
    ControlMessage::Connect(protocol::ConnectRequest {
        session_id: session_id.to_string(),
        hostname: hostname.to_string(),
        username: "root".to_string(),
        port: 22,
    })
}

pub fn terminate(session_id: &str) -> ControlMessage {
    ControlMessage::Terminate(protocol::TerminateRequest {
        session_id: session_id.to_string(),
    })
}

pub fn resize(session_id: &str, rows: u16, cols: u16) -> ControlMessage {
    ControlMessage::Resize(protocol::ResizeRequest {
        session_id: session_id.to_string(),
        rows,
        cols,
    })
}

/// A running agent wired to in-memory channels.
pub struct Harness {
    pub connector: FakeConnector,
    pub registry: Arc<SessionRegistry>,
    pub codec: FrameCodec,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
    control: Option<DuplexStream>,
    data: DuplexStream,
    decoder: FrameDecoder,
}

impl Harness {
    pub fn start(connector: FakeConnector) -> Self {
        Self::start_with_config(Config::default(), connector)
    }

    pub fn start_with_config(config: Config, connector: FakeConnector) -> Self {
        let codec = FrameCodec::with_max_payload_size(config.channels.max_payload_size);
        let (control, agent_control) = duplex(256 * 1024);
        let (data, agent_data) = duplex(256 * 1024);
        let (control_in, control_out) = tokio::io::split(agent_control);
        let (data_in, data_out) = tokio::io::split(agent_data);

        let orchestrator = AgentOrchestrator::new(config, connector.clone());
        let registry = orchestrator.registry().clone();
        let shutdown = orchestrator.shutdown_token();
        let task = tokio::spawn(async move {
            orchestrator
                .run(AgentChannels {
                    control_in,
                    control_out,
                    data_in,
                    data_out,
                })
                .await
        });

        Self {
            connector,
            registry,
            codec: codec.clone(),
            shutdown,
            task,
            control: Some(control),
            data,
            decoder: FrameDecoder::new(codec),
        }
    }

    fn control(&mut self) -> &mut DuplexStream {
        self.control.as_mut().expect("control channel already closed")
    }

    pub async fn send_control(&mut self, message: &ControlMessage) {
        let body = message.encode().unwrap();
        self.send_control_body(&body).await;
    }

    pub async fn send_control_body(&mut self, body: &[u8]) {
        let framed = length_prefixed(body).unwrap();
        self.control().write_all(&framed).await.unwrap();
    }

    pub async fn next_event(&mut self) -> ControlEvent {
        let control = self.control();
        let event = tokio::time::timeout(TIMEOUT, async {
            let len = control.read_u32().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            control.read_exact(&mut body).await.unwrap();
            ControlEvent::decode(&body).unwrap()
        })
        .await;
        event.expect("timed out waiting for a control event")
    }

    /// Round-trip a ping so every earlier control message has been applied.
    pub async fn sync(&mut self) -> u64 {
        self.send_control(&ControlMessage::Ping).await;
        match self.next_event().await {
            ControlEvent::Pong { sessions } => sessions,
            other => panic!("expected pong, got {other:?}"),
        }
    }

    /// Connect a session and wait until its shell is running.
    pub async fn open_session(&mut self, session_id: &str, hostname: &str) -> FakeRemote {
        self.send_control(&connect(session_id, hostname)).await;
        assert_eq!(
            self.next_event().await,
            ControlEvent::SessionReady {
                session_id: session_id.to_string()
            }
        );
        self.connector.remote(hostname).await
    }

    pub async fn send_frame(&mut self, frame: &Frame) {
        let bytes = self.codec.encode(frame).unwrap();
        self.send_data(&bytes).await;
    }

    pub async fn send_data(&mut self, bytes: &[u8]) {
        self.data.write_all(bytes).await.unwrap();
        self.data.flush().await.unwrap();
    }

    pub async fn next_frame(&mut self) -> Frame {
        let data = &mut self.data;
        let decoder = &mut self.decoder;
        let frame = tokio::time::timeout(TIMEOUT, async {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(frame) = decoder.next_frame().unwrap() {
                    return frame;
                }
                let n = data.read(&mut buf).await.unwrap();
                assert!(n > 0, "data channel closed");
                decoder.extend(&buf[..n]);
            }
        })
        .await;
        frame.expect("timed out waiting for an outbound frame")
    }

    /// Close the controller's end of the control channel.
    pub fn close_control(&mut self) {
        self.control = None;
    }

    /// Wait for the agent to stop on its own.
    pub async fn join(self) -> anyhow::Result<()> {
        tokio::time::timeout(TIMEOUT, self.task)
            .await
            .expect("agent did not stop")
            .unwrap()
    }

    /// Request shutdown and wait for the agent to stop.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        self.join().await
    }
}
