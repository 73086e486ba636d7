//! Control message router.
//!
//! This module provides the `ControlRouter` that reads length-prefixed
//! control messages from the controller and applies them: `connect` opens a
//! session in the background, `terminate` tears one down, `resize` changes a
//! terminal size and `ping` reports liveness. Outcomes the controller needs
//! to know about are sent back as [`ControlEvent`]s.

use std::io;
use std::sync::Arc;

use protocol::messages::length_prefixed;
use protocol::{
    ConnectRequest, ControlEvent, ControlMessage, ResizeRequest, MAX_CONTROL_MESSAGE_SIZE,
    MAX_SESSION_ID_LEN,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::session::{
    DispatchError, OutboundMux, RemoteShell, ResizeOutcome, SessionDriver, SessionError,
    SessionOptions, SessionOutput, SessionRegistry, ShellConnector, ShellSession, ShellTarget,
};

/// Sender half of the control event queue.
pub type EventSender = mpsc::UnboundedSender<ControlEvent>;

/// Receiver half of the control event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<ControlEvent>;

/// Dispatches control messages to the session layer.
pub struct ControlRouter<C: ShellConnector> {
    registry: Arc<SessionRegistry>,
    connector: Arc<C>,
    outbound: OutboundMux,
    events: EventSender,
    options: SessionOptions,
}

impl<C: ShellConnector> ControlRouter<C> {
    /// Create a new router with the given dependencies.
    pub fn new(
        registry: Arc<SessionRegistry>,
        connector: Arc<C>,
        outbound: OutboundMux,
        events: EventSender,
        options: SessionOptions,
    ) -> Self {
        Self {
            registry,
            connector,
            outbound,
            events,
            options,
        }
    }

    /// Read and handle control messages until the channel closes.
    ///
    /// Messages that cannot be decoded are logged and skipped. Returns `Ok`
    /// on EOF and `FatalTransport` if reading fails.
    pub async fn run<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<(), DispatchError> {
        info!("Reading control messages");

        loop {
            let len = match reader.read_u32().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("Control channel closed");
                    return Ok(());
                }
                Err(e) => return Err(DispatchError::FatalTransport(e)),
            };

            if len > MAX_CONTROL_MESSAGE_SIZE {
                warn!(
                    size = len,
                    max = MAX_CONTROL_MESSAGE_SIZE,
                    "Skipping oversized control message"
                );
                let mut remainder = (&mut reader).take(len as u64);
                let skipped = tokio::io::copy(&mut remainder, &mut tokio::io::sink())
                    .await
                    .map_err(DispatchError::FatalTransport)?;
                if skipped < len as u64 {
                    info!("Control channel closed mid-message");
                    return Ok(());
                }
                continue;
            }

            let mut body = vec![0u8; len];
            match reader.read_exact(&mut body).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("Control channel closed mid-message");
                    return Ok(());
                }
                Err(e) => return Err(DispatchError::FatalTransport(e)),
            }

            self.handle(&body).await;
        }
    }

    /// Decode and apply one control message body.
    pub async fn handle(&self, body: &[u8]) {
        let message = match ControlMessage::decode(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, label = e.label(), "Skipping control message");
                return;
            }
        };

        debug!(
            operation = message.operation(),
            session_id = message.session_id().unwrap_or(""),
            "Received control message"
        );

        match message {
            ControlMessage::Connect(request) => {
                let session_id = request.session_id.clone();
                if let Err(e) = self.connect(request) {
                    warn!(session_id = %session_id, error = %e, "Rejected connect request");
                    self.emit(ControlEvent::ConnectFailed {
                        session_id,
                        error: e.label().to_string(),
                    });
                }
            }
            ControlMessage::Terminate(request) => self.terminate(&request.session_id),
            ControlMessage::Resize(request) => {
                if let Err(e) = self.resize(&request).await {
                    warn!(session_id = %request.session_id, error = %e, "Resize failed");
                }
            }
            ControlMessage::Ping => self.emit(ControlEvent::Pong {
                sessions: self.registry.count() as u64,
            }),
        }
    }

    /// Register a session and open it in the background.
    ///
    /// Returns once the session is registered; input for it is queued from
    /// that point on. Establishment failures are reported as
    /// `connect_failed` events.
    pub fn connect(&self, request: ConnectRequest) -> Result<Arc<ShellSession>, SessionError> {
        validate_connect(&request)?;

        let session = ShellSession::new(request.session_id.clone(), self.options.clone());
        self.registry.register(Arc::clone(&session))?;

        let target = ShellTarget {
            hostname: request.hostname,
            port: request.port,
            username: request.username,
        };

        tokio::spawn(run_session(
            Arc::clone(&self.registry),
            Arc::clone(&self.connector),
            self.outbound.clone(),
            self.events.clone(),
            Arc::clone(&session),
            target,
            self.options.clone(),
        ));

        Ok(session)
    }

    /// Remove and close a session. Unknown IDs are ignored.
    pub fn terminate(&self, session_id: &str) {
        if self.registry.remove(session_id) {
            info!(session_id = %session_id, "Terminated session");
        } else {
            debug!(session_id = %session_id, "Terminate for unknown session ignored");
        }
    }

    /// Resize a session's terminal. Unknown IDs are ignored.
    pub async fn resize(&self, request: &ResizeRequest) -> Result<(), SessionError> {
        let session = match self.registry.lookup(&request.session_id) {
            Ok(session) => session,
            Err(_) => {
                debug!(session_id = %request.session_id, "Resize for unknown session ignored");
                return Ok(());
            }
        };

        match session.resize(request.rows, request.cols).await? {
            ResizeOutcome::Deferred => {
                debug!(session_id = %request.session_id, "Resize deferred until pty exists")
            }
            ResizeOutcome::Forwarded => debug!(
                session_id = %request.session_id,
                rows = request.rows,
                cols = request.cols,
                "Resize forwarded"
            ),
        }
        Ok(())
    }

    fn emit(&self, event: ControlEvent) {
        emit(&self.events, event);
    }
}

fn emit(events: &EventSender, event: ControlEvent) {
    if events.send(event).is_err() {
        debug!("Control event writer gone, dropping event");
    }
}

fn validate_connect(request: &ConnectRequest) -> Result<(), SessionError> {
    if request.session_id.is_empty() {
        return Err(SessionError::InvalidRequest(
            "sessionID is required".to_string(),
        ));
    }
    if request.session_id.len() > MAX_SESSION_ID_LEN {
        return Err(SessionError::InvalidRequest(format!(
            "sessionID is {} bytes, at most {} allowed",
            request.session_id.len(),
            MAX_SESSION_ID_LEN
        )));
    }
    if request.hostname.is_empty() {
        return Err(SessionError::InvalidRequest(
            "hostname is required".to_string(),
        ));
    }
    if request.username.is_empty() {
        return Err(SessionError::InvalidRequest(
            "username is required".to_string(),
        ));
    }
    if request.port == 0 {
        return Err(SessionError::InvalidRequest("port is required".to_string()));
    }
    Ok(())
}

/// Dial, allocate the pty and start the shell for `session`.
async fn establish<C: ShellConnector>(
    session: &Arc<ShellSession>,
    connector: &C,
    target: &ShellTarget,
    options: &SessionOptions,
) -> Result<(SessionDriver<C::Shell>, SessionOutput), SessionError> {
    let mut shell = session.open(connector, target).await?;

    let size = options.default_size;
    if let Err(e) = session.request_pty(&mut shell, size.rows, size.cols).await {
        shell.close().await;
        return Err(e);
    }

    session.start_shell(shell).await
}

async fn run_session<C: ShellConnector>(
    registry: Arc<SessionRegistry>,
    connector: Arc<C>,
    outbound: OutboundMux,
    events: EventSender,
    session: Arc<ShellSession>,
    target: ShellTarget,
    options: SessionOptions,
) {
    let session_id = session.id().clone();

    let closing_event = match establish(&session, connector.as_ref(), &target, &options).await {
        Ok((driver, output)) => {
            let (stdout_task, stderr_task) = outbound.attach(&session_id, output);
            emit(
                &events,
                ControlEvent::SessionReady {
                    session_id: session_id.clone(),
                },
            );

            driver.run().await;

            // Let buffered output reach the channel before reporting closure
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            ControlEvent::SessionClosed {
                session_id: session_id.clone(),
            }
        }
        Err(SessionError::Closed(_)) => {
            info!(session_id = %session_id, "Session closed before the shell started");
            session.mark_closed();
            ControlEvent::SessionClosed {
                session_id: session_id.clone(),
            }
        }
        Err(source) => {
            let label = source.label();
            let e = DispatchError::Connection {
                session_id: session_id.clone(),
                source,
            };
            error!(error = %e, label, "Failed to open remote shell");
            session.mark_closed();
            ControlEvent::ConnectFailed {
                session_id: session_id.clone(),
                error: label.to_string(),
            }
        }
    };

    // Deregister first so the controller may reuse the ID once it sees the event
    registry.remove_session(&session);
    emit(&events, closing_event);
}

/// Write control events to the controller until the queue closes.
///
/// Returns `FatalTransport` if the control channel cannot be written.
pub async fn write_events<W: AsyncWrite + Unpin>(
    mut events: EventReceiver,
    mut writer: W,
) -> Result<(), DispatchError> {
    while let Some(event) = events.recv().await {
        let framed = match event.encode().and_then(|body| length_prefixed(&body)) {
            Ok(framed) => framed,
            Err(e) => {
                error!(operation = event.operation(), error = %e, "Failed to encode control event");
                continue;
            }
        };

        writer
            .write_all(&framed)
            .await
            .map_err(DispatchError::FatalTransport)?;
        writer.flush().await.map_err(DispatchError::FatalTransport)?;
        debug!(operation = event.operation(), "Sent control event");
    }
    Ok(())
}
