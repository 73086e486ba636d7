//! Remote shell sessions.
//!
//! A [`ShellSession`] owns one interactive shell on a remote host. It walks
//! the lifecycle `Created -> PtyRequested -> Running -> Closing -> Closed`,
//! buffers keystrokes from the data channel in a bounded queue, and exposes
//! the shell's stdout and stderr as byte pipes once the shell is running.
//!
//! The transport underneath is abstracted by [`ShellConnector`] and
//! [`RemoteShell`] so the lifecycle can be driven by the SSH backend in
//! production and by in-memory shells in tests.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ShellConfig;

/// Unique identifier for a session, chosen by the controller.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session is registered under this ID.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// A session is already registered under this ID.
    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    /// The session was closed before the operation could complete.
    #[error("session closed: {0}")]
    Closed(SessionId),

    /// The connect request is missing or has invalid fields.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The transport to the remote host could not be established.
    #[error("dial failed: {0}")]
    Dial(String),

    /// The SSH handshake or authentication failed.
    #[error("SSH handshake failed: {0}")]
    Handshake(String),

    /// The server does not identify as a supported remote shell server.
    #[error("server is not a supported remote shell server: {0}")]
    NotRemoteShellServer(String),

    /// The server refused the pseudo-terminal request.
    #[error("pty request failed: {0}")]
    Pty(String),

    /// The server refused to start the shell.
    #[error("failed to start shell: {0}")]
    ShellStart(String),

    /// The window change request failed.
    #[error("failed to resize terminal: {0}")]
    Resize(String),

    /// The session is still being established and its input queue is full.
    #[error("input queue full while session {0} is starting")]
    InputBacklog(SessionId),

    /// Writing input to the remote shell failed.
    #[error("failed to write to remote shell: {0}")]
    WriteFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Stable label reported to the controller in `connect_failed` events.
    pub fn label(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "not_found",
            SessionError::AlreadyExists(_) => "already_exists",
            SessionError::Closed(_) => "session_closed",
            SessionError::InvalidRequest(_) => "invalid_request",
            SessionError::Dial(_) => "dial_failed",
            SessionError::Handshake(_) => "handshake_failed",
            SessionError::NotRemoteShellServer(_) => "not_remote_shell_server",
            SessionError::Pty(_) => "pty_failed",
            SessionError::ShellStart(_) => "shell_start_failed",
            SessionError::Resize(_) => "resize_failed",
            SessionError::InputBacklog(_) => "input_backlog",
            SessionError::WriteFailed(_) => "write_failed",
            SessionError::Io(_) => "io_error",
        }
    }
}

/// Lifecycle state of a session. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Registered, transport not yet established.
    Created,
    /// Pseudo-terminal granted by the server.
    PtyRequested,
    /// Shell started, I/O flowing.
    Running,
    /// Teardown in progress.
    Closing,
    /// Fully torn down.
    Closed,
}

impl SessionState {
    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::PtyRequested => "pty_requested",
            SessionState::Running => "running",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    /// Width in columns.
    pub cols: u16,
    /// Height in rows.
    pub rows: u16,
}

impl PtySize {
    /// Creates a size from columns and rows.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl fmt::Display for PtySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// What happened to a resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// No pty yet; the size will be used when the pty is requested.
    Deferred,
    /// Handed to the running session to apply as a window change.
    Forwarded,
}

/// Where to open a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellTarget {
    /// Host name or address.
    pub hostname: String,
    /// SSH port.
    pub port: u16,
    /// Remote user.
    pub username: String,
}

impl ShellTarget {
    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.hostname.contains(':') && !self.hostname.starts_with('[') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

/// Output produced by a running remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Bytes written to the shell's stdout.
    Stdout(Bytes),
    /// Bytes written to the shell's stderr.
    Stderr(Bytes),
    /// The remote command exited with this status.
    ExitStatus(u32),
    /// The remote side will send no more output.
    Eof,
}

/// An established remote shell channel.
///
/// `next_event` must be cancel-safe: the session driver polls it inside a
/// `select!` alongside input and resize commands.
pub trait RemoteShell: Send + 'static {
    /// Ask the server for a pseudo-terminal.
    fn request_pty(
        &mut self,
        term: &str,
        size: PtySize,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Start the user's login shell on the pty.
    fn start_shell(&mut self) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Apply a new window size.
    fn window_change(&mut self, size: PtySize)
        -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Write bytes to the shell's stdin.
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Wait for the next output event. `None` means the channel is gone.
    fn next_event(&mut self) -> impl Future<Output = Option<ShellEvent>> + Send;

    /// Close the channel and the underlying connection.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens remote shells.
pub trait ShellConnector: Send + Sync + 'static {
    /// The shell type this connector produces.
    type Shell: RemoteShell;

    /// Dial, handshake and authenticate, returning a shell that still needs
    /// a pty and a shell request.
    fn connect(
        &self,
        target: &ShellTarget,
    ) -> impl Future<Output = Result<Self::Shell, SessionError>> + Send;
}

/// Per-session settings derived from [`ShellConfig`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Terminal type for the pty request.
    pub term: String,
    /// Size used when no resize arrived before the pty request.
    pub default_size: PtySize,
    /// Capacity of the per-session input queue.
    pub input_queue_capacity: usize,
    /// Capacity of each output pipe.
    pub output_pipe_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions::from(&ShellConfig::default())
    }
}

impl From<&ShellConfig> for SessionOptions {
    fn from(config: &ShellConfig) -> Self {
        Self {
            term: config.term.clone(),
            default_size: PtySize::new(config.default_cols, config.default_rows),
            input_queue_capacity: config.input_queue_capacity,
            output_pipe_capacity: config.read_buffer_size * 4,
        }
    }
}

/// Readable ends of a running session's stdout and stderr.
///
/// Both reach EOF once the session has ended and all buffered output has
/// been read.
#[derive(Debug)]
pub struct SessionOutput {
    /// Shell stdout.
    pub stdout: DuplexStream,
    /// Shell stderr.
    pub stderr: DuplexStream,
}

#[derive(Debug)]
enum PtyState {
    /// Not requested yet, possibly with a size from an early resize.
    Pending(Option<PtySize>),
    /// Requested with (or since resized to) this size.
    Allocated(PtySize),
}

/// One interactive shell on a remote host.
///
/// Sessions are shared as `Arc<ShellSession>` between the registry, the
/// control router and the inbound data path. The remote channel itself is
/// owned by the [`SessionDriver`] returned from [`ShellSession::start_shell`].
pub struct ShellSession {
    id: SessionId,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    input_tx: mpsc::Sender<Bytes>,
    input_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    resize_tx: mpsc::UnboundedSender<PtySize>,
    resize_rx: Mutex<Option<mpsc::UnboundedReceiver<PtySize>>>,
    pty: Mutex<PtyState>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl ShellSession {
    /// Creates a session in the `Created` state.
    ///
    /// Input written before the shell starts is queued and delivered once it
    /// is running.
    pub fn new(id: impl Into<SessionId>, options: SessionOptions) -> Arc<Self> {
        let (input_tx, input_rx) = mpsc::channel(options.input_queue_capacity.max(1));
        let (resize_tx, resize_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Created);

        Arc::new(Self {
            id: id.into(),
            options,
            state,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            resize_tx,
            resize_rx: Mutex::new(Some(resize_rx)),
            pty: Mutex::new(PtyState::Pending(None)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether `close` has been called or the session ended on its own.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Current pty size, if a pty has been requested.
    pub async fn pty_size(&self) -> Option<PtySize> {
        match *self.pty.lock().await {
            PtyState::Allocated(size) => Some(size),
            PtyState::Pending(_) => None,
        }
    }

    /// Moves the state forward. Backward transitions are ignored.
    fn advance(&self, next: SessionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            if next > *state {
                previous = *state;
                *state = next;
                true
            } else {
                false
            }
        });

        if changed {
            debug!(session_id = %self.id, from = %previous, to = %next, "Session state changed");
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// Runs `operation` unless the session is closed first.
    async fn unless_closed<T>(
        &self,
        operation: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SessionError::Closed(self.id.clone())),
            result = operation => result,
        }
    }

    /// Establish the transport to `target`.
    ///
    /// Returns `Closed` if the session is closed while dialing.
    pub async fn open<C: ShellConnector>(
        &self,
        connector: &C,
        target: &ShellTarget,
    ) -> Result<C::Shell, SessionError> {
        self.ensure_open()?;
        info!(
            session_id = %self.id,
            host = %target.hostname,
            port = target.port,
            user = %target.username,
            "Opening remote shell"
        );
        self.unless_closed(connector.connect(target)).await
    }

    /// Request the pseudo-terminal.
    ///
    /// A size recorded by an earlier [`resize`](Self::resize) takes
    /// precedence over `rows` and `cols`. Returns the size requested.
    pub async fn request_pty<S: RemoteShell>(
        &self,
        shell: &mut S,
        rows: u16,
        cols: u16,
    ) -> Result<PtySize, SessionError> {
        self.ensure_open()?;

        // Claim the pty slot before awaiting so a concurrent resize is
        // routed to the driver instead of being recorded as pending.
        let size = {
            let mut pty = self.pty.lock().await;
            let size = match *pty {
                PtyState::Pending(Some(pending)) => pending,
                PtyState::Pending(None) => PtySize::new(cols, rows),
                PtyState::Allocated(current) => current,
            };
            *pty = PtyState::Allocated(size);
            size
        };

        debug!(session_id = %self.id, term = %self.options.term, size = %size, "Requesting pty");
        self.unless_closed(shell.request_pty(&self.options.term, size))
            .await?;
        self.advance(SessionState::PtyRequested);
        Ok(size)
    }

    /// Start the remote shell and hand back its driver and output pipes.
    ///
    /// The shell is closed before returning an error.
    pub async fn start_shell<S: RemoteShell>(
        self: &Arc<Self>,
        mut shell: S,
    ) -> Result<(SessionDriver<S>, SessionOutput), SessionError> {
        let started = match self.ensure_open() {
            Ok(()) => self.unless_closed(shell.start_shell()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            shell.close().await;
            return Err(e);
        }

        let input_rx = self.input_rx.lock().await.take();
        let resize_rx = self.resize_rx.lock().await.take();
        let (Some(input_rx), Some(resize_rx)) = (input_rx, resize_rx) else {
            shell.close().await;
            return Err(SessionError::ShellStart(format!(
                "session {} was already started",
                self.id
            )));
        };

        let (stdout_writer, stdout_reader) = duplex(self.options.output_pipe_capacity);
        let (stderr_writer, stderr_reader) = duplex(self.options.output_pipe_capacity);

        self.advance(SessionState::Running);
        info!(session_id = %self.id, "Remote shell started");

        let driver = SessionDriver {
            session: Arc::clone(self),
            shell,
            input_rx,
            resize_rx,
            stdout: stdout_writer,
            stderr: stderr_writer,
        };
        let output = SessionOutput {
            stdout: stdout_reader,
            stderr: stderr_reader,
        };
        Ok((driver, output))
    }

    /// Queue input for the remote shell.
    ///
    /// Input arriving before the shell runs is held until it does, up to the
    /// queue capacity; beyond that it is refused with `InputBacklog` rather
    /// than waiting on a connection that may never complete. Once running,
    /// waits while the queue is full.
    pub async fn write_input(&self, data: Bytes) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.state() < SessionState::Running {
            return self.input_tx.try_send(data).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SessionError::InputBacklog(self.id.clone()),
                mpsc::error::TrySendError::Closed(_) => SessionError::Closed(self.id.clone()),
            });
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(SessionError::Closed(self.id.clone())),
            sent = self.input_tx.send(data) => {
                sent.map_err(|_| SessionError::Closed(self.id.clone()))
            }
        }
    }

    /// Change the terminal size.
    ///
    /// Before the pty exists the size is recorded and used by
    /// [`request_pty`](Self::request_pty).
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<ResizeOutcome, SessionError> {
        self.ensure_open()?;
        if rows == 0 || cols == 0 {
            return Err(SessionError::Resize(format!(
                "invalid terminal size {}x{}",
                cols, rows
            )));
        }

        let size = PtySize::new(cols, rows);
        let mut pty = self.pty.lock().await;
        match &mut *pty {
            PtyState::Pending(pending) => {
                *pending = Some(size);
                debug!(session_id = %self.id, size = %size, "Deferred resize until pty is requested");
                Ok(ResizeOutcome::Deferred)
            }
            PtyState::Allocated(current) => {
                *current = size;
                self.resize_tx
                    .send(size)
                    .map_err(|_| SessionError::Closed(self.id.clone()))?;
                Ok(ResizeOutcome::Forwarded)
            }
        }
    }

    /// Begin teardown. Idempotent and non-blocking.
    ///
    /// A running driver notices, closes the remote channel and finishes the
    /// transition to `Closed`. A session that never started stays in
    /// `Closing` until [`mark_closed`](Self::mark_closed).
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            info!(session_id = %self.id, state = %self.state(), "Closing session");
            self.shutdown.cancel();
        }
        self.advance(SessionState::Closing);
    }

    /// Record that nothing is left running for this session.
    pub fn mark_closed(&self) {
        self.shutdown.cancel();
        self.advance(SessionState::Closed);
    }
}

enum Step {
    Shutdown,
    Resize(PtySize),
    Input(Bytes),
    Event(Option<ShellEvent>),
}

/// Pumps a running session: input to the shell, shell output to the pipes.
pub struct SessionDriver<S: RemoteShell> {
    session: Arc<ShellSession>,
    shell: S,
    input_rx: mpsc::Receiver<Bytes>,
    resize_rx: mpsc::UnboundedReceiver<PtySize>,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

impl<S: RemoteShell> SessionDriver<S> {
    /// The session this driver runs.
    pub fn session(&self) -> &Arc<ShellSession> {
        &self.session
    }

    /// Run until the session is closed or the remote side goes away, then
    /// tear down the channel. Returns the remote exit status if one was
    /// reported.
    pub async fn run(self) -> Option<u32> {
        let SessionDriver {
            session,
            mut shell,
            mut input_rx,
            mut resize_rx,
            mut stdout,
            mut stderr,
        } = self;
        let id = session.id.clone();
        let mut exit_status = None;

        let reason = loop {
            let step = tokio::select! {
                biased;
                _ = session.shutdown.cancelled() => Step::Shutdown,
                Some(size) = resize_rx.recv() => Step::Resize(size),
                Some(data) = input_rx.recv() => Step::Input(data),
                event = shell.next_event() => Step::Event(event),
            };

            match step {
                Step::Shutdown => break "closed locally",
                Step::Resize(size) => {
                    if let Err(e) = shell.window_change(size).await {
                        warn!(session_id = %id, size = %size, error = %e, "Failed to resize remote terminal");
                    } else {
                        debug!(session_id = %id, size = %size, "Resized remote terminal");
                    }
                }
                Step::Input(data) => {
                    trace!(session_id = %id, bytes = data.len(), "Writing input to remote shell");
                    if let Err(e) = shell.send(&data).await {
                        warn!(session_id = %id, error = %e, "Failed to write to remote shell");
                        break "input failed";
                    }
                }
                Step::Event(Some(ShellEvent::Stdout(data))) => {
                    if !pipe_output(&session.shutdown, &mut stdout, &data).await {
                        break "stdout consumer gone";
                    }
                }
                Step::Event(Some(ShellEvent::Stderr(data))) => {
                    if !pipe_output(&session.shutdown, &mut stderr, &data).await {
                        break "stderr consumer gone";
                    }
                }
                Step::Event(Some(ShellEvent::ExitStatus(status))) => {
                    info!(session_id = %id, exit_status = status, "Remote shell exited");
                    exit_status = Some(status);
                }
                Step::Event(Some(ShellEvent::Eof)) | Step::Event(None) => {
                    break "remote closed";
                }
            }
        };

        session.close();
        // Dropping the writers lets readers drain buffered output then see EOF.
        drop(stdout);
        drop(stderr);
        shell.close().await;
        session.mark_closed();
        info!(session_id = %id, reason, "Session ended");

        exit_status
    }
}

/// Writes to an output pipe, giving up if the session closes meanwhile.
async fn pipe_output(shutdown: &CancellationToken, pipe: &mut DuplexStream, data: &[u8]) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        written = pipe.write_all(data) => written.is_ok(),
    }
}
