//! Data channel multiplexing.
//!
//! [`InboundDemux`] decodes frames from the inbound data channel and hands
//! stdin payloads to the addressed session. [`OutboundMux`] serializes
//! stdout and stderr from every session onto the single outbound data
//! channel, one whole frame at a time.

use std::io;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use protocol::{ChannelKind, Frame, FrameCodec, FrameDecoder, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::manager::SessionRegistry;
use super::shell::{SessionError, SessionId, SessionOutput};

/// Read size for the inbound data channel.
pub const INBOUND_READ_SIZE: usize = 8 * 1024;

/// Errors raised while moving data between the channels and sessions.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A frame addressed a session that is not registered.
    #[error("no session registered for {session_id}")]
    Routing { session_id: SessionId },

    /// A session could not be established.
    #[error("failed to connect session {session_id}: {source}")]
    Connection {
        session_id: SessionId,
        source: SessionError,
    },

    /// Reading from or writing to one session failed.
    #[error("I/O error on session {session_id}: {source}")]
    SessionIo {
        session_id: SessionId,
        source: SessionError,
    },

    /// A data or control channel failed. The agent cannot continue.
    #[error("transport failure: {0}")]
    FatalTransport(#[source] io::Error),
}

impl DispatchError {
    /// Whether the error ends the agent rather than one frame or session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::FatalTransport(_))
    }
}

/// Routes inbound frames to sessions.
pub struct InboundDemux {
    registry: Arc<SessionRegistry>,
    decoder: FrameDecoder,
}

impl InboundDemux {
    /// Creates a demultiplexer over `registry`.
    pub fn new(registry: Arc<SessionRegistry>, codec: FrameCodec) -> Self {
        Self {
            registry,
            decoder: FrameDecoder::new(codec),
        }
    }

    /// Read frames until the channel closes.
    ///
    /// Malformed frames and frames for unknown sessions are logged and
    /// dropped. Returns `Ok` on a clean EOF and `FatalTransport` if the
    /// channel fails.
    pub async fn run<R: AsyncRead + Unpin>(mut self, mut reader: R) -> Result<(), DispatchError> {
        let mut buffer = vec![0u8; INBOUND_READ_SIZE];
        info!("Reading session input from data channel");

        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(DispatchError::FatalTransport)?;
            if n == 0 {
                if self.decoder.buffered() > 0 {
                    warn!(
                        bytes = self.decoder.buffered(),
                        "Data channel closed mid-frame, discarding partial frame"
                    );
                }
                info!("Data channel closed");
                return Ok(());
            }

            self.decoder.extend(&buffer[..n]);
            self.drain().await;
        }
    }

    async fn drain(&mut self) {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) = self.route(frame).await {
                        warn!(error = %e, "Dropped inbound frame");
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, label = e.label(), "Malformed frame on data channel");
                }
            }
        }
    }

    /// Deliver one stdin frame to its session.
    ///
    /// Waits while the session's input queue is full. Returns the number of
    /// payload bytes delivered.
    pub async fn route(&self, frame: Frame) -> Result<usize, DispatchError> {
        if frame.channel != ChannelKind::Stdin {
            return Err(DispatchError::Protocol(ProtocolError::MalformedFrame(
                format!("unexpected {} frame on inbound channel", frame.channel),
            )));
        }

        let Frame {
            session_id,
            payload,
            ..
        } = frame;

        let session = match self.registry.lookup(&session_id) {
            Ok(session) => session,
            Err(_) => return Err(DispatchError::Routing { session_id }),
        };

        let len = payload.len();
        if let Err(source) = session.write_input(Bytes::from(payload)).await {
            return Err(DispatchError::SessionIo { session_id, source });
        }

        trace!(session_id = %session_id, bytes = len, "Routed input to session");
        Ok(len)
    }
}

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Serializes session output onto the outbound data channel.
///
/// Cheap to clone; every clone writes through the same channel. A write
/// failure is fatal: the mux stops accepting frames and [`failed`]
/// resolves.
///
/// [`failed`]: OutboundMux::failed
#[derive(Clone)]
pub struct OutboundMux {
    writer: SharedWriter,
    codec: FrameCodec,
    read_buffer_size: usize,
    failed: CancellationToken,
    failure: Arc<OnceLock<(io::ErrorKind, String)>>,
}

impl OutboundMux {
    /// Creates a mux writing to `writer`. Session output is read in chunks
    /// of `read_buffer_size` bytes, one frame per chunk.
    pub fn new<W>(writer: W, codec: FrameCodec, read_buffer_size: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            codec,
            read_buffer_size: read_buffer_size.max(1),
            failed: CancellationToken::new(),
            failure: Arc::new(OnceLock::new()),
        }
    }

    /// Whether a write to the outbound channel has failed.
    pub fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// Resolves with the transport error once the outbound channel fails.
    pub async fn failed(&self) -> DispatchError {
        self.failed.cancelled().await;
        self.failure_error()
    }

    fn failure_error(&self) -> DispatchError {
        let (kind, message) = self
            .failure
            .get()
            .cloned()
            .unwrap_or((io::ErrorKind::BrokenPipe, "outbound channel failed".to_string()));
        DispatchError::FatalTransport(io::Error::new(kind, message))
    }

    fn fail(&self, e: &io::Error) {
        let _ = self.failure.set((e.kind(), e.to_string()));
        self.failed.cancel();
    }

    /// Write one frame. Frames never interleave on the channel.
    pub async fn send(&self, frame: &Frame) -> Result<(), DispatchError> {
        if self.is_failed() {
            return Err(self.failure_error());
        }

        let bytes = self.codec.encode(frame)?;

        let mut writer = self.writer.lock().await;
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        drop(writer);

        if let Err(e) = written {
            error!(session_id = %frame.session_id, error = %e, "Outbound data channel write failed");
            self.fail(&e);
            return Err(DispatchError::FatalTransport(e));
        }

        trace!(
            session_id = %frame.session_id,
            channel = %frame.channel,
            bytes = frame.payload.len(),
            "Wrote frame"
        );
        Ok(())
    }

    /// Forward a session's stdout and stderr until both reach EOF.
    ///
    /// Returns the two forwarding tasks.
    pub fn attach(
        &self,
        session_id: &SessionId,
        output: SessionOutput,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        debug!(session_id = %session_id, "Attaching session output");
        let stdout = tokio::spawn(self.clone().forward(
            session_id.clone(),
            ChannelKind::Stdout,
            output.stdout,
        ));
        let stderr = tokio::spawn(self.clone().forward(
            session_id.clone(),
            ChannelKind::Stderr,
            output.stderr,
        ));
        (stdout, stderr)
    }

    async fn forward<R>(self, session_id: SessionId, channel: ChannelKind, mut reader: R)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buffer = vec![0u8; self.read_buffer_size];

        loop {
            let read = tokio::select! {
                biased;
                _ = self.failed.cancelled() => break,
                read = reader.read(&mut buffer) => read,
            };

            match read {
                Ok(0) => {
                    debug!(session_id = %session_id, channel = %channel, "Session stream finished");
                    break;
                }
                Ok(n) => {
                    let frame = Frame::new(channel, session_id.clone(), buffer[..n].to_vec());
                    if let Err(e) = self.send(&frame).await {
                        if !e.is_fatal() {
                            warn!(session_id = %session_id, error = %e, "Failed to frame session output");
                        }
                        break;
                    }
                }
                Err(e) => {
                    let e = DispatchError::SessionIo {
                        session_id: session_id.clone(),
                        source: SessionError::Io(e),
                    };
                    warn!(error = %e, "Failed to read session output");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::shell::{SessionOptions, ShellSession};
    use std::collections::HashMap;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::duplex;

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn registry_with(ids: &[&str]) -> (Arc<SessionRegistry>, Vec<Arc<ShellSession>>) {
        let registry = Arc::new(SessionRegistry::new());
        let sessions = ids
            .iter()
            .map(|id| {
                let session = ShellSession::new(*id, SessionOptions::default());
                registry.register(session.clone()).unwrap();
                session
            })
            .collect();
        (registry, sessions)
    }

    #[test]
    fn test_only_transport_errors_are_fatal() {
        let fatal = DispatchError::FatalTransport(io::Error::other("gone"));
        assert!(fatal.is_fatal());
        let routing = DispatchError::Routing {
            session_id: "s1".to_string(),
        };
        assert!(!routing.is_fatal());
    }

    #[tokio::test]
    async fn test_route_delivers_stdin() {
        let (registry, _sessions) = registry_with(&["s1"]);
        let demux = InboundDemux::new(registry, FrameCodec::new());

        let delivered = demux
            .route(Frame::new(ChannelKind::Stdin, "s1", b"ls\n".to_vec()))
            .await
            .unwrap();
        assert_eq!(delivered, 3);
    }

    #[tokio::test]
    async fn test_route_unknown_session() {
        let (registry, _sessions) = registry_with(&[]);
        let demux = InboundDemux::new(registry, FrameCodec::new());

        let result = demux
            .route(Frame::new(ChannelKind::Stdin, "ghost", b"x".to_vec()))
            .await;
        assert!(matches!(result, Err(DispatchError::Routing { session_id }) if session_id == "ghost"));
    }

    #[tokio::test]
    async fn test_route_rejects_output_channels() {
        let (registry, _sessions) = registry_with(&["s1"]);
        let demux = InboundDemux::new(registry, FrameCodec::new());

        let result = demux
            .route(Frame::new(ChannelKind::Stdout, "s1", b"x".to_vec()))
            .await;
        assert!(matches!(result, Err(DispatchError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_route_to_starting_session_with_full_queue_does_not_wait() {
        let registry = Arc::new(SessionRegistry::new());
        let options = SessionOptions {
            input_queue_capacity: 1,
            ..SessionOptions::default()
        };
        let starting = ShellSession::new("starting", options);
        registry.register(starting.clone()).unwrap();
        registry
            .register(ShellSession::new("other", SessionOptions::default()))
            .unwrap();
        let demux = InboundDemux::new(registry, FrameCodec::new());

        demux
            .route(Frame::new(ChannelKind::Stdin, "starting", b"a".to_vec()))
            .await
            .unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            demux.route(Frame::new(ChannelKind::Stdin, "starting", b"b".to_vec())),
        )
        .await
        .expect("routing must not wait on a session that is still starting");
        assert!(matches!(
            result,
            Err(DispatchError::SessionIo {
                source: SessionError::InputBacklog(_),
                ..
            })
        ));

        let delivered = demux
            .route(Frame::new(ChannelKind::Stdin, "other", b"pwd\n".to_vec()))
            .await
            .unwrap();
        assert_eq!(delivered, 4);
    }

    #[tokio::test]
    async fn test_route_to_closed_session() {
        let (registry, sessions) = registry_with(&["s1"]);
        sessions[0].close();
        let demux = InboundDemux::new(registry, FrameCodec::new());

        let result = demux
            .route(Frame::new(ChannelKind::Stdin, "s1", b"x".to_vec()))
            .await;
        assert!(matches!(result, Err(DispatchError::SessionIo { .. })));
    }

    #[tokio::test]
    async fn test_run_survives_garbage_and_stops_on_eof() {
        let (registry, _sessions) = registry_with(&["s1"]);
        let codec = FrameCodec::new();
        let demux = InboundDemux::new(registry, codec.clone());

        let mut stream = b"garbage!".to_vec();
        stream.extend(
            codec
                .encode(&Frame::new(ChannelKind::Stdin, "s1", b"ok".to_vec()))
                .unwrap(),
        );
        stream.extend(
            codec
                .encode(&Frame::new(ChannelKind::Stdin, "nobody", b"lost".to_vec()))
                .unwrap(),
        );

        let result = demux.run(std::io::Cursor::new(stream)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_writes_whole_frame() {
        let (mut reader, writer) = duplex(4096);
        let codec = FrameCodec::new();
        let mux = OutboundMux::new(writer, codec.clone(), 1024);

        let frame = Frame::new(ChannelKind::Stdout, "s1", b"hello".to_vec());
        mux.send(&frame).await.unwrap();

        let mut buf = vec![0u8; frame.encoded_len()];
        reader.read_exact(&mut buf).await.unwrap();
        let (decoded, consumed) = codec.decode(&buf).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, buf.len());
    }

    #[tokio::test]
    async fn test_write_failure_is_fatal() {
        let mux = OutboundMux::new(BrokenWriter, FrameCodec::new(), 1024);
        let frame = Frame::new(ChannelKind::Stdout, "s1", b"hello".to_vec());

        let result = mux.send(&frame).await;
        assert!(matches!(result, Err(DispatchError::FatalTransport(_))));
        assert!(mux.is_failed());

        let failure = tokio::time::timeout(Duration::from_secs(1), mux.failed())
            .await
            .unwrap();
        match failure {
            DispatchError::FatalTransport(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {other:?}"),
        }

        // Later sends fail fast
        assert!(mux.send(&frame).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_sessions_never_interleave() {
        let (mut reader, writer) = duplex(512);
        let codec = FrameCodec::new();
        let mux = OutboundMux::new(writer, codec.clone(), 64);

        let mut expected = HashMap::new();
        let mut producers = Vec::new();
        let mut forwarders = Vec::new();

        for id in ["a", "b", "c"] {
            let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
            expected.insert(id.to_string(), payload.clone());

            let (stdout_writer, stdout_reader) = duplex(256);
            let (stderr_writer, stderr_reader) = duplex(256);
            drop(stderr_writer);
            let output = SessionOutput {
                stdout: stdout_reader,
                stderr: stderr_reader,
            };
            let (stdout_task, stderr_task) = mux.attach(&id.to_string(), output);
            forwarders.push(stdout_task);
            forwarders.push(stderr_task);

            producers.push(tokio::spawn(async move {
                let mut stdout_writer = stdout_writer;
                for chunk in payload.chunks(100) {
                    stdout_writer.write_all(chunk).await.unwrap();
                }
            }));
        }

        let collector = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new(codec);
            let mut received: HashMap<String, Vec<u8>> = HashMap::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = reader.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    assert_eq!(frame.channel, ChannelKind::Stdout);
                    received
                        .entry(frame.session_id)
                        .or_default()
                        .extend(frame.payload);
                }
            }
            received
        });

        for producer in producers {
            producer.await.unwrap();
        }
        for forwarder in forwarders {
            forwarder.await.unwrap();
        }
        drop(mux);

        let received = collector.await.unwrap();
        assert_eq!(received, expected);
    }
}
