//! SSH backend for remote shells.
//!
//! The connector dials the target through a [`Dialer`], checks the server's
//! identification line against the configured banner markers, completes the
//! SSH handshake with `none` authentication (the overlay network has already
//! authenticated the peer) and opens a session channel.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::{debug, info, trace, warn};

use super::{Dialer, TcpDialer};
use crate::config::TrustConfig;
use crate::session::{PtySize, RemoteShell, SessionError, ShellConnector, ShellEvent, ShellTarget};

/// Longest preamble accepted before the SSH identification line.
const MAX_BANNER_BYTES: usize = 8 * 1024;

/// Extended data type code for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Terminal modes sent with the pty request.
const TERMINAL_MODES: &[(Pty, u32)] = &[
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Which servers and host keys the connector accepts.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    /// Accept any host key.
    pub trust_overlay: bool,
    /// Require a banner marker in the server identification.
    pub verify_server_banner: bool,
    /// Accepted identification substrings.
    pub banner_markers: Vec<String>,
    /// Pinned SHA-256 host key fingerprints.
    pub host_key_fingerprints: Vec<String>,
}

impl From<&TrustConfig> for TrustPolicy {
    fn from(config: &TrustConfig) -> Self {
        Self {
            trust_overlay: config.trust_overlay,
            verify_server_banner: config.verify_server_banner,
            banner_markers: config.server_banner_markers.clone(),
            host_key_fingerprints: config.host_key_fingerprints.clone(),
        }
    }
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy::from(&TrustConfig::default())
    }
}

fn normalize_fingerprint(fingerprint: &str) -> &str {
    let fingerprint = fingerprint.trim();
    fingerprint.strip_prefix("SHA256:").unwrap_or(fingerprint)
}

impl TrustPolicy {
    /// Check the server identification line.
    pub fn check_banner(&self, banner: &str) -> Result<(), SessionError> {
        if !self.verify_server_banner {
            return Ok(());
        }
        if self
            .banner_markers
            .iter()
            .any(|marker| banner.contains(marker.as_str()))
        {
            Ok(())
        } else {
            Err(SessionError::NotRemoteShellServer(banner.to_string()))
        }
    }

    /// Whether a host key with this fingerprint is acceptable.
    pub fn accepts_fingerprint(&self, fingerprint: &str) -> bool {
        if self.trust_overlay {
            return true;
        }
        let fingerprint = normalize_fingerprint(fingerprint);
        self.host_key_fingerprints
            .iter()
            .any(|pinned| normalize_fingerprint(pinned) == fingerprint)
    }
}

/// Client-side SSH event handler.
pub struct ClientHandler {
    policy: Arc<TrustPolicy>,
    address: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        let accepted = self.policy.accepts_fingerprint(&fingerprint);

        if !accepted {
            warn!(address = %self.address, fingerprint = %fingerprint, "Rejected unpinned host key");
        } else if self.policy.trust_overlay {
            debug!(address = %self.address, fingerprint = %fingerprint, "Accepted host key from overlay peer");
        } else {
            debug!(address = %self.address, fingerprint = %fingerprint, "Accepted pinned host key");
        }
        Ok(accepted)
    }
}

/// Opens SSH shells over streams from a [`Dialer`].
pub struct SshConnector<D: Dialer = TcpDialer> {
    dialer: D,
    policy: Arc<TrustPolicy>,
    config: Arc<client::Config>,
}

impl<D: Dialer> SshConnector<D> {
    /// Creates a connector.
    pub fn new(dialer: D, policy: TrustPolicy) -> Self {
        Self {
            dialer,
            policy: Arc::new(policy),
            config: Arc::new(client::Config::default()),
        }
    }

    /// The trust policy in force.
    pub fn policy(&self) -> &TrustPolicy {
        &self.policy
    }
}

impl<D: Dialer> ShellConnector for SshConnector<D> {
    type Shell = SshShell;

    async fn connect(&self, target: &ShellTarget) -> Result<SshShell, SessionError> {
        let address = target.address();

        let mut stream = self
            .dialer
            .dial("tcp", &address)
            .await
            .map_err(|e| SessionError::Dial(format!("{}: {}", address, e)))?;

        let (banner, consumed) = read_server_banner(&mut stream).await?;
        debug!(address = %address, banner = %banner, "Received server identification");
        self.policy.check_banner(&banner)?;

        let handler = ClientHandler {
            policy: Arc::clone(&self.policy),
            address: address.clone(),
        };
        let stream = Rewind::new(Bytes::from(consumed), stream);
        let mut handle = client::connect_stream(Arc::clone(&self.config), stream, handler)
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;

        let authenticated = handle
            .authenticate_none(target.username.clone())
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        if !authenticated {
            return Err(SessionError::Handshake(format!(
                "server refused authentication for {}",
                target.username
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Handshake(format!("failed to open channel: {}", e)))?;

        info!(address = %address, user = %target.username, "SSH connection established");
        Ok(SshShell {
            handle,
            channel,
            pending: VecDeque::new(),
        })
    }
}

/// A session channel on an authenticated SSH connection.
pub struct SshShell {
    handle: Handle<ClientHandler>,
    channel: Channel<Msg>,
    pending: VecDeque<ShellEvent>,
}

impl SshShell {
    /// Wait for the reply to a `want_reply` request, keeping any output that
    /// arrives first.
    async fn await_reply(&mut self, request: &str) -> Result<(), String> {
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(format!("server refused {} request", request))
                }
                Some(ChannelMsg::Close) | None => {
                    return Err(format!("channel closed during {} request", request))
                }
                Some(msg) => {
                    if let Some(event) = translate(msg) {
                        self.pending.push_back(event);
                    }
                }
            }
        }
    }
}

/// Map a channel message to a shell event. Messages with no counterpart
/// yield `None`.
fn translate(msg: ChannelMsg) -> Option<ShellEvent> {
    match msg {
        ChannelMsg::Data { data } => Some(ShellEvent::Stdout(Bytes::copy_from_slice(&data))),
        ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
            Some(ShellEvent::Stderr(Bytes::copy_from_slice(&data)))
        }
        ChannelMsg::ExitStatus { exit_status } => Some(ShellEvent::ExitStatus(exit_status)),
        // Exit status may still follow EOF, so only Close ends the stream.
        ChannelMsg::Close => Some(ShellEvent::Eof),
        _ => None,
    }
}

impl RemoteShell for SshShell {
    async fn request_pty(&mut self, term: &str, size: PtySize) -> Result<(), SessionError> {
        self.channel
            .request_pty(
                true,
                term,
                u32::from(size.cols),
                u32::from(size.rows),
                0,
                0,
                TERMINAL_MODES,
            )
            .await
            .map_err(|e| SessionError::Pty(e.to_string()))?;
        self.await_reply("pty").await.map_err(SessionError::Pty)
    }

    async fn start_shell(&mut self) -> Result<(), SessionError> {
        self.channel
            .request_shell(true)
            .await
            .map_err(|e| SessionError::ShellStart(e.to_string()))?;
        self.await_reply("shell")
            .await
            .map_err(SessionError::ShellStart)
    }

    async fn window_change(&mut self, size: PtySize) -> Result<(), SessionError> {
        self.channel
            .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
            .await
            .map_err(|e| SessionError::Resize(e.to_string()))
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<ShellEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        loop {
            let msg = self.channel.wait().await?;
            if let Some(event) = translate(msg) {
                return Some(event);
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.channel.eof().await {
            trace!(error = %e, "Channel already closed");
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

/// Find the SSH identification line in what has been read so far.
fn find_identification(data: &[u8]) -> Option<String> {
    let mut start = 0;
    while let Some(offset) = data[start..].iter().position(|&b| b == b'\n') {
        let line = &data[start..start + offset];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.starts_with(b"SSH-") {
            return Some(String::from_utf8_lossy(line).into_owned());
        }
        start += offset + 1;
    }
    None
}

/// Read up to and including the server identification line.
///
/// Returns the line and every byte consumed, which must be replayed to the
/// SSH client.
async fn read_server_banner<S>(stream: &mut S) -> Result<(String, Vec<u8>), SessionError>
where
    S: AsyncRead + Unpin,
{
    let mut consumed = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];

    loop {
        if let Some(banner) = find_identification(&consumed) {
            return Ok((banner, consumed));
        }
        if consumed.len() >= MAX_BANNER_BYTES {
            return Err(SessionError::NotRemoteShellServer(
                "no SSH identification received".to_string(),
            ));
        }

        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        if n == 0 {
            return Err(SessionError::Handshake(
                "connection closed before server identification".to_string(),
            ));
        }
        consumed.extend_from_slice(&chunk[..n]);
    }
}

/// A stream that yields `prefix` before reading from `inner`.
struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() && buf.remaining() > 0 {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
