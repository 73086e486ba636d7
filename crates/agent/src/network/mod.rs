//! Network module for reaching remote shell servers.
//!
//! This module provides:
//! - The [`Dialer`] abstraction over the transport used to reach a host
//! - [`TcpDialer`], which dials plain TCP through the host's network stack
//! - The SSH backend in [`ssh`] that turns a dialed stream into a shell

pub mod ssh;

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

pub use ssh::{SshConnector, SshShell, TrustPolicy};

/// Opens byte streams to remote hosts.
///
/// Implementations may route through an overlay network; the SSH backend
/// only needs a bidirectional stream.
pub trait Dialer: Send + Sync + 'static {
    /// The stream type produced by this dialer.
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Dial `address` (`host:port`) over `network` (`tcp`, `tcp4`, `tcp6`).
    fn dial(
        &self,
        network: &str,
        address: &str,
    ) -> impl Future<Output = io::Result<Self::Conn>> + Send;
}

/// Dials TCP through the host's own network stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl TcpDialer {
    /// Creates a TCP dialer.
    pub fn new() -> Self {
        Self
    }
}

impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, network: &str, address: &str) -> io::Result<TcpStream> {
        let family = AddressFamily::parse(network)?;

        let mut last_error = None;
        for addr in lookup_host(address).await? {
            if !family.admits(&addr) {
                continue;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(address, peer = %addr, "Dialed remote host");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(address, peer = %addr, error = %e, "Dial attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address for {}", network, address),
            )
        }))
    }
}

/// Address families selectable through the `network` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressFamily {
    Any,
    V4,
    V6,
}

impl AddressFamily {
    fn parse(network: &str) -> io::Result<Self> {
        match network {
            "tcp" => Ok(AddressFamily::Any),
            "tcp4" => Ok(AddressFamily::V4),
            "tcp6" => Ok(AddressFamily::V6),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network: {}", other),
            )),
        }
    }

    fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let stream = TcpDialer::new().dial("tcp", &address).await.unwrap();

        assert!(stream.nodelay().unwrap());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_dialer_rejects_unknown_network() {
        let err = TcpDialer::new()
            .dial("udp", "127.0.0.1:22")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_tcp_dialer_honors_address_family() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let err = TcpDialer::new().dial("tcp6", &address).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);

        let stream = TcpDialer::new().dial("tcp4", &address).await.unwrap();
        assert!(stream.peer_addr().unwrap().is_ipv4());
        accept.await.unwrap().unwrap();
    }

    #[test]
    fn test_address_family_filter() {
        let v4: SocketAddr = "127.0.0.1:22".parse().unwrap();
        let v6: SocketAddr = "[::1]:22".parse().unwrap();

        assert!(AddressFamily::Any.admits(&v4) && AddressFamily::Any.admits(&v6));
        assert!(AddressFamily::V4.admits(&v4) && !AddressFamily::V4.admits(&v6));
        assert!(AddressFamily::V6.admits(&v6) && !AddressFamily::V6.admits(&v4));
    }
}
