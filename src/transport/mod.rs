//! Tunnel transports.
//!
//! A link rides on any bidirectional byte channel: a plain TCP connection or
//! one bidirectional stream of a QUIC connection. The channel is reduced to
//! its split read/write halves so the link's read loop can own the reader
//! while writers share the locked writer.

mod quic;
mod tcp;

pub use quic::{QuicDialer, QuicTunnelListener};
pub use tcp::{TcpDialer, TcpTunnelListener};
pub(crate) use tcp::tune_stream;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// ALPN identifier for the QUIC tunnel transport.
pub const ALPN: &[u8] = b"moto-accel";

/// Owned read half of a tunnel connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Owned write half of a tunnel connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A dialed or accepted tunnel connection, reduced to its byte-channel
/// capability.
pub struct LinkIo {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Human-readable peer label for logs.
    pub peer: String,
}

impl std::fmt::Debug for LinkIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkIo").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Client-side dialer for tunnel links.
#[async_trait]
pub trait TunnelDialer: Send + Sync {
    /// Establish one link to `remote` (`host:port`).
    async fn dial(&self, remote: &str) -> Result<LinkIo>;
}

/// Tunnel transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain TCP with TCP_NODELAY and 30 s keepalive.
    #[default]
    Tcp,
    /// QUIC; each link is one bidirectional stream.
    Quic,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Quic => write!(f, "quic"),
        }
    }
}
