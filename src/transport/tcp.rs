//! TCP tunnel transport.
//!
//! Reliable fallback transport that traverses restrictive networks where
//! UDP-based transports may be blocked.

use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::{LinkIo, TunnelDialer};
use crate::error::{Error, Result, TransportError};

/// Keepalive interval for tunnel connections.
const KEEPALIVE: Duration = Duration::from_secs(30);

/// Per-link connect timeout. The dial loop retries forever, so this only
/// bounds a single attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Apply TCP_NODELAY and keepalive to a tunnel or prewarmed connection.
pub(crate) fn tune_stream(stream: &TcpStream) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE))
        .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
    Ok(())
}

fn into_link_io(stream: TcpStream, peer: String) -> LinkIo {
    let (reader, writer) = stream.into_split();
    LinkIo {
        reader: Box::new(reader),
        writer: Box::new(writer),
        peer,
    }
}

/// Dials tunnel links over plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl TunnelDialer for TcpDialer {
    async fn dial(&self, remote: &str) -> Result<LinkIo> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(remote))
            .await
            .map_err(|_| Error::Timeout("tunnel dial"))?
            .map_err(|e| Error::DialFailed {
                addr: remote.to_string(),
                reason: e.to_string(),
            })?;
        tune_stream(&stream)?;

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| remote.to_string());
        Ok(into_link_io(stream, peer))
    }
}

/// Server-side tunnel listener over plain TCP.
pub struct TcpTunnelListener {
    listener: TcpListener,
}

impl TcpTunnelListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { listener })
    }

    /// Accept one inbound link.
    pub async fn accept(&self) -> Result<LinkIo> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        tune_stream(&stream)?;
        Ok(into_link_io(stream, peer.to_string()))
    }
}
