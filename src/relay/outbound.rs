//! Outbound dialing seam shared by every policy.
//!
//! With the accelerator up, outbound connections ride the tunnel; otherwise
//! the prewarm pool is consulted first and the parallel direct dialer last.
//! When the overlay is enabled but no link is currently up, the dial falls
//! back to direct so traffic keeps flowing through link churn.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::dialer;
use super::Services;
use crate::error::{Error, Result};
use crate::tunnel::TunnelStream;

/// An established outbound connection.
pub enum OutboundConn {
    Direct {
        stream: TcpStream,
        latency: Duration,
    },
    Tunnel(TunnelStream),
}

impl OutboundConn {
    /// Replay bytes (e.g. a captured first packet) before piping begins.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Direct { stream, .. } => {
                stream.write_all(data).await?;
                Ok(())
            }
            Self::Tunnel(stream) => stream.write(data).await,
        }
    }

    /// Pipe bytes bidirectionally between the accepted client connection
    /// and this outbound connection until either side closes.
    pub async fn relay(self, mut client: TcpStream) {
        match self {
            Self::Direct { mut stream, .. } => {
                let _ = tokio::io::copy_bidirectional(&mut client, &mut stream).await;
            }
            Self::Tunnel(stream) => {
                let (mut tunnel_read, tunnel_write) = stream.split();
                let (mut client_read, mut client_write) = client.into_split();

                let uplink = async {
                    let mut buf = vec![0u8; 32 * 1024];
                    loop {
                        match client_read.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tunnel_write.write(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                };
                let downlink = async {
                    while let Some(chunk) = tunnel_read.read_chunk().await {
                        if client_write.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                    let _ = client_write.shutdown().await;
                };

                // Both directions run to completion, as copy_bidirectional
                // does for the direct case: a client half-close must not
                // cut off response bytes still queued on the stream. The
                // close after both broadcasts the FIN.
                tokio::join!(uplink, downlink);
                tunnel_write.close().await;
            }
        }
    }
}

/// Dial `addr` through the configured outbound path.
pub async fn dial(services: &Services, addr: &str) -> Result<OutboundConn> {
    if let Some(tunnel) = &services.tunnel {
        match tunnel.open(addr).await {
            Ok(stream) => return Ok(OutboundConn::Tunnel(stream)),
            Err(Error::NoTunnels) => {
                warn!(target = addr, "no tunnel links up, falling back to direct dial");
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(stream) = services.prewarm.acquire(addr) {
        debug!(target = addr, "using prewarmed connection");
        return Ok(OutboundConn::Direct {
            stream,
            latency: Duration::ZERO,
        });
    }

    let dialed = dialer::dial_fast(addr).await?;
    Ok(OutboundConn::Direct {
        stream: dialed.stream,
        latency: dialed.latency,
    })
}
