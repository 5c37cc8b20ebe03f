//! Parallel direct dialer.
//!
//! Resolves every address for the target host and launches staggered dial
//! attempts, returning the first success with its measured latency so
//! consumers can use it for decisions. Literal IPs skip resolution.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};

/// Overall dial budget.
const OVERALL_BUDGET: Duration = Duration::from_secs(3);
/// Budget for one address attempt.
const PER_DIAL: Duration = Duration::from_secs(2);
/// Stagger between successive address attempts.
const STAGGER: Duration = Duration::from_millis(50);

/// A direct connection with its measured dial latency.
#[derive(Debug)]
pub struct DialedConn {
    pub stream: TcpStream,
    pub latency: Duration,
}

/// Dial `addr` (`host:port`), racing all resolved addresses. The first
/// attempt to succeed wins; the rest are cancelled.
pub async fn dial_fast(addr: &str) -> Result<DialedConn> {
    let start = Instant::now();

    // Literal socket addresses skip resolution entirely.
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        let stream = connect_one(sock, OVERALL_BUDGET).await?;
        return Ok(DialedConn {
            stream,
            latency: start.elapsed(),
        });
    }

    let addrs: Vec<SocketAddr> = timeout(OVERALL_BUDGET, tokio::net::lookup_host(addr))
        .await
        .map_err(|_| Error::Timeout("dns resolution"))?
        .map_err(|e| Error::DialFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::DialFailed {
            addr: addr.to_string(),
            reason: "no addresses resolved".into(),
        });
    }
    if addrs.len() == 1 {
        let stream = connect_one(addrs[0], OVERALL_BUDGET).await?;
        return Ok(DialedConn {
            stream,
            latency: start.elapsed(),
        });
    }

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<TcpStream>(1);

    for (i, sock) in addrs.into_iter().enumerate() {
        let cancel = cancel.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            if i > 0 {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(STAGGER * i as u32) => {}
                }
            }
            let stream = tokio::select! {
                () = cancel.cancelled() => return,
                res = connect_one(sock, PER_DIAL) => match res {
                    Ok(stream) => stream,
                    Err(e) => {
                        trace!(addr = %sock, error = %e, "dial attempt failed");
                        return;
                    }
                }
            };
            // Losers past this point are closed by the drop below.
            if tx.try_send(stream).is_err() {
                // A faster attempt already won.
            }
        });
    }
    drop(tx);

    match timeout(OVERALL_BUDGET, rx.recv()).await {
        Ok(Some(stream)) => {
            cancel.cancel();
            Ok(DialedConn {
                stream,
                latency: start.elapsed(),
            })
        }
        Ok(None) => {
            cancel.cancel();
            Err(Error::DialFailed {
                addr: addr.to_string(),
                reason: "all addresses failed".into(),
            })
        }
        Err(_) => {
            cancel.cancel();
            Err(Error::Timeout("parallel dial"))
        }
    }
}

async fn connect_one(sock: SocketAddr, budget: Duration) -> Result<TcpStream> {
    let stream = timeout(budget, TcpStream::connect(sock))
        .await
        .map_err(|_| Error::Timeout("dial"))?
        .map_err(|e| Error::DialFailed {
            addr: sock.to_string(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}
