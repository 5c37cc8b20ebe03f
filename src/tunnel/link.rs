//! Individual tunnel link management.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{LinkPool, EMA_ALPHA};
use crate::error::{Result, TransportError};
use crate::protocol::{monotonic_nanos, read_frame, write_frame, Frame, FrameKind};
use crate::transport::{BoxedReader, BoxedWriter};

/// Handler for frames arriving on a link. The client multiplexer and the
/// server relay each implement this; PING/PONG and ACK accounting are
/// handled by the read loop before dispatch.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn on_frame(&self, link: &Arc<Link>, frame: Frame);

    /// Called once after the link's read loop has terminated and the link
    /// was removed from the pool.
    async fn on_link_closed(&self, _link: &Arc<Link>) {}
}

/// Health statistics, updated from PONG probes.
#[derive(Debug, Default)]
struct HealthStats {
    rtt_ewma_ms: f64,
    jitter_ewma_ms: f64,
    samples: u64,
}

/// One persistent tunnel connection carrying framed traffic.
///
/// Whole frames are serialized under the write lock; frames on one link are
/// strictly ordered, frames across links are not.
pub struct Link {
    peer: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    health: parking_lot::Mutex<HealthStats>,
    /// DATA/FIN frames transmitted in the current adaptation window.
    window_sent: AtomicU64,
    /// ACKs received in the current adaptation window.
    window_acked: AtomicU64,
    /// Current duplication factor, 1..=5.
    multiplier: AtomicU32,
    closed: CancellationToken,
}

impl Link {
    pub fn new(writer: BoxedWriter, peer: String) -> Arc<Self> {
        Arc::new(Self {
            peer,
            writer: tokio::sync::Mutex::new(writer),
            health: parking_lot::Mutex::new(HealthStats::default()),
            window_sent: AtomicU64::new(0),
            window_acked: AtomicU64::new(0),
            multiplier: AtomicU32::new(1),
            closed: CancellationToken::new(),
        })
    }

    /// Human-readable peer label.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Emit one encoded frame under the write lock.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        drop(writer);

        if frame.kind.counts_as_sent() {
            self.window_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Record one RTT sample; jitter tracks the EWMA of |Δrtt|.
    pub fn record_rtt(&self, rtt_ms: f64) {
        let mut health = self.health.lock();
        if health.samples == 0 {
            health.rtt_ewma_ms = rtt_ms;
            health.jitter_ewma_ms = 0.0;
        } else {
            let delta = (rtt_ms - health.rtt_ewma_ms).abs();
            health.rtt_ewma_ms = EMA_ALPHA * rtt_ms + (1.0 - EMA_ALPHA) * health.rtt_ewma_ms;
            health.jitter_ewma_ms =
                EMA_ALPHA * delta + (1.0 - EMA_ALPHA) * health.jitter_ewma_ms;
        }
        health.samples += 1;
    }

    /// Health score: `rtt EWMA + jitter EWMA` in milliseconds, lower is
    /// better. A link with no samples yet scores +∞ and sorts last.
    pub fn score(&self) -> f64 {
        let health = self.health.lock();
        if health.samples == 0 {
            f64::INFINITY
        } else {
            health.rtt_ewma_ms + health.jitter_ewma_ms
        }
    }

    pub fn rtt_ms(&self) -> f64 {
        self.health.lock().rtt_ewma_ms
    }

    pub fn samples(&self) -> u64 {
        self.health.lock().samples
    }

    /// Current per-link duplication factor.
    pub fn multiplier(&self) -> u32 {
        self.multiplier.load(Ordering::Relaxed)
    }

    pub fn set_multiplier(&self, m: u32) {
        self.multiplier.store(m.clamp(1, 5), Ordering::Relaxed);
    }

    /// Count one ACK received on this link.
    pub fn note_ack(&self) {
        self.window_acked.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset the windowed (sent, acked) counters.
    pub fn take_window(&self) -> (u64, u64) {
        (
            self.window_sent.swap(0, Ordering::Relaxed),
            self.window_acked.swap(0, Ordering::Relaxed),
        )
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the link is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("score", &self.score())
            .field("multiplier", &self.multiplier())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Run the single reader for a link: parse frames and delegate by flag.
/// Any read error terminates the link and removes it from the pool; streams
/// survive link churn as long as any link remains.
pub(crate) async fn read_loop(
    link: Arc<Link>,
    mut reader: BoxedReader,
    pool: Arc<LinkPool>,
    handler: Arc<dyn FrameHandler>,
    max_payload: usize,
) {
    loop {
        tokio::select! {
            () = link.closed() => break,
            res = read_frame(&mut reader, max_payload) => match res {
                Ok(frame) => dispatch(&link, frame, &handler).await,
                Err(e) => {
                    debug!(peer = %link.peer(), error = %e, "link read failed");
                    break;
                }
            }
        }
    }
    link.close();
    pool.remove(&link);
    handler.on_link_closed(&link).await;
}

async fn dispatch(link: &Arc<Link>, frame: Frame, handler: &Arc<dyn FrameHandler>) {
    match frame.kind {
        FrameKind::Ping => {
            // Echo the timestamp verbatim.
            if let Err(e) = link.send(&Frame::pong(frame.payload)).await {
                warn!(peer = %link.peer(), error = %e, "pong write failed");
            }
        }
        FrameKind::Pong => {
            if frame.payload.len() == 8 {
                let mut ts = [0u8; 8];
                ts.copy_from_slice(&frame.payload);
                let sent = u64::from_be_bytes(ts);
                let now = monotonic_nanos();
                if now >= sent {
                    let rtt_ms = (now - sent) as f64 / 1_000_000.0;
                    link.record_rtt(rtt_ms);
                    trace!(peer = %link.peer(), rtt_ms, "probe rtt");
                }
            }
        }
        FrameKind::Ack => {
            // Uplink ack accounting happens on the receiving link; the
            // handler may additionally prune caches.
            link.note_ack();
            handler.on_frame(link, frame).await;
        }
        _ => handler.on_frame(link, frame).await,
    }
}

/// Periodically write a PING whose payload is the current monotonic
/// nanosecond timestamp.
pub(crate) async fn probe_loop(link: Arc<Link>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = link.closed() => break,
            _ = ticker.tick() => {
                if let Err(e) = link.send(&Frame::ping(monotonic_nanos())).await {
                    warn!(peer = %link.peer(), error = %e, "probe write failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_link() -> Arc<Link> {
        Link::new(Box::new(tokio::io::sink()), "test".into())
    }

    #[test]
    fn test_unsampled_link_scores_infinity() {
        let link = sink_link();
        assert!(link.score().is_infinite());
    }

    #[test]
    fn test_score_tracks_rtt_and_jitter() {
        let link = sink_link();
        link.record_rtt(10.0);
        assert!((link.score() - 10.0).abs() < f64::EPSILON);

        // A higher sample can only raise the score.
        let before = link.score();
        link.record_rtt(50.0);
        assert!(link.score() > before);
    }

    #[test]
    fn test_score_monotone_in_rtt() {
        let a = sink_link();
        let b = sink_link();
        for _ in 0..10 {
            a.record_rtt(10.0);
            b.record_rtt(80.0);
        }
        assert!(a.score() < b.score());
    }

    #[test]
    fn test_multiplier_clamped() {
        let link = sink_link();
        link.set_multiplier(0);
        assert_eq!(link.multiplier(), 1);
        link.set_multiplier(9);
        assert_eq!(link.multiplier(), 5);
        link.set_multiplier(3);
        assert_eq!(link.multiplier(), 3);
    }

    #[tokio::test]
    async fn test_window_counters() {
        let link = sink_link();
        link.send(&Frame::data(1, 1, bytes::Bytes::from_static(b"x")))
            .await
            .unwrap();
        link.send(&Frame::fin(1, 2)).await.unwrap();
        link.send(&Frame::ack(1, 1)).await.unwrap(); // control, not counted
        link.note_ack();

        assert_eq!(link.take_window(), (2, 1));
        // Window resets after the swap.
        assert_eq!(link.take_window(), (0, 0));
    }
}
