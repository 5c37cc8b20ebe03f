//! Server-side relay: terminates tunnel streams by dialing the real
//! targets and pumping bytes both ways.
//!
//! The downlink direction keeps a per-stream retransmission cache keyed by
//! seq. Every payload between the cache floor (inclusive) and the highest
//! sent seq is retained until the peer ACKs it; an ACK prunes the acked seq
//! and everything earlier.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::link::{probe_loop, read_loop};
use super::{AcceleratorConfig, Adaptation, FrameHandler, Link, LinkPool};
use crate::error::Result;
use crate::protocol::{Frame, FrameKind};
use crate::relay::dialer;
use crate::transport::{LinkIo, QuicTunnelListener, TcpTunnelListener, TransportKind};

/// Uplink forwarding phase for one stream.
enum Phase {
    /// SYN received, the real dial is in flight; early DATA buffers in the
    /// pending map.
    Dialing,
    /// Upstream connected; in-order payloads flow through this channel to
    /// the writer task.
    Ready(mpsc::UnboundedSender<Bytes>),
    Closed,
}

struct UpstreamInner {
    phase: Phase,
    /// Next uplink seq to forward, starts at 1.
    expect_seq: u32,
    pending: BTreeMap<u32, Bytes>,
    /// Downlink retransmission cache, seq → payload.
    cache: BTreeMap<u32, Bytes>,
    /// Lowest unacked cached seq.
    floor: u32,
}

/// Per-stream server state.
struct Upstream {
    id: u32,
    target: String,
    /// Link the SYN arrived on; kept in every downlink selection and used
    /// for RST on dial failure.
    origin: Arc<Link>,
    inner: Mutex<UpstreamInner>,
    cancel: CancellationToken,
}

impl Upstream {
    fn new(id: u32, target: String, origin: Arc<Link>) -> Arc<Self> {
        Arc::new(Self {
            id,
            target,
            origin,
            inner: Mutex::new(UpstreamInner {
                phase: Phase::Dialing,
                expect_seq: 1,
                pending: BTreeMap::new(),
                cache: BTreeMap::new(),
                floor: 1,
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Feed one uplink DATA payload toward the target, reordering by seq.
    fn push_uplink(&self, seq: u32, payload: Bytes) {
        let mut inner = self.inner.lock();
        if seq < inner.expect_seq {
            return; // expected duplicate
        }
        if seq > inner.expect_seq {
            inner.pending.entry(seq).or_insert(payload);
            return;
        }
        let Phase::Ready(tx) = &inner.phase else {
            // Still dialing; buffer in order.
            inner.pending.entry(seq).or_insert(payload);
            return;
        };
        let tx = tx.clone();
        let _ = tx.send(payload);
        inner.expect_seq += 1;
        loop {
            let next = inner.expect_seq;
            match inner.pending.remove(&next) {
                Some(chunk) => {
                    let _ = tx.send(chunk);
                    inner.expect_seq += 1;
                }
                None => break,
            }
        }
    }

    /// Transition to Ready and replay everything buffered while dialing.
    fn set_ready(&self, tx: mpsc::UnboundedSender<Bytes>) {
        let mut inner = self.inner.lock();
        loop {
            let next = inner.expect_seq;
            match inner.pending.remove(&next) {
                Some(chunk) => {
                    let _ = tx.send(chunk);
                    inner.expect_seq += 1;
                }
                None => break,
            }
        }
        inner.phase = Phase::Ready(tx);
    }

    /// Flush any contiguous buffered data, then close the uplink writer.
    fn close_uplink(&self) {
        let mut inner = self.inner.lock();
        if let Phase::Ready(tx) = &inner.phase {
            let tx = tx.clone();
            loop {
                let next = inner.expect_seq;
                match inner.pending.remove(&next) {
                    Some(chunk) => {
                        let _ = tx.send(chunk);
                        inner.expect_seq += 1;
                    }
                    None => break,
                }
            }
        }
        inner.phase = Phase::Closed;
        inner.pending.clear();
        inner.cache.clear();
    }

    fn cache_insert(&self, seq: u32, payload: Bytes) {
        self.inner.lock().cache.insert(seq, payload);
    }

    fn cache_lookup(&self, seq: u32) -> Option<Bytes> {
        self.inner.lock().cache.get(&seq).cloned()
    }

    /// Prune the cache for all seqs in `[floor, acked]` and advance the
    /// floor.
    fn cache_prune(&self, acked: u32) {
        let mut inner = self.inner.lock();
        if acked < inner.floor {
            return;
        }
        inner.cache = inner.cache.split_off(&(acked + 1));
        inner.floor = acked + 1;
    }

    #[cfg(test)]
    fn cache_span(&self) -> (u32, usize) {
        let inner = self.inner.lock();
        (inner.floor, inner.cache.len())
    }
}

/// The relay side of the tunnel. Symmetric to the client for downlink
/// traffic, with the added retransmission cache.
pub struct TunnelServer {
    pool: Arc<LinkPool>,
    upstreams: DashMap<u32, Arc<Upstream>>,
    adapt: Arc<Adaptation>,
    shutdown: CancellationToken,
    /// Back-reference for spawning tasks from the frame handler.
    weak_self: std::sync::Weak<TunnelServer>,
}

impl TunnelServer {
    pub fn new(adapt: Arc<Adaptation>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            pool: LinkPool::new(),
            upstreams: DashMap::new(),
            adapt,
            shutdown: CancellationToken::new(),
            weak_self: weak.clone(),
        })
    }

    pub fn pool(&self) -> &Arc<LinkPool> {
        &self.pool
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept tunnel links forever. Only this entry point is specialized
    /// per transport; everything after the byte channel is shared.
    pub async fn run(self: Arc<Self>, cfg: AcceleratorConfig) -> Result<()> {
        self.adapt
            .spawn_ticker(Arc::clone(&self.pool), self.shutdown.clone());
        info!(listen = %cfg.listen, transport = %cfg.transport, "accelerator relay listening");

        match cfg.transport {
            TransportKind::Tcp => {
                let listener = TcpTunnelListener::bind(&cfg.listen).await?;
                loop {
                    tokio::select! {
                        () = self.shutdown.cancelled() => return Ok(()),
                        res = listener.accept() => match res {
                            Ok(io) => self.add_link(io),
                            Err(e) => {
                                warn!(error = %e, "tunnel accept failed");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
            TransportKind::Quic => {
                let listener =
                    QuicTunnelListener::bind(&cfg.listen, cfg.cert.as_deref(), cfg.key.as_deref())?;
                loop {
                    tokio::select! {
                        () = self.shutdown.cancelled() => return Ok(()),
                        res = listener.accept() => match res {
                            Ok(io) => self.add_link(io),
                            Err(e) => {
                                warn!(error = %e, "tunnel accept failed");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Register one accepted link and start its loops.
    pub fn add_link(self: &Arc<Self>, io: LinkIo) {
        let link = Link::new(io.writer, io.peer);
        debug!(peer = %link.peer(), "tunnel link accepted");
        self.pool.add(Arc::clone(&link));

        tokio::spawn(probe_loop(
            Arc::clone(&link),
            self.adapt.probe_interval(),
        ));
        let handler: Arc<dyn FrameHandler> = Arc::clone(self) as _;
        tokio::spawn(read_loop(
            link,
            io.reader,
            Arc::clone(&self.pool),
            handler,
            self.adapt.max_payload(),
        ));
    }

    /// SYN: dial the real target. On success, replay buffered frames and
    /// start the downlink producer; on failure, RST on the originating
    /// link.
    fn handle_syn(&self, link: &Arc<Link>, frame: &Frame) {
        let Some(server) = self.weak_self.upgrade() else {
            return;
        };
        let id = frame.stream_id;
        let target = match std::str::from_utf8(&frame.payload) {
            Ok(t) => t.to_string(),
            Err(_) => {
                warn!(stream = id, "SYN with non-UTF-8 target");
                return;
            }
        };

        // The SYN is broadcast across links; only the first copy starts a
        // dial.
        let upstream = Upstream::new(id, target, Arc::clone(link));
        let entry = self
            .upstreams
            .entry(id)
            .or_insert_with(|| Arc::clone(&upstream));
        if !Arc::ptr_eq(entry.value(), &upstream) {
            return;
        }
        drop(entry);

        tokio::spawn(async move {
            match dialer::dial_fast(&upstream.target).await {
                Ok(dialed) => {
                    debug!(
                        stream = id,
                        target = %upstream.target,
                        latency_ms = dialed.latency.as_millis() as u64,
                        "upstream connected"
                    );
                    let (read_half, write_half) = dialed.stream.into_split();
                    let (tx, rx) = mpsc::unbounded_channel();
                    upstream.set_ready(tx);
                    tokio::spawn(uplink_writer(Arc::clone(&upstream), rx, write_half));
                    tokio::spawn(downlink_producer(server, upstream, read_half));
                }
                Err(e) => {
                    warn!(stream = id, target = %upstream.target, error = %e, "upstream dial failed");
                    if let Err(e) = upstream.origin.send(&Frame::rst(id)).await {
                        warn!(stream = id, error = %e, "rst write failed");
                    }
                    server.drop_stream(id);
                }
            }
        });
    }

    fn drop_stream(&self, id: u32) {
        if let Some((_, upstream)) = self.upstreams.remove(&id) {
            upstream.cancel.cancel();
            upstream.close_uplink();
            debug!(stream = id, "stream state dropped");
        }
    }

    pub fn active_streams(&self) -> usize {
        self.upstreams.len()
    }
}

#[async_trait]
impl FrameHandler for TunnelServer {
    async fn on_frame(&self, link: &Arc<Link>, frame: Frame) {
        match frame.kind {
            FrameKind::Syn => self.handle_syn(link, &frame),
            FrameKind::Data => {
                if let Err(e) = link.send(&Frame::ack(frame.stream_id, frame.seq)).await {
                    warn!(peer = %link.peer(), error = %e, "ack write failed");
                }
                if let Some(upstream) = self.upstreams.get(&frame.stream_id) {
                    upstream.push_uplink(frame.seq, frame.payload);
                }
            }
            FrameKind::Nack => {
                // Selective retransmission on the requesting link only, no
                // fanout.
                let cached = self
                    .upstreams
                    .get(&frame.stream_id)
                    .and_then(|u| u.cache_lookup(frame.seq));
                if let Some(payload) = cached {
                    debug!(stream = frame.stream_id, seq = frame.seq, "nack retransmit");
                    if let Err(e) = link
                        .send(&Frame::data(frame.stream_id, frame.seq, payload))
                        .await
                    {
                        warn!(peer = %link.peer(), error = %e, "retransmit write failed");
                    }
                }
            }
            FrameKind::Ack => {
                if let Some(upstream) = self.upstreams.get(&frame.stream_id) {
                    upstream.cache_prune(frame.seq);
                }
            }
            FrameKind::Fin | FrameKind::Rst => {
                self.drop_stream(frame.stream_id);
            }
            kind => {
                debug!(peer = %link.peer(), %kind, "unexpected frame on server side");
            }
        }
    }
}

/// Drain in-order uplink payloads into the real target.
async fn uplink_writer(
    upstream: Arc<Upstream>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut write_half: OwnedWriteHalf,
) {
    loop {
        tokio::select! {
            () = upstream.cancel.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = write_half.write_all(&chunk).await {
                        debug!(stream = upstream.id, error = %e, "upstream write failed");
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = write_half.shutdown().await;
}

/// Read target bytes into DATA frames numbered from 1, retaining each
/// payload in the downlink cache until the peer ACKs it. On upstream
/// EOF or error, send FIN; the stream state stays until the peer's FIN so
/// NACK repair keeps working for the tail.
async fn downlink_producer(
    server: Arc<TunnelServer>,
    upstream: Arc<Upstream>,
    mut read_half: OwnedReadHalf,
) {
    let mut next_seq: u32 = 1;
    let mut buf = vec![0u8; server.adapt.max_payload()];

    loop {
        let chunk_size = server.adapt.frame_size().min(buf.len());
        let n = tokio::select! {
            () = upstream.cancel.cancelled() => return,
            res = read_half.read(&mut buf[..chunk_size]) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(stream = upstream.id, error = %e, "upstream read failed");
                    break;
                }
            }
        };

        let seq = next_seq;
        next_seq += 1;
        let payload = Bytes::copy_from_slice(&buf[..n]);
        upstream.cache_insert(seq, payload.clone());
        if let Err(e) = server
            .pool
            .downlink_send(
                &Frame::data(upstream.id, seq, payload),
                Some(&upstream.origin),
            )
            .await
        {
            debug!(stream = upstream.id, error = %e, "downlink send failed");
        }
    }

    let fin_seq = next_seq;
    if let Err(e) = server
        .pool
        .downlink_send(&Frame::fin(upstream.id, fin_seq), Some(&upstream.origin))
        .await
    {
        debug!(stream = upstream.id, error = %e, "downlink fin failed");
    }
}
