//! Client-side stream multiplexer and tunnel manager.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::link::{probe_loop, read_loop};
use super::stream::StreamState;
use super::{
    AcceleratorConfig, Adaptation, FrameHandler, Link, LinkPool, TunnelStream, DIAL_RETRY,
};
use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameKind};
use crate::transport::{LinkIo, TunnelDialer};

/// Maps stream ids to logical connections and fans application bytes out
/// across the link pool.
pub struct TunnelClient {
    pool: Arc<LinkPool>,
    streams: DashMap<u32, Arc<StreamState>>,
    /// Process-unique stream id counter.
    next_stream_id: AtomicU32,
    adapt: Arc<Adaptation>,
    shutdown: CancellationToken,
}

impl TunnelClient {
    pub fn new(adapt: Arc<Adaptation>) -> Arc<Self> {
        Arc::new(Self {
            pool: LinkPool::new(),
            streams: DashMap::new(),
            next_stream_id: AtomicU32::new(1),
            adapt,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn pool(&self) -> &Arc<LinkPool> {
        &self.pool
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the dial loops and the adaptation ticker. One dial loop per
    /// tunnel slot; slot i sticks to `remotes[i % remotes.len()]` and
    /// retries forever.
    pub fn start(
        self: &Arc<Self>,
        cfg: &AcceleratorConfig,
        dialer: Arc<dyn TunnelDialer>,
        adaptation_enabled: bool,
    ) {
        let count = cfg.tunnel_count(adaptation_enabled);
        info!(
            tunnels = count,
            remotes = cfg.remotes.len(),
            transport = %cfg.transport,
            "starting accelerator client"
        );
        for slot in 0..count {
            let remote = cfg.remotes[slot % cfg.remotes.len()].clone();
            self.spawn_dial_loop(slot, remote, Arc::clone(&dialer));
        }
        self.adapt
            .spawn_ticker(Arc::clone(&self.pool), self.shutdown.clone());
    }

    fn spawn_dial_loop(self: &Arc<Self>, slot: usize, remote: String, dialer: Arc<dyn TunnelDialer>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if client.shutdown.is_cancelled() {
                    break;
                }
                match dialer.dial(&remote).await {
                    Ok(io) => {
                        let (link, read_task) = client.attach_link(io);
                        debug!(slot, peer = %link.peer(), "tunnel link up");
                        // Wait for the link to die, then fall through to
                        // re-dial the slot.
                        let _ = read_task.await;
                        debug!(slot, peer = %link.peer(), "tunnel link down");
                    }
                    Err(e) => {
                        warn!(slot, remote = %remote, error = %e, "tunnel dial failed");
                    }
                }
                tokio::select! {
                    () = client.shutdown.cancelled() => break,
                    () = tokio::time::sleep(DIAL_RETRY) => {}
                }
            }
        });
    }

    /// Register one established link: start its probe and read loops. The
    /// returned task resolves when the link dies.
    pub fn attach_link(self: &Arc<Self>, io: LinkIo) -> (Arc<Link>, tokio::task::JoinHandle<()>) {
        let link = Link::new(io.writer, io.peer);
        self.pool.add(Arc::clone(&link));

        tokio::spawn(probe_loop(
            Arc::clone(&link),
            self.adapt.probe_interval(),
        ));
        let handler: Arc<dyn FrameHandler> = Arc::clone(self) as _;
        let read_task = tokio::spawn(read_loop(
            Arc::clone(&link),
            io.reader,
            Arc::clone(&self.pool),
            handler,
            self.adapt.max_payload(),
        ));
        (link, read_task)
    }

    /// Open a stream to `target`: allocate an id, broadcast one SYN whose
    /// payload is the target address, and hand back the byte channel.
    pub async fn open(self: &Arc<Self>, target: &str) -> Result<TunnelStream> {
        if self.pool.is_empty() {
            return Err(Error::NoTunnels);
        }
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (state, rx) = StreamState::new(id, target.to_string());
        self.streams.insert(id, Arc::clone(&state));

        // If the caller cancels us mid-broadcast (a lost race) the entry
        // must not linger in the stream map.
        let mut guard = OpenGuard {
            client: self.as_ref(),
            id,
            armed: true,
        };
        self.pool.broadcast(&Frame::syn(id, target)).await?;
        guard.armed = false;
        debug!(stream = id, target, "stream opened");

        let writer = super::stream::TunnelStreamWriter::new(state, Arc::clone(self));
        Ok(TunnelStream::new(writer, rx))
    }

    /// Chunk and broadcast application bytes as DATA frames. Flow control
    /// is the transport's backpressure; there is no per-stream window.
    pub(crate) async fn write_stream(&self, stream: &StreamState, data: &[u8]) -> Result<()> {
        let frame_size = self.adapt.frame_size();
        for chunk in data.chunks(frame_size) {
            let seq = stream.next_write_seq();
            self.pool
                .broadcast(&Frame::data(
                    stream.id(),
                    seq,
                    Bytes::copy_from_slice(chunk),
                ))
                .await?;
        }
        Ok(())
    }

    /// Broadcast FIN with the final write seq, remove from the stream map,
    /// and wake readers. Idempotent.
    pub(crate) async fn close_stream(&self, stream: &StreamState) {
        if !stream.mark_closed() {
            return;
        }
        let _ = self
            .pool
            .broadcast(&Frame::fin(stream.id(), stream.current_write_seq()))
            .await;
        self.streams.remove(&stream.id());
        stream.finish();
        debug!(stream = stream.id(), "stream closed");
    }

    /// Close the stream locally on a peer FIN/RST without echoing a FIN.
    fn close_stream_from_peer(&self, stream_id: u32) {
        if let Some((_, state)) = self.streams.remove(&stream_id) {
            state.mark_closed();
            state.finish();
            debug!(stream = stream_id, "stream closed by peer");
        }
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}

/// Removes a half-opened stream if `open` is dropped before the SYN
/// broadcast finishes.
struct OpenGuard<'a> {
    client: &'a TunnelClient,
    id: u32,
    armed: bool,
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.client.streams.remove(&self.id);
        }
    }
}

#[async_trait]
impl FrameHandler for TunnelClient {
    async fn on_frame(&self, link: &Arc<Link>, frame: Frame) {
        match frame.kind {
            FrameKind::Data => {
                // Acknowledge on the receiving link, then NACK the gap if
                // this frame arrived ahead of the expected seq.
                if let Err(e) = link.send(&Frame::ack(frame.stream_id, frame.seq)).await {
                    warn!(peer = %link.peer(), error = %e, "ack write failed");
                }
                let Some(state) = self.streams.get(&frame.stream_id).map(|s| Arc::clone(&s))
                else {
                    return;
                };
                let expected = state.expected_seq();
                if frame.seq > expected {
                    if let Err(e) = link.send(&Frame::nack(frame.stream_id, expected)).await {
                        warn!(peer = %link.peer(), error = %e, "nack write failed");
                    }
                }
                state.deliver(frame.seq, frame.payload);
            }
            FrameKind::Fin | FrameKind::Rst => {
                self.close_stream_from_peer(frame.stream_id);
            }
            // Uplink ack accounting already happened on the link.
            FrameKind::Ack => {}
            kind => {
                debug!(peer = %link.peer(), %kind, "unexpected frame on client side");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::read_frame;
    use crate::tunnel::AdaptationConfig;
    use tokio::io::{duplex, split, ReadHalf};

    fn client() -> Arc<TunnelClient> {
        TunnelClient::new(Adaptation::new(AdaptationConfig::default(), 32768))
    }

    /// A link whose peer side is readable, for asserting emitted frames.
    /// The buffer is large enough that whole-frame writes never block on
    /// the test reading them back.
    fn observable_link() -> (Arc<Link>, ReadHalf<tokio::io::DuplexStream>) {
        let (ours, theirs) = duplex(1 << 20);
        let (_unused_read, write) = split(ours);
        let (peer_read, _unused_write) = split(theirs);
        (Link::new(Box::new(write), "test-peer".into()), peer_read)
    }

    #[tokio::test]
    async fn test_open_broadcasts_syn() {
        let client = client();
        let (link, mut peer) = observable_link();
        client.pool().add(link);

        let stream = client.open("db.internal:5432").await.unwrap();
        assert_eq!(stream.id(), 1);

        let syn = read_frame(&mut peer, 32 * 1024).await.unwrap();
        assert_eq!(syn.kind, FrameKind::Syn);
        assert_eq!(syn.stream_id, 1);
        assert_eq!(&syn.payload[..], b"db.internal:5432");
    }

    #[tokio::test]
    async fn test_open_with_no_links_is_no_tunnels() {
        let client = client();
        assert!(matches!(
            client.open("a:1").await.unwrap_err(),
            Error::NoTunnels
        ));
    }

    #[tokio::test]
    async fn test_data_acked_and_gap_nacked() {
        let client = client();
        let (link, mut peer) = observable_link();
        client.pool().add(Arc::clone(&link));

        let mut stream = client.open("t:80").await.unwrap();
        let _syn = read_frame(&mut peer, 32 * 1024).await.unwrap();

        // Seq 2 arrives first: ACK(2) plus NACK for the missing seq 1.
        client
            .on_frame(&link, Frame::data(1, 2, Bytes::from_static(b"world")))
            .await;
        let ack = read_frame(&mut peer, 32 * 1024).await.unwrap();
        assert_eq!((ack.kind, ack.seq), (FrameKind::Ack, 2));
        let nack = read_frame(&mut peer, 32 * 1024).await.unwrap();
        assert_eq!((nack.kind, nack.seq), (FrameKind::Nack, 1));

        // Seq 1 fills the gap: ACK only, then both chunks deliver in order.
        client
            .on_frame(&link, Frame::data(1, 1, Bytes::from_static(b"hello ")))
            .await;
        let ack = read_frame(&mut peer, 32 * 1024).await.unwrap();
        assert_eq!((ack.kind, ack.seq), (FrameKind::Ack, 1));

        assert_eq!(stream.read_chunk().await.unwrap(), &b"hello "[..]);
        assert_eq!(stream.read_chunk().await.unwrap(), &b"world"[..]);
    }

    #[tokio::test]
    async fn test_peer_fin_ends_stream() {
        let client = client();
        let (link, mut peer) = observable_link();
        client.pool().add(Arc::clone(&link));

        let mut stream = client.open("t:80").await.unwrap();
        let _syn = read_frame(&mut peer, 32 * 1024).await.unwrap();

        client
            .on_frame(&link, Frame::data(1, 1, Bytes::from_static(b"tail")))
            .await;
        client.on_frame(&link, Frame::fin(1, 2)).await;

        // Buffered bytes drain before end-of-stream.
        assert_eq!(stream.read_chunk().await.unwrap(), &b"tail"[..]);
        assert!(stream.read_chunk().await.is_none());
        assert_eq!(client.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_write_chunks_by_frame_size() {
        let adapt = Adaptation::new(AdaptationConfig::default(), 32768);
        let client = TunnelClient::new(adapt);
        let (link, mut peer) = observable_link();
        client.pool().add(link);

        let stream = client.open("t:80").await.unwrap();
        let _syn = read_frame(&mut peer, 32 * 1024).await.unwrap();

        // Two frame sizes and one byte produce three DATA frames.
        let payload = vec![7u8; 32768 * 2 + 1];
        stream.write(&payload).await.unwrap();

        for (expected_seq, expected_len) in [(1, 32768), (2, 32768), (3, 1)] {
            let frame = read_frame(&mut peer, 64 * 1024).await.unwrap();
            assert_eq!(frame.kind, FrameKind::Data);
            assert_eq!(frame.seq, expected_seq);
            assert_eq!(frame.payload.len(), expected_len);
        }
    }

    #[tokio::test]
    async fn test_close_broadcasts_fin_once() {
        let client = client();
        let (link, mut peer) = observable_link();
        client.pool().add(link);

        let stream = client.open("t:80").await.unwrap();
        let _syn = read_frame(&mut peer, 32 * 1024).await.unwrap();

        stream.close().await;
        stream.close().await; // idempotent

        let fin = read_frame(&mut peer, 32 * 1024).await.unwrap();
        assert_eq!(fin.kind, FrameKind::Fin);
        assert_eq!(fin.seq, 1); // no data written
        assert_eq!(client.active_streams(), 0);

        // Writes after close error out.
        assert!(matches!(
            stream.write(b"late").await.unwrap_err(),
            Error::StreamClosed
        ));
    }
}
