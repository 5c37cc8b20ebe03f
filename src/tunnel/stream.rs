//! Client-side stream state and in-order reassembly.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::TunnelClient;
use crate::error::{Error, Result};

/// Reassembly state: a monotonic expected sequence plus a sorted pending
/// map for out-of-order arrivals.
struct Reorder {
    /// Next expected inbound seq; readers observe payloads in ascending
    /// contiguous order starting here.
    read_seq: u32,
    pending: BTreeMap<u32, Bytes>,
    /// In-order deliverable queue; dropped to signal end-of-stream.
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

/// One logical end-to-end byte channel carried across the links.
pub struct StreamState {
    id: u32,
    target: String,
    /// Next outbound seq, starts at 1.
    write_seq: AtomicU32,
    reorder: Mutex<Reorder>,
    closed: AtomicBool,
}

impl StreamState {
    pub(crate) fn new(id: u32, target: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Self {
            id,
            target,
            write_seq: AtomicU32::new(1),
            reorder: Mutex::new(Reorder {
                read_seq: 1,
                pending: BTreeMap::new(),
                tx: Some(tx),
            }),
            closed: AtomicBool::new(false),
        });
        (state, rx)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Claim the next outbound sequence number.
    pub(crate) fn next_write_seq(&self) -> u32 {
        self.write_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// The seq a FIN carries: the next unused write seq.
    pub(crate) fn current_write_seq(&self) -> u32 {
        self.write_seq.load(Ordering::Relaxed)
    }

    /// Next expected inbound seq, for NACK generation.
    pub(crate) fn expected_seq(&self) -> u32 {
        self.reorder.lock().read_seq
    }

    /// Feed one DATA payload into reassembly.
    ///
    /// In-order payloads flush any contiguous pending run; future seqs are
    /// stored with first-arrival-wins so duplicates are suppressed; stale
    /// seqs (below `read_seq`) are expected duplicates and dropped
    /// silently.
    pub(crate) fn deliver(&self, seq: u32, payload: Bytes) {
        let mut reorder = self.reorder.lock();
        if seq < reorder.read_seq {
            return;
        }
        if seq > reorder.read_seq {
            reorder.pending.entry(seq).or_insert(payload);
            return;
        }

        let Some(tx) = reorder.tx.clone() else {
            return;
        };
        let _ = tx.send(payload);
        reorder.read_seq += 1;
        loop {
            let next = reorder.read_seq;
            match reorder.pending.remove(&next) {
                Some(chunk) => {
                    let _ = tx.send(chunk);
                    reorder.read_seq += 1;
                }
                None => break,
            }
        }
    }

    /// Mark closed; returns true on the first call.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wake readers with end-of-stream once the buffer drains.
    pub(crate) fn finish(&self) {
        self.reorder.lock().tx = None;
    }
}

/// Read half of a tunnel stream: in-order payload chunks, `None` at
/// end-of-stream.
pub struct TunnelStreamReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl TunnelStreamReader {
    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Write half of a tunnel stream. Dropping it without an explicit close
/// still broadcasts the FIN.
pub struct TunnelStreamWriter {
    state: Arc<StreamState>,
    client: Arc<TunnelClient>,
}

impl TunnelStreamWriter {
    pub(crate) fn new(state: Arc<StreamState>, client: Arc<TunnelClient>) -> Self {
        Self { state, client }
    }

    /// Chunk `data` by the adaptive frame size and broadcast DATA frames.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::StreamClosed);
        }
        self.client.write_stream(&self.state, data).await
    }

    /// Broadcast FIN and drop local state. Idempotent.
    pub async fn close(&self) {
        self.client.close_stream(&self.state).await;
    }
}

impl Drop for TunnelStreamWriter {
    fn drop(&mut self) {
        if !self.state.is_closed() {
            let client = Arc::clone(&self.client);
            let state = Arc::clone(&self.state);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { client.close_stream(&state).await });
            }
        }
    }
}

/// Byte-channel handle returned by [`TunnelClient::open`].
pub struct TunnelStream {
    writer: TunnelStreamWriter,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream").field("id", &self.id()).finish_non_exhaustive()
    }
}

impl TunnelStream {
    pub(crate) fn new(writer: TunnelStreamWriter, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self { writer, rx }
    }

    pub fn id(&self) -> u32 {
        self.writer.state.id()
    }

    pub fn target(&self) -> &str {
        self.writer.state.target()
    }

    /// Next in-order chunk, `None` at end-of-stream.
    pub async fn read_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.writer.write(data).await
    }

    pub async fn close(&self) {
        self.writer.close().await;
    }

    /// Split into independently-owned read and write halves for
    /// bidirectional piping.
    pub fn split(self) -> (TunnelStreamReader, TunnelStreamWriter) {
        (TunnelStreamReader { rx: self.rx }, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (Arc<StreamState>, mpsc::UnboundedReceiver<Bytes>) {
        StreamState::new(1, "target:80".into())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn test_in_order_delivery() {
        let (state, mut rx) = stream();
        state.deliver(1, Bytes::from_static(b"a"));
        state.deliver(2, Bytes::from_static(b"b"));
        assert_eq!(drain(&mut rx), vec![&b"a"[..], &b"b"[..]]);
    }

    #[test]
    fn test_out_of_order_flushes_contiguous_run() {
        let (state, mut rx) = stream();
        state.deliver(3, Bytes::from_static(b"c"));
        state.deliver(2, Bytes::from_static(b"b"));
        assert!(drain(&mut rx).is_empty());

        state.deliver(1, Bytes::from_static(b"a"));
        assert_eq!(drain(&mut rx), vec![&b"a"[..], &b"b"[..], &b"c"[..]]);
        assert_eq!(state.expected_seq(), 4);
    }

    #[test]
    fn test_duplicates_suppressed() {
        let (state, mut rx) = stream();
        // Pending duplicate: first arrival wins.
        state.deliver(2, Bytes::from_static(b"first"));
        state.deliver(2, Bytes::from_static(b"second"));
        state.deliver(1, Bytes::from_static(b"a"));
        assert_eq!(drain(&mut rx), vec![&b"a"[..], &b"first"[..]]);

        // Late duplicate: dropped silently.
        state.deliver(1, Bytes::from_static(b"stale"));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_large_gap_buffers_in_pending() {
        let (state, mut rx) = stream();
        state.deliver(100, Bytes::from_static(b"far"));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(state.expected_seq(), 1);
    }

    #[test]
    fn test_finish_signals_eof() {
        let (state, mut rx) = stream();
        state.deliver(1, Bytes::from_static(b"a"));
        state.finish();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert!(rx.try_recv().is_err()); // disconnected after drain
    }

    #[test]
    fn test_mark_closed_once() {
        let (state, _rx) = stream();
        assert!(state.mark_closed());
        assert!(!state.mark_closed());
    }
}
