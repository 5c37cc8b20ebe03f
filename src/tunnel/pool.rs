//! Link pool: health-ranked selection and fanout.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use super::Link;
use crate::error::{Error, Result};
use crate::protocol::Frame;

/// The set of open links on one side of the tunnel.
///
/// Readers snapshot the set before iterating; the write lock is held only
/// during insert and remove.
#[derive(Default)]
pub struct LinkPool {
    links: RwLock<Vec<Arc<Link>>>,
}

impl LinkPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, link: Arc<Link>) {
        self.links.write().push(link);
    }

    pub fn remove(&self, link: &Arc<Link>) {
        self.links.write().retain(|l| !Arc::ptr_eq(l, link));
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Link>> {
        self.links.read().clone()
    }

    /// The k healthiest links by score ascending; unmeasured links sort
    /// last.
    pub fn select_top_k(&self, k: usize) -> Vec<Arc<Link>> {
        let mut links = self.snapshot();
        links.sort_by(|a, b| {
            a.score()
                .partial_cmp(&b.score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        links.truncate(k);
        links
    }

    /// Duplication factor for the next fanout: the maximum multiplier over
    /// the current links.
    fn fanout(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|l| l.multiplier() as usize)
            .max()
            .unwrap_or(1)
    }

    /// Uplink fanout: send `frame` on the top-k healthiest links, where k
    /// is the current fanout. Per-link write failures are logged and do not
    /// tear down streams.
    pub async fn broadcast(&self, frame: &Frame) -> Result<()> {
        self.send_selected(frame, self.select_top_k(self.fanout()))
            .await
    }

    /// Downlink fanout: like [`broadcast`](Self::broadcast), but `primary`
    /// always appears in the selection, replacing the last slot if absent.
    pub async fn downlink_send(&self, frame: &Frame, primary: Option<&Arc<Link>>) -> Result<()> {
        let mut selected = self.select_top_k(self.fanout());
        if let Some(primary) = primary {
            if !primary.is_closed() && !selected.iter().any(|l| Arc::ptr_eq(l, primary)) {
                if selected.is_empty() {
                    selected.push(Arc::clone(primary));
                } else {
                    let last = selected.len() - 1;
                    selected[last] = Arc::clone(primary);
                }
            }
        }
        self.send_selected(frame, selected).await
    }

    async fn send_selected(&self, frame: &Frame, selected: Vec<Arc<Link>>) -> Result<()> {
        if selected.is_empty() {
            return Err(Error::NoTunnels);
        }
        for link in selected {
            if let Err(e) = link.send(frame).await {
                warn!(peer = %link.peer(), kind = %frame.kind, error = %e, "link send failed");
            }
        }
        Ok(())
    }
}
