//! Multiplexed overlay tunnel with adaptive loss mitigation.
//!
//! This module implements the accelerator core:
//! - Persistent links with RTT/jitter health scoring and per-link loss
//!   accounting
//! - Stream multiplexing with in-order reassembly over reordered and
//!   duplicated frames
//! - A windowed loss estimator driving per-link duplication and an adaptive
//!   frame size
//! - NACK-driven selective retransmission backed by a server-side downlink
//!   cache

mod adapt;
mod link;
mod mux;
mod pool;
mod server;
mod stream;

pub use adapt::{Adaptation, AdaptationConfig, LossRule};
pub use link::{FrameHandler, Link};
pub use mux::TunnelClient;
pub use pool::LinkPool;
pub use server::TunnelServer;
pub use stream::{TunnelStream, TunnelStreamReader, TunnelStreamWriter};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Weight for the RTT and jitter exponential moving averages.
pub const EMA_ALPHA: f64 = 0.2;

/// Backoff between tunnel dial attempts; the client retries forever.
pub const DIAL_RETRY: Duration = Duration::from_secs(1);

/// Accelerator role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listener side: opens tunnel links and multiplexes streams onto them.
    #[default]
    Client,
    /// Relay side: accepts links and dials the real targets.
    Server,
}

/// Accelerator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorConfig {
    /// Enable the overlay. When disabled every policy dials directly.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub role: Role,

    /// Relay addresses (client role). Tunnel slot i dials
    /// `remotes[i % remotes.len()]`.
    #[serde(default)]
    pub remotes: Vec<String>,

    /// Listen address (server role).
    #[serde(default)]
    pub listen: String,

    /// Tunnel count override. Defaults to `2 * remotes.len()` when loss
    /// adaptation is enabled, else `remotes.len()`.
    #[serde(default)]
    pub tunnels: Option<usize>,

    /// Fallback frame size when no adaptation rule proposes one.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    #[serde(default)]
    pub transport: TransportKind,

    /// PEM certificate path for the QUIC transport. When unset the server
    /// generates a self-signed certificate at startup.
    #[serde(default)]
    pub cert: Option<PathBuf>,

    /// PEM private key path for the QUIC transport.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

fn default_frame_size() -> usize {
    crate::DEFAULT_FRAME_SIZE
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            role: Role::Client,
            remotes: Vec::new(),
            listen: String::new(),
            tunnels: None,
            frame_size: default_frame_size(),
            transport: TransportKind::Tcp,
            cert: None,
            key: None,
        }
    }
}

impl AcceleratorConfig {
    /// Effective number of tunnel links for the client role.
    pub fn tunnel_count(&self, adaptation_enabled: bool) -> usize {
        self.tunnels.unwrap_or_else(|| {
            let n = self.remotes.len().max(1);
            if adaptation_enabled {
                2 * n
            } else {
                n
            }
        })
    }
}
