//! # Moto
//!
//! Weak-network TCP proxy and overlay accelerator.
//!
//! Moto accepts application TCP connections on configured listeners and
//! routes each one to an upstream target chosen by a per-rule policy
//! (sequential, first-packet regex, race-to-connect, round-robin). When the
//! accelerator overlay is enabled, outbound traffic is carried over a
//! multiplexed tunnel spanning several persistent links to a remote relay
//! that performs the real dial.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Rule Listeners                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │        Target Selection (normal / regex / boost / rr)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  Stream Multiplexer                         │
//! │  ┌────────┐  ┌────────┐  ┌────────┐  ┌────────┐             │
//! │  │ Link 1 │  │ Link 2 │  │ Link 3 │  │ Link N │             │
//! │  └────────┘  └────────┘  └────────┘  └────────┘             │
//! ├─────────────────────────────────────────────────────────────┤
//! │           Loss Adaptation & Health Ranking                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │             Transport (TCP / QUIC streams)                  │
//! └─────────────────────────────────────────────────────────────┘

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)] // Intentional for seq/size arithmetic
#![allow(clippy::cast_precision_loss)] // Acceptable for loss statistics

pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fallback frame size when no adaptation rule proposes one.
pub const DEFAULT_FRAME_SIZE: usize = 32 * 1024;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{Config, Rule, RuleMode};
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{Frame, FrameKind};
    pub use crate::relay::Services;
    pub use crate::tunnel::{AcceleratorConfig, TunnelClient, TunnelServer};
}
