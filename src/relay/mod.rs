//! Rule listeners and target-selection policies.
//!
//! Each rule binds one TCP listener and routes accepted connections to its
//! targets with one of four policies: sequential (normal), first-packet
//! regex, race-to-connect (boost), or round-robin. The winner cache and
//! prewarm pool are shared services consumed by every policy; the outbound
//! seam redirects dials through the accelerator when it is up.

pub mod dialer;
mod listener;
pub mod outbound;
mod prewarm;
pub mod race;
pub mod regex_route;
pub mod round_robin;
pub mod sequential;

pub use listener::{run_rule, Waf};
pub use outbound::OutboundConn;
pub use prewarm::{PrewarmPool, PrewarmRegistry};
pub use race::{Freshness, WinnerCache, WINNER_TTL};
pub use round_robin::RoundRobinCounter;

use std::sync::Arc;

use crate::tunnel::TunnelClient;

/// Process-lifetime services shared by the listeners and policies,
/// constructed once at startup and passed in by reference.
pub struct Services {
    /// Accelerator client; `None` when the overlay is disabled or this
    /// process is the relay side.
    pub tunnel: Option<Arc<TunnelClient>>,
    pub prewarm: Arc<PrewarmRegistry>,
    pub winners: Arc<WinnerCache>,
    pub rr: RoundRobinCounter,
    pub waf: Waf,
}

impl Services {
    pub fn new(tunnel: Option<Arc<TunnelClient>>) -> Arc<Self> {
        Arc::new(Self {
            tunnel,
            prewarm: PrewarmRegistry::new(),
            winners: WinnerCache::new(),
            rr: RoundRobinCounter::default(),
            waf: Waf::default(),
        })
    }
}
