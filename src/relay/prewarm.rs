//! Idle-connection prewarming.
//!
//! Rules marked `prewarm` keep a small stack of pre-dialed connections per
//! target. Acquisition pops the freshest idle connection; when the remaining
//! idle count falls below a quarter of the desired size, the desired size
//! grows by twice the approximate number of connections currently in use,
//! capped per target. There is no auto-shrink.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::dialer;
use crate::config::Rule;
use crate::transport::tune_stream;

/// Initial desired idle connections per target.
const INITIAL_SIZE: usize = 16;
/// Hard cap on the desired size after growth.
const PER_TARGET_MAX: usize = 256;
/// Backoff after a failed warm dial.
const REDIAL_DELAY: Duration = Duration::from_millis(500);

struct PoolInner {
    desired: usize,
    idle: Vec<TcpStream>,
    /// Dials currently in flight.
    warming: usize,
}

/// Prewarm state for one target address.
pub struct PrewarmPool {
    addr: String,
    inner: Mutex<PoolInner>,
}

impl PrewarmPool {
    fn new(addr: String, desired: usize) -> Arc<Self> {
        Arc::new(Self {
            addr,
            inner: Mutex::new(PoolInner {
                desired,
                idle: Vec::new(),
                warming: 0,
            }),
        })
    }

    /// Launch warm dials until idle + warming reaches the desired size.
    fn ensure_locked(self: &Arc<Self>, inner: &mut PoolInner) {
        let need = inner
            .desired
            .saturating_sub(inner.idle.len() + inner.warming);
        for _ in 0..need {
            inner.warming += 1;
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.dial_one().await });
        }
    }

    async fn dial_one(self: Arc<Self>) {
        match dialer::dial_fast(&self.addr).await {
            Ok(dialed) => {
                if let Err(e) = tune_stream(&dialed.stream) {
                    debug!(target = %self.addr, error = %e, "prewarm socket tuning failed");
                }
                let mut inner = self.inner.lock();
                inner.warming = inner.warming.saturating_sub(1);
                inner.idle.push(dialed.stream);
                self.ensure_locked(&mut inner);
            }
            Err(e) => {
                warn!(target = %self.addr, error = %e, "prewarm dial failed");
                tokio::time::sleep(REDIAL_DELAY).await;
                let mut inner = self.inner.lock();
                inner.warming = inner.warming.saturating_sub(1);
                self.ensure_locked(&mut inner);
            }
        }
    }

    /// Pop one idle connection and apply the growth rule.
    fn acquire(self: &Arc<Self>) -> Option<TcpStream> {
        let mut inner = self.inner.lock();
        let conn = inner.idle.pop();
        if conn.is_none() {
            self.ensure_locked(&mut inner);
            return None;
        }

        // Growth: once the remaining idle count drops below a quarter of
        // desired, grow desired by 2x the approximate in-use count.
        let remaining = inner.idle.len();
        if inner.desired > 0 && remaining * 4 < inner.desired {
            let old_desired = inner.desired;
            let active = inner
                .desired
                .saturating_sub(remaining + inner.warming);
            let growth = (active * 2).max(1);
            inner.desired = (inner.desired + growth).min(PER_TARGET_MAX);
            debug!(
                target = %self.addr,
                remaining,
                active,
                warming = inner.warming,
                old_desired,
                new_desired = inner.desired,
                "prewarm pool grown"
            );
        }
        self.ensure_locked(&mut inner);
        conn
    }

    #[cfg(test)]
    fn desired(&self) -> usize {
        self.inner.lock().desired
    }

    #[cfg(test)]
    fn seed_idle(&self, conns: Vec<TcpStream>) {
        self.inner.lock().idle = conns;
    }
}

/// All prewarm pools, keyed by target address.
#[derive(Default)]
pub struct PrewarmRegistry {
    pools: DashMap<String, Arc<PrewarmPool>>,
}

impl PrewarmRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start background warming for every target of a prewarm-enabled rule.
    pub fn init_rule(&self, rule: &Rule) {
        if !rule.prewarm {
            return;
        }
        for target in &rule.targets {
            self.ensure(&target.address, INITIAL_SIZE);
        }
    }

    fn ensure(&self, addr: &str, desired: usize) -> Arc<PrewarmPool> {
        let pool = self
            .pools
            .entry(addr.to_string())
            .or_insert_with(|| PrewarmPool::new(addr.to_string(), desired))
            .clone();
        let mut inner = pool.inner.lock();
        if desired > inner.desired {
            inner.desired = desired;
        }
        pool.ensure_locked(&mut inner);
        drop(inner);
        pool
    }

    /// Take an idle prewarmed connection for `addr`, if any.
    pub fn acquire(&self, addr: &str) -> Option<TcpStream> {
        let pool = self.pools.get(addr)?.clone();
        pool.acquire()
    }
}
