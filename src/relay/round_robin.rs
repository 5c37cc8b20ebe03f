//! Round-robin policy with race fallback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::{outbound, race, Services};
use crate::config::Rule;

/// The round-robin counter. A single process-wide sequence is shared by
/// every rule in roundrobin mode; each rule re-modulos it by its own
/// target count.
#[derive(Default)]
pub struct RoundRobinCounter {
    counter: AtomicU64,
}

impl RoundRobinCounter {
    /// Pick the next target index. The counter resets to 1 once it exceeds
    /// `100 * targets` to bound growth.
    pub fn pick(&self, targets: usize) -> usize {
        let value = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if value >= 100 * targets as u64 {
            self.counter.store(1, Ordering::Relaxed);
        }
        (value % targets as u64) as usize
    }
}

/// Handle one accepted connection in round-robin mode. A failed dial falls
/// back to a full race.
pub async fn handle(client: TcpStream, rule: Arc<Rule>, services: Arc<Services>) {
    let peer = client
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    let index = services.rr.pick(rule.targets.len());
    let target = &rule.targets[index];

    let begin = Instant::now();
    match outbound::dial(&services, &target.address).await {
        Ok(conn) => {
            debug!(
                rule = %rule.name,
                remote = %peer,
                target = %target.address,
                roundrobin_ms = begin.elapsed().as_millis() as u64,
                "established"
            );
            conn.relay(client).await;
        }
        Err(e) => {
            warn!(
                rule = %rule.name,
                remote = %peer,
                target = %target.address,
                error = %e,
                failed_ms = begin.elapsed().as_millis() as u64,
                "round-robin dial failed, switching to boost mode"
            );
            race::handle(client, rule, services).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycles_through_targets() {
        let counter = RoundRobinCounter::default();
        let picks: Vec<usize> = (0..6).map(|_| counter.pick(3)).collect();
        assert_eq!(picks, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_counter_resets_past_limit() {
        let counter = RoundRobinCounter::default();
        for _ in 0..(100 * 2) {
            counter.pick(2);
        }
        // After the reset the sequence restarts from counter value 1.
        let next = counter.pick(2);
        assert_eq!(next, 0);
    }

    #[test]
    fn test_single_sequence_shared_across_rules() {
        // Rules do not get independent counters; they interleave on one
        // sequence and re-modulo it by their own target count.
        let counter = RoundRobinCounter::default();
        assert_eq!(counter.pick(3), 1); // value 1
        assert_eq!(counter.pick(2), 0); // value 2
        assert_eq!(counter.pick(3), 0); // value 3
        assert_eq!(counter.pick(2), 0); // value 4
    }
}
