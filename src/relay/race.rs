//! Race-to-connect policy (boost mode) and the winner cache.
//!
//! Every target is dialed concurrently; the first to connect wins and the
//! losers are closed. The winner's address is cached per rule for a fixed
//! TTL so subsequent connections skip the race. A cache hit in the second
//! half of its lifetime triggers a lazy background revalidation: a short
//! bounded race whose connection is always discarded, refreshing the cache
//! if a faster target has appeared.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::outbound::{self, OutboundConn};
use super::Services;
use crate::config::Rule;
use crate::error::{Error, Result};

/// Winner lifetime.
pub const WINNER_TTL: Duration = Duration::from_secs(30);
/// Soft bound on cached winners.
const CACHE_CAP: usize = 256;
/// Hard budget for a lazy revalidation race.
const REVALIDATE_BUDGET: Duration = Duration::from_millis(200);

struct Winner {
    addr: String,
    expires: Instant,
}

/// Cached race winners, keyed by rule name. Expired entries are dropped
/// lazily on lookup or on dial failure.
#[derive(Default)]
pub struct WinnerCache {
    entries: DashMap<String, Winner>,
}

/// Cache entry freshness at lookup time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Less than half the TTL has elapsed.
    Fresh,
    /// Past half the TTL; still usable but worth revalidating.
    Stale,
}

impl WinnerCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look up the winner for a rule, dropping it if expired.
    pub fn lookup(&self, rule: &str) -> Option<(String, Freshness)> {
        let entry = self.entries.get(rule)?;
        let now = Instant::now();
        if now >= entry.expires {
            drop(entry);
            self.entries.remove(rule);
            return None;
        }
        let age = WINNER_TTL.saturating_sub(entry.expires - now);
        let freshness = if age * 2 < WINNER_TTL {
            Freshness::Fresh
        } else {
            Freshness::Stale
        };
        Some((entry.addr.clone(), freshness))
    }

    pub fn store(&self, rule: &str, addr: String) {
        if self.entries.len() >= CACHE_CAP && !self.entries.contains_key(rule) {
            // Soft cap: shed expired entries; if none are expired the new
            // winner simply isn't cached.
            let now = Instant::now();
            self.entries.retain(|_, w| w.expires > now);
            if self.entries.len() >= CACHE_CAP {
                return;
            }
        }
        self.entries.insert(
            rule.to_string(),
            Winner {
                addr,
                expires: Instant::now() + WINNER_TTL,
            },
        );
    }

    pub fn invalidate(&self, rule: &str) {
        self.entries.remove(rule);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn store_with_expiry(&self, rule: &str, addr: String, expires: Instant) {
        self.entries
            .insert(rule.to_string(), Winner { addr, expires });
    }
}

/// Handle one accepted connection in boost mode.
pub async fn handle(client: TcpStream, rule: Arc<Rule>, services: Arc<Services>) {
    let decision_begin = Instant::now();

    // Cached-winner fast path.
    if let Some((addr, freshness)) = services.winners.lookup(&rule.name) {
        if freshness == Freshness::Stale {
            spawn_revalidation(Arc::clone(&rule), Arc::clone(&services));
        }
        match outbound::dial(&services, &addr).await {
            Ok(conn) => {
                debug!(
                    rule = %rule.name,
                    target = %addr,
                    boost_cache_hit = true,
                    decision_ms = decision_begin.elapsed().as_millis() as u64,
                    "established"
                );
                conn.relay(client).await;
                return;
            }
            Err(e) => {
                debug!(rule = %rule.name, target = %addr, error = %e, "cached winner failed");
                services.winners.invalidate(&rule.name);
            }
        }
    }

    // Fresh race, bounded by the rule timeout.
    let budget = Duration::from_millis(rule.timeout.max(1));
    match race(&rule, &services, budget).await {
        Ok((conn, addr)) => {
            services.winners.store(&rule.name, addr.clone());
            debug!(
                rule = %rule.name,
                target = %addr,
                boost_cache_hit = false,
                decision_ms = decision_begin.elapsed().as_millis() as u64,
                "established"
            );
            conn.relay(client).await;
        }
        Err(_) => {
            error!(rule = %rule.name, "boost decision failed, all lines unavailable");
        }
    }
}

/// Concurrently dial every target; first success wins, losers are closed
/// via the shared cancellation signal.
async fn race(
    rule: &Rule,
    services: &Arc<Services>,
    budget: Duration,
) -> Result<(OutboundConn, String)> {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<(OutboundConn, String)>(1);

    for target in &rule.targets {
        let addr = target.address.clone();
        let cancel = cancel.clone();
        let tx = tx.clone();
        let services = Arc::clone(services);
        tokio::spawn(async move {
            let conn = tokio::select! {
                () = cancel.cancelled() => return,
                res = outbound::dial(&services, &addr) => match res {
                    Ok(conn) => conn,
                    Err(_) => return,
                }
            };
            if let Err(mpsc::error::TrySendError::Full((conn, _)) | mpsc::error::TrySendError::Closed((conn, _))) =
                tx.try_send((conn, addr))
            {
                // A faster target already won; close the unselected
                // connection.
                close_loser(conn).await;
            }
        });
    }
    drop(tx);

    match timeout(budget, rx.recv()).await {
        Ok(Some(winner)) => {
            cancel.cancel();
            Ok(winner)
        }
        Ok(None) => {
            cancel.cancel();
            Err(Error::DialFailed {
                addr: rule.name.clone(),
                reason: "all targets failed".into(),
            })
        }
        Err(_) => {
            cancel.cancel();
            Err(Error::Timeout("boost race"))
        }
    }
}

async fn close_loser(conn: OutboundConn) {
    if let OutboundConn::Tunnel(stream) = conn {
        stream.close().await;
    }
    // Direct connections close on drop.
}

/// Lazy revalidation: a short race over all targets, discarding the
/// connection and refreshing the cache if a winner emerges in time.
fn spawn_revalidation(rule: Arc<Rule>, services: Arc<Services>) {
    tokio::spawn(async move {
        match race(&rule, &services, REVALIDATE_BUDGET).await {
            Ok((conn, addr)) => {
                debug!(rule = %rule.name, target = %addr, "winner revalidated");
                services.winners.store(&rule.name, addr);
                close_loser(conn).await;
            }
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "winner revalidation failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_then_stale_then_expired() {
        let cache = WinnerCache::new();
        cache.store("r", "a:1".into());
        assert_eq!(
            cache.lookup("r"),
            Some(("a:1".into(), Freshness::Fresh))
        );

        // Rewind the expiry into the second half of the TTL.
        cache.store_with_expiry(
            "r",
            "a:1".into(),
            Instant::now() + WINNER_TTL / 2 - Duration::from_millis(50),
        );
        assert_eq!(
            cache.lookup("r"),
            Some(("a:1".into(), Freshness::Stale))
        );

        cache.store_with_expiry("r", "a:1".into(), Instant::now() - Duration::from_millis(1));
        assert_eq!(cache.lookup("r"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_on_dial_failure_path() {
        let cache = WinnerCache::new();
        cache.store("r", "a:1".into());
        cache.invalidate("r");
        assert_eq!(cache.lookup("r"), None);
    }

    #[test]
    fn test_soft_cap_sheds_expired_first() {
        let cache = WinnerCache::new();
        for i in 0..CACHE_CAP {
            cache.store_with_expiry(
                &format!("rule-{i}"),
                "a:1".into(),
                Instant::now() - Duration::from_millis(1),
            );
        }
        assert_eq!(cache.len(), CACHE_CAP);

        // The cap is enforced by dropping the expired entries.
        cache.store("fresh", "b:2".into());
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup("fresh").is_some());
    }

    #[test]
    fn test_soft_cap_skips_insert_when_full_of_live_entries() {
        let cache = WinnerCache::new();
        for i in 0..CACHE_CAP {
            cache.store(&format!("rule-{i}"), "a:1".into());
        }
        cache.store("extra", "b:2".into());
        assert_eq!(cache.len(), CACHE_CAP);
        assert_eq!(cache.lookup("extra"), None);
    }
}
