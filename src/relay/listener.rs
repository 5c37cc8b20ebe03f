//! Per-rule TCP listener.
//!
//! Accepts client connections, applies the blacklist and a best-effort
//! per-IP rate bucket, and dispatches to the rule's policy handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::{race, regex_route, round_robin, sequential, Services};
use crate::config::{Rule, RuleMode};
use crate::error::{Result, TransportError};

/// WAF bucket window.
const WAF_WINDOW: Duration = Duration::from_secs(30);
/// Per-IP hit cap within one window.
const WAF_CAP: u32 = 200;

/// Best-effort per-IP request counter. Not part of the relay contract;
/// over-cap connections are closed with a warning.
#[derive(Default)]
pub struct Waf {
    buckets: DashMap<String, (u32, Instant)>,
}

impl Waf {
    /// Count a hit for `ip`; false when the bucket is over the cap.
    pub fn allow(&self, ip: &str) -> bool {
        let mut bucket = self
            .buckets
            .entry(ip.to_string())
            .or_insert_with(|| (0, Instant::now()));
        if bucket.1.elapsed() >= WAF_WINDOW {
            *bucket = (0, Instant::now());
        }
        bucket.0 += 1;
        bucket.0 <= WAF_CAP
    }
}

/// Run one rule's accept loop. Bind failure aborts this rule only; accept
/// errors back off for a second and continue.
pub async fn run_rule(rule: Arc<Rule>, services: Arc<Services>) -> Result<()> {
    services.prewarm.init_rule(&rule);

    let listener = TcpListener::bind(&rule.listen)
        .await
        .map_err(|e| TransportError::BindFailed {
            addr: rule.listen.clone(),
            reason: e.to_string(),
        })?;
    info!(rule = %rule.name, listen = %rule.listen, mode = ?rule.mode, "listening");

    loop {
        let (client, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(rule = %rule.name, listen = %rule.listen, error = %e, "accept failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let client_ip = peer.ip().to_string();
        if rule.blacklist.contains(&client_ip) {
            info!(rule = %rule.name, ip = %client_ip, "disconnected blacklisted ip");
            continue;
        }
        if !services.waf.allow(&client_ip) {
            warn!(rule = %rule.name, ip = %client_ip, "too many requests");
            continue;
        }

        let rule = Arc::clone(&rule);
        let services = Arc::clone(&services);
        tokio::spawn(async move {
            match rule.mode {
                RuleMode::Normal => sequential::handle(client, rule, services).await,
                RuleMode::Regex => regex_route::handle(client, rule, services).await,
                RuleMode::Boost => race::handle(client, rule, services).await,
                RuleMode::RoundRobin => round_robin::handle(client, rule, services).await,
            }
        });
    }
}
