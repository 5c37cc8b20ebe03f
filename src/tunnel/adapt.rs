//! Loss adaptation engine.
//!
//! Every window boundary the engine converts each link's sent-vs-acked
//! counters into a loss percentage, walks the ordered loss rules, and adopts
//! the matching rule's duplication factor per link. Duplication is per link
//! so each path tracks the loss it individually sees; a clean link is never
//! amplified to compensate for a noisy one. The engine also elects a global
//! adaptive frame size: the minimum candidate proposed by any link in the
//! window, since smaller frames survive worse links.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::LinkPool;
use crate::protocol::MIN_MAX_PAYLOAD;

/// One loss rule: applies when the window loss percentage is below
/// `loss_below`. Rules are ordered ascending; the last must cover 100%.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LossRule {
    /// Upper bound (exclusive) on loss percent for this rule to match.
    pub loss_below: f64,
    /// Duplication factor to adopt, clamped to 1..=5.
    pub dup: u32,
    /// Optional frame size candidate for this loss band.
    #[serde(default)]
    pub frame_size: Option<usize>,
}

/// Loss adaptation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Estimation window in seconds.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// PING probe interval in milliseconds.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Ordered loss rules, ascending by `loss_below`.
    #[serde(default)]
    pub rules: Vec<LossRule>,
}

fn default_window_seconds() -> u64 {
    10
}
fn default_probe_interval_ms() -> u64 {
    1000
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_seconds: default_window_seconds(),
            probe_interval_ms: default_probe_interval_ms(),
            rules: Vec::new(),
        }
    }
}

impl AdaptationConfig {
    /// Validate rule ordering and coverage.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.rules.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "adaptation enabled but no loss rules".into(),
            ));
        }
        for pair in self.rules.windows(2) {
            if pair[0].loss_below > pair[1].loss_below {
                return Err(crate::Error::InvalidConfig(
                    "loss rules must be ordered ascending by lossBelow".into(),
                ));
            }
        }
        let last = self.rules.last().expect("non-empty");
        if last.loss_below < 100.0 {
            return Err(crate::Error::InvalidConfig(
                "last loss rule must cover 100% loss".into(),
            ));
        }
        Ok(())
    }
}

/// Shared adaptation state: the elected frame size and the receive-side
/// payload ceiling, read by both outbound paths.
pub struct Adaptation {
    cfg: AdaptationConfig,
    frame_size: AtomicUsize,
    /// Baseline when no link proposes a size this window: the frame size of
    /// any dup==1 rule, else the configured fallback.
    baseline: usize,
    max_payload: usize,
}

impl Adaptation {
    pub fn new(cfg: AdaptationConfig, fallback_frame_size: usize) -> Arc<Self> {
        let fallback = if fallback_frame_size == 0 {
            crate::DEFAULT_FRAME_SIZE
        } else {
            fallback_frame_size
        };
        let baseline = cfg
            .rules
            .iter()
            .find(|r| r.dup == 1)
            .and_then(|r| r.frame_size)
            .unwrap_or(fallback);

        // The receiver tolerates every size the sender might choose.
        let max_payload = cfg
            .rules
            .iter()
            .filter_map(|r| r.frame_size)
            .chain([baseline, fallback])
            .max()
            .unwrap_or(MIN_MAX_PAYLOAD)
            .max(MIN_MAX_PAYLOAD);

        Arc::new(Self {
            cfg,
            frame_size: AtomicUsize::new(baseline),
            baseline,
            max_payload,
        })
    }

    /// Current adaptive frame size, clamped to the receive-side ceiling.
    pub fn frame_size(&self) -> usize {
        self.frame_size.load(Ordering::Relaxed).min(self.max_payload)
    }

    /// Receive-side payload limit for frame decoding.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.cfg.probe_interval_ms.max(1))
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.cfg.window_seconds.max(1))
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Spawn the window ticker over `pool`. Runs until cancelled.
    pub fn spawn_ticker(self: &Arc<Self>, pool: Arc<LinkPool>, shutdown: CancellationToken) {
        if !self.cfg.enabled {
            return;
        }
        let adapt = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(adapt.window());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the first window
            // is full length.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => adapt.tick(&pool),
                }
            }
        });
    }

    /// One window boundary: update per-link multipliers and elect the frame
    /// size.
    fn tick(&self, pool: &LinkPool) {
        let mut candidate: Option<usize> = None;

        for link in pool.snapshot() {
            let (sent, acked) = link.take_window();
            if sent == 0 {
                continue;
            }
            let loss = sent.saturating_sub(acked) as f64 / sent as f64 * 100.0;
            let rule = self
                .cfg
                .rules
                .iter()
                .find(|r| loss < r.loss_below)
                .or_else(|| self.cfg.rules.last());
            let Some(rule) = rule else { continue };

            link.set_multiplier(rule.dup);
            if let Some(size) = rule.frame_size {
                candidate = Some(candidate.map_or(size, |c| c.min(size)));
            }
            debug!(
                peer = %link.peer(),
                sent,
                acked,
                loss_pct = loss,
                dup = link.multiplier(),
                "adaptation window"
            );
        }

        let elected = candidate.unwrap_or(self.baseline).min(self.max_payload);
        let previous = self.frame_size.swap(elected, Ordering::Relaxed);
        if previous != elected {
            info!(from = previous, to = elected, "adaptive frame size changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::Link;

    fn rules() -> Vec<LossRule> {
        vec![
            LossRule {
                loss_below: 1.0,
                dup: 1,
                frame_size: Some(32768),
            },
            LossRule {
                loss_below: 10.0,
                dup: 2,
                frame_size: Some(16384),
            },
            LossRule {
                loss_below: 101.0,
                dup: 4,
                frame_size: Some(4096),
            },
        ]
    }

    fn engine() -> Arc<Adaptation> {
        Adaptation::new(
            AdaptationConfig {
                enabled: true,
                rules: rules(),
                ..Default::default()
            },
            32768,
        )
    }

    async fn async_link_with_window(sent: u64, acked: u64) -> Arc<Link> {
        let link = Link::new(Box::new(tokio::io::sink()), "test".into());
        for i in 0..sent {
            link.send(&crate::protocol::Frame::data(
                1,
                i as u32 + 1,
                bytes::Bytes::from_static(b"x"),
            ))
            .await
            .unwrap();
        }
        for _ in 0..acked {
            link.note_ack();
        }
        link
    }

    #[tokio::test]
    async fn test_clean_window_selects_dup_one() {
        let adapt = engine();
        let pool = LinkPool::new();
        pool.add(async_link_with_window(100, 100).await);
        adapt.tick(&pool);

        assert_eq!(pool.snapshot()[0].multiplier(), 1);
        assert_eq!(adapt.frame_size(), 32768);
    }

    #[tokio::test]
    async fn test_lossy_window_raises_dup_and_shrinks_frames() {
        let adapt = engine();
        let pool = LinkPool::new();
        // 50% loss lands in the last rule.
        pool.add(async_link_with_window(100, 50).await);
        adapt.tick(&pool);

        assert_eq!(pool.snapshot()[0].multiplier(), 4);
        assert_eq!(adapt.frame_size(), 4096);
    }

    #[tokio::test]
    async fn test_minimum_candidate_wins_across_links() {
        let adapt = engine();
        let pool = LinkPool::new();
        pool.add(async_link_with_window(100, 100).await); // proposes 32768
        pool.add(async_link_with_window(100, 95).await); // 5% loss, proposes 16384
        adapt.tick(&pool);

        assert_eq!(adapt.frame_size(), 16384);
    }

    #[tokio::test]
    async fn test_idle_link_skipped_and_baseline_restored() {
        let adapt = engine();
        let pool = LinkPool::new();
        let idle = Link::new(Box::new(tokio::io::sink()), "idle".into());
        idle.set_multiplier(3);
        pool.add(idle);
        adapt.tick(&pool);

        // Idle link keeps its multiplier; frame size falls back to baseline.
        assert_eq!(pool.snapshot()[0].multiplier(), 3);
        assert_eq!(adapt.frame_size(), 32768);
    }

    #[tokio::test]
    async fn test_ack_overrun_clamps_to_zero_loss() {
        let adapt = engine();
        let pool = LinkPool::new();
        // Duplicated sends can be acked more times than this link sent.
        pool.add(async_link_with_window(10, 15).await);
        adapt.tick(&pool);
        assert_eq!(pool.snapshot()[0].multiplier(), 1);
    }

    #[test]
    fn test_validation_rejects_bad_rule_order() {
        let cfg = AdaptationConfig {
            enabled: true,
            rules: vec![
                LossRule {
                    loss_below: 50.0,
                    dup: 2,
                    frame_size: None,
                },
                LossRule {
                    loss_below: 10.0,
                    dup: 1,
                    frame_size: None,
                },
            ],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_requires_full_coverage() {
        let cfg = AdaptationConfig {
            enabled: true,
            rules: vec![LossRule {
                loss_below: 50.0,
                dup: 2,
                frame_size: None,
            }],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_max_payload_covers_all_rule_sizes() {
        let adapt = Adaptation::new(
            AdaptationConfig {
                enabled: true,
                rules: vec![LossRule {
                    loss_below: 101.0,
                    dup: 1,
                    frame_size: Some(128 * 1024),
                }],
                ..Default::default()
            },
            32768,
        );
        assert_eq!(adapt.max_payload(), 128 * 1024);

        // Small configured sizes still leave the conservative floor.
        let small = Adaptation::new(AdaptationConfig::default(), 1024);
        assert_eq!(small.max_payload(), MIN_MAX_PAYLOAD);
    }
}
