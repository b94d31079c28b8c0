//! Observation application pipeline.
//!
//! One successful wallet/exchange fetch covers every position that
//! wallet holds on that exchange, so both the refresh scheduler and
//! the discovery loop funnel their results through here: matched
//! entries go through the detector, unmatched cached keys are treated
//! as full liquidations, and (during discovery) unseen positions that
//! clear the filters are inserted.

use crate::alerts::Alerter;
use crate::config::MonitorConfig;
use crate::db::CacheWriterHandle;
use crate::models::{distance_to_liquidation, Exchange, Position};
use crate::monitoring::cache::{PositionCache, RefreshOutcome};
use crate::registry::WalletRegistry;
use crate::thresholds::NotionalThresholds;
use crate::upstream::info::lookup_mark;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;

/// Counters from one applied fetch.
#[derive(Debug, Default)]
pub struct AppliedStats {
    pub inserted: usize,
    pub updated: usize,
    pub evicted: usize,
    pub liquidated: usize,
    pub alerts: usize,
}

/// Shared between the refresh scheduler and the discovery loop.
#[derive(Clone)]
pub struct Pipeline {
    pub cache: Arc<PositionCache>,
    pub alerter: Arc<Alerter>,
    pub writer: CacheWriterHandle,
    pub thresholds: Arc<NotionalThresholds>,
    /// Supplies the cohort label for newly inserted positions
    pub registry: Option<Arc<WalletRegistry>>,
    pub cfg: MonitorConfig,
}

impl Pipeline {
    /// Apply the positions returned by one successful wallet/exchange
    /// fetch. `insert_new` is set by the discovery loop; the refresh
    /// scheduler only updates entries it already watches.
    pub async fn apply_wallet_fetch(
        &self,
        address: &str,
        exchange: Exchange,
        observations: Vec<Position>,
        marks: Option<&HashMap<String, f64>>,
        insert_new: bool,
        now: Instant,
    ) -> AppliedStats {
        let mut stats = AppliedStats::default();
        let cached_keys = self.cache.keys_for(address, exchange);
        let observed: HashSet<_> = observations.iter().map(|p| p.key.clone()).collect();

        for obs in observations {
            let key = obs.key.clone();
            let min_notional = self.thresholds.min_notional(
                &key.token,
                key.exchange,
                obs.effective_margin(),
            );
            let mark_hint = marks.and_then(|m| lookup_mark(m, &key.token));

            if self.cache.contains(&key) {
                match self.cache.refresh(&key, &obs, mark_hint, min_notional, now) {
                    RefreshOutcome::Updated { alert, snapshot, .. } => {
                        stats.updated += 1;
                        self.writer.save(snapshot);
                        if let Some(ctx) = alert {
                            match self.alerter.emit(&ctx).await {
                                Ok(true) => stats.alerts += 1,
                                Ok(false) => {}
                                Err(e) => {
                                    tracing::error!(key = %key, error = %e, "alert emission failed")
                                }
                            }
                        }
                    }
                    RefreshOutcome::Evicted { reason } => {
                        stats.evicted += 1;
                        self.writer.delete(&key);
                        tracing::debug!(key = %key, ?reason, "position evicted");
                    }
                    RefreshOutcome::Stale => {
                        // Straggler discarded; keep the entry scheduled.
                        self.cache.reschedule(&key, now);
                    }
                    RefreshOutcome::NotFound => {}
                }
            } else if insert_new {
                if let Some(stored) = self.try_insert(obs, mark_hint, min_notional, now) {
                    stats.inserted += 1;
                    self.writer.save(stored);
                }
            }
        }

        // Keys the fetch no longer returned: the position is gone.
        // This branch only runs after a successful fetch, so absence
        // means full liquidation, not a transport error.
        for key in cached_keys {
            if observed.contains(&key) {
                continue;
            }
            if let Some(ctx) = self.cache.remove_liquidated(&key) {
                stats.liquidated += 1;
                self.writer.delete(&key);
                tracing::warn!(
                    key = %key,
                    notional = ctx.notional,
                    distance = ctx.distance_pct,
                    "position disappeared, treating as full liquidation"
                );
                match self.alerter.emit(&ctx).await {
                    Ok(true) => stats.alerts += 1,
                    Ok(false) => {}
                    Err(e) => tracing::error!(key = %key, error = %e, "alert emission failed"),
                }
            }
        }

        stats
    }

    /// Insert filter chain for a position seen for the first time:
    /// a liquidation price must be present, notional must clear the
    /// token threshold, and distance must sit inside (0, max_watch].
    fn try_insert(
        &self,
        obs: Position,
        mark_hint: Option<f64>,
        min_notional: f64,
        now: Instant,
    ) -> Option<crate::db::StoredPosition> {
        let liq = obs.liq_price?;

        if obs.notional < min_notional {
            return None;
        }

        let mark = mark_hint.or_else(|| {
            if obs.size > 0.0 {
                Some(obs.notional / obs.size)
            } else {
                None
            }
        })?;
        if mark <= 0.0 {
            return None;
        }

        let distance = distance_to_liquidation(obs.key.side, mark, liq);
        if distance <= 0.0 || distance > self.cfg.max_watch_pct {
            return None;
        }

        let cohort = self
            .registry
            .as_ref()
            .and_then(|r| r.get(&obs.key.address))
            .and_then(|w| w.cohort);

        Some(self.cache.insert(obs, mark, distance, cohort, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertKind, Alerter, MessageSink};
    use crate::models::{MarginType, PositionKey, Side};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicBool;
    use tokio_util::sync::CancellationToken;

    struct CaptureSink {
        messages: SyncMutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSink for CaptureSink {
        async fn send(&self, text: &str) -> anyhow::Result<()> {
            self.messages.lock().push(text.to_string());
            Ok(())
        }
    }

    async fn pipeline() -> (Pipeline, Arc<CaptureSink>) {
        let pool = crate::db::tests::memory_pool().await;
        let sink = Arc::new(CaptureSink {
            messages: SyncMutex::new(Vec::new()),
        });
        let alerter = Arc::new(Alerter::new(
            pool.clone(),
            sink.clone(),
            chrono_tz::America::New_York,
        ));
        let cancel = CancellationToken::new();
        let (writer, _task) = crate::db::spawn_cache_writer(
            pool,
            std::time::Duration::from_millis(50),
            cancel,
            Arc::new(AtomicBool::new(false)),
        );

        let cfg = MonitorConfig::default();
        (
            Pipeline {
                cache: Arc::new(PositionCache::new(cfg.clone())),
                alerter,
                writer,
                thresholds: Arc::new(NotionalThresholds::default()),
                registry: None,
                cfg,
            },
            sink,
        )
    }

    fn btc_obs(liq: f64, size: f64, notional: f64) -> Position {
        Position {
            key: PositionKey::new("0xaa", "BTC", Exchange::Main, Side::Long),
            size,
            entry_price: 100_000.0,
            leverage: 10.0,
            margin_type: MarginType::Cross,
            notional,
            liq_price: Some(liq),
            margin_used: 0.0,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_discovery_inserts_refresh_does_not() {
        let (pipeline, _sink) = pipeline().await;
        let now = Instant::now();

        // refresh mode ignores unknown keys
        let stats = pipeline
            .apply_wallet_fetch(
                "0xaa",
                Exchange::Main,
                vec![btc_obs(99_000.0, 2000.0, 200_000_000.0)],
                None,
                false,
                now,
            )
            .await;
        assert_eq!(stats.inserted, 0);
        assert!(pipeline.cache.is_empty());

        // discovery mode inserts it
        let stats = pipeline
            .apply_wallet_fetch(
                "0xaa",
                Exchange::Main,
                vec![btc_obs(99_000.0, 2000.0, 200_000_000.0)],
                None,
                true,
                now,
            )
            .await;
        assert_eq!(stats.inserted, 1);
        assert_eq!(pipeline.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_filters_below_threshold() {
        let (pipeline, _sink) = pipeline().await;

        // $50M BTC cross is below the $100M threshold
        let stats = pipeline
            .apply_wallet_fetch(
                "0xaa",
                Exchange::Main,
                vec![btc_obs(99_000.0, 500.0, 50_000_000.0)],
                None,
                true,
                Instant::now(),
            )
            .await;
        assert_eq!(stats.inserted, 0);
    }

    #[tokio::test]
    async fn test_missing_key_emits_full_liquidation() {
        let (pipeline, sink) = pipeline().await;
        let now = Instant::now();

        pipeline
            .apply_wallet_fetch(
                "0xaa",
                Exchange::Main,
                vec![btc_obs(99_000.0, 2000.0, 200_000_000.0)],
                None,
                true,
                now,
            )
            .await;
        assert_eq!(pipeline.cache.len(), 1);

        // next successful fetch returns nothing for this wallet
        let stats = pipeline
            .apply_wallet_fetch("0xaa", Exchange::Main, vec![], None, false, now)
            .await;
        assert_eq!(stats.liquidated, 1);
        assert!(pipeline.cache.is_empty());

        let messages = sink.messages.lock();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("FULL LIQUIDATION"));
    }

    #[tokio::test]
    async fn test_update_emits_alert_once() {
        let (pipeline, sink) = pipeline().await;
        let now = Instant::now();

        pipeline
            .apply_wallet_fetch(
                "0xaa",
                Exchange::Main,
                vec![btc_obs(99_000.0, 2000.0, 200_000_000.0)],
                None,
                true,
                now,
            )
            .await;

        // mark near liq: distance 0.2%
        let mut marks = HashMap::new();
        marks.insert("BTC".to_string(), 99_198.4);
        let stats = pipeline
            .apply_wallet_fetch(
                "0xaa",
                Exchange::Main,
                vec![btc_obs(99_000.0, 2000.0, 198_396_800.0)],
                Some(&marks),
                false,
                now,
            )
            .await;
        assert_eq!(stats.alerts, 1);
        assert!(sink.messages.lock()[0].contains("APPROACHING"));

        // same state again: flag set, nothing new
        let stats = pipeline
            .apply_wallet_fetch(
                "0xaa",
                Exchange::Main,
                vec![btc_obs(99_000.0, 2000.0, 198_396_800.0)],
                Some(&marks),
                false,
                now,
            )
            .await;
        assert_eq!(stats.alerts, 0);
    }

    #[tokio::test]
    async fn test_collateral_added_flow() {
        let (pipeline, sink) = pipeline().await;
        let now = Instant::now();

        // ETH long, liq 3480, mark 3500: distance ~0.57%
        let mut obs = btc_obs(3_480.0, 30_000.0, 105_000_000.0);
        obs.key = PositionKey::new("0xaa", "ETH", Exchange::Main, Side::Long);
        obs.entry_price = 3_500.0;
        pipeline
            .apply_wallet_fetch("0xaa", Exchange::Main, vec![obs.clone()], None, true, now)
            .await;

        // margin added: liq moves to 3400, size unchanged
        let mut marks = HashMap::new();
        marks.insert("ETH".to_string(), 3_500.0);
        obs.liq_price = Some(3_400.0);
        obs.observed_at = Utc::now();
        let stats = pipeline
            .apply_wallet_fetch("0xaa", Exchange::Main, vec![obs], Some(&marks), false, now)
            .await;

        assert_eq!(stats.alerts, 1);
        let messages = sink.messages.lock();
        assert!(messages[0].contains("COLLATERAL ADDED"));

        // verify the kind that got logged is collateral-added
        drop(messages);
        let key = PositionKey::new("0xaa", "ETH", Exchange::Main, Side::Long);
        assert_eq!(
            crate::db::count_alerts(
                &pipeline.alerter_pool(),
                &key.to_string(),
                AlertKind::CollateralAdded.as_str()
            )
            .await
            .unwrap(),
            1
        );
    }
}

#[cfg(test)]
impl Pipeline {
    fn alerter_pool(&self) -> crate::db::DbPool {
        self.alerter.pool_for_tests()
    }
}
