//! Discovery loop.
//!
//! Periodically walks the cohort feeds and the wallet registry to find
//! new addresses and new positions. The cycle interval adapts to API
//! pressure: the more critical-tier entries the cache holds, the more
//! upstream budget is reserved for refreshes and the longer discovery
//! waits.
//!
//! Failures are isolated per cohort and per wallet; a bad cycle step
//! is logged and the cycle moves on.

use crate::config::DiscoveryConfig;
use crate::db::{self, DbPool, ScanLogEntry};
use crate::models::{DiscoverySource, Exchange};
use crate::monitoring::liq_history::LiqHistoryStore;
use crate::monitoring::pipeline::Pipeline;
use crate::registry::WalletRegistry;
use crate::upstream::Fetcher;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cohort label recorded for wallets ingested from the liquidation
/// history feed.
const LIQ_HISTORY_COHORT: &str = "liq_history";

#[derive(Debug, Default)]
struct CycleStats {
    new_from_cohorts: usize,
    new_from_liq_history: usize,
    wallets_scanned: usize,
    positions_found: usize,
}

pub struct DiscoveryLoop {
    registry: Arc<WalletRegistry>,
    pipeline: Pipeline,
    fetcher: Arc<Fetcher>,
    liq_history: LiqHistoryStore,
    pool: DbPool,
    cfg: DiscoveryConfig,
    cancel: CancellationToken,
}

impl DiscoveryLoop {
    pub fn new(
        registry: Arc<WalletRegistry>,
        pipeline: Pipeline,
        fetcher: Arc<Fetcher>,
        liq_history: LiqHistoryStore,
        pool: DbPool,
        cfg: DiscoveryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            pipeline,
            fetcher,
            liq_history,
            pool,
            cfg,
            cancel,
        }
    }

    pub async fn run(self) {
        tracing::info!("discovery loop started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let started = Utc::now();
            let cycle_start = Instant::now();
            match self.run_cycle().await {
                Ok(stats) => {
                    let duration = cycle_start.elapsed().as_secs_f64();
                    tracing::info!(
                        wallets = stats.wallets_scanned,
                        new_cohort = stats.new_from_cohorts,
                        new_liq_history = stats.new_from_liq_history,
                        positions = stats.positions_found,
                        duration_secs = duration,
                        "discovery cycle complete"
                    );

                    let entry = ScanLogEntry {
                        started_at: started,
                        duration_secs: duration,
                        wallets_scanned: stats.wallets_scanned as i64,
                        new_from_cohorts: stats.new_from_cohorts as i64,
                        new_from_liq_history: stats.new_from_liq_history as i64,
                        positions_found: stats.positions_found as i64,
                        notes: None,
                    };
                    if let Err(e) = db::insert_scan_log(&self.pool, &entry).await {
                        tracing::warn!(error = %e, "failed to record scan snapshot");
                    }
                    if let Err(e) =
                        db::set_state(&self.pool, "last_discovery", &started.to_rfc3339()).await
                    {
                        tracing::warn!(error = %e, "failed to record discovery timestamp");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "discovery cycle failed");
                }
            }

            let interval = self.next_interval();
            tracing::debug!(minutes = interval.as_secs() / 60, "next discovery in");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        tracing::info!("discovery loop stopped");
    }

    /// Adaptive interval: lengthens with the critical-tier population
    /// to conserve upstream budget for refreshes.
    fn next_interval(&self) -> Duration {
        let critical = self.pipeline.cache.critical_count() as f64;
        let minutes = 30.0 * (1.0 + critical / 10.0);
        let clamped = minutes
            .max(self.cfg.min_interval_minutes as f64)
            .min(self.cfg.max_interval_minutes as f64);
        Duration::from_secs((clamped * 60.0) as u64)
    }

    async fn run_cycle(&self) -> crate::error::MonitorResult<CycleStats> {
        let mut stats = CycleStats::default();

        self.discover_cohorts(&mut stats).await;
        self.ingest_liq_history(&mut stats).await;

        let marks = self.fetch_marks().await;
        self.scan_due_wallets(&marks, &mut stats).await;

        Ok(stats)
    }

    /// Walk every configured cohort, page by page, and upsert the
    /// wallets that clear the registration filters.
    async fn discover_cohorts(&self, stats: &mut CycleStats) {
        for cohort_id in &self.cfg.cohorts {
            if self.cancel.is_cancelled() {
                return;
            }

            let mut offset: u32 = 0;
            loop {
                let page = match self
                    .fetcher
                    .get_cohort_page(cohort_id, offset, self.cfg.page_size)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::warn!(cohort = %cohort_id, offset, error = %e, "cohort page failed");
                        break;
                    }
                };

                let count = page.traders.len();
                for trader in &page.traders {
                    // No position value means no liquidation exposure
                    // worth scanning; unleveraged long-only wallets
                    // cannot be liquidated either.
                    if trader.total_notional < self.cfg.min_wallet_value {
                        continue;
                    }
                    if trader.leverage() <= 1.0 && trader.is_pure_long() {
                        continue;
                    }

                    match self
                        .registry
                        .upsert(
                            &trader.address,
                            DiscoverySource::Cohort,
                            Some(cohort_id),
                            Some(trader.total_notional),
                        )
                        .await
                    {
                        Ok(true) => stats.new_from_cohorts += 1,
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(address = %trader.address, error = %e, "registry upsert failed")
                        }
                    }
                }

                if !page.has_more || count == 0 {
                    break;
                }
                offset += count as u32;
                tokio::time::sleep(Duration::from_millis(self.cfg.page_delay_ms)).await;
            }
        }
    }

    /// Register addresses appended by the liquidation-history import.
    async fn ingest_liq_history(&self, stats: &mut CycleStats) {
        let addresses = match self
            .liq_history
            .addresses_for_discovery(self.cfg.liq_history_min_notional)
            .await
        {
            Ok(addresses) => addresses,
            Err(e) => {
                tracing::warn!(error = %e, "liquidation history read failed");
                return;
            }
        };

        for (address, _max_notional) in addresses {
            match self
                .registry
                .upsert(
                    &address,
                    DiscoverySource::LiquidationHistory,
                    Some(LIQ_HISTORY_COHORT),
                    None,
                )
                .await
            {
                Ok(true) => stats.new_from_liq_history += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(address = %address, error = %e, "registry upsert failed")
                }
            }
        }
    }

    /// One `allMids` per exchange, reused for every wallet this cycle.
    async fn fetch_marks(&self) -> HashMap<Exchange, HashMap<String, f64>> {
        let mut marks = HashMap::new();
        for exchange in Exchange::ALL {
            match self.fetcher.get_mark_prices(exchange).await {
                Ok(prices) => {
                    marks.insert(exchange, prices);
                }
                Err(e) => {
                    tracing::warn!(%exchange, error = %e, "mark price fetch failed");
                }
            }
        }
        marks
    }

    /// Scan every due wallet across all exchanges, feed surviving
    /// positions through the pipeline, and record the scan.
    async fn scan_due_wallets(
        &self,
        marks: &HashMap<Exchange, HashMap<String, f64>>,
        stats: &mut CycleStats,
    ) {
        let due = self.registry.iter_due(Utc::now());
        tracing::info!(due = due.len(), "scanning due wallets");

        for wallet in due {
            if self.cancel.is_cancelled() {
                return;
            }

            let results = self
                .fetcher
                .get_positions_all_exchanges(&wallet.address)
                .await;

            let mut aggregate_value = 0.0;
            let mut positions_found = 0usize;
            let mut any_success = false;

            for (exchange, result) in results {
                match result {
                    Ok(observations) => {
                        any_success = true;
                        positions_found += observations.len();
                        aggregate_value += observations.iter().map(|p| p.notional).sum::<f64>();

                        let applied = self
                            .pipeline
                            .apply_wallet_fetch(
                                &wallet.address,
                                exchange,
                                observations,
                                marks.get(&exchange),
                                true,
                                Instant::now(),
                            )
                            .await;
                        stats.positions_found += applied.inserted + applied.updated;
                    }
                    Err(e) => {
                        // Skipped this cycle; absence of positions on a
                        // failed exchange is NOT a liquidation signal.
                        tracing::warn!(
                            wallet = %wallet.address,
                            %exchange,
                            error = %e,
                            "wallet scan failed for exchange"
                        );
                    }
                }
            }

            if any_success {
                stats.wallets_scanned += 1;
                if let Err(e) = self
                    .registry
                    .mark_scanned(&wallet.address, aggregate_value, positions_found)
                    .await
                {
                    tracing::warn!(wallet = %wallet.address, error = %e, "mark_scanned failed");
                }
            }
        }
    }
}
