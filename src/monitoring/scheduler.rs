//! Tiered refresh scheduler.
//!
//! A single-writer control loop: pick the cached position with the
//! earliest due deadline, coalesce every other due-soon position on
//! the same wallet/exchange into one upstream call, run the result
//! through the pipeline, and sleep until the next deadline when
//! nothing is due. A mark-price sweep runs on its own cadence between
//! refreshes so distances track the market even for positions whose
//! full refresh is seconds away.
//!
//! Errors inside one refresh never escape the loop; the affected batch
//! is pushed back one period and the cycle continues.

use crate::config::{MonitorConfig, UpstreamConfig};
use crate::models::{Exchange, PositionKey};
use crate::monitoring::cache::NextDue;
use crate::monitoring::pipeline::Pipeline;
use crate::upstream::Fetcher;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct RefreshScheduler {
    pipeline: Pipeline,
    fetcher: Arc<Fetcher>,
    monitor_cfg: MonitorConfig,
    upstream_cfg: UpstreamConfig,
    cancel: CancellationToken,
    /// Latest mark prices per exchange, refreshed by the sweep
    marks: HashMap<Exchange, HashMap<String, f64>>,
}

impl RefreshScheduler {
    pub fn new(
        pipeline: Pipeline,
        fetcher: Arc<Fetcher>,
        monitor_cfg: MonitorConfig,
        upstream_cfg: UpstreamConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            fetcher,
            monitor_cfg,
            upstream_cfg,
            cancel,
            marks: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        tracing::info!("refresh scheduler started");
        let sweep_period = Duration::from_millis(self.monitor_cfg.price_sweep_ms);
        let mut last_sweep: Option<Instant> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let now = Instant::now();
            let sweep_due = last_sweep
                .map(|t| now.duration_since(t) >= sweep_period)
                .unwrap_or(true);
            if sweep_due {
                self.price_sweep(now).await;
                last_sweep = Some(now);
            }
            let next_sweep = last_sweep.unwrap_or(now) + sweep_period;

            match self.pipeline.cache.next_due(Instant::now()) {
                NextDue::Due(key) => {
                    self.refresh_batch(key).await;
                }
                NextDue::SleepUntil(deadline) => {
                    let wake = deadline.min(next_sweep);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
                NextDue::Empty => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep_until(next_sweep) => {}
                    }
                }
            }
        }

        tracing::info!("refresh scheduler stopped");
    }

    /// Fetch fresh mids for every exchange with cached entries and
    /// re-derive distances. Threshold crossings alert from here; a
    /// failed exchange is skipped until the next sweep.
    async fn price_sweep(&mut self, now: Instant) {
        for exchange in self.pipeline.cache.exchanges_present() {
            match self.fetcher.get_mark_prices(exchange).await {
                Ok(prices) => {
                    let outcome = self.pipeline.cache.apply_mark_prices(exchange, &prices, now);

                    for snapshot in outcome.changed {
                        self.pipeline.writer.save(snapshot);
                    }
                    for key in &outcome.evicted {
                        self.pipeline.writer.delete(key);
                        tracing::debug!(key = %key, "position evicted on price sweep");
                    }
                    for ctx in outcome.alerts {
                        if let Err(e) = self.pipeline.alerter.emit(&ctx).await {
                            tracing::error!(key = %ctx.key, error = %e, "alert emission failed");
                        }
                    }

                    self.marks.insert(exchange, prices);
                }
                Err(e) => {
                    tracing::warn!(%exchange, error = %e, "mark price sweep failed, skipping");
                }
            }
        }
    }

    /// Refresh one due position plus everything coalescable with it.
    async fn refresh_batch(&mut self, seed: PositionKey) {
        let now = Instant::now();
        let window = Duration::from_millis(self.upstream_cfg.request_delay_ms);
        let batch = self.pipeline.cache.collect_batch(&seed, now, window);

        match self
            .fetcher
            .get_positions(&seed.address, seed.exchange)
            .await
        {
            Ok(observations) => {
                let marks = self.marks.get(&seed.exchange);
                let stats = self
                    .pipeline
                    .apply_wallet_fetch(
                        &seed.address,
                        seed.exchange,
                        observations,
                        marks,
                        false,
                        Instant::now(),
                    )
                    .await;

                tracing::trace!(
                    wallet = %seed.address,
                    exchange = %seed.exchange,
                    batch = batch.len(),
                    updated = stats.updated,
                    liquidated = stats.liquidated,
                    "refresh applied"
                );
            }
            Err(e) => {
                // Skip this cycle; push the whole batch back one
                // period so it is not retried in a tight loop.
                tracing::warn!(
                    wallet = %seed.address,
                    exchange = %seed.exchange,
                    error = %e,
                    "refresh fetch failed, deferring batch"
                );
                let now = Instant::now();
                for key in &batch {
                    self.pipeline.cache.reschedule(key, now);
                }
            }
        }
    }
}
