//! Rate-limited upstream fetcher.
//!
//! Serializes all upstream calls behind a semaphore, paces successive
//! requests, and retries transient failures with full-jitter
//! exponential backoff. Parse failures are never retried.

use crate::config::UpstreamConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::models::{Exchange, Position};
use crate::upstream::cohort::{CohortPage, CohortRequest, CohortResponse};
use crate::upstream::info::{parse_mids, parse_positions, ClearinghouseState};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};

struct Pacing {
    last_completed: Option<Instant>,
    burst_count: u32,
}

/// Concurrency gate plus typed query operations against the upstream.
pub struct Fetcher {
    client: reqwest::Client,
    permits: Semaphore,
    pacing: Mutex<Pacing>,
    cfg: UpstreamConfig,
}

impl Fetcher {
    pub fn new(cfg: UpstreamConfig) -> MonitorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| MonitorError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            permits: Semaphore::new(cfg.max_in_flight),
            pacing: Mutex::new(Pacing {
                last_completed: None,
                burst_count: 0,
            }),
            cfg,
        })
    }

    /// Fetch a wallet's positions on one exchange.
    pub async fn get_positions(
        &self,
        address: &str,
        exchange: Exchange,
    ) -> MonitorResult<Vec<Position>> {
        let body = serde_json::json!({
            "type": "clearinghouseState",
            "user": address,
            "dex": exchange.dex_tag(),
        });

        let value = self.post_json(&self.cfg.info_url, &body).await?;
        let state: ClearinghouseState = serde_json::from_value(value)
            .map_err(|e| MonitorError::MalformedResponse(format!("clearinghouseState: {}", e)))?;

        parse_positions(state, address, exchange, Utc::now())
    }

    /// Fetch a wallet's positions across every exchange, separating
    /// successive sub-exchange queries by the configured gap. Each
    /// exchange carries its own result so callers can tell a failed
    /// fetch apart from an empty wallet.
    pub async fn get_positions_all_exchanges(
        &self,
        address: &str,
    ) -> Vec<(Exchange, MonitorResult<Vec<Position>>)> {
        let mut results = Vec::with_capacity(Exchange::ALL.len());
        for (i, exchange) in Exchange::ALL.iter().enumerate() {
            if i > 0 {
                sleep(Duration::from_millis(self.cfg.dex_gap_ms)).await;
            }
            results.push((*exchange, self.get_positions(address, *exchange).await));
        }
        results
    }

    /// Fetch the mark price map for one exchange.
    pub async fn get_mark_prices(&self, exchange: Exchange) -> MonitorResult<HashMap<String, f64>> {
        let body = serde_json::json!({
            "type": "allMids",
            "dex": exchange.dex_tag(),
        });

        let value = self.post_json(&self.cfg.info_url, &body).await?;
        let raw: HashMap<String, String> = serde_json::from_value(value)
            .map_err(|e| MonitorError::MalformedResponse(format!("allMids: {}", e)))?;

        parse_mids(raw)
    }

    /// Fetch one page of a discovery cohort.
    pub async fn get_cohort_page(
        &self,
        cohort_id: &str,
        offset: u32,
        limit: u32,
    ) -> MonitorResult<CohortPage> {
        let body = serde_json::to_value(CohortRequest::new(cohort_id, offset, limit))
            .map_err(|e| MonitorError::Internal(e.to_string()))?;

        let value = self.post_json(&self.cfg.cohort_url, &body).await?;
        let resp: CohortResponse = serde_json::from_value(value)
            .map_err(|e| MonitorError::MalformedResponse(format!("cohort page: {}", e)))?;

        if !resp.errors.is_empty() {
            return Err(MonitorError::MalformedResponse(format!(
                "cohort query errors: {}",
                serde_json::to_string(&resp.errors).unwrap_or_default()
            )));
        }

        let traders = resp
            .data
            .and_then(|d| d.analytics.size_cohort)
            .map(|c| c.top_traders)
            .ok_or_else(|| {
                MonitorError::MalformedResponse("cohort response missing data".to_string())
            })?;

        Ok(CohortPage {
            has_more: traders.has_more,
            traders: traders.traders,
        })
    }

    /// POST a JSON body with admission control, pacing, and retries.
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> MonitorResult<serde_json::Value> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MonitorError::Internal("fetcher semaphore closed".to_string()))?;

        let mut last_error = String::new();

        for attempt in 0..self.cfg.max_attempts {
            if attempt > 0 {
                sleep(self.backoff_delay(attempt - 1)).await;
            }

            self.pace().await;
            let result = self.client.post(url).json(body).send().await;
            self.mark_completed().await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_error = format!("status {}", status);
                        tracing::warn!(
                            url,
                            %status,
                            attempt = attempt + 1,
                            "upstream throttled or erroring, backing off"
                        );
                        continue;
                    }
                    if !status.is_success() {
                        // Other 4xx means the request itself is wrong;
                        // retrying cannot help.
                        return Err(MonitorError::MalformedResponse(format!(
                            "unexpected status {}",
                            status
                        )));
                    }
                    return resp
                        .json::<serde_json::Value>()
                        .await
                        .map_err(|e| MonitorError::MalformedResponse(e.to_string()));
                }
                Err(e) => {
                    // Network errors and timeouts follow the same
                    // backoff policy as 429/5xx.
                    last_error = e.to_string();
                    tracing::warn!(
                        url,
                        error = %e,
                        attempt = attempt + 1,
                        "upstream request failed, backing off"
                    );
                }
            }
        }

        Err(MonitorError::TransientUpstream(format!(
            "{} attempts exhausted: {}",
            self.cfg.max_attempts, last_error
        )))
    }

    /// Full-jitter exponential backoff: uniform in [0, min(base * 2^n, cap)].
    fn backoff_delay(&self, failures: u32) -> Duration {
        let ceiling = self
            .cfg
            .backoff_base_ms
            .saturating_mul(1u64 << failures.min(16))
            .min(self.cfg.backoff_cap_ms);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Enforce the inter-request delay and per-burst pause.
    async fn pace(&self) {
        let wait = {
            let mut p = self.pacing.lock().await;
            let mut wait = Duration::ZERO;

            if let Some(last) = p.last_completed {
                let d_req = Duration::from_millis(self.cfg.request_delay_ms);
                let elapsed = last.elapsed();
                if elapsed < d_req {
                    wait = d_req - elapsed;
                }
            }

            p.burst_count += 1;
            if self.cfg.burst_size > 0 && p.burst_count % self.cfg.burst_size == 0 {
                wait += Duration::from_millis(self.cfg.batch_pause_ms);
            }
            wait
        };

        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn mark_completed(&self) {
        self.pacing.lock().await.last_completed = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> UpstreamConfig {
        UpstreamConfig {
            request_delay_ms: 40,
            burst_size: 3,
            batch_pause_ms: 80,
            ..UpstreamConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pace_enforces_request_delay() {
        let fetcher = Fetcher::new(test_cfg()).unwrap();

        fetcher.pace().await;
        fetcher.mark_completed().await;

        let start = Instant::now();
        fetcher.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn test_pace_injects_batch_pause() {
        let fetcher = Fetcher::new(test_cfg()).unwrap();

        // Third pace call completes a burst and adds the batch pause.
        fetcher.pace().await;
        fetcher.mark_completed().await;
        fetcher.pace().await;
        fetcher.mark_completed().await;

        let start = Instant::now();
        fetcher.pace().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_delay_bounded() {
        let mut cfg = test_cfg();
        cfg.backoff_base_ms = 1000;
        cfg.backoff_cap_ms = 60_000;
        let fetcher = Fetcher::new(cfg).unwrap();

        for failures in 0..10 {
            let d = fetcher.backoff_delay(failures);
            assert!(d <= Duration::from_millis(60_000));
        }
        // first retry never exceeds the base
        assert!(fetcher.backoff_delay(0) <= Duration::from_millis(1000));
    }
}
