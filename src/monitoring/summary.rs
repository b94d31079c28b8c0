//! Daily summary scheduler.
//!
//! At configured wall-clock times (Eastern by default) the current
//! cache is grouped by tier and sent as a single message. No dedup;
//! each scheduled instant fires once.

use crate::alerts::{format_price, format_value, Alerter};
use crate::config::{parse_summary_time, SummaryConfig};
use crate::models::Side;
use crate::monitoring::cache::{CachedPosition, PositionCache, Tier};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct SummaryScheduler {
    cache: Arc<PositionCache>,
    alerter: Arc<Alerter>,
    times: Vec<(u32, u32)>,
    tz: Tz,
    cancel: CancellationToken,
}

impl SummaryScheduler {
    pub fn new(
        cache: Arc<PositionCache>,
        alerter: Arc<Alerter>,
        cfg: &SummaryConfig,
        cancel: CancellationToken,
    ) -> Self {
        let tz: Tz = cfg
            .timezone
            .parse()
            .unwrap_or(chrono_tz::America::New_York);
        let times = cfg
            .times
            .iter()
            .filter_map(|t| parse_summary_time(t))
            .collect();

        Self {
            cache,
            alerter,
            times,
            tz,
            cancel,
        }
    }

    pub async fn run(self) {
        if self.times.is_empty() {
            tracing::warn!("no summary times configured, summary scheduler idle");
            return;
        }
        tracing::info!(times = ?self.times, tz = %self.tz, "summary scheduler started");

        loop {
            let now = Utc::now();
            let next = next_occurrence(now, &self.times, self.tz);
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    let text = build_summary(&self.cache.snapshot_all(), next.with_timezone(&self.tz));
                    self.alerter.send_raw(&text).await;
                    tracing::info!("daily summary sent");
                }
            }
        }

        tracing::info!("summary scheduler stopped");
    }
}

/// The earliest configured wall-clock instant strictly after `now`.
pub fn next_occurrence(now: DateTime<Utc>, times: &[(u32, u32)], tz: Tz) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let today = local_now.date_naive();

    let mut best: Option<DateTime<Utc>> = None;
    for &(hour, minute) in times {
        for day_offset in 0..2 {
            let date = today + ChronoDuration::days(day_offset);
            let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                continue;
            };
            // DST gaps: take the earliest valid interpretation
            let Some(local) = tz.from_local_datetime(&naive).earliest() else {
                continue;
            };
            let candidate = local.with_timezone(&Utc);
            if candidate > now {
                best = Some(match best {
                    Some(current) if current <= candidate => current,
                    _ => candidate,
                });
                break;
            }
        }
    }

    best.unwrap_or(now + ChronoDuration::days(1))
}

/// Render the tier-grouped watchlist summary.
pub fn build_summary(positions: &[CachedPosition], at: DateTime<Tz>) -> String {
    let mut lines = vec![
        "<b>DAILY WATCHLIST SUMMARY</b>".to_string(),
        String::new(),
        format!("Watching {} positions", positions.len()),
    ];

    for tier in [Tier::Critical, Tier::High, Tier::Normal] {
        let mut group: Vec<&CachedPosition> =
            positions.iter().filter(|p| p.tier == tier).collect();
        if group.is_empty() {
            continue;
        }
        group.sort_by(|a, b| {
            a.distance_pct
                .partial_cmp(&b.distance_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        lines.push(String::new());
        let label = match tier {
            Tier::Critical => "Critical",
            Tier::High => "High",
            Tier::Normal => "Normal",
        };
        lines.push(format!("<b>{} ({})</b>", label, group.len()));

        for pos in group {
            let side = match pos.position.key.side {
                Side::Long => "L",
                Side::Short => "S",
            };
            let liq = pos
                .position
                .liq_price
                .map(format_price)
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "{} | {} | {} | {:.2}% | liq {}",
                pos.position.key.token,
                side,
                format_value(pos.position.notional),
                pos.distance_pct,
                liq
            ));
        }
    }

    lines.push(String::new());
    lines.push(at.format("%H:%M:%S %Z").to_string());
    lines.join("\n")
}
