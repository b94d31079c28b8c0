//! Alert emission.
//!
//! The alerter turns classified transitions into outbound messages.
//! Emission is idempotent per (position key, alert kind, UTC day): the
//! alert log's unique index is the dedup authority, so suppression
//! survives restarts. Delivery failures are logged and never retried;
//! the next state transition produces a fresh alert.

use crate::db::{self, DbPool};
use crate::error::MonitorResult;
use crate::models::{MarginType, PositionKey, Side};
use crate::monitoring::detector::TransitionKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Alert kinds written to the alert log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Approaching,
    Imminent,
    CollateralAdded,
    PartialLiquidation,
    FullLiquidation,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Approaching => "approaching",
            AlertKind::Imminent => "imminent",
            AlertKind::CollateralAdded => "collateral-added",
            AlertKind::PartialLiquidation => "partial-liquidation",
            AlertKind::FullLiquidation => "full-liquidation",
        }
    }

    pub fn from_transition(kind: TransitionKind) -> Option<AlertKind> {
        match kind {
            TransitionKind::FullLiquidation => Some(AlertKind::FullLiquidation),
            TransitionKind::PartialLiquidation => Some(AlertKind::PartialLiquidation),
            TransitionKind::CollateralAdded => Some(AlertKind::CollateralAdded),
            TransitionKind::Imminent => Some(AlertKind::Imminent),
            TransitionKind::Approaching => Some(AlertKind::Approaching),
            TransitionKind::SilentUpdate => None,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything message formatting needs about one transition.
#[derive(Debug, Clone)]
pub struct AlertContext {
    pub key: PositionKey,
    pub kind: AlertKind,
    pub margin: MarginType,
    pub notional: f64,
    pub prev_notional: Option<f64>,
    pub distance_pct: f64,
    pub prev_distance_pct: Option<f64>,
    pub liq_price: Option<f64>,
    pub mark_price: f64,
    pub emitted_at: DateTime<Utc>,
}

/// Outbound message capability. Injected so tests can capture output
/// and dry runs can print instead of send.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<()>;
}

/// Telegram Bot API sink.
pub struct TelegramSink {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramSink {
    pub fn new(bot_token: String, chat_id: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            bot_token,
            chat_id,
            client,
        })
    }
}

#[async_trait]
impl MessageSink for TelegramSink {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);

        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let response = self.client.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            // Body intentionally not logged; it can echo the URL.
            anyhow::bail!("Telegram API error: {}", status);
        }

        Ok(())
    }
}

/// Sink that logs instead of sending (--dry-run).
pub struct DryRunSink;

#[async_trait]
impl MessageSink for DryRunSink {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        tracing::info!("[dry-run] would send:\n{}", text);
        Ok(())
    }
}

const ALERT_LOCK_SHARDS: usize = 16;

/// Writes alert records and hands messages to the sink.
pub struct Alerter {
    pool: DbPool,
    sink: Arc<dyn MessageSink>,
    /// Sharded by position-key hash so dedup-check-then-send is
    /// ordered per key without a global lock.
    shards: Vec<Mutex<()>>,
    timezone: Tz,
}

impl Alerter {
    pub fn new(pool: DbPool, sink: Arc<dyn MessageSink>, timezone: Tz) -> Self {
        Self {
            pool,
            sink,
            shards: (0..ALERT_LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
            timezone,
        }
    }

    fn shard(&self, key: &PositionKey) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % ALERT_LOCK_SHARDS]
    }

    /// Emit one alert. Returns true when the alert was recorded and
    /// dispatched, false when the dedup log suppressed it.
    pub async fn emit(&self, ctx: &AlertContext) -> MonitorResult<bool> {
        let _guard = self.shard(&ctx.key).lock().await;

        let key_str = ctx.key.to_string();
        let recorded =
            db::try_record_alert(&self.pool, &key_str, ctx.kind.as_str(), ctx.emitted_at).await?;

        if !recorded {
            tracing::debug!(key = %key_str, kind = %ctx.kind, "alert suppressed by dedup log");
            return Ok(false);
        }

        let text = format_alert(ctx, self.timezone);
        if let Err(e) = self.sink.send(&text).await {
            // Not retried: the record stays so the day's dedup holds,
            // and the next transition will produce a fresh alert.
            tracing::error!(key = %key_str, kind = %ctx.kind, error = %e, "alert delivery failed");
        } else {
            tracing::info!(key = %key_str, kind = %ctx.kind, distance = ctx.distance_pct, "alert sent");
        }

        Ok(true)
    }

    /// Send a message that bypasses dedup (summaries, service status).
    pub async fn send_raw(&self, text: &str) {
        if let Err(e) = self.sink.send(text).await {
            tracing::error!(error = %e, "message delivery failed");
        }
    }
}

#[cfg(test)]
impl Alerter {
    pub(crate) fn pool_for_tests(&self) -> DbPool {
        self.pool.clone()
    }
}

// =========================================================================
// Formatting
// =========================================================================

pub fn format_value(value: f64) -> String {
    if value >= 1_000_000.0 {
        format!("${:.1}M", value / 1_000_000.0)
    } else {
        format!("${:.0}K", value / 1_000.0)
    }
}

pub fn format_price(p: f64) -> String {
    if p >= 1000.0 {
        format!("${:.0}", p)
    } else if p >= 1.0 {
        format!("${:.2}", p)
    } else {
        format!("${:.6}", p)
    }
}

fn address_line(address: &str) -> String {
    let display = if address.len() > 12 {
        format!("{}...{}", &address[..6], &address[address.len() - 4..])
    } else {
        address.to_string()
    };
    format!(
        "<a href=\"https://hypurrscan.io/address/{}\">{}</a>",
        address, display
    )
}

fn position_line(ctx: &AlertContext) -> String {
    let side = match ctx.key.side {
        Side::Long => "L",
        Side::Short => "S",
    };
    let margin = match ctx.margin {
        MarginType::Isolated => "Iso",
        MarginType::Cross => "Cross",
    };
    format!(
        "{} | {} | {} | {}",
        ctx.key.token,
        side,
        format_value(ctx.notional),
        margin
    )
}

/// Render one alert in the channel's message style.
pub fn format_alert(ctx: &AlertContext, tz: Tz) -> String {
    let header = match ctx.kind {
        AlertKind::Approaching => "APPROACHING LIQUIDATION",
        AlertKind::Imminent => "🚨 IMMINENT LIQUIDATION",
        AlertKind::CollateralAdded => "🛡 COLLATERAL ADDED",
        AlertKind::PartialLiquidation => "⚠️ PARTIAL LIQUIDATION",
        AlertKind::FullLiquidation => "💥 FULL LIQUIDATION",
    };

    let mut lines = vec![
        header.to_string(),
        String::new(),
        position_line(ctx),
        address_line(&ctx.key.address),
        String::new(),
    ];

    match ctx.kind {
        AlertKind::Approaching | AlertKind::Imminent => {
            let prev = ctx
                .prev_distance_pct
                .map(|d| format!("{:.2}%", d))
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "Liquidation Distance: {} -> <b>{:.2}%</b>",
                prev, ctx.distance_pct
            ));
            if let Some(liq) = ctx.liq_price {
                lines.push(format!(
                    "Liq. Price: {} | Current Price: {}",
                    format_price(liq),
                    format_price(ctx.mark_price)
                ));
            }
        }
        AlertKind::CollateralAdded => {
            if let (Some(_), Some(liq)) = (ctx.prev_distance_pct, ctx.liq_price) {
                lines.push(format!(
                    "Liq. Price moved to {} | Distance now {:.2}%",
                    format_price(liq),
                    ctx.distance_pct
                ));
            }
        }
        AlertKind::PartialLiquidation => {
            if let Some(prev) = ctx.prev_notional {
                lines.push(format!(
                    "Position reduced: {} -> <b>{}</b>",
                    format_value(prev),
                    format_value(ctx.notional)
                ));
            }
        }
        AlertKind::FullLiquidation => {
            lines.push(format!(
                "Position gone (was {} at {:.3}%)",
                format_value(ctx.notional),
                ctx.distance_pct
            ));
            if let Some(liq) = ctx.liq_price {
                lines.push(format!("Liq. Price: {}", format_price(liq)));
            }
        }
    }

    lines.push(String::new());
    let local = ctx.emitted_at.with_timezone(&tz);
    lines.push(local.format("%H:%M:%S %Z").to_string());

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Exchange;
    use parking_lot::Mutex as SyncMutex;

    /// Capturing sink for tests.
    pub struct CaptureSink {
        pub messages: SyncMutex<Vec<String>>,
    }

    impl CaptureSink {
        pub fn new() -> Self {
            Self {
                messages: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageSink for CaptureSink {
        async fn send(&self, text: &str) -> anyhow::Result<()> {
            self.messages.lock().push(text.to_string());
            Ok(())
        }
    }

    fn ctx(kind: AlertKind) -> AlertContext {
        AlertContext {
            key: PositionKey::new("0xabcdef0123456789", "BTC", Exchange::Main, Side::Long),
            kind,
            margin: MarginType::Cross,
            notional: 2_500_000.0,
            prev_notional: Some(3_000_000.0),
            distance_pct: 0.20,
            prev_distance_pct: Some(0.70),
            liq_price: Some(99_000.0),
            mark_price: 99_200.0,
            emitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(2_500_000.0), "$2.5M");
        assert_eq!(format_value(250_000.0), "$250K");
    }

    #[test]
    fn test_format_alert_approaching() {
        let text = format_alert(&ctx(AlertKind::Approaching), chrono_tz::America::New_York);
        assert!(text.contains("APPROACHING LIQUIDATION"));
        assert!(text.contains("BTC | L | $2.5M | Cross"));
        assert!(text.contains("0.70% -> <b>0.20%</b>"));
        assert!(text.contains("hypurrscan.io/address/0xabcdef0123456789"));
    }

    #[test]
    fn test_format_alert_partial() {
        let text = format_alert(
            &ctx(AlertKind::PartialLiquidation),
            chrono_tz::America::New_York,
        );
        assert!(text.contains("PARTIAL LIQUIDATION"));
        assert!(text.contains("$3.0M -> <b>$2.5M</b>"));
    }

    #[tokio::test]
    async fn test_emit_dedups_per_day() {
        let pool = crate::db::tests::memory_pool().await;
        let sink = Arc::new(CaptureSink::new());
        let alerter = Alerter::new(pool, sink.clone(), chrono_tz::America::New_York);

        let context = ctx(AlertKind::Approaching);
        assert!(alerter.emit(&context).await.unwrap());
        assert!(!alerter.emit(&context).await.unwrap());
        assert_eq!(sink.messages.lock().len(), 1);

        // a different kind for the same key still goes out
        let context = ctx(AlertKind::Imminent);
        assert!(alerter.emit(&context).await.unwrap());
        assert_eq!(sink.messages.lock().len(), 2);
    }
}
