//! Shared helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use harrier_monitor::alerts::{Alerter, MessageSink};
use harrier_monitor::config::{DatabaseConfig, MonitorConfig};
use harrier_monitor::db::{self, DbPool};
use harrier_monitor::models::{Exchange, MarginType, Position, PositionKey, Side};
use harrier_monitor::monitoring::cache::PositionCache;
use harrier_monitor::monitoring::pipeline::Pipeline;
use harrier_monitor::thresholds::NotionalThresholds;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sink that records every outbound message.
pub struct CaptureSink {
    pub messages: Mutex<Vec<String>>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

#[async_trait]
impl MessageSink for CaptureSink {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        self.messages.lock().push(text.to_string());
        Ok(())
    }
}

pub async fn memory_pool() -> DbPool {
    let config = DatabaseConfig {
        path: PathBuf::from(":memory:"),
        max_connections: 1,
        write_batch_ms: 50,
    };
    let pool = db::init_pool(&config).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

pub struct TestRig {
    pub pipeline: Pipeline,
    pub pool: DbPool,
    pub sink: Arc<CaptureSink>,
    pub cancel: CancellationToken,
}

/// Build a pipeline over an in-memory store with a capturing sink.
pub async fn rig() -> TestRig {
    let pool = memory_pool().await;
    let sink = CaptureSink::new();
    let alerter = Arc::new(Alerter::new(
        pool.clone(),
        sink.clone(),
        chrono_tz::America::New_York,
    ));
    let cancel = CancellationToken::new();
    let (writer, _task) = db::spawn_cache_writer(
        pool.clone(),
        Duration::from_millis(50),
        cancel.clone(),
        Arc::new(AtomicBool::new(false)),
    );

    let cfg = MonitorConfig::default();
    TestRig {
        pipeline: Pipeline {
            cache: Arc::new(PositionCache::new(cfg.clone())),
            alerter,
            writer,
            thresholds: Arc::new(NotionalThresholds::default()),
            registry: None,
            cfg,
        },
        pool,
        sink,
        cancel,
    }
}

/// A BTC long for wallet `0xaa` on the main exchange. Notional is
/// kept consistent with the implied mark (notional = size * mark).
pub fn btc_long(size: f64, mark: f64, liq: Option<f64>) -> Position {
    Position {
        key: PositionKey::new("0xaa", "BTC", Exchange::Main, Side::Long),
        size,
        entry_price: 100_000.0,
        leverage: 20.0,
        margin_type: MarginType::Cross,
        notional: size * mark,
        liq_price: liq,
        margin_used: 0.0,
        observed_at: Utc::now(),
    }
}

/// Mark price that puts a long at the given distance from `liq`.
pub fn mark_for_distance(liq: f64, distance_pct: f64) -> f64 {
    liq / (1.0 - distance_pct / 100.0)
}

/// Wait for the batched writer to flush.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
