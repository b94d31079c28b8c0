//! Database module for Harrier Monitor
//!
//! Manages the SQLite connection pool with WAL mode and provides
//! operations for the wallet registry, the position-cache snapshot,
//! and the alert log. Position-cache writes are batched through a
//! writer task; registry and alert writes are synchronous.

use crate::config::DatabaseConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::models::{Exchange, MarginType, PositionKey, ScanFrequency, Side, WalletRecord};
use crate::monitoring::cache::Tier;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Type alias for the SQLite connection pool
pub type DbPool = Pool<Sqlite>;

const SCHEMA: &str = include_str!("../database/schema.sql");

/// Initialize the database connection pool
pub async fn init_pool(config: &DatabaseConfig) -> MonitorResult<DbPool> {
    if let Some(parent) = config.path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MonitorError::Internal(format!("failed to create database directory: {}", e))
            })?;
            info!("Created database directory: {:?}", parent);
        }
    }

    let db_url = if config.path.as_os_str() == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite:{}?mode=rwc", config.path.display())
    };

    let connect_options = SqliteConnectOptions::from_str(&db_url)
        .map_err(MonitorError::Persistence)?
        // WAL mode for concurrent reads
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await?;

    info!(
        "Database pool initialized: {:?} (max {} connections)",
        config.path, config.max_connections
    );

    Ok(pool)
}

/// Apply the embedded schema. Statements are idempotent.
pub async fn run_migrations(pool: &DbPool) -> MonitorResult<()> {
    for statement in SCHEMA.split(';') {
        let stmt = statement.trim();
        if stmt.is_empty() {
            continue;
        }
        sqlx::query(stmt).execute(pool).await?;
    }

    info!("Database schema applied");
    Ok(())
}

fn parse_ts(value: &str) -> MonitorResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| MonitorError::Internal(format!("bad timestamp {:?}: {}", value, e)))
}

// =========================================================================
// Wallet registry
// =========================================================================

/// Insert or replace a wallet registry row (write-through from the
/// in-memory registry; the merge logic lives there).
pub async fn upsert_wallet(pool: &DbPool, record: &WalletRecord) -> MonitorResult<()> {
    sqlx::query(
        r#"
        INSERT INTO wallet_registry (
            address, sources, cohort, last_value, frequency,
            first_seen, last_scanned, scan_count
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(address) DO UPDATE SET
            sources = excluded.sources,
            cohort = excluded.cohort,
            last_value = excluded.last_value,
            frequency = excluded.frequency,
            first_seen = excluded.first_seen,
            last_scanned = excluded.last_scanned,
            scan_count = excluded.scan_count
        "#,
    )
    .bind(&record.address)
    .bind(record.sources_str())
    .bind(&record.cohort)
    .bind(record.last_value)
    .bind(record.frequency.as_str())
    .bind(record.first_seen.to_rfc3339())
    .bind(record.last_scanned.map(|t| t.to_rfc3339()))
    .bind(record.scan_count)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load every wallet registry row.
pub async fn load_wallets(pool: &DbPool) -> MonitorResult<Vec<WalletRecord>> {
    let rows = sqlx::query("SELECT * FROM wallet_registry")
        .fetch_all(pool)
        .await?;

    let mut wallets = Vec::with_capacity(rows.len());
    for row in rows {
        let sources: String = row.try_get("sources")?;
        let first_seen: String = row.try_get("first_seen")?;
        let last_scanned: Option<String> = row.try_get("last_scanned")?;
        let frequency: String = row.try_get("frequency")?;

        wallets.push(WalletRecord {
            address: row.try_get("address")?,
            sources: WalletRecord::parse_sources(&sources),
            cohort: row.try_get("cohort")?,
            last_value: row.try_get("last_value")?,
            frequency: ScanFrequency::parse(&frequency).unwrap_or(ScanFrequency::Normal),
            first_seen: parse_ts(&first_seen)?,
            last_scanned: match last_scanned {
                Some(ts) => Some(parse_ts(&ts)?),
                None => None,
            },
            scan_count: row.try_get("scan_count")?,
        });
    }

    Ok(wallets)
}

pub async fn count_wallets(pool: &DbPool) -> MonitorResult<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM wallet_registry")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

// =========================================================================
// Position cache snapshot
// =========================================================================

/// One persisted position-cache row.
#[derive(Debug, Clone)]
pub struct StoredPosition {
    pub key: PositionKey,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub liq_price: Option<f64>,
    pub notional: f64,
    pub leverage: f64,
    pub margin_type: MarginType,
    pub cohort: Option<String>,
    pub tier: Tier,
    pub distance_pct: f64,
    pub approaching_alerted: bool,
    pub critical_alerted: bool,
    pub prev_liq_price: Option<f64>,
    pub prev_notional: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

fn stored_from_row(row: &SqliteRow) -> MonitorResult<StoredPosition> {
    let address: String = row.try_get("address")?;
    let token: String = row.try_get("token")?;
    let exchange: String = row.try_get("exchange")?;
    let side: String = row.try_get("side")?;
    let margin_type: String = row.try_get("margin_type")?;
    let tier: String = row.try_get("tier")?;
    let last_updated: String = row.try_get("last_updated")?;

    let exchange = Exchange::parse(&exchange)
        .ok_or_else(|| MonitorError::Internal(format!("unknown exchange {:?}", exchange)))?;
    let side = Side::parse(&side)
        .ok_or_else(|| MonitorError::Internal(format!("unknown side {:?}", side)))?;

    Ok(StoredPosition {
        key: PositionKey::new(&address, &token, exchange, side),
        size: row.try_get("size")?,
        entry_price: row.try_get("entry_price")?,
        mark_price: row.try_get("mark_price")?,
        liq_price: row.try_get("liq_price")?,
        notional: row.try_get("notional")?,
        leverage: row.try_get("leverage")?,
        margin_type: MarginType::parse(&margin_type).unwrap_or(MarginType::Cross),
        cohort: row.try_get("cohort")?,
        tier: Tier::parse(&tier).unwrap_or(Tier::Normal),
        distance_pct: row.try_get("distance_pct")?,
        approaching_alerted: row.try_get::<i64, _>("approaching_alerted")? != 0,
        critical_alerted: row.try_get::<i64, _>("critical_alerted")? != 0,
        prev_liq_price: row.try_get("prev_liq_price")?,
        prev_notional: row.try_get("prev_notional")?,
        last_updated: parse_ts(&last_updated)?,
    })
}

/// Load the persisted cache snapshot.
pub async fn load_position_cache(pool: &DbPool) -> MonitorResult<Vec<StoredPosition>> {
    let rows = sqlx::query("SELECT * FROM position_cache")
        .fetch_all(pool)
        .await?;

    rows.iter().map(stored_from_row).collect()
}

async fn upsert_position_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    pos: &StoredPosition,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO position_cache (
            position_key, address, token, exchange, side,
            size, entry_price, mark_price, liq_price, notional,
            leverage, margin_type, cohort, tier, distance_pct,
            approaching_alerted, critical_alerted,
            prev_liq_price, prev_notional, last_updated
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(position_key) DO UPDATE SET
            size = excluded.size,
            entry_price = excluded.entry_price,
            mark_price = excluded.mark_price,
            liq_price = excluded.liq_price,
            notional = excluded.notional,
            leverage = excluded.leverage,
            margin_type = excluded.margin_type,
            cohort = excluded.cohort,
            tier = excluded.tier,
            distance_pct = excluded.distance_pct,
            approaching_alerted = excluded.approaching_alerted,
            critical_alerted = excluded.critical_alerted,
            prev_liq_price = excluded.prev_liq_price,
            prev_notional = excluded.prev_notional,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(pos.key.to_string())
    .bind(&pos.key.address)
    .bind(&pos.key.token)
    .bind(pos.key.exchange.as_str())
    .bind(pos.key.side.as_str())
    .bind(pos.size)
    .bind(pos.entry_price)
    .bind(pos.mark_price)
    .bind(pos.liq_price)
    .bind(pos.notional)
    .bind(pos.leverage)
    .bind(pos.margin_type.as_str())
    .bind(&pos.cohort)
    .bind(pos.tier.as_str())
    .bind(pos.distance_pct)
    .bind(pos.approaching_alerted as i64)
    .bind(pos.critical_alerted as i64)
    .bind(pos.prev_liq_price)
    .bind(pos.prev_notional)
    .bind(pos.last_updated.to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Truncate the position cache only (the registry is preserved).
pub async fn clear_position_cache(pool: &DbPool) -> MonitorResult<u64> {
    let result = sqlx::query("DELETE FROM position_cache").execute(pool).await?;
    Ok(result.rows_affected())
}

/// Truncate all core tables. Wallet-source history survives: registry
/// rows keep address, sources, cohort, and first_seen, but scan state
/// is reset.
pub async fn clear_core_tables(pool: &DbPool) -> MonitorResult<()> {
    sqlx::query("DELETE FROM position_cache").execute(pool).await?;
    sqlx::query("DELETE FROM alert_log").execute(pool).await?;
    sqlx::query("DELETE FROM scan_log").execute(pool).await?;
    sqlx::query("DELETE FROM service_state").execute(pool).await?;
    sqlx::query(
        "UPDATE wallet_registry SET last_value = NULL, frequency = 'normal', \
         last_scanned = NULL, scan_count = 0",
    )
    .execute(pool)
    .await?;
    Ok(())
}

// =========================================================================
// Alert log
// =========================================================================

/// Record an alert emission. Returns false when a matching
/// (position, kind, day) record already exists, in which case the
/// alert must be suppressed.
pub async fn try_record_alert(
    pool: &DbPool,
    position_key: &str,
    kind: &str,
    emitted_at: DateTime<Utc>,
) -> MonitorResult<bool> {
    let day_bucket = emitted_at.format("%Y-%m-%d").to_string();

    let result = sqlx::query(
        r#"
        INSERT INTO alert_log (position_key, kind, emitted_at, day_bucket)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(position_key, kind, day_bucket) DO NOTHING
        "#,
    )
    .bind(position_key)
    .bind(kind)
    .bind(emitted_at.to_rfc3339())
    .bind(day_bucket)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn count_alerts(pool: &DbPool, position_key: &str, kind: &str) -> MonitorResult<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM alert_log WHERE position_key = ? AND kind = ?")
            .bind(position_key)
            .bind(kind)
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

// =========================================================================
// Scan log and service state
// =========================================================================

/// One row per discovery cycle.
pub struct ScanLogEntry {
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub wallets_scanned: i64,
    pub new_from_cohorts: i64,
    pub new_from_liq_history: i64,
    pub positions_found: i64,
    pub notes: Option<String>,
}

pub async fn insert_scan_log(pool: &DbPool, entry: &ScanLogEntry) -> MonitorResult<()> {
    sqlx::query(
        r#"
        INSERT INTO scan_log (
            started_at, duration_secs, wallets_scanned,
            new_from_cohorts, new_from_liq_history, positions_found, notes
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.started_at.to_rfc3339())
    .bind(entry.duration_secs)
    .bind(entry.wallets_scanned)
    .bind(entry.new_from_cohorts)
    .bind(entry.new_from_liq_history)
    .bind(entry.positions_found)
    .bind(&entry.notes)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_state(pool: &DbPool, key: &str, value: &str) -> MonitorResult<()> {
    sqlx::query(
        r#"
        INSERT INTO service_state (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_state(pool: &DbPool, key: &str) -> MonitorResult<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM service_state WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v))
}

// =========================================================================
// Batched cache writer
// =========================================================================

/// A pending position-cache write.
#[derive(Debug, Clone)]
pub enum CacheWrite {
    Upsert(Box<StoredPosition>),
    Delete(String),
}

/// Handle for enqueueing batched cache writes.
#[derive(Clone)]
pub struct CacheWriterHandle {
    tx: mpsc::UnboundedSender<CacheWrite>,
}

impl CacheWriterHandle {
    pub fn save(&self, pos: StoredPosition) {
        let _ = self.tx.send(CacheWrite::Upsert(Box::new(pos)));
    }

    pub fn delete(&self, key: &PositionKey) {
        let _ = self.tx.send(CacheWrite::Delete(key.to_string()));
    }
}

/// Writer failures past this count are treated as a sustained
/// persistence failure and bring the daemon down.
const WRITER_FATAL_FAILURES: u32 = 10;

/// Spawn the batched cache writer. Writes are coalesced per key over
/// the configured window so critical-tier refresh churn does not
/// amplify into the store. On cancellation the pending batch is
/// flushed before exit.
pub fn spawn_cache_writer(
    pool: DbPool,
    batch_window: Duration,
    cancel: CancellationToken,
    fatal: Arc<AtomicBool>,
) -> (CacheWriterHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<CacheWrite>();

    let handle = tokio::spawn(async move {
        let mut pending: HashMap<String, CacheWrite> = HashMap::new();
        let mut failures: u32 = 0;
        let mut ticker = tokio::time::interval(batch_window);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain whatever is still queued, then final flush.
                    while let Ok(write) = rx.try_recv() {
                        coalesce(&mut pending, write);
                    }
                    if let Err(e) = flush(&pool, &mut pending).await {
                        error!(error = %e, "final cache flush failed");
                    }
                    info!("cache writer stopped");
                    return;
                }
                write = rx.recv() => {
                    match write {
                        Some(write) => coalesce(&mut pending, write),
                        None => return,
                    }
                }
                _ = ticker.tick() => {
                    if pending.is_empty() {
                        continue;
                    }
                    match flush(&pool, &mut pending).await {
                        Ok(count) => {
                            failures = 0;
                            tracing::debug!(rows = count, "flushed cache batch");
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(error = %e, failures, "cache batch flush failed, backing off");
                            if failures >= WRITER_FATAL_FAILURES {
                                error!("sustained persistence failure, shutting down");
                                fatal.store(true, Ordering::SeqCst);
                                cancel.cancel();
                                return;
                            }
                            // In-memory state keeps advancing; retry later.
                            let backoff = Duration::from_secs(1 << failures.min(6));
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
            }
        }
    });

    (CacheWriterHandle { tx }, handle)
}

fn coalesce(pending: &mut HashMap<String, CacheWrite>, write: CacheWrite) {
    let key = match &write {
        CacheWrite::Upsert(pos) => pos.key.to_string(),
        CacheWrite::Delete(key) => key.clone(),
    };
    pending.insert(key, write);
}

async fn flush(pool: &DbPool, pending: &mut HashMap<String, CacheWrite>) -> MonitorResult<usize> {
    if pending.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    for write in pending.values() {
        match write {
            CacheWrite::Upsert(pos) => upsert_position_tx(&mut tx, pos).await?,
            CacheWrite::Delete(key) => {
                sqlx::query("DELETE FROM position_cache WHERE position_key = ?")
                    .bind(key)
                    .execute(&mut *tx)
                    .await?;
            }
        }
    }
    tx.commit().await?;

    let count = pending.len();
    pending.clear();
    Ok(count)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    pub(crate) async fn memory_pool() -> DbPool {
        let config = DatabaseConfig {
            path: PathBuf::from(":memory:"),
            max_connections: 1,
            write_batch_ms: 50,
        };
        let pool = init_pool(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_pool_and_schema() {
        let pool = memory_pool().await;
        assert_eq!(count_wallets(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_alert_dedup() {
        let pool = memory_pool().await;
        let now = Utc::now();

        assert!(try_record_alert(&pool, "k", "approaching", now).await.unwrap());
        // same key/kind/day is suppressed
        assert!(!try_record_alert(&pool, "k", "approaching", now).await.unwrap());
        // a different kind on the same day is not
        assert!(try_record_alert(&pool, "k", "imminent", now).await.unwrap());

        assert_eq!(count_alerts(&pool, "k", "approaching").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_service_state_roundtrip() {
        let pool = memory_pool().await;
        assert_eq!(get_state(&pool, "last_discovery").await.unwrap(), None);
        set_state(&pool, "last_discovery", "2026-01-01T00:00:00Z").await.unwrap();
        assert_eq!(
            get_state(&pool, "last_discovery").await.unwrap().as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
    }
}
