//! Persistence properties: restart round-trip, restart idempotence of
//! alerts, registry monotonicity, staleness rejection, and the
//! per-day alert dedup.

mod common;

use common::{btc_long, mark_for_distance, memory_pool, rig, settle};
use chrono::Utc;
use harrier_monitor::config::MonitorConfig;
use harrier_monitor::db;
use harrier_monitor::models::{DiscoverySource, Exchange};
use harrier_monitor::monitoring::cache::{PositionCache, RefreshOutcome};
use harrier_monitor::registry::{RegistryPolicy, WalletRegistry};
use std::collections::HashMap;
use tokio::time::Instant;

fn marks(mark: f64) -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("BTC".to_string(), mark);
    m
}

/// Serialize, reload, and compare: the reconstructed entry equals the
/// persisted one modulo scheduling state.
#[tokio::test]
async fn test_cache_round_trip() {
    let rig = rig().await;
    let now = Instant::now();
    let liq = 99_000.0;
    let mark = mark_for_distance(liq, 0.20);

    rig.pipeline
        .apply_wallet_fetch(
            "0xaa",
            Exchange::Main,
            vec![btc_long(2_000.0, mark, Some(liq))],
            Some(&marks(mark)),
            true,
            now,
        )
        .await;
    // cross the approaching threshold so a flag is set; persist the
    // changed snapshots like the scheduler does
    let outcome = rig
        .pipeline
        .cache
        .apply_mark_prices(Exchange::Main, &marks(mark), now);
    for snapshot in outcome.changed {
        rig.pipeline.writer.save(snapshot);
    }
    for ctx in outcome.alerts {
        rig.pipeline.alerter.emit(&ctx).await.unwrap();
    }
    settle().await;

    let stored = db::load_position_cache(&rig.pool).await.unwrap();
    assert_eq!(stored.len(), 1);

    let original = rig.pipeline.cache.snapshot_all().pop().unwrap();
    let row = &stored[0];
    assert_eq!(row.key, original.position.key);
    assert_eq!(row.liq_price, original.position.liq_price);
    assert_eq!(row.notional, original.position.notional);
    assert_eq!(row.tier, original.tier);
    assert_eq!(row.approaching_alerted, original.approaching_alerted);
    assert_eq!(row.critical_alerted, original.critical_alerted);

    // reload into a fresh cache
    let cache2 = PositionCache::new(MonitorConfig::default());
    for row in stored {
        cache2.restore(row, false, Instant::now());
    }
    let restored = cache2.get(&original.position.key).unwrap();
    assert_eq!(restored.distance_pct, original.distance_pct);
    assert_eq!(restored.approaching_alerted, original.approaching_alerted);
}

/// Restart idempotence: a persisted approaching flag suppresses the
/// re-alert, but a later imminent crossing still fires.
#[tokio::test]
async fn test_restart_does_not_realert() {
    let rig = rig().await;
    let now = Instant::now();
    let liq = 99_000.0;

    rig.pipeline
        .apply_wallet_fetch(
            "0xaa",
            Exchange::Main,
            vec![btc_long(2_000.0, 100_000.0, Some(liq))],
            Some(&marks(100_000.0)),
            true,
            now,
        )
        .await;

    // approaching fires at 0.20; flag change is persisted
    let mark = mark_for_distance(liq, 0.20);
    let outcome = rig
        .pipeline
        .cache
        .apply_mark_prices(Exchange::Main, &marks(mark), now);
    for snapshot in outcome.changed {
        rig.pipeline.writer.save(snapshot);
    }
    for ctx in outcome.alerts {
        rig.pipeline.alerter.emit(&ctx).await.unwrap();
    }
    assert_eq!(rig.sink.count(), 1);
    settle().await;

    // "restart": rebuild the cache from the store, same alert log
    let stored = db::load_position_cache(&rig.pool).await.unwrap();
    let cache2 = PositionCache::new(MonitorConfig::default());
    for row in stored {
        cache2.restore(row, false, Instant::now());
    }

    // 0.22% after restart: flag persisted, no event
    let mark = mark_for_distance(liq, 0.22);
    let outcome = cache2.apply_mark_prices(Exchange::Main, &marks(mark), now);
    assert!(outcome.alerts.is_empty());

    // 0.10%: a different kind, still fires
    let mark = mark_for_distance(liq, 0.10);
    let outcome = cache2.apply_mark_prices(Exchange::Main, &marks(mark), now);
    assert_eq!(outcome.alerts.len(), 1);
    let ctx = &outcome.alerts[0];
    assert!(rig.pipeline.alerter.emit(ctx).await.unwrap());
    assert_eq!(rig.sink.count(), 2);
}

/// The wallet registry never shrinks, clear-cache included.
#[tokio::test]
async fn test_registry_monotonic_across_clear_cache() {
    let pool = memory_pool().await;
    let policy = RegistryPolicy {
        active_threshold: 60_000.0,
        infrequent_rescan_hours: 24,
    };
    let registry = WalletRegistry::load(pool.clone(), policy.clone())
        .await
        .unwrap();

    let mut count = 0usize;
    for round in 0..3 {
        for i in 0..5 {
            let address = format!("0x{:02}{:02}", round, i);
            registry
                .upsert(&address, DiscoverySource::Cohort, Some("whale"), None)
                .await
                .unwrap();
        }
        count += 5;

        db::clear_position_cache(&pool).await.unwrap();
        assert_eq!(db::count_wallets(&pool).await.unwrap() as usize, count);
    }

    // clear-db keeps the address set too
    db::clear_core_tables(&pool).await.unwrap();
    assert_eq!(db::count_wallets(&pool).await.unwrap() as usize, count);

    let reloaded = WalletRegistry::load(pool, policy).await.unwrap();
    assert_eq!(reloaded.len(), count);
}

/// Observations applied out of order converge to the in-order state.
#[tokio::test]
async fn test_straggler_observation_discarded() {
    let rig = rig().await;
    let now = Instant::now();
    let liq = 99_000.0;
    let mark = mark_for_distance(liq, 1.0);

    rig.pipeline
        .apply_wallet_fetch(
            "0xaa",
            Exchange::Main,
            vec![btc_long(2_000.0, mark, Some(liq))],
            Some(&marks(mark)),
            true,
            now,
        )
        .await;
    let key = rig.pipeline.cache.snapshot_all()[0].position.key.clone();

    // O2 (newer, size 1500) applies first
    let mut o2 = btc_long(1_500.0, mark, Some(liq));
    o2.observed_at = Utc::now() + chrono::Duration::seconds(10);
    // O1 (older, size 1800) arrives late
    let mut o1 = btc_long(1_800.0, mark, Some(liq));
    o1.observed_at = Utc::now() + chrono::Duration::seconds(5);

    let r2 = rig.pipeline.cache.refresh(&key, &o2, Some(mark), 0.0, now);
    assert!(matches!(r2, RefreshOutcome::Updated { .. }));

    let r1 = rig.pipeline.cache.refresh(&key, &o1, Some(mark), 0.0, now);
    assert!(matches!(r1, RefreshOutcome::Stale));

    // final state reflects O2
    assert_eq!(rig.pipeline.cache.get(&key).unwrap().position.size, 1_500.0);
}

/// At most one alert record per (key, kind, day).
#[tokio::test]
async fn test_alert_log_unique_per_day() {
    let pool = memory_pool().await;
    let now = Utc::now();

    for _ in 0..5 {
        db::try_record_alert(&pool, "k1", "approaching", now)
            .await
            .unwrap();
    }
    assert_eq!(db::count_alerts(&pool, "k1", "approaching").await.unwrap(), 1);

    // a different day bucket admits a new record
    let tomorrow = now + chrono::Duration::days(1);
    assert!(db::try_record_alert(&pool, "k1", "approaching", tomorrow)
        .await
        .unwrap());
    assert_eq!(db::count_alerts(&pool, "k1", "approaching").await.unwrap(), 2);
}

/// Stale snapshots (older than the revalidation window) restore in a
/// provisional state that cannot alert until refreshed.
#[tokio::test]
async fn test_stale_restore_requires_revalidation() {
    let rig = rig().await;
    let now = Instant::now();
    let liq = 99_000.0;
    let mark = mark_for_distance(liq, 1.0);

    rig.pipeline
        .apply_wallet_fetch(
            "0xaa",
            Exchange::Main,
            vec![btc_long(2_000.0, mark, Some(liq))],
            Some(&marks(mark)),
            true,
            now,
        )
        .await;
    settle().await;

    let stored = db::load_position_cache(&rig.pool).await.unwrap();
    let cache2 = PositionCache::new(MonitorConfig::default());
    for row in stored {
        cache2.restore(row, true, Instant::now());
    }
    let key = cache2.snapshot_all()[0].position.key.clone();

    // sweeps cannot alert while provisional
    let close = mark_for_distance(liq, 0.10);
    let outcome = cache2.apply_mark_prices(Exchange::Main, &marks(close), now);
    assert!(outcome.alerts.is_empty());

    // a full refresh revalidates and alerting resumes
    let mut fresh = btc_long(2_000.0, close, Some(liq));
    fresh.observed_at = Utc::now() + chrono::Duration::seconds(5);
    let outcome = cache2.refresh(&key, &fresh, Some(close), 0.0, now);
    match outcome {
        RefreshOutcome::Updated { alert, .. } => assert!(alert.is_some()),
        other => panic!("expected Updated, got {:?}", other),
    }
    assert!(!cache2.get(&key).unwrap().needs_revalidation);
}
