//! Wallet registry.
//!
//! An append-only set of addresses driving what the discovery loop
//! scans. Records are only ever added or updated; `clear-cache` and
//! `clear-db` never shrink it. Persistence is write-through: the
//! in-memory map mutates under a short lock and the row is written to
//! SQLite outside it.

use crate::db::{self, DbPool};
use crate::error::MonitorResult;
use crate::models::{DiscoverySource, ScanFrequency, WalletRecord};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// A wallet due for scanning this discovery cycle.
#[derive(Debug, Clone)]
pub struct DueWallet {
    pub address: String,
    pub cohort: Option<String>,
}

/// Registry configuration knobs.
#[derive(Debug, Clone)]
pub struct RegistryPolicy {
    /// Aggregate value at or above which a wallet scans every cycle
    pub active_threshold: f64,
    /// Rescan interval for infrequent wallets
    pub infrequent_rescan_hours: i64,
}

pub struct WalletRegistry {
    inner: RwLock<HashMap<String, WalletRecord>>,
    pool: DbPool,
    policy: RegistryPolicy,
}

impl WalletRegistry {
    /// Load the registry from its persisted table.
    pub async fn load(pool: DbPool, policy: RegistryPolicy) -> MonitorResult<Self> {
        let wallets = db::load_wallets(&pool).await?;
        let mut map = HashMap::with_capacity(wallets.len());
        for wallet in wallets {
            map.insert(wallet.address.clone(), wallet);
        }
        tracing::info!(wallets = map.len(), "wallet registry loaded");

        Ok(Self {
            inner: RwLock::new(map),
            pool,
            policy,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn get(&self, address: &str) -> Option<WalletRecord> {
        self.inner.read().get(&address.to_ascii_lowercase()).cloned()
    }

    /// Add or merge a wallet. Merge rules when an address is
    /// rediscovered: earliest first_seen wins, source tags union, a
    /// non-null cohort label beats an absent one. Returns whether the
    /// address was new.
    pub async fn upsert(
        &self,
        address: &str,
        source: DiscoverySource,
        cohort: Option<&str>,
        aggregate_value: Option<f64>,
    ) -> MonitorResult<bool> {
        let now = Utc::now();
        let (record, is_new) = {
            let mut inner = self.inner.write();
            let address = address.to_ascii_lowercase();

            match inner.get_mut(&address) {
                Some(existing) => {
                    existing.sources.insert(source);
                    if cohort.is_some() {
                        existing.cohort = cohort.map(|c| c.to_string());
                    }
                    if let Some(value) = aggregate_value {
                        existing.last_value = Some(value);
                    }
                    (existing.clone(), false)
                }
                None => {
                    let mut record = WalletRecord::new(&address, source, now);
                    record.cohort = cohort.map(|c| c.to_string());
                    record.last_value = aggregate_value;
                    inner.insert(address, record.clone());
                    (record, true)
                }
            }
        };

        db::upsert_wallet(&self.pool, &record).await?;
        Ok(is_new)
    }

    /// Record a completed scan. The frequency class is recomputed here:
    /// wallets at or above the active threshold scan every cycle,
    /// everyone else drops to the infrequent class.
    pub async fn mark_scanned(
        &self,
        address: &str,
        aggregate_value: f64,
        _positions_found: usize,
    ) -> MonitorResult<()> {
        let now = Utc::now();
        let record = {
            let mut inner = self.inner.write();
            let Some(record) = inner.get_mut(&address.to_ascii_lowercase()) else {
                return Ok(());
            };
            record.last_value = Some(aggregate_value);
            record.last_scanned = Some(now);
            record.scan_count += 1;
            record.frequency = if aggregate_value >= self.policy.active_threshold {
                ScanFrequency::Normal
            } else {
                ScanFrequency::Infrequent
            };
            record.clone()
        };

        db::upsert_wallet(&self.pool, &record).await?;
        Ok(())
    }

    /// Wallets due for scanning at a discovery-cycle start: never
    /// scanned, normal frequency, or infrequent past the rescan
    /// interval.
    pub fn iter_due(&self, now: DateTime<Utc>) -> Vec<DueWallet> {
        let rescan = Duration::hours(self.policy.infrequent_rescan_hours);
        self.inner
            .read()
            .values()
            .filter(|record| match (record.frequency, record.last_scanned) {
                (_, None) => true,
                (ScanFrequency::Normal, Some(_)) => true,
                (ScanFrequency::Infrequent, Some(last)) => now - last >= rescan,
            })
            .map(|record| DueWallet {
                address: record.address.clone(),
                cohort: record.cohort.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RegistryPolicy {
        RegistryPolicy {
            active_threshold: 60_000.0,
            infrequent_rescan_hours: 24,
        }
    }

    async fn registry() -> WalletRegistry {
        let pool = crate::db::tests::memory_pool().await;
        WalletRegistry::load(pool, policy()).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_merges_sources_and_cohort() {
        let reg = registry().await;

        assert!(reg
            .upsert("0xAA", DiscoverySource::Cohort, Some("whale"), Some(1e6))
            .await
            .unwrap());
        // rediscovered from a different feed: union, not replace
        assert!(!reg
            .upsert("0xaa", DiscoverySource::LiquidationHistory, None, None)
            .await
            .unwrap());

        let record = reg.get("0xAA").unwrap();
        assert_eq!(record.sources.len(), 2);
        // non-null cohort label is kept
        assert_eq!(record.cohort.as_deref(), Some("whale"));
        assert_eq!(record.last_value, Some(1e6));
    }

    #[tokio::test]
    async fn test_mark_scanned_reclassifies() {
        let reg = registry().await;
        reg.upsert("0xAA", DiscoverySource::Cohort, None, None)
            .await
            .unwrap();

        reg.mark_scanned("0xAA", 100_000.0, 2).await.unwrap();
        assert_eq!(reg.get("0xAA").unwrap().frequency, ScanFrequency::Normal);

        // value dropped below the active threshold: demoted
        reg.mark_scanned("0xAA", 10_000.0, 1).await.unwrap();
        let record = reg.get("0xAA").unwrap();
        assert_eq!(record.frequency, ScanFrequency::Infrequent);
        assert_eq!(record.scan_count, 2);

        // and promoted again on recovery
        reg.mark_scanned("0xAA", 80_000.0, 1).await.unwrap();
        assert_eq!(reg.get("0xAA").unwrap().frequency, ScanFrequency::Normal);
    }

    #[tokio::test]
    async fn test_iter_due() {
        let reg = registry().await;
        let now = Utc::now();

        reg.upsert("0xAA", DiscoverySource::Cohort, None, None)
            .await
            .unwrap();
        reg.upsert("0xBB", DiscoverySource::Cohort, None, None)
            .await
            .unwrap();
        reg.upsert("0xCC", DiscoverySource::Cohort, None, None)
            .await
            .unwrap();

        // never-scanned wallets are all due
        assert_eq!(reg.iter_due(now).len(), 3);

        // 0xAA stays normal, 0xBB drops to infrequent
        reg.mark_scanned("0xAA", 100_000.0, 1).await.unwrap();
        reg.mark_scanned("0xBB", 1_000.0, 0).await.unwrap();

        let due: Vec<String> = reg.iter_due(now).into_iter().map(|w| w.address).collect();
        assert!(due.contains(&"0xaa".to_string()));
        assert!(!due.contains(&"0xbb".to_string()));
        assert!(due.contains(&"0xcc".to_string()));

        // infrequent wallets come due after the rescan interval
        let later = now + Duration::hours(25);
        let due: Vec<String> = reg.iter_due(later).into_iter().map(|w| w.address).collect();
        assert!(due.contains(&"0xbb".to_string()));
    }

    #[tokio::test]
    async fn test_registry_survives_reload() {
        let pool = crate::db::tests::memory_pool().await;
        {
            let reg = WalletRegistry::load(pool.clone(), policy()).await.unwrap();
            reg.upsert("0xAA", DiscoverySource::Manual, Some("manual"), None)
                .await
                .unwrap();
            reg.mark_scanned("0xAA", 50_000.0, 3).await.unwrap();
        }

        let reg = WalletRegistry::load(pool, policy()).await.unwrap();
        let record = reg.get("0xAA").unwrap();
        assert_eq!(record.frequency, ScanFrequency::Infrequent);
        assert_eq!(record.scan_count, 1);
        assert!(record.sources.contains(&DiscoverySource::Manual));
    }
}
