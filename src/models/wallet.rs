//! Wallet registry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Where a wallet address was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoverySource {
    Cohort,
    LiquidationHistory,
    Manual,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::Cohort => "cohort",
            DiscoverySource::LiquidationHistory => "liquidation-history",
            DiscoverySource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<DiscoverySource> {
        match s {
            "cohort" => Some(DiscoverySource::Cohort),
            "liquidation-history" => Some(DiscoverySource::LiquidationHistory),
            "manual" => Some(DiscoverySource::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scan frequency class, recomputed after every scan from the wallet's
/// aggregate position value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanFrequency {
    Normal,
    Infrequent,
}

impl ScanFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanFrequency::Normal => "normal",
            ScanFrequency::Infrequent => "infrequent",
        }
    }

    pub fn parse(s: &str) -> Option<ScanFrequency> {
        match s {
            "normal" => Some(ScanFrequency::Normal),
            "infrequent" => Some(ScanFrequency::Infrequent),
            _ => None,
        }
    }
}

/// A wallet known to the registry. Wallets are only ever added or
/// updated, never removed.
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub address: String,
    /// Union of every source that has produced this address
    pub sources: BTreeSet<DiscoverySource>,
    pub cohort: Option<String>,
    /// Aggregate position value observed at the last scan
    pub last_value: Option<f64>,
    pub frequency: ScanFrequency,
    pub first_seen: DateTime<Utc>,
    pub last_scanned: Option<DateTime<Utc>>,
    pub scan_count: i64,
}

impl WalletRecord {
    pub fn new(address: &str, source: DiscoverySource, now: DateTime<Utc>) -> Self {
        let mut sources = BTreeSet::new();
        sources.insert(source);
        Self {
            address: address.to_ascii_lowercase(),
            sources,
            cohort: None,
            last_value: None,
            frequency: ScanFrequency::Normal,
            first_seen: now,
            last_scanned: None,
            scan_count: 0,
        }
    }

    /// Comma-joined source tags for storage.
    pub fn sources_str(&self) -> String {
        self.sources
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn parse_sources(s: &str) -> BTreeSet<DiscoverySource> {
        s.split(',').filter_map(DiscoverySource::parse).collect()
    }
}
