//! Configuration management for Harrier Monitor
//!
//! Loads configuration from YAML files and environment variables.
//! Environment variables override YAML values.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Upstream endpoints and rate-limit pacing
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Tier boundaries, refresh cadences, alert thresholds
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Discovery loop settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Notional threshold table
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    /// Daily summary schedule
    #[serde(default)]
    pub summary: SummaryConfig,
    /// Telegram delivery settings
    #[serde(default)]
    pub telegram: TelegramConfig,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Coalescing window for batched position-cache writes (ms)
    #[serde(default = "default_write_batch_ms")]
    pub write_batch_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            write_batch_ms: default_write_batch_ms(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/harrier.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_write_batch_ms() -> u64 {
    1000
}

/// Upstream endpoint configuration and fetcher pacing
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Info endpoint (positions and mark prices)
    #[serde(default = "default_info_url")]
    pub info_url: String,
    /// Cohort discovery GraphQL endpoint
    #[serde(default = "default_cohort_url")]
    pub cohort_url: String,
    /// Maximum concurrent in-flight requests
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Delay between successive completed requests (ms)
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    /// Requests per burst before the batch pause kicks in
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Extra pause after each full burst (ms)
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    /// Gap between sub-exchange queries for the same address (ms)
    #[serde(default = "default_dex_gap_ms")]
    pub dex_gap_ms: u64,
    /// Retry attempts for transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff (ms), doubled per attempt with full jitter
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling (ms)
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Per-call timeout (s)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            info_url: default_info_url(),
            cohort_url: default_cohort_url(),
            max_in_flight: default_max_in_flight(),
            request_delay_ms: default_request_delay_ms(),
            burst_size: default_burst_size(),
            batch_pause_ms: default_batch_pause_ms(),
            dex_gap_ms: default_dex_gap_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_info_url() -> String {
    "https://api.hyperliquid.xyz/info".to_string()
}

fn default_cohort_url() -> String {
    "https://api.hyperdash.com/graphql".to_string()
}

fn default_max_in_flight() -> usize {
    5
}

fn default_request_delay_ms() -> u64 {
    250
}

fn default_burst_size() -> u32 {
    50
}

fn default_batch_pause_ms() -> u64 {
    2000
}

fn default_dex_gap_ms() -> u64 {
    100
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_timeout_secs() -> u64 {
    10
}

/// Tier boundaries, refresh cadences, and alert thresholds.
///
/// Alert thresholds default to the tier boundaries but stay separate
/// fields; the source material disagrees on the exact values so both
/// are deliberately configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Critical tier boundary (distance %, inclusive)
    #[serde(default = "default_critical_pct")]
    pub critical_pct: f64,
    /// High tier boundary (distance %, inclusive)
    #[serde(default = "default_high_pct")]
    pub high_pct: f64,
    /// Maximum watched distance; farther positions are not monitored
    #[serde(default = "default_max_watch_pct")]
    pub max_watch_pct: f64,
    /// Imminent alert threshold (distance %)
    #[serde(default = "default_critical_pct")]
    pub imminent_pct: f64,
    /// Approaching alert threshold (distance %)
    #[serde(default = "default_high_pct")]
    pub approaching_pct: f64,
    /// Re-arm factor: flags reset once distance exceeds threshold * factor
    #[serde(default = "default_rearm_factor")]
    pub rearm_factor: f64,
    /// Partial liquidation notional drop fraction
    #[serde(default = "default_partial_drop")]
    pub partial_drop_fraction: f64,
    /// Minimum relative liq-price move to count as a collateral change
    #[serde(default = "default_collateral_min_move")]
    pub collateral_min_move_pct: f64,
    /// Critical tier refresh period (ms)
    #[serde(default = "default_refresh_critical_ms")]
    pub refresh_critical_ms: u64,
    /// High tier refresh period (ms)
    #[serde(default = "default_refresh_high_ms")]
    pub refresh_high_ms: u64,
    /// Normal tier refresh period (ms)
    #[serde(default = "default_refresh_normal_ms")]
    pub refresh_normal_ms: u64,
    /// Mark price sweep interval (ms)
    #[serde(default = "default_price_sweep_ms")]
    pub price_sweep_ms: u64,
    /// Cached entries older than this need revalidation before alerting (h)
    #[serde(default = "default_cache_stale_hours")]
    pub cache_stale_hours: i64,
    /// Hard deadline for graceful shutdown (s)
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            critical_pct: default_critical_pct(),
            high_pct: default_high_pct(),
            max_watch_pct: default_max_watch_pct(),
            imminent_pct: default_critical_pct(),
            approaching_pct: default_high_pct(),
            rearm_factor: default_rearm_factor(),
            partial_drop_fraction: default_partial_drop(),
            collateral_min_move_pct: default_collateral_min_move(),
            refresh_critical_ms: default_refresh_critical_ms(),
            refresh_high_ms: default_refresh_high_ms(),
            refresh_normal_ms: default_refresh_normal_ms(),
            price_sweep_ms: default_price_sweep_ms(),
            cache_stale_hours: default_cache_stale_hours(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
        }
    }
}

fn default_critical_pct() -> f64 {
    0.125
}

fn default_high_pct() -> f64 {
    0.25
}

fn default_max_watch_pct() -> f64 {
    5.0
}

fn default_rearm_factor() -> f64 {
    1.2
}

fn default_partial_drop() -> f64 {
    0.10
}

fn default_collateral_min_move() -> f64 {
    0.5
}

fn default_refresh_critical_ms() -> u64 {
    500
}

fn default_refresh_high_ms() -> u64 {
    3000
}

fn default_refresh_normal_ms() -> u64 {
    30_000
}

fn default_price_sweep_ms() -> u64 {
    1000
}

fn default_cache_stale_hours() -> i64 {
    24
}

fn default_shutdown_deadline_secs() -> u64 {
    30
}

/// Discovery loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Minimum interval between discovery cycles (min)
    #[serde(default = "default_discovery_min_interval")]
    pub min_interval_minutes: u64,
    /// Maximum interval between discovery cycles (min)
    #[serde(default = "default_discovery_max_interval")]
    pub max_interval_minutes: u64,
    /// Cohort ids to walk on each cycle
    #[serde(default = "default_cohorts")]
    pub cohorts: Vec<String>,
    /// Traders per cohort page
    #[serde(default = "default_cohort_page_size")]
    pub page_size: u32,
    /// Delay between cohort pages (ms)
    #[serde(default = "default_cohort_page_delay_ms")]
    pub page_delay_ms: u64,
    /// Minimum aggregate position value for a wallet to be registered
    #[serde(default = "default_min_wallet_value")]
    pub min_wallet_value: f64,
    /// Minimum historical notional for liquidation-history ingest
    #[serde(default = "default_liq_history_min_notional")]
    pub liq_history_min_notional: f64,
    /// Aggregate value at or above which a wallet scans at normal frequency
    #[serde(default = "default_wallet_active_threshold")]
    pub wallet_active_threshold: f64,
    /// Rescan interval for infrequent wallets (h)
    #[serde(default = "default_infrequent_rescan_hours")]
    pub infrequent_rescan_hours: i64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_interval_minutes: default_discovery_min_interval(),
            max_interval_minutes: default_discovery_max_interval(),
            cohorts: default_cohorts(),
            page_size: default_cohort_page_size(),
            page_delay_ms: default_cohort_page_delay_ms(),
            min_wallet_value: default_min_wallet_value(),
            liq_history_min_notional: default_liq_history_min_notional(),
            wallet_active_threshold: default_wallet_active_threshold(),
            infrequent_rescan_hours: default_infrequent_rescan_hours(),
        }
    }
}

fn default_discovery_min_interval() -> u64 {
    30
}

fn default_discovery_max_interval() -> u64 {
    240
}

fn default_cohorts() -> Vec<String> {
    [
        "kraken",
        "large_whale",
        "whale",
        "rekt",
        "shark",
        "extremely_profitable",
        "very_unprofitable",
        "very_profitable",
        "profitable",
        "unprofitable",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_cohort_page_size() -> u32 {
    500
}

fn default_cohort_page_delay_ms() -> u64 {
    1000
}

fn default_min_wallet_value() -> f64 {
    300_000.0
}

fn default_liq_history_min_notional() -> f64 {
    100_000.0
}

fn default_wallet_active_threshold() -> f64 {
    60_000.0
}

fn default_infrequent_rescan_hours() -> i64 {
    24
}

/// Notional threshold configuration. Token entries are cross-margin
/// values; isolated thresholds divide by `isolated_divisor`.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    /// Default cross threshold for unlisted tokens
    #[serde(default = "default_threshold_cross")]
    pub default_cross: f64,
    /// Cross-to-isolated divisor
    #[serde(default = "default_isolated_divisor")]
    pub isolated_divisor: f64,
    /// Flat cross threshold on flx/hyna/km
    #[serde(default = "default_sub_exchange_flat")]
    pub sub_exchange_flat: f64,
    /// Per-token overrides (cross values), merged over the built-in table
    #[serde(default)]
    pub tokens: HashMap<String, f64>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            default_cross: default_threshold_cross(),
            isolated_divisor: default_isolated_divisor(),
            sub_exchange_flat: default_sub_exchange_flat(),
            tokens: HashMap::new(),
        }
    }
}

fn default_threshold_cross() -> f64 {
    300_000.0
}

fn default_isolated_divisor() -> f64 {
    5.0
}

fn default_sub_exchange_flat() -> f64 {
    500_000.0
}

/// Daily summary schedule
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryConfig {
    /// Wall-clock times, "HH:MM" in the configured timezone
    #[serde(default = "default_summary_times")]
    pub times: Vec<String>,
    /// IANA timezone name
    #[serde(default = "default_summary_timezone")]
    pub timezone: String,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            times: default_summary_times(),
            timezone: default_summary_timezone(),
        }
    }
}

fn default_summary_times() -> Vec<String> {
    vec!["06:00".to_string()]
}

fn default_summary_timezone() -> String {
    "America/New_York".to_string()
}

/// Telegram delivery configuration (loaded from env)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

impl AppConfig {
    /// Load configuration from files and environment
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (HARRIER_*)
    /// 2. config/config.yaml (if exists)
    /// 3. config.yaml (if exists)
    /// 4. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(File::with_name("config/config").required(false))
            // HARRIER_MONITOR__CRITICAL_PCT=0.1 -> monitor.critical_pct = 0.1
            .add_source(
                Environment::with_prefix("HARRIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.critical_pct >= self.monitor.high_pct {
            return Err(ConfigError::Message(
                "critical tier boundary must be below the high tier boundary".to_string(),
            ));
        }

        if self.monitor.high_pct >= self.monitor.max_watch_pct {
            return Err(ConfigError::Message(
                "high tier boundary must be below max watch distance".to_string(),
            ));
        }

        if self.monitor.rearm_factor <= 1.0 {
            return Err(ConfigError::Message(
                "rearm factor must exceed 1.0 (hysteresis margin)".to_string(),
            ));
        }

        if self.thresholds.isolated_divisor <= 0.0 {
            return Err(ConfigError::Message(
                "isolated divisor must be positive".to_string(),
            ));
        }

        if self.discovery.min_interval_minutes > self.discovery.max_interval_minutes {
            return Err(ConfigError::Message(
                "discovery min interval must not exceed max interval".to_string(),
            ));
        }

        for t in &self.summary.times {
            if parse_summary_time(t).is_none() {
                return Err(ConfigError::Message(format!(
                    "invalid summary time '{}', expected HH:MM",
                    t
                )));
            }
        }

        Ok(())
    }
}

/// Parse an "HH:MM" summary time.
pub fn parse_summary_time(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = AppConfig {
            database: DatabaseConfig::default(),
            upstream: UpstreamConfig::default(),
            monitor: MonitorConfig::default(),
            discovery: DiscoveryConfig::default(),
            thresholds: ThresholdConfig::default(),
            summary: SummaryConfig::default(),
            telegram: TelegramConfig::default(),
        };

        assert_eq!(cfg.upstream.max_in_flight, 5);
        assert_eq!(cfg.upstream.request_delay_ms, 250);
        assert_eq!(cfg.monitor.critical_pct, 0.125);
        assert_eq!(cfg.monitor.refresh_critical_ms, 500);
        assert_eq!(cfg.discovery.cohorts.len(), 10);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_summary_time() {
        assert_eq!(parse_summary_time("06:00"), Some((6, 0)));
        assert_eq!(parse_summary_time("23:59"), Some((23, 59)));
        assert_eq!(parse_summary_time("24:00"), None);
        assert_eq!(parse_summary_time("6"), None);
    }

    #[test]
    fn test_validation_rejects_inverted_tiers() {
        let mut cfg = AppConfig {
            database: DatabaseConfig::default(),
            upstream: UpstreamConfig::default(),
            monitor: MonitorConfig::default(),
            discovery: DiscoveryConfig::default(),
            thresholds: ThresholdConfig::default(),
            summary: SummaryConfig::default(),
            telegram: TelegramConfig::default(),
        };
        cfg.monitor.critical_pct = 0.5;
        assert!(cfg.validate().is_err());
    }
}
