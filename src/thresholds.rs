//! Notional threshold table.
//!
//! Positions below their token's minimum notional are never inserted
//! into the cache. Table entries are cross-margin values; isolated
//! positions divide by the configured divisor. Sub-exchange (flx,
//! hyna, km) tokens share one flat value. Token symbols are looked up
//! with any dex prefix stripped.

use crate::config::ThresholdConfig;
use crate::models::{strip_dex_prefix, Exchange, MarginType};
use std::collections::HashMap;

/// Resolved threshold table: built-in tiers merged with config overrides.
#[derive(Debug, Clone)]
pub struct NotionalThresholds {
    default_cross: f64,
    isolated_divisor: f64,
    sub_exchange_flat: f64,
    tokens: HashMap<String, f64>,
}

impl NotionalThresholds {
    pub fn from_config(cfg: &ThresholdConfig) -> Self {
        let mut tokens = builtin_table();
        for (token, value) in &cfg.tokens {
            tokens.insert(token.to_ascii_uppercase(), *value);
        }
        Self {
            default_cross: cfg.default_cross,
            isolated_divisor: cfg.isolated_divisor,
            sub_exchange_flat: cfg.sub_exchange_flat,
            tokens,
        }
    }

    /// Minimum notional for a position to be watched.
    pub fn min_notional(&self, token: &str, exchange: Exchange, margin: MarginType) -> f64 {
        let token = strip_dex_prefix(token).to_ascii_uppercase();

        let cross = match exchange {
            Exchange::Main | Exchange::Xyz => {
                self.tokens.get(&token).copied().unwrap_or(self.default_cross)
            }
            Exchange::Flx | Exchange::Hyna | Exchange::Km => self.sub_exchange_flat,
        };

        // Sub-exchanges only support isolated margin, so the divisor
        // always applies off main.
        let isolated = exchange.is_sub_exchange() || margin == MarginType::Isolated;
        if isolated {
            cross / self.isolated_divisor
        } else {
            cross
        }
    }

    /// Whether a position's notional clears the watch threshold.
    pub fn passes(&self, token: &str, exchange: Exchange, margin: MarginType, notional: f64) -> bool {
        notional >= self.min_notional(token, exchange, margin)
    }
}

impl Default for NotionalThresholds {
    fn default() -> Self {
        Self::from_config(&ThresholdConfig::default())
    }
}

/// Built-in cross thresholds. Tier sizing follows open-interest depth:
/// mega caps need nine figures of notional to matter, thin sub-exchange
/// listings matter at six.
fn builtin_table() -> HashMap<String, f64> {
    let mut t = HashMap::new();

    // Crypto majors
    t.insert("BTC".into(), 100_000_000.0);
    t.insert("ETH".into(), 75_000_000.0);
    for token in ["SOL", "BNB", "XRP"] {
        t.insert(token.into(), 25_000_000.0);
    }
    for token in [
        "DOGE", "ADA", "AVAX", "LINK", "LTC", "DOT", "MATIC", "UNI", "ATOM", "TRX", "SHIB", "HYPE",
    ] {
        t.insert(token.into(), 10_000_000.0);
    }
    for token in [
        "APT", "ARB", "OP", "SUI", "TON", "NEAR", "SEI", "TIA", "INJ", "PEPE", "WIF", "BONK",
        "FLOKI", "AAVE", "MKR", "RENDER", "FET", "FIL",
    ] {
        t.insert(token.into(), 5_000_000.0);
    }

    // xyz listings: indices, equities, commodities, forex
    t.insert("XYZ100".into(), 5_000_000.0);
    for token in ["AAPL", "MSFT", "NVDA", "GOOGL", "AMZN", "META", "TSLA"] {
        t.insert(token.into(), 3_000_000.0);
    }
    for token in ["AMD", "NFLX", "COIN", "MSTR", "ORCL", "TSM", "LLY", "COST"] {
        t.insert(token.into(), 2_000_000.0);
    }
    t.insert("GOLD".into(), 2_500_000.0);
    t.insert("CL".into(), 2_000_000.0);
    t.insert("SILVER".into(), 1_000_000.0);
    t.insert("COPPER".into(), 1_000_000.0);
    t.insert("NATGAS".into(), 800_000.0);
    t.insert("URANIUM".into(), 500_000.0);
    t.insert("EUR".into(), 1_000_000.0);
    t.insert("JPY".into(), 1_000_000.0);

    t
}
