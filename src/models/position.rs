//! Position model and identifying enums.
//!
//! A position is uniquely identified by `(address, token, exchange, side)`.
//! Token symbols on sub-exchanges may carry a dex prefix (e.g. `xyz:GOLD`);
//! the prefix is preserved in keys but stripped for threshold and price
//! lookups via [`strip_dex_prefix`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange family. `Main` is the core perp venue; the rest are
/// sub-exchanges queried with a dex tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Main,
    Xyz,
    Flx,
    Hyna,
    Km,
}

impl Exchange {
    /// All exchanges, in scan order.
    pub const ALL: [Exchange; 5] = [
        Exchange::Main,
        Exchange::Xyz,
        Exchange::Flx,
        Exchange::Hyna,
        Exchange::Km,
    ];

    /// Tag sent in the upstream `dex` field. Empty string selects the
    /// main exchange.
    pub fn dex_tag(&self) -> &'static str {
        match self {
            Exchange::Main => "",
            Exchange::Xyz => "xyz",
            Exchange::Flx => "flx",
            Exchange::Hyna => "hyna",
            Exchange::Km => "km",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Main => "main",
            Exchange::Xyz => "xyz",
            Exchange::Flx => "flx",
            Exchange::Hyna => "hyna",
            Exchange::Km => "km",
        }
    }

    pub fn parse(s: &str) -> Option<Exchange> {
        match s {
            "main" | "" => Some(Exchange::Main),
            "xyz" => Some(Exchange::Xyz),
            "flx" => Some(Exchange::Flx),
            "hyna" => Some(Exchange::Hyna),
            "km" => Some(Exchange::Km),
            _ => None,
        }
    }

    /// Sub-exchanges only support isolated margin.
    pub fn is_sub_exchange(&self) -> bool {
        !matches!(self, Exchange::Main)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Some(Side::Long),
            "short" => Some(Side::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Margin mode. Cross positions draw on the wallet's whole balance and
/// may be partially reduced; isolated positions liquidate in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    Cross,
    Isolated,
}

impl MarginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarginType::Cross => "cross",
            MarginType::Isolated => "isolated",
        }
    }

    pub fn parse(s: &str) -> Option<MarginType> {
        match s.to_ascii_lowercase().as_str() {
            "cross" => Some(MarginType::Cross),
            "isolated" => Some(MarginType::Isolated),
            _ => None,
        }
    }
}

impl fmt::Display for MarginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite position identifier: `(address, token, exchange, side)`.
///
/// The token component keeps any dex prefix exactly as the upstream
/// reports it, so keys stay stable across refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub address: String,
    pub token: String,
    pub exchange: Exchange,
    pub side: Side,
}

impl PositionKey {
    pub fn new(address: &str, token: &str, exchange: Exchange, side: Side) -> Self {
        Self {
            address: address.to_ascii_lowercase(),
            token: token.to_string(),
            exchange,
            side,
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.address, self.token, self.exchange, self.side
        )
    }
}

/// A single observation of a position as returned by the upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub key: PositionKey,
    /// Position size in coin units (absolute value; direction lives in the key)
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub margin_type: MarginType,
    /// Notional value in quote currency
    pub notional: f64,
    /// Absent when the exchange reports no liquidation price; such
    /// positions are not eligible for monitoring
    pub liq_price: Option<f64>,
    pub margin_used: f64,
    /// Wall-clock time this observation was taken. Used to reject
    /// stragglers that would otherwise overwrite newer data.
    pub observed_at: DateTime<Utc>,
}

impl Position {
    /// Distance to liquidation at the given mark price, in percent.
    /// Positive while the position is still solvent.
    pub fn distance_pct(&self, mark_price: f64) -> Option<f64> {
        let liq = self.liq_price?;
        Some(distance_to_liquidation(self.key.side, mark_price, liq))
    }

    /// Effective margin mode: sub-exchange positions are always
    /// isolated regardless of what the leverage payload claims.
    pub fn effective_margin(&self) -> MarginType {
        if self.key.exchange.is_sub_exchange() {
            MarginType::Isolated
        } else {
            self.margin_type
        }
    }
}

/// Signed percentage move from mark to liquidation price.
///
/// Never trusted from upstream; recomputed on every observation.
pub fn distance_to_liquidation(side: Side, mark_price: f64, liq_price: f64) -> f64 {
    if mark_price <= 0.0 {
        return 0.0;
    }
    match side {
        Side::Long => (mark_price - liq_price) / mark_price * 100.0,
        Side::Short => (liq_price - mark_price) / mark_price * 100.0,
    }
}

/// Strip a known dex prefix from a token symbol (`xyz:GOLD` -> `GOLD`).
/// Unknown prefixes are left untouched.
pub fn strip_dex_prefix(token: &str) -> &str {
    if let Some((prefix, rest)) = token.split_once(':') {
        if Exchange::parse(prefix).is_some() {
            return rest;
        }
    }
    token
}
