//! Info endpoint wire types: `clearinghouseState` and `allMids`.
//!
//! Numeric fields arrive as strings and are parsed here; any field
//! that fails to parse makes the whole response malformed.

use crate::error::{MonitorError, MonitorResult};
use crate::models::{Exchange, MarginType, Position, PositionKey, Side};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Response body of a `clearinghouseState` query.
#[derive(Debug, Deserialize)]
pub struct ClearinghouseState {
    #[serde(rename = "assetPositions", default)]
    pub asset_positions: Vec<AssetPosition>,
}

#[derive(Debug, Deserialize)]
pub struct AssetPosition {
    pub position: Option<RawPosition>,
}

#[derive(Debug, Deserialize)]
pub struct RawPosition {
    pub coin: String,
    /// Signed size; negative means short
    pub szi: String,
    #[serde(rename = "entryPx")]
    pub entry_px: Option<String>,
    pub leverage: RawLeverage,
    #[serde(rename = "liquidationPx")]
    pub liquidation_px: Option<String>,
    #[serde(rename = "positionValue")]
    pub position_value: String,
    #[serde(rename = "marginUsed")]
    pub margin_used: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawLeverage {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
}

fn parse_f64(field: &str, value: &str) -> MonitorResult<f64> {
    value
        .parse::<f64>()
        .map_err(|_| MonitorError::MalformedResponse(format!("bad {} value: {:?}", field, value)))
}

/// Convert a clearinghouse state into position observations.
///
/// Zero-size entries are skipped; a missing `liquidationPx` is carried
/// through as `None` so the cache can evict the entry.
pub fn parse_positions(
    state: ClearinghouseState,
    address: &str,
    exchange: Exchange,
    observed_at: DateTime<Utc>,
) -> MonitorResult<Vec<Position>> {
    let mut positions = Vec::new();

    for asset in state.asset_positions {
        let Some(raw) = asset.position else { continue };

        let szi = parse_f64("szi", &raw.szi)?;
        if szi == 0.0 {
            continue;
        }
        let side = if szi > 0.0 { Side::Long } else { Side::Short };

        let entry_price = match &raw.entry_px {
            Some(px) => parse_f64("entryPx", px)?,
            None => 0.0,
        };
        let liq_price = match &raw.liquidation_px {
            Some(px) => Some(parse_f64("liquidationPx", px)?),
            None => None,
        };
        let notional = parse_f64("positionValue", &raw.position_value)?.abs();
        let margin_used = match &raw.margin_used {
            Some(v) => parse_f64("marginUsed", v)?,
            None => 0.0,
        };
        let margin_type = MarginType::parse(&raw.leverage.kind).unwrap_or(MarginType::Cross);

        positions.push(Position {
            key: PositionKey::new(address, &raw.coin, exchange, side),
            size: szi.abs(),
            entry_price,
            leverage: raw.leverage.value,
            margin_type,
            notional,
            liq_price,
            margin_used,
            observed_at,
        });
    }

    Ok(positions)
}

/// Parse an `allMids` response (coin -> price string) into a price map.
pub fn parse_mids(raw: HashMap<String, String>) -> MonitorResult<HashMap<String, f64>> {
    let mut prices = HashMap::with_capacity(raw.len());
    for (coin, px) in raw {
        let price = parse_f64("mid", &px)?;
        if price > 0.0 {
            prices.insert(coin, price);
        }
    }
    Ok(prices)
}

/// Look up a mark price for a token, trying the symbol as reported
/// first and then with its dex prefix stripped.
pub fn lookup_mark(prices: &HashMap<String, f64>, token: &str) -> Option<f64> {
    if let Some(p) = prices.get(token) {
        return Some(*p);
    }
    prices.get(crate::models::strip_dex_prefix(token)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state(liq: Option<&str>) -> ClearinghouseState {
        let liq_json = match liq {
            Some(px) => format!("\"{}\"", px),
            None => "null".to_string(),
        };
        let json = format!(
            r#"{{
                "assetPositions": [
                    {{
                        "position": {{
                            "coin": "BTC",
                            "szi": "-2.5",
                            "entryPx": "101000.0",
                            "leverage": {{"type": "cross", "value": 20.0}},
                            "liquidationPx": {},
                            "positionValue": "250000.0",
                            "marginUsed": "12500.0"
                        }}
                    }},
                    {{"position": null}}
                ]
            }}"#,
            liq_json
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_parse_positions_short() {
        let state = sample_state(Some("104000.0"));
        let positions = parse_positions(state, "0xAA", Exchange::Main, Utc::now()).unwrap();
        assert_eq!(positions.len(), 1);

        let pos = &positions[0];
        assert_eq!(pos.key.side, Side::Short);
        assert_eq!(pos.size, 2.5);
        assert_eq!(pos.liq_price, Some(104_000.0));
        assert_eq!(pos.notional, 250_000.0);
        assert_eq!(pos.margin_type, MarginType::Cross);
    }

    #[test]
    fn test_parse_positions_missing_liq() {
        let state = sample_state(None);
        let positions = parse_positions(state, "0xAA", Exchange::Main, Utc::now()).unwrap();
        assert_eq!(positions[0].liq_price, None);
    }

    #[test]
    fn test_parse_positions_bad_number_is_malformed() {
        let json = r#"{
            "assetPositions": [
                {"position": {
                    "coin": "BTC", "szi": "not-a-number",
                    "leverage": {"type": "cross", "value": 1.0},
                    "positionValue": "1.0"
                }}
            ]
        }"#;
        let state: ClearinghouseState = serde_json::from_str(json).unwrap();
        let err = parse_positions(state, "0xAA", Exchange::Main, Utc::now()).unwrap_err();
        assert!(matches!(err, MonitorError::MalformedResponse(_)));
    }

    #[test]
    fn test_lookup_mark_prefers_exact_symbol() {
        let mut prices = HashMap::new();
        prices.insert("xyz:GOLD".to_string(), 2400.0);
        prices.insert("GOLD".to_string(), 2300.0);

        assert_eq!(lookup_mark(&prices, "xyz:GOLD"), Some(2400.0));
        assert_eq!(lookup_mark(&prices, "xyz:SILVER"), None);

        prices.insert("SILVER".to_string(), 29.0);
        assert_eq!(lookup_mark(&prices, "xyz:SILVER"), Some(29.0));
    }
}
