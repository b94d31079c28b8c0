//! State-change detector.
//!
//! Pure classification of a refresh: given the previously cached state
//! and a freshly observed one (or its absence), exactly one transition
//! kind applies. Priority when several conditions hold:
//! full > partial > collateral > imminent > approaching > silent.
//!
//! A mark-price move with an unchanged liquidation price can cross the
//! imminent/approaching thresholds, but never reads as collateral
//! activity; the collateral and partial branches only fire on changes
//! the position owner made.

use crate::config::MonitorConfig;
use crate::models::{Position, Side};
use std::fmt;

/// Classified outcome of one refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// Wallet fetch succeeded but the key is gone
    FullLiquidation,
    /// Notional dropped >= the partial threshold with a size reduction
    PartialLiquidation,
    /// Liquidation price moved to the safer side with no size change
    CollateralAdded,
    /// Distance crossed the imminent threshold, not yet alerted
    Imminent,
    /// Distance crossed the approaching threshold, not yet alerted
    Approaching,
    /// No alert-worthy change
    SilentUpdate,
}

impl TransitionKind {
    pub fn is_alert(&self) -> bool {
        !matches!(self, TransitionKind::SilentUpdate)
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionKind::FullLiquidation => "full-liquidation",
            TransitionKind::PartialLiquidation => "partial-liquidation",
            TransitionKind::CollateralAdded => "collateral-added",
            TransitionKind::Imminent => "imminent",
            TransitionKind::Approaching => "approaching",
            TransitionKind::SilentUpdate => "silent-update",
        };
        f.write_str(s)
    }
}

/// The slice of cached state the classifier needs.
#[derive(Debug, Clone)]
pub struct PrevState {
    pub side: Side,
    pub size: f64,
    pub notional: f64,
    pub liq_price: Option<f64>,
    pub approaching_alerted: bool,
    pub critical_alerted: bool,
}

/// Classify a refresh where the position is still present.
///
/// `next_distance` is the distance recomputed from the current mark
/// and the fresh liquidation price; it is never taken from upstream.
pub fn classify_update(
    prev: &PrevState,
    next: &Position,
    next_distance: f64,
    cfg: &MonitorConfig,
) -> TransitionKind {
    if is_partial_liquidation(prev, next, cfg) {
        return TransitionKind::PartialLiquidation;
    }

    if is_collateral_added(prev, next, cfg) {
        return TransitionKind::CollateralAdded;
    }

    if next_distance <= cfg.imminent_pct && !prev.critical_alerted {
        return TransitionKind::Imminent;
    }

    if next_distance <= cfg.approaching_pct && !prev.approaching_alerted {
        return TransitionKind::Approaching;
    }

    TransitionKind::SilentUpdate
}

fn is_partial_liquidation(prev: &PrevState, next: &Position, cfg: &MonitorConfig) -> bool {
    // Same key implies same side; the size check separates a forced
    // reduction from a price-driven notional drop.
    prev.notional > 0.0
        && next.notional < (1.0 - cfg.partial_drop_fraction) * prev.notional
        && next.key.side == prev.side
        && next.size < prev.size
}

fn is_collateral_added(prev: &PrevState, next: &Position, cfg: &MonitorConfig) -> bool {
    let (Some(prev_liq), Some(next_liq)) = (prev.liq_price, next.liq_price) else {
        return false;
    };
    if prev_liq <= 0.0 || next.size != prev.size {
        return false;
    }

    let delta = next_liq - prev_liq;
    let moved_safer = match prev.side {
        Side::Long => delta < 0.0,
        Side::Short => delta > 0.0,
    };

    moved_safer && (delta.abs() / prev_liq) * 100.0 >= cfg.collateral_min_move_pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Exchange, MarginType, PositionKey};
    use chrono::Utc;

    fn cfg() -> MonitorConfig {
        MonitorConfig::default()
    }

    fn prev(side: Side) -> PrevState {
        PrevState {
            side,
            size: 10.0,
            notional: 1_000_000.0,
            liq_price: Some(99_000.0),
            approaching_alerted: false,
            critical_alerted: false,
        }
    }

    fn obs(side: Side, size: f64, notional: f64, liq: Option<f64>) -> Position {
        Position {
            key: PositionKey::new("0xaa", "BTC", Exchange::Main, side),
            size,
            entry_price: 100_000.0,
            leverage: 10.0,
            margin_type: MarginType::Cross,
            notional,
            liq_price: liq,
            margin_used: 0.0,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_partial_liquidation_needs_size_drop() {
        let p = prev(Side::Long);

        // notional down 20% with smaller size: partial
        let n = obs(Side::Long, 8.0, 800_000.0, Some(99_000.0));
        assert_eq!(
            classify_update(&p, &n, 1.0, &cfg()),
            TransitionKind::PartialLiquidation
        );

        // notional down but size unchanged: price move, not a partial
        let n = obs(Side::Long, 10.0, 800_000.0, Some(99_000.0));
        assert_ne!(
            classify_update(&p, &n, 1.0, &cfg()),
            TransitionKind::PartialLiquidation
        );
    }

    #[test]
    fn test_collateral_added_long() {
        let p = prev(Side::Long);
        // liq moved down 2.3% with the same size: collateral added
        let n = obs(Side::Long, 10.0, 1_000_000.0, Some(96_700.0));
        assert_eq!(
            classify_update(&p, &n, 0.57, &cfg()),
            TransitionKind::CollateralAdded
        );
    }

    #[test]
    fn test_collateral_added_short_direction() {
        let mut p = prev(Side::Short);
        p.liq_price = Some(101_000.0);

        // liq moved UP for a short: safer
        let n = obs(Side::Short, 10.0, 1_000_000.0, Some(102_000.0));
        assert_eq!(
            classify_update(&p, &n, 1.0, &cfg()),
            TransitionKind::CollateralAdded
        );

        // liq moved down for a short: riskier, no alert
        let n = obs(Side::Short, 10.0, 1_000_000.0, Some(100_200.0));
        assert_eq!(
            classify_update(&p, &n, 0.2, &cfg()),
            TransitionKind::Approaching
        );
    }

    #[test]
    fn test_collateral_move_below_minimum_is_silent() {
        let p = prev(Side::Long);
        // 0.1% liq move is below the 0.5% minimum
        let n = obs(Side::Long, 10.0, 1_000_000.0, Some(98_901.0));
        assert_eq!(
            classify_update(&p, &n, 1.0, &cfg()),
            TransitionKind::SilentUpdate
        );
    }

    #[test]
    fn test_imminent_respects_flag() {
        let mut p = prev(Side::Long);
        let n = obs(Side::Long, 10.0, 1_000_000.0, Some(99_000.0));

        assert_eq!(classify_update(&p, &n, 0.10, &cfg()), TransitionKind::Imminent);

        p.critical_alerted = true;
        assert_eq!(
            classify_update(&p, &n, 0.10, &cfg()),
            TransitionKind::SilentUpdate
        );
    }

    #[test]
    fn test_approaching_suppressed_when_imminent() {
        let p = prev(Side::Long);
        let n = obs(Side::Long, 10.0, 1_000_000.0, Some(99_000.0));

        // 0.10% is inside both thresholds; only imminent fires
        assert_eq!(classify_update(&p, &n, 0.10, &cfg()), TransitionKind::Imminent);
    }

    #[test]
    fn test_natural_price_move_is_silent() {
        let mut p = prev(Side::Long);
        p.approaching_alerted = true;
        p.critical_alerted = true;

        // mark drifted, liq and size unchanged
        let n = obs(Side::Long, 10.0, 1_050_000.0, Some(99_000.0));
        assert_eq!(
            classify_update(&p, &n, 0.8, &cfg()),
            TransitionKind::SilentUpdate
        );
    }

    #[test]
    fn test_priority_partial_over_collateral() {
        let p = prev(Side::Long);
        // size dropped AND liq moved safer; partial wins
        let n = obs(Side::Long, 7.0, 700_000.0, Some(96_000.0));
        assert_eq!(
            classify_update(&p, &n, 2.0, &cfg()),
            TransitionKind::PartialLiquidation
        );
    }
}
