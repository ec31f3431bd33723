//! Cost model (component G): per-trade commission + spread cost applied
//! to gross P&L, grounded on the original `apply_costs` helper.

use crate::types::Trade;
use ahash::AHashMap;

/// How spread cost is conceptually attributed across entry/exit. Both
/// `Once` and `Both` resolve to the same total charge (factor 1.0) — the
/// distinction changes reporting, not the amount actually subtracted.
/// `None` disables spread cost entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadMode {
    Once,
    Both,
    None,
}

impl SpreadMode {
    fn factor(self) -> f64 {
        match self {
            SpreadMode::Once | SpreadMode::Both => 1.0,
            SpreadMode::None => 0.0,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "both" => SpreadMode::Both,
            "none" => SpreadMode::None,
            _ => SpreadMode::Once,
        }
    }
}

/// Per-epic cost overrides, merged over the global defaults before
/// computing a trade's cost.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostOverride {
    pub commission_per_trade: Option<f64>,
    pub spread_points: Option<f64>,
    pub point_value: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CostModelConfig {
    pub commission_per_trade: f64,
    pub spread_points: f64,
    pub point_value: f64,
    pub spread_mode: SpreadMode,
    pub overrides: AHashMap<String, CostOverride>,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        CostModelConfig {
            commission_per_trade: 0.0,
            spread_points: 0.0,
            point_value: 1.0,
            spread_mode: SpreadMode::Once,
            overrides: AHashMap::new(),
        }
    }
}

/// Resolved commission + spread cost for a single trade. The spread is
/// kept both as a combined total and split across the entry/exit legs —
/// `once` attributes the whole charge to entry, `both` splits it 0.5/0.5,
/// `none` zeroes both legs — so a future per-leg report can read the
/// attribution without recomputing it from the mode.
#[derive(Debug, Clone, Copy)]
pub struct TradeCost {
    pub commission: f64,
    pub spread: f64,
    pub spread_entry: f64,
    pub spread_exit: f64,
}

impl TradeCost {
    pub fn total(&self) -> f64 {
        self.commission + self.spread
    }
}

fn resolved(epic: &str, cfg: &CostModelConfig) -> (f64, f64, f64) {
    let over = cfg.overrides.get(epic).copied().unwrap_or_default();
    (
        over.commission_per_trade.unwrap_or(cfg.commission_per_trade),
        over.spread_points.unwrap_or(cfg.spread_points),
        over.point_value.unwrap_or(cfg.point_value),
    )
}

/// Computes the commission + spread cost for one trade. Non-finite inputs
/// (e.g. a NaN units count from a malformed fill) yield zero cost for that
/// row rather than propagating NaN into the P&L.
pub fn cost_for_trade(epic: &str, units: f64, cfg: &CostModelConfig) -> TradeCost {
    let (commission, spread_points, point_value) = resolved(epic, cfg);
    if !units.is_finite() || !commission.is_finite() || !spread_points.is_finite() || !point_value.is_finite() {
        return TradeCost {
            commission: 0.0,
            spread: 0.0,
            spread_entry: 0.0,
            spread_exit: 0.0,
        };
    }
    let spread = spread_points * point_value * units.abs() * cfg.spread_mode.factor();
    let (spread_entry, spread_exit) = match cfg.spread_mode {
        SpreadMode::Once => (spread, 0.0),
        SpreadMode::Both => (spread / 2.0, spread / 2.0),
        SpreadMode::None => (0.0, 0.0),
    };
    TradeCost {
        commission,
        spread,
        spread_entry,
        spread_exit,
    }
}

/// Applies the cost model to `trade` in place: overwrites `pnl` and
/// `pnl_percent` with their net values (gross minus commission+spread).
/// Returns the [`TradeCost`] charged, so the caller can net it out of
/// cash/equity as well rather than just the trade record.
pub fn apply_cost(trade: &mut Trade, cfg: &CostModelConfig) -> TradeCost {
    let cost = cost_for_trade(&trade.epic, trade.units, cfg);
    let pnl_gross = trade.pnl;
    trade.pnl = pnl_gross - cost.total();
    trade.pnl_percent = if trade.size_eur.abs() > 1e-12 {
        (trade.pnl / trade.size_eur) * 100.0
    } else {
        0.0
    };
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, ExitReason, Regime, SessionBucket};
    use chrono::{TimeZone, Utc};

    fn trade(pnl: f64, size_eur: f64, units: f64) -> Trade {
        Trade {
            epic: "GOLD".into(),
            direction: Direction::Buy,
            entry_ts: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            exit_ts: Utc.timestamp_opt(1_700_003_600, 0).unwrap(),
            entry_price: 100.0,
            exit_price: 101.0,
            units,
            size_eur,
            pnl,
            pnl_percent: 0.0,
            exit_reason: ExitReason::TakeProfit,
            confidence: 0.8,
            duration_hours: 1.0,
            day_of_week: "Monday".into(),
            hour_of_day: 10,
            session: SessionBucket::EuOpen,
            regime_at_exit: Regime::Trending,
        }
    }

    #[test]
    fn once_and_both_modes_charge_the_same_total() {
        let mut once = CostModelConfig {
            spread_mode: SpreadMode::Once,
            spread_points: 2.0,
            point_value: 1.0,
            ..Default::default()
        };
        let mut both = CostModelConfig {
            spread_mode: SpreadMode::Both,
            ..once.clone()
        };
        both.spread_mode = SpreadMode::Both;
        once.overrides = AHashMap::new();
        let c1 = cost_for_trade("GOLD", 10.0, &once);
        let c2 = cost_for_trade("GOLD", 10.0, &both);
        assert!((c1.spread - c2.spread).abs() < 1e-9);
    }

    #[test]
    fn none_mode_charges_zero_spread() {
        let cfg = CostModelConfig {
            spread_mode: SpreadMode::None,
            spread_points: 5.0,
            ..Default::default()
        };
        let c = cost_for_trade("GOLD", 10.0, &cfg);
        assert_eq!(c.spread, 0.0);
    }

    #[test]
    fn non_finite_units_yield_zero_cost() {
        let cfg = CostModelConfig {
            spread_points: 5.0,
            ..Default::default()
        };
        let c = cost_for_trade("GOLD", f64::NAN, &cfg);
        assert_eq!(c.total(), 0.0);
    }

    #[test]
    fn apply_cost_overwrites_pnl_with_net() {
        let cfg = CostModelConfig {
            commission_per_trade: 1.0,
            spread_points: 1.0,
            point_value: 1.0,
            spread_mode: SpreadMode::Once,
            overrides: AHashMap::new(),
        };
        let mut t = trade(10.0, 1000.0, 5.0);
        apply_cost(&mut t, &cfg);
        assert!(t.pnl < 10.0);
        assert!((t.pnl_percent - (t.pnl / 1000.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn both_mode_splits_spread_evenly_across_legs() {
        let cfg = CostModelConfig {
            commission_per_trade: 0.5,
            spread_points: 0.8,
            point_value: 10.0,
            spread_mode: SpreadMode::Both,
            overrides: AHashMap::new(),
        };
        let c = cost_for_trade("GOLD", 2.0, &cfg);
        assert!((c.spread - 16.0).abs() < 1e-9);
        assert!((c.spread_entry - 8.0).abs() < 1e-9);
        assert!((c.spread_exit - 8.0).abs() < 1e-9);
        assert!((c.total() - 16.5).abs() < 1e-9);
    }

    #[test]
    fn once_mode_attributes_whole_spread_to_entry() {
        let cfg = CostModelConfig {
            spread_points: 2.0,
            point_value: 1.0,
            spread_mode: SpreadMode::Once,
            ..Default::default()
        };
        let c = cost_for_trade("GOLD", 5.0, &cfg);
        assert!((c.spread_entry - 10.0).abs() < 1e-9);
        assert_eq!(c.spread_exit, 0.0);
    }

    #[test]
    fn per_epic_override_takes_precedence() {
        let mut overrides = AHashMap::new();
        overrides.insert(
            "GOLD".to_string(),
            CostOverride {
                commission_per_trade: Some(5.0),
                spread_points: None,
                point_value: None,
            },
        );
        let cfg = CostModelConfig {
            commission_per_trade: 1.0,
            overrides,
            ..Default::default()
        };
        let c = cost_for_trade("GOLD", 1.0, &cfg);
        assert_eq!(c.commission, 5.0);
    }
}
