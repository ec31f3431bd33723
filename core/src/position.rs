//! Position manager (component F): stop-loss/take-profit computation,
//! open/monitor/close lifecycle, and end-of-run forced closure. Grounded
//! on the original `position_manager.py` (SL/TP formulas) and
//! `backtest_engine.py` (cash bookkeeping: the full notional `size_eur`
//! is debited from cash at open and `size_eur + pnl` is credited back at
//! close — margin/leverage only gates how big a position may be sized,
//! it never substitutes for notional in the cash ledger).

use crate::config::SlTpMode;
use crate::types::{Bar, Direction, ExitReason, Position, Regime, Signal, Trade};
use chrono::{DateTime, Datelike, Timelike, Utc};

#[derive(Debug, Clone, Copy)]
pub struct PositionManagerConfig {
    pub mode: SlTpMode,
    pub sl_buy_pct: f64,
    pub tp_buy_pct: f64,
    pub sl_sell_pct: f64,
    pub tp_sell_pct: f64,
    pub atr_multiplier_sl: f64,
    pub atr_multiplier_tp: f64,
}

const DYNAMIC_SL_MIN_PCT: f64 = 1.0;
const DYNAMIC_SL_MAX_PCT: f64 = 10.0;
const DYNAMIC_TP_MIN_PCT: f64 = 2.0;
const DYNAMIC_TP_MAX_PCT: f64 = 15.0;

/// Computes the stop-loss price for a new position, in STATIC mode from
/// the configured percentage, in DYNAMIC mode from `atr_pct * multiplier`
/// clamped to [1%, 10%].
pub fn compute_stop_loss(direction: Direction, entry_price: f64, atr_pct: f64, cfg: &PositionManagerConfig) -> f64 {
    let pct = match cfg.mode {
        SlTpMode::Static => match direction {
            Direction::Buy => cfg.sl_buy_pct,
            _ => cfg.sl_sell_pct,
        },
        SlTpMode::Dynamic => ((atr_pct * cfg.atr_multiplier_sl) / 100.0).clamp(DYNAMIC_SL_MIN_PCT / 100.0, DYNAMIC_SL_MAX_PCT / 100.0),
    };
    match direction {
        Direction::Buy => entry_price * (1.0 - pct),
        _ => entry_price * (1.0 + pct),
    }
}

/// Computes the take-profit price, mirroring [`compute_stop_loss`] with
/// the [2%, 15%] dynamic clamp.
pub fn compute_take_profit(direction: Direction, entry_price: f64, atr_pct: f64, cfg: &PositionManagerConfig) -> f64 {
    let pct = match cfg.mode {
        SlTpMode::Static => match direction {
            Direction::Buy => cfg.tp_buy_pct,
            _ => cfg.tp_sell_pct,
        },
        SlTpMode::Dynamic => ((atr_pct * cfg.atr_multiplier_tp) / 100.0).clamp(DYNAMIC_TP_MIN_PCT / 100.0, DYNAMIC_TP_MAX_PCT / 100.0),
    };
    match direction {
        Direction::Buy => entry_price * (1.0 + pct),
        _ => entry_price * (1.0 - pct),
    }
}

/// Opens a new position for `signal`, sized at `size_eur` notional.
/// Returns `None` if `units` would be non-positive (e.g. zero price).
pub fn open(signal: &Signal, units: f64, size_eur: f64, cfg: &PositionManagerConfig) -> Option<Position> {
    if units <= 0.0 || size_eur <= 0.0 {
        return None;
    }
    let atr_pct = signal.indicators.atr_pct;
    Some(Position {
        epic: signal.epic.clone(),
        direction: signal.direction,
        entry_ts: signal.ts,
        entry_price: signal.current_price,
        units,
        size_eur,
        stop_loss: compute_stop_loss(signal.direction, signal.current_price, atr_pct, cfg),
        take_profit: compute_take_profit(signal.direction, signal.current_price, atr_pct, cfg),
        confidence: signal.confidence,
        regime_at_open: signal.regime,
        current_price: signal.current_price,
    })
}

/// Marks a position to the latest observed bar and returns the exit
/// reason if the bar's close crossed the stop-loss or take-profit.
/// Stop-loss takes priority over take-profit when a single bar crosses
/// both (a large gap bar, for instance).
pub fn check_exit(position: &mut Position, bar: &Bar) -> Option<ExitReason> {
    position.current_price = bar.close;
    match position.direction {
        Direction::Buy => {
            if bar.close <= position.stop_loss {
                Some(ExitReason::StopLoss)
            } else if bar.close >= position.take_profit {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
        Direction::Sell => {
            if bar.close >= position.stop_loss {
                Some(ExitReason::StopLoss)
            } else if bar.close <= position.take_profit {
                Some(ExitReason::TakeProfit)
            } else {
                None
            }
        }
        Direction::Neutral => None,
    }
}

/// Closes `position` at `exit_price`/`exit_ts` for `reason`, returning
/// the resulting [`Trade`] (gross P&L; the cost model overwrites it with
/// net values) and the cash delta to add back (`size_eur + pnl`).
pub fn close(position: &Position, exit_price: f64, exit_ts: DateTime<Utc>, reason: ExitReason, regime_at_exit: Regime, session: crate::types::SessionBucket) -> (Trade, f64) {
    let pnl = match position.direction {
        Direction::Buy => (exit_price - position.entry_price) * position.units,
        Direction::Sell => (position.entry_price - exit_price) * position.units,
        Direction::Neutral => 0.0,
    };
    let duration_hours = (exit_ts - position.entry_ts).num_seconds() as f64 / 3600.0;
    let trade = Trade {
        epic: position.epic.clone(),
        direction: position.direction,
        entry_ts: position.entry_ts,
        exit_ts,
        entry_price: position.entry_price,
        exit_price,
        units: position.units,
        size_eur: position.size_eur,
        pnl,
        pnl_percent: if position.size_eur.abs() > 1e-12 { pnl / position.size_eur * 100.0 } else { 0.0 },
        exit_reason: reason,
        confidence: position.confidence,
        duration_hours,
        day_of_week: exit_ts.weekday().to_string(),
        hour_of_day: exit_ts.hour(),
        session,
        regime_at_exit,
    };
    (trade, position.size_eur + pnl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IndicatorSnapshot, SessionBucket};
    use chrono::TimeZone;

    fn cfg_static() -> PositionManagerConfig {
        PositionManagerConfig {
            mode: SlTpMode::Static,
            sl_buy_pct: 0.02,
            tp_buy_pct: 0.04,
            sl_sell_pct: 0.02,
            tp_sell_pct: 0.04,
            atr_multiplier_sl: 1.5,
            atr_multiplier_tp: 3.0,
        }
    }

    fn snap(atr_pct: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: 50.0,
            macd: 0.0,
            macd_signal: 0.0,
            macd_histogram: 0.0,
            sma_short: 0.0,
            sma_long: 0.0,
            momentum_pct: 0.0,
            atr_pct,
            adx: 0.0,
            plus_di: 0.0,
            minus_di: 0.0,
        }
    }

    fn signal(direction: Direction) -> Signal {
        Signal {
            epic: "GOLD".into(),
            ts: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            direction,
            confidence: 0.8,
            current_price: 100.0,
            reasons: vec![],
            indicators: snap(2.0),
            regime: Regime::Trending,
        }
    }

    #[test]
    fn static_buy_stop_loss_below_entry() {
        let sl = compute_stop_loss(Direction::Buy, 100.0, 2.0, &cfg_static());
        assert!((sl - 98.0).abs() < 1e-9);
    }

    #[test]
    fn dynamic_sl_clamped_to_band() {
        let cfg = PositionManagerConfig {
            mode: SlTpMode::Dynamic,
            ..cfg_static()
        };
        // atr_pct huge -> clamp to 10%.
        let sl = compute_stop_loss(Direction::Buy, 100.0, 50.0, &cfg);
        assert!((sl - 90.0).abs() < 1e-6);
    }

    #[test]
    fn open_debits_full_notional_and_close_credits_notional_plus_pnl() {
        let sig = signal(Direction::Buy);
        let pos = open(&sig, 10.0, 1000.0, &cfg_static()).unwrap();
        assert_eq!(pos.size_eur, 1000.0);
        let (trade, cash_back) = close(&pos, 110.0, sig.ts, ExitReason::TakeProfit, Regime::Trending, SessionBucket::EuOpen);
        assert!((trade.pnl - 100.0).abs() < 1e-9);
        assert!((cash_back - 1100.0).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_takes_priority_when_bar_crosses_both() {
        let sig = signal(Direction::Buy);
        let mut pos = open(&sig, 10.0, 1000.0, &cfg_static()).unwrap();
        let bar = Bar {
            ts: sig.ts,
            open: 100.0,
            high: 200.0,
            low: 50.0,
            close: 50.0,
            volume: None,
        };
        assert_eq!(check_exit(&mut pos, &bar), Some(ExitReason::StopLoss));
    }
}
