//! Simulation loop (component I): deterministic, single-threaded,
//! event-driven backtest over historical bars (chronological iteration,
//! force-close at the end, metrics computed once the run completes).
//!
//! Phases run in this strict order for every eligible date: update →
//! signal → risk gate → allocate → open → mark-to-market. No bar with
//! timestamp greater than the date's evaluation timestamp is ever visible
//! to the signal phase for that date.

use crate::allocator::{legacy_allocate, AllocatorConfig, CapitalAllocator};
use crate::collaborators::{InstrumentSource, PersistenceSink};
use crate::config::AppConfig;
use crate::cost::{apply_cost, CostModelConfig, SpreadMode};
use crate::instrument::InstrumentModel;
use crate::metrics::{self, BacktestResult};
use crate::position::{self, PositionManagerConfig};
use crate::regime::RegimeConfig;
use crate::risk::{CircuitBreaker, CircuitBreakerConfig};
use crate::strategy::{self, MtfContext, StrategyConfig};
use crate::types::{Bar, Direction, EquityPoint, ExitReason, Position, Signal, Trade};
use ahash::AHashMap;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::BTreeSet;

/// A bar series with precomputed timestamp index, so the "ts <= T" and
/// "bars on date D" queries used every simulation step are O(log n)
/// binary searches rather than a per-date linear scan. Bars are assumed
/// already sorted ascending by `ts`; the
/// engine never reorders what it's given.
struct EpicSeries {
    bars: Vec<Bar>,
    timestamps: Vec<DateTime<Utc>>,
}

impl EpicSeries {
    fn new(bars: Vec<Bar>) -> Self {
        let timestamps = bars.iter().map(|b| b.ts).collect();
        EpicSeries { bars, timestamps }
    }

    /// All bars with `ts <= ts`.
    fn prefix_upto(&self, ts: DateTime<Utc>) -> &[Bar] {
        let idx = self.timestamps.partition_point(|t| *t <= ts);
        &self.bars[..idx]
    }

    /// Bars whose UTC date equals `date`, in ascending order.
    fn bars_on_date(&self, date: NaiveDate) -> &[Bar] {
        let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
        let end = start + chrono::Duration::days(1);
        let lo = self.timestamps.partition_point(|t| *t < start);
        let hi = self.timestamps.partition_point(|t| *t < end);
        &self.bars[lo..hi]
    }
}

fn strategy_config_from(cfg: &AppConfig) -> StrategyConfig {
    StrategyConfig {
        rsi_period: cfg.rsi_period,
        rsi_oversold: cfg.rsi_oversold,
        rsi_overbought: cfg.rsi_overbought,
        macd_fast: cfg.macd_fast,
        macd_slow: cfg.macd_slow,
        macd_signal: cfg.macd_signal,
        sma_short: cfg.sma_short,
        sma_long: cfg.sma_long,
        momentum_period: cfg.momentum_period,
        atr_period: cfg.atr_period,
        atr_min_pct: cfg.atr_min_pct,
        atr_max_pct: cfg.atr_max_pct,
        atr_optimal_low: cfg.atr_optimal_low,
        atr_optimal_high: cfg.atr_optimal_high,
        adx_period: cfg.adx_period,
        adx_filter_enabled: cfg.adx_filter_enabled,
        adx_min_trend: cfg.adx_min_trend,
        adx_strong: cfg.adx_strong,
        min_signals_to_trade: cfg.min_signals_to_trade,
        min_confidence: cfg.min_confidence,
        regime: RegimeConfig {
            adx_period: cfg.adx_period,
            atr_period: cfg.atr_period,
            adx_threshold: cfg.regime_adx_threshold,
            atr_pct_threshold: cfg.regime_atr_pct_threshold,
        },
    }
}

fn position_config_from(cfg: &AppConfig) -> PositionManagerConfig {
    PositionManagerConfig {
        mode: cfg.sl_tp_mode,
        sl_buy_pct: cfg.sl_buy_pct,
        tp_buy_pct: cfg.tp_buy_pct,
        sl_sell_pct: cfg.sl_sell_pct,
        tp_sell_pct: cfg.tp_sell_pct,
        atr_multiplier_sl: cfg.atr_multiplier_sl,
        atr_multiplier_tp: cfg.atr_multiplier_tp,
    }
}

fn cost_config_from(cfg: &AppConfig) -> CostModelConfig {
    CostModelConfig {
        commission_per_trade: cfg.commission_per_trade,
        spread_points: cfg.spread_points,
        point_value: cfg.point_value,
        spread_mode: SpreadMode::parse(&cfg.spread_mode),
        overrides: cfg.cost_overrides.clone(),
    }
}

fn breaker_config_from(cfg: &AppConfig) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: cfg.enable_circuit_breaker,
        max_daily_loss_percent: cfg.max_daily_loss_percent,
        max_weekly_loss_percent: cfg.max_weekly_loss_percent,
        max_consecutive_losses: cfg.max_consecutive_losses,
        max_total_drawdown_percent: cfg.max_total_drawdown_percent,
    }
}

fn allocator_config_from(cfg: &AppConfig) -> AllocatorConfig {
    AllocatorConfig {
        daily_budget_pct: cfg.daily_budget_pct,
        per_trade_cap_pct: cfg.per_trade_cap_pct,
        min_allocation_eur: cfg.min_allocation_eur,
        allow_partial: cfg.allow_partial_allocation,
    }
}

fn equity_of(cash: f64, open_positions: &AHashMap<String, Position>) -> f64 {
    cash + open_positions.values().map(|p| p.size_eur + p.unrealized_pnl()).sum::<f64>()
}

fn log_persistence_err(context: &str, result: crate::error::EngineResult<()>) {
    if let Err(e) = result {
        tracing::warn!(context, error = %e, "persistence call failed, continuing");
    }
}

/// Runs a full backtest over `bars_by_epic` and returns the aggregate
/// [`BacktestResult`]. `mtf_bars_by_epic`, when present, supplies the
/// slower-timeframe series consulted for MTF confirmation;
/// `instrument_source` backs the instrument-spec cache (component E);
/// `persistence` receives trades, equity points, signals, and the final
/// metrics (a [`crate::collaborators::NullPersistence`] is fine for
/// tests).
pub fn run_backtest(
    cfg: &AppConfig,
    bars_by_epic: &AHashMap<String, Vec<Bar>>,
    mtf_bars_by_epic: Option<&AHashMap<String, Vec<Bar>>>,
    instrument_source: &dyn InstrumentSource,
    persistence: &dyn PersistenceSink,
) -> BacktestResult {
    let strat_cfg = strategy_config_from(cfg);
    let pos_cfg = position_config_from(cfg);
    let cost_cfg = cost_config_from(cfg);

    let series: AHashMap<String, EpicSeries> = bars_by_epic.iter().map(|(epic, bars)| (epic.clone(), EpicSeries::new(bars.clone()))).collect();
    let mtf_series: AHashMap<String, EpicSeries> = mtf_bars_by_epic
        .map(|m| m.iter().map(|(epic, bars)| (epic.clone(), EpicSeries::new(bars.clone()))).collect())
        .unwrap_or_default();

    let mut dates: BTreeSet<NaiveDate> = BTreeSet::new();
    for s in series.values() {
        for b in &s.bars {
            dates.insert(b.ts.date_naive());
        }
    }

    let instrument_model = InstrumentModel::new();
    let mut capital_allocator = CapitalAllocator::new(allocator_config_from(cfg));
    let mut circuit_breaker = CircuitBreaker::new(breaker_config_from(cfg));

    let mut cash = cfg.initial_capital;
    let mut open_positions: AHashMap<String, Position> = AHashMap::new();
    let mut margin_in_use: AHashMap<String, f64> = AHashMap::new();
    let mut trades: Vec<Trade> = Vec::new();
    let mut equity_curve: Vec<EquityPoint> = Vec::new();

    circuit_breaker.initialize(cash, dates.iter().next().map(|d| Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap())).unwrap_or_else(Utc::now));

    for &date in &dates {
        // 1. Update phase: monitor every open position against this
        // date's bars for its epic, in chronological order.
        let mut closed_epics: Vec<String> = Vec::new();
        for (epic, position) in open_positions.iter_mut() {
            let epic_series = match series.get(epic) {
                Some(s) => s,
                None => continue,
            };
            for bar in epic_series.bars_on_date(date) {
                if let Some(reason) = position::check_exit(position, bar) {
                    let regime_cfg = strat_cfg.regime;
                    let regime_at_exit = crate::regime::classify(epic_series.prefix_upto(bar.ts), &regime_cfg);
                    let session = metrics::classify_session(bar.ts);
                    let (trade, cash_back) = position::close(position, position.current_price, bar.ts, reason, regime_at_exit, session);
                    cash += cash_back;
                    circuit_breaker.register_trade_result(trade.pnl);
                    trades.push(trade);
                    margin_in_use.remove(epic);
                    closed_epics.push(epic.clone());
                    break;
                }
            }
        }
        for epic in closed_epics {
            open_positions.remove(&epic);
        }

        // Last bar timestamp observed today, across all epics — used for
        // the equity point and as "now" for the allocator/breaker.
        let mut date_last_ts: Option<DateTime<Utc>> = None;

        // 2. Signal phase.
        let mut candidate_signals: Vec<Signal> = Vec::new();
        for epic in &cfg.epics {
            let epic_series = match series.get(epic) {
                Some(s) => s,
                None => continue,
            };
            let today_bars = epic_series.bars_on_date(date);
            let eval_ts = match today_bars.last() {
                Some(b) => b.ts,
                None => continue,
            };
            date_last_ts = Some(date_last_ts.map_or(eval_ts, |t: DateTime<Utc>| t.max(eval_ts)));

            let bars_subset = epic_series.prefix_upto(eval_ts);
            let mtf_ctx = if cfg.mtf_enabled {
                mtf_series.get(epic).map(|m| MtfContext {
                    bars: m.prefix_upto(eval_ts),
                    sma_short: cfg.mtf_sma_short,
                    sma_long: cfg.mtf_sma_long,
                    rsi_period: cfg.mtf_rsi_period,
                })
            } else {
                None
            };
            let mut signal = strategy::evaluate(epic, bars_subset, &strat_cfg, mtf_ctx.as_ref());

            if cfg.regime_filter_enabled && signal.regime.as_str() == cfg.regime_filter_block {
                signal.direction = Direction::Neutral;
                signal.confidence = 0.0;
            }
            if signal.confidence < cfg.min_confidence {
                signal.direction = Direction::Neutral;
                signal.confidence = 0.0;
            }

            if signal.direction != Direction::Neutral {
                log_persistence_err("record_signal", persistence.record_signal(&signal));
                candidate_signals.push(signal);
            }
        }

        // 3-5. Risk gate, allocate, open — skipped entirely while the
        // breaker is tripped; existing positions are left in force.
        if !circuit_breaker.is_active() && !candidate_signals.is_empty() {
            let equity_now = equity_of(cash, &open_positions);
            let now = date_last_ts.unwrap_or_else(|| Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap()));

            let allocations: Vec<(String, f64)> = if cfg.use_capital_tracker {
                capital_allocator.allocate_for_signals(equity_now, &candidate_signals, now)
            } else {
                legacy_allocate(
                    equity_now,
                    &candidate_signals,
                    open_positions.len() as u32,
                    cfg.max_positions,
                    cfg.capital_mode,
                    cfg.max_capital_percent,
                    cfg.max_capital_fixed,
                    cfg.distribution_mode,
                )
            };

            let signals_by_epic: AHashMap<&str, &Signal> = candidate_signals.iter().map(|s| (s.epic.as_str(), s)).collect();

            for (epic, alloc_eur) in &allocations {
                if *alloc_eur <= 0.0 {
                    continue;
                }
                if open_positions.contains_key(epic) {
                    continue;
                }
                if open_positions.len() as u32 >= cfg.max_positions {
                    continue;
                }
                let signal = match signals_by_epic.get(epic.as_str()) {
                    Some(s) => *s,
                    None => continue,
                };

                let mut target_margin = alloc_eur * cfg.size_safety_margin;
                target_margin = target_margin.min(equity_now * cfg.max_margin_per_asset);
                let total_margin_used: f64 = margin_in_use.values().sum();
                if total_margin_used + target_margin > equity_now * cfg.max_capital_risk {
                    continue;
                }

                let sizing = instrument_model.size_for_target_margin(epic, signal.current_price, target_margin, instrument_source);
                if sizing.units < cfg.min_position_size {
                    continue;
                }
                let size_eur = signal.current_price * sizing.units;
                if size_eur <= 0.0 || size_eur > cash {
                    continue;
                }
                let Some(position) = position::open(signal, sizing.units, size_eur, &pos_cfg) else {
                    continue;
                };
                cash -= size_eur;
                margin_in_use.insert(epic.clone(), sizing.estimated_margin);
                open_positions.insert(epic.clone(), position);
                if cfg.use_capital_tracker {
                    capital_allocator.record_fill(*alloc_eur, now);
                }
            }
        }

        // 6. Mark-to-market phase.
        if let Some(ts) = date_last_ts {
            let equity = equity_of(cash, &open_positions);
            let point = EquityPoint {
                ts,
                equity,
                cash,
                open_positions: open_positions.len() as u32,
            };
            circuit_breaker.update_balance(equity, ts);
            log_persistence_err("record_equity_point", persistence.record_equity_point(&point));
            equity_curve.push(point);
        }
    }

    // 7. End: force-close every remaining open position at its last
    // observed price, then apply the cost model to all accumulated trades.
    let run_end_ts = equity_curve.last().map(|p| p.ts).unwrap_or_else(Utc::now);
    let remaining: Vec<(String, Position)> = open_positions.drain().collect();
    for (epic, position) in remaining {
        let regime_cfg = strat_cfg.regime;
        let regime_at_exit = series
            .get(&epic)
            .map(|s| crate::regime::classify(s.prefix_upto(run_end_ts), &regime_cfg))
            .unwrap_or(position.regime_at_open);
        let session = metrics::classify_session(run_end_ts);
        let (trade, cash_back) = position::close(&position, position.current_price, run_end_ts, ExitReason::EndOfRun, regime_at_exit, session);
        cash += cash_back;
        trades.push(trade);
    }

    let mut total_cost = 0.0;
    for trade in trades.iter_mut() {
        total_cost += apply_cost(trade, &cost_cfg).total();
    }
    trades.sort_by_key(|t| t.exit_ts);

    // Costs are only known once every trade has closed, so `cash` and the
    // equity curve were accumulated gross throughout the run above. Net
    // the total cost out of both now so final capital and the curve's
    // last point agree with the cost-adjusted trade list.
    cash -= total_cost;
    if let Some(last) = equity_curve.last_mut() {
        last.equity -= total_cost;
        last.cash -= total_cost;
    }

    for trade in &trades {
        log_persistence_err("record_trade", persistence.record_trade(trade));
    }

    let result = metrics::compute(&trades, &equity_curve, cfg.initial_capital);
    log_persistence_err("record_metrics", persistence.record_metrics(&result));
    result
}
