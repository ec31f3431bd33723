//! Live loop glue (component L): the same phase sequence as the
//! simulation loop (component I), driven by wall-clock ticks against a
//! real broker instead of historical bars. Kept synchronous like every
//! other core collaborator trait — the binary wrapping this in a
//! `tokio` polling loop owns the only async boundary (HTTP fetch,
//! persistence I/O, inter-tick sleep), grounded on the original
//! `live_main.py`'s warmup-then-poll structure.

use crate::allocator::{legacy_allocate, AllocatorConfig, CapitalAllocator};
use crate::collaborators::{AccountSource, InstrumentSource, OrderRequest, OrderRouter, PersistenceSink};
use crate::config::AppConfig;
use crate::instrument::InstrumentModel;
use crate::metrics::classify_session;
use crate::position::{self, PositionManagerConfig};
use crate::regime::RegimeConfig;
use crate::risk::{CircuitBreaker, CircuitBreakerConfig};
use crate::strategy::{self, StrategyConfig};
use crate::types::{Bar, Direction, EquityPoint, Position, Signal};
use ahash::AHashMap;
use chrono::{DateTime, Datelike, Timelike, Utc};

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

fn allocator_config_from(cfg: &AppConfig) -> AllocatorConfig {
    AllocatorConfig {
        daily_budget_pct: cfg.daily_budget_pct,
        per_trade_cap_pct: cfg.per_trade_cap_pct,
        min_allocation_eur: cfg.min_allocation_eur,
        allow_partial: cfg.allow_partial_allocation,
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

/// Gates new entries to a trading window, UTC `[start_hour, end_hour)`,
/// Monday through Friday. Existing positions still get monitored
/// outside the window — only new signal evaluation is skipped.
pub fn in_trading_window(now: DateTime<Utc>, cfg: &AppConfig) -> bool {
    let is_weekday = !matches!(now.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun);
    is_weekday && now.hour() >= cfg.start_hour && now.hour() < cfg.end_hour
}

/// What happened during one [`LiveEngine::tick`] call, for the binary to
/// log without re-deriving it from persistence.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub equity: f64,
    pub breaker_active: bool,
}

/// Owns the accumulated per-epic bar history, open positions, and the
/// allocator/breaker/instrument-model state across ticks. One instance
/// per running live binary; not `Send`-shared across threads (the live
/// loop is single-owner).
pub struct LiveEngine {
    cfg: AppConfig,
    strat_cfg: StrategyConfig,
    pos_cfg: PositionManagerConfig,
    series: AHashMap<String, Vec<Bar>>,
    mtf_series: AHashMap<String, Vec<Bar>>,
    instrument_model: InstrumentModel,
    capital_allocator: CapitalAllocator,
    circuit_breaker: CircuitBreaker,
    open_positions: AHashMap<String, Position>,
    margin_in_use: AHashMap<String, f64>,
    warmed_up: bool,
}

impl LiveEngine {
    pub fn new(cfg: AppConfig) -> Self {
        let strat_cfg = strategy_config_from(&cfg);
        let pos_cfg = position_config_from(&cfg);
        let allocator = CapitalAllocator::new(allocator_config_from(&cfg));
        let breaker = CircuitBreaker::new(breaker_config_from(&cfg));
        LiveEngine {
            cfg,
            strat_cfg,
            pos_cfg,
            series: AHashMap::new(),
            mtf_series: AHashMap::new(),
            instrument_model: InstrumentModel::new(),
            capital_allocator: allocator,
            circuit_breaker: breaker,
            open_positions: AHashMap::new(),
            margin_in_use: AHashMap::new(),
            warmed_up: false,
        }
    }

    /// Feeds historical warmup bars through the indicator/regime machinery
    /// without evaluating signals or trading, so the first real tick
    /// already has a full indicator window. Call once per epic
    /// before the first [`Self::tick`]; `initial_balance` seeds the
    /// circuit breaker's daily/weekly/peak anchors.
    pub fn warmup(&mut self, epic: &str, bars: Vec<Bar>, mtf_bars: Option<Vec<Bar>>) {
        self.series.entry(epic.to_string()).or_default().extend(bars);
        if let Some(m) = mtf_bars {
            self.mtf_series.entry(epic.to_string()).or_default().extend(m);
        }
    }

    /// Must be called once, after all epics are warmed up, before the
    /// first tick — anchors the circuit breaker to the broker's actual
    /// starting balance rather than a config default.
    pub fn start(&mut self, starting_balance: f64, now: DateTime<Utc>) {
        self.circuit_breaker.initialize(starting_balance, now);
        self.warmed_up = true;
        crate::botstate::update_heartbeat(now);
    }

    fn equity_of(&self, cash: f64) -> f64 {
        cash + self.open_positions.values().map(|p| p.size_eur + p.unrealized_pnl()).sum::<f64>()
    }

    /// One live tick. `new_bars_by_epic` holds whatever the broker returned
    /// since the last tick for each epic (possibly empty for an epic with
    /// nothing new); bars are appended to the running series before
    /// evaluation. Does nothing but record a heartbeat if
    /// [`crate::botstate::is_running`] is false.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        new_bars_by_epic: &AHashMap<String, Vec<Bar>>,
        account: &dyn AccountSource,
        order_router: &dyn OrderRouter,
        instrument_source: &dyn InstrumentSource,
        persistence: &dyn PersistenceSink,
    ) -> TickOutcome {
        crate::botstate::update_heartbeat(now);
        let mut outcome = TickOutcome::default();
        if !crate::botstate::is_running() || !self.warmed_up {
            return outcome;
        }

        for (epic, bars) in new_bars_by_epic {
            self.series.entry(epic.clone()).or_default().extend(bars.iter().copied());
        }

        let account_snapshot = match account.account() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "account snapshot unavailable, skipping tick");
                return outcome;
            }
        };
        let mut cash = account_snapshot.available;

        // 1. Update phase: monitor every open position against the latest
        // observed bar for its epic.
        let mut closed_epics: Vec<String> = Vec::new();
        for (epic, position) in self.open_positions.iter_mut() {
            let Some(bars) = self.series.get(epic) else { continue };
            let Some(latest) = bars.last() else { continue };
            if let Some(reason) = position::check_exit(position, latest) {
                let regime_cfg = self.strat_cfg.regime;
                let regime_at_exit = crate::regime::classify(bars, &regime_cfg);
                let session = classify_session(now);
                match order_router.close(epic, position.units) {
                    Ok(ack) => {
                        let (trade, cash_back) = position::close(position, ack.fill_price, now, reason, regime_at_exit, session);
                        cash += cash_back;
                        self.circuit_breaker.register_trade_result(trade.pnl);
                        if let Err(e) = persistence.record_trade(&trade) {
                            tracing::warn!(error = %e, "record_trade failed");
                        }
                        self.margin_in_use.remove(epic);
                        closed_epics.push(epic.clone());
                        outcome.closed.push(epic.clone());
                    }
                    Err(e) => {
                        tracing::error!(epic, error = %e, "order close rejected, position remains open");
                    }
                }
            }
        }
        for epic in closed_epics {
            self.open_positions.remove(&epic);
        }

        // 2. Signal phase, gated to the configured trading window.
        let mut candidate_signals: Vec<Signal> = Vec::new();
        if in_trading_window(now, &self.cfg) {
            for epic in &self.cfg.epics {
                let Some(bars) = self.series.get(epic) else { continue };
                if bars.is_empty() {
                    continue;
                }
                let mtf_ctx = if self.cfg.mtf_enabled {
                    self.mtf_series.get(epic).map(|m| strategy::MtfContext {
                        bars: m.as_slice(),
                        sma_short: self.cfg.mtf_sma_short,
                        sma_long: self.cfg.mtf_sma_long,
                        rsi_period: self.cfg.mtf_rsi_period,
                    })
                } else {
                    None
                };
                let mut signal = strategy::evaluate(epic, bars, &self.strat_cfg, mtf_ctx.as_ref());

                if self.cfg.regime_filter_enabled && signal.regime.as_str() == self.cfg.regime_filter_block {
                    signal.direction = Direction::Neutral;
                    signal.confidence = 0.0;
                }
                if signal.confidence < self.cfg.min_confidence {
                    signal.direction = Direction::Neutral;
                    signal.confidence = 0.0;
                }
                if signal.direction != Direction::Neutral {
                    if let Err(e) = persistence.record_signal(&signal) {
                        tracing::warn!(error = %e, "record_signal failed");
                    }
                    candidate_signals.push(signal);
                }
            }
        }

        // 3-5. Risk gate, allocate, open.
        outcome.breaker_active = self.circuit_breaker.is_active();
        if !outcome.breaker_active && !candidate_signals.is_empty() {
            let equity_now = self.equity_of(cash);

            let allocations: Vec<(String, f64)> = if self.cfg.use_capital_tracker {
                self.capital_allocator.allocate_for_signals(equity_now, &candidate_signals, now)
            } else {
                legacy_allocate(
                    equity_now,
                    &candidate_signals,
                    self.open_positions.len() as u32,
                    self.cfg.max_positions,
                    self.cfg.capital_mode,
                    self.cfg.max_capital_percent,
                    self.cfg.max_capital_fixed,
                    self.cfg.distribution_mode,
                )
            };

            let signals_by_epic: AHashMap<&str, &Signal> = candidate_signals.iter().map(|s| (s.epic.as_str(), s)).collect();

            for (epic, alloc_eur) in &allocations {
                if *alloc_eur <= 0.0 || self.open_positions.contains_key(epic) {
                    continue;
                }
                if self.open_positions.len() as u32 >= self.cfg.max_positions {
                    continue;
                }
                let Some(signal) = signals_by_epic.get(epic.as_str()).copied() else { continue };

                let mut target_margin = alloc_eur * self.cfg.size_safety_margin;
                target_margin = target_margin.min(equity_now * self.cfg.max_margin_per_asset);
                let total_margin_used: f64 = self.margin_in_use.values().sum();
                if total_margin_used + target_margin > equity_now * self.cfg.max_capital_risk {
                    continue;
                }

                let sizing = self.instrument_model.size_for_target_margin(epic, signal.current_price, target_margin, instrument_source);
                if sizing.units < self.cfg.min_position_size {
                    continue;
                }
                let size_eur = signal.current_price * sizing.units;
                if size_eur <= 0.0 || size_eur > cash {
                    continue;
                }

                let stop_loss = position::compute_stop_loss(signal.direction, signal.current_price, signal.indicators.atr_pct, &self.pos_cfg);
                let take_profit = position::compute_take_profit(signal.direction, signal.current_price, signal.indicators.atr_pct, &self.pos_cfg);
                let req = OrderRequest {
                    epic: epic.clone(),
                    direction: signal.direction,
                    units: sizing.units,
                    stop_loss,
                    take_profit,
                };
                match order_router.open(&req) {
                    Ok(ack) => {
                        let filled_size_eur = ack.fill_price * sizing.units;
                        let position = Position {
                            epic: epic.clone(),
                            direction: signal.direction,
                            entry_ts: now,
                            entry_price: ack.fill_price,
                            units: sizing.units,
                            size_eur: filled_size_eur,
                            stop_loss,
                            take_profit,
                            confidence: signal.confidence,
                            regime_at_open: signal.regime,
                            current_price: ack.fill_price,
                        };
                        cash -= filled_size_eur;
                        self.margin_in_use.insert(epic.clone(), sizing.estimated_margin);
                        self.open_positions.insert(epic.clone(), position);
                        outcome.opened.push(epic.clone());
                        if self.cfg.use_capital_tracker {
                            self.capital_allocator.record_fill(*alloc_eur, now);
                        }
                    }
                    Err(e) => {
                        tracing::error!(epic, error = %e, "order open rejected");
                    }
                }
            }
        }

        // 6. Mark-to-market: persist this tick's equity point.
        let equity = self.equity_of(cash);
        self.circuit_breaker.update_balance(equity, now);
        let point = EquityPoint {
            ts: now,
            equity,
            cash,
            open_positions: self.open_positions.len() as u32,
        };
        if let Err(e) = persistence.record_equity_point(&point) {
            tracing::warn!(error = %e, "record_equity_point failed");
        }
        outcome.equity = equity;
        outcome
    }
}
