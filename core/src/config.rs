//! config.rs — Centralised configuration loaded from .env
//!
//! All parameters consumed by the engine are defined here. Loading happens
//! once at startup; every module borrows `&AppConfig`. Every numeric field
//! is domain-validated by [`AppConfig::from_env`]; the first violation is
//! returned as [`EngineError::ConfigurationInvalid`] rather than panicking.

use crate::cost::CostOverride;
use crate::error::{EngineError, EngineResult};
use ahash::AHashMap;
use std::env;

/// Capital-sizing mode for the legacy proportional-budget fallback path
/// (used when `USE_CAPITAL_TRACKER` is disabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapitalMode {
    Percent,
    Fixed,
}

/// How the legacy fallback path spreads its budget across concurrently
/// eligible signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionMode {
    Equal,
    Weighted,
}

/// Stop-loss / take-profit computation mode (component F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlTpMode {
    Static,
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // ── Trading universe ─────────────────────────────────────────────
    pub epics: Vec<String>,
    pub resolution: String,
    pub start_hour: u32,
    pub end_hour: u32,
    pub scan_interval_secs: u64,

    // ── Strategy (component C) ───────────────────────────────────────
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub sma_short: usize,
    pub sma_long: usize,
    pub momentum_period: usize,
    pub min_signals_to_trade: u32,
    pub min_confidence: f64,

    // ── Volatility / trend filters ───────────────────────────────────
    pub atr_period: usize,
    pub atr_min_pct: f64,
    pub atr_max_pct: f64,
    pub atr_optimal_low: f64,
    pub atr_optimal_high: f64,
    pub adx_period: usize,
    pub adx_filter_enabled: bool,
    pub adx_min_trend: f64,
    pub adx_strong: f64,

    // ── Multi-timeframe confirmation ─────────────────────────────────
    pub mtf_enabled: bool,
    pub mtf_sma_short: usize,
    pub mtf_sma_long: usize,
    pub mtf_rsi_period: usize,

    // ── Regime filter ────────────────────────────────────────────────
    pub regime_filter_enabled: bool,
    pub regime_filter_block: String,
    pub regime_adx_threshold: f64,
    pub regime_atr_pct_threshold: f64,

    // ── Capital allocation (component D) ─────────────────────────────
    pub use_capital_tracker: bool,
    pub daily_budget_pct: f64,
    pub per_trade_cap_pct: f64,
    pub min_allocation_eur: f64,
    pub allow_partial_allocation: bool,
    pub capital_mode: CapitalMode,
    pub max_capital_percent: f64,
    pub max_capital_fixed: f64,
    pub distribution_mode: DistributionMode,
    pub size_safety_margin: f64,
    pub max_capital_risk: f64,
    pub max_margin_per_asset: f64,
    pub max_positions: u32,
    pub min_position_size: f64,
    /// Legacy fallback path only (`USE_CAPITAL_TRACKER=false`); independent
    /// of `max_capital_percent`, which belongs to `CAPITAL_MODE=PERCENTAGE`
    /// sizing.
    pub target_percent_of_available: f64,

    // ── Stop-loss / take-profit (component F) ────────────────────────
    pub sl_tp_mode: SlTpMode,
    pub sl_buy_pct: f64,
    pub tp_buy_pct: f64,
    pub sl_sell_pct: f64,
    pub tp_sell_pct: f64,
    pub atr_multiplier_sl: f64,
    pub atr_multiplier_tp: f64,

    // ── Cost model (component G) ──────────────────────────────────────
    pub commission_per_trade: f64,
    pub spread_points: f64,
    pub point_value: f64,
    pub spread_mode: String,
    pub cost_overrides: AHashMap<String, CostOverride>,

    // ── Risk supervisor / circuit breaker (component H) ──────────────
    pub enable_circuit_breaker: bool,
    pub max_daily_loss_percent: f64,
    pub max_weekly_loss_percent: f64,
    pub max_consecutive_losses: u32,
    pub max_total_drawdown_percent: f64,
    pub trading_days_per_week: u32,

    // ── Simulation / backtest ────────────────────────────────────────
    pub initial_capital: f64,
}

impl AppConfig {
    /// Load configuration from environment variables (after dotenv).
    pub fn from_env() -> EngineResult<Self> {
        dotenv::dotenv().ok(); // ignore missing .env

        let epics: Vec<String> = env::var("EPICS")
            .unwrap_or_else(|_| "GOLD,TSLA,DE40,SP35".into())
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
        if epics.is_empty() {
            return Err(EngineError::ConfigurationInvalid {
                field: "EPICS".into(),
                value: "<empty>".into(),
            });
        }

        let capital_mode = match env::var("CAPITAL_MODE").unwrap_or_else(|_| "PERCENT".into()).to_uppercase().as_str() {
            "FIXED" => CapitalMode::Fixed,
            _ => CapitalMode::Percent,
        };
        let sl_tp_mode = match env::var("SL_TP_MODE").unwrap_or_else(|_| "STATIC".into()).to_uppercase().as_str() {
            "DYNAMIC" => SlTpMode::Dynamic,
            _ => SlTpMode::Static,
        };
        let distribution_mode = match env::var("DISTRIBUTION_MODE").unwrap_or_else(|_| "EQUAL".into()).to_uppercase().as_str() {
            "WEIGHTED" => DistributionMode::Weighted,
            _ => DistributionMode::Equal,
        };

        let cfg = AppConfig {
            epics,
            resolution: env::var("RESOLUTION").unwrap_or_else(|_| "HOUR".into()),
            start_hour: parse_env("START_HOUR", 9u32)?,
            end_hour: parse_env("END_HOUR", 22u32)?,
            scan_interval_secs: parse_env("SCAN_INTERVAL", 900u64)?,

            rsi_period: parse_env("RSI_PERIOD", 14usize)?,
            rsi_oversold: parse_env("RSI_OVERSOLD", 35.0)?,
            rsi_overbought: parse_env("RSI_OVERBOUGHT", 65.0)?,
            macd_fast: parse_env("MACD_FAST", 12usize)?,
            macd_slow: parse_env("MACD_SLOW", 26usize)?,
            macd_signal: parse_env("MACD_SIGNAL", 9usize)?,
            sma_short: parse_env("SMA_SHORT", 10usize)?,
            sma_long: parse_env("SMA_LONG", 50usize)?,
            momentum_period: parse_env("MOMENTUM_PERIOD", 10usize)?,
            min_signals_to_trade: parse_env("MIN_SIGNALS_TO_TRADE", 2u32)?,
            min_confidence: parse_env("MIN_CONFIDENCE", 0.50)?,

            atr_period: parse_env("ATR_PERIOD", 14usize)?,
            atr_min_pct: parse_env("ATR_MIN_PCT", 0.5)?,
            atr_max_pct: parse_env("ATR_MAX_PCT", 5.0)?,
            atr_optimal_low: parse_env("ATR_OPTIMAL_LOW", 1.0)?,
            atr_optimal_high: parse_env("ATR_OPTIMAL_HIGH", 3.0)?,
            adx_period: parse_env("ADX_PERIOD", 14usize)?,
            adx_filter_enabled: parse_env_bool("ADX_FILTER_ENABLED", true),
            adx_min_trend: parse_env("ADX_MIN_TREND", 20.0)?,
            adx_strong: parse_env("ADX_STRONG", 40.0)?,

            mtf_enabled: parse_env_bool("MTF_ENABLED", false),
            mtf_sma_short: parse_env("MTF_SMA_SHORT", 10usize)?,
            mtf_sma_long: parse_env("MTF_SMA_LONG", 50usize)?,
            mtf_rsi_period: parse_env("MTF_RSI_PERIOD", 14usize)?,

            regime_filter_enabled: parse_env_bool("REGIME_FILTER_ENABLED", true),
            regime_filter_block: env::var("REGIME_FILTER_BLOCK").unwrap_or_else(|_| "lateral".into()).to_lowercase(),
            regime_adx_threshold: parse_env("REGIME_ADX_THRESHOLD", 25.0)?,
            regime_atr_pct_threshold: parse_env("REGIME_ATR_PCT_THRESHOLD", 0.5)?,

            use_capital_tracker: parse_env_bool("USE_CAPITAL_TRACKER", true),
            daily_budget_pct: parse_env("DAILY_BUDGET_PCT", 0.08)?,
            per_trade_cap_pct: parse_env("PER_TRADE_CAP_PCT", 0.03)?,
            min_allocation_eur: parse_env("MIN_ALLOCATION_EUR", 0.0)?,
            allow_partial_allocation: parse_env_bool("ALLOW_PARTIAL_ALLOCATION", true),
            capital_mode,
            max_capital_percent: parse_env("MAX_CAPITAL_PERCENT", 40.0)?,
            max_capital_fixed: parse_env("MAX_CAPITAL_FIXED", 400.0)?,
            distribution_mode,
            size_safety_margin: parse_env("SIZE_SAFETY_MARGIN", 0.85)?,
            max_capital_risk: parse_env("MAX_CAPITAL_RISK", 0.70)?,
            max_margin_per_asset: parse_env("MAX_MARGIN_PER_ASSET", 0.35)?,
            max_positions: parse_env("MAX_POSITIONS", 8u32)?,
            min_position_size: parse_env("MIN_POSITION_SIZE", 0.01)?,
            target_percent_of_available: parse_env("TARGET_PERCENT_OF_AVAILABLE", 0.60)?,

            sl_tp_mode,
            sl_buy_pct: parse_env("SL_BUY_PCT", 0.02)?,
            tp_buy_pct: parse_env("TP_BUY_PCT", 0.04)?,
            sl_sell_pct: parse_env("SL_SELL_PCT", 0.02)?,
            tp_sell_pct: parse_env("TP_SELL_PCT", 0.04)?,
            atr_multiplier_sl: parse_env("ATR_MULTIPLIER_SL", 1.5)?,
            atr_multiplier_tp: parse_env("ATR_MULTIPLIER_TP", 3.0)?,

            commission_per_trade: parse_env("COMMISSION_PER_TRADE", 0.0)?,
            spread_points: parse_env("SPREAD_POINTS", 0.0)?,
            point_value: parse_env("POINT_VALUE", 1.0)?,
            spread_mode: env::var("SPREAD_MODE").unwrap_or_else(|_| "once".into()).to_lowercase(),
            cost_overrides: parse_cost_overrides("COST_OVERRIDES"),

            enable_circuit_breaker: parse_env_bool("ENABLE_CIRCUIT_BREAKER", true),
            max_daily_loss_percent: parse_env("MAX_DAILY_LOSS_PERCENT", 3.0)?,
            max_weekly_loss_percent: parse_env("MAX_WEEKLY_LOSS_PERCENT", 8.0)?,
            max_consecutive_losses: parse_env("MAX_CONSECUTIVE_LOSSES", 5u32)?,
            max_total_drawdown_percent: parse_env("MAX_TOTAL_DRAWDOWN_PERCENT", 15.0)?,
            trading_days_per_week: parse_env("TRADING_DAYS_PER_WEEK", 5u32)?,

            initial_capital: parse_env("INITIAL_CAPITAL", 10000.0)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> EngineResult<()> {
        let checks: &[(&str, f64, bool)] = &[
            ("DAILY_BUDGET_PCT", self.daily_budget_pct, self.daily_budget_pct > 0.0 && self.daily_budget_pct <= 1.0),
            ("PER_TRADE_CAP_PCT", self.per_trade_cap_pct, self.per_trade_cap_pct > 0.0 && self.per_trade_cap_pct <= 1.0),
            ("MIN_CONFIDENCE", self.min_confidence, (0.0..=1.0).contains(&self.min_confidence)),
            ("INITIAL_CAPITAL", self.initial_capital, self.initial_capital.is_finite() && self.initial_capital > 0.0),
            ("MAX_DAILY_LOSS_PERCENT", self.max_daily_loss_percent, self.max_daily_loss_percent > 0.0),
            ("MAX_WEEKLY_LOSS_PERCENT", self.max_weekly_loss_percent, self.max_weekly_loss_percent > 0.0),
            ("MAX_TOTAL_DRAWDOWN_PERCENT", self.max_total_drawdown_percent, self.max_total_drawdown_percent > 0.0),
            ("SIZE_SAFETY_MARGIN", self.size_safety_margin, self.size_safety_margin > 0.0 && self.size_safety_margin <= 1.0),
            ("ATR_MIN_PCT", self.atr_min_pct, self.atr_min_pct >= 0.0 && self.atr_min_pct < self.atr_max_pct),
        ];
        for (field, value, ok) in checks {
            if !*ok {
                return Err(EngineError::ConfigurationInvalid {
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }
        }
        if self.start_hour >= self.end_hour {
            return Err(EngineError::ConfigurationInvalid {
                field: "START_HOUR/END_HOUR".into(),
                value: format!("{}/{}", self.start_hour, self.end_hour),
            });
        }
        if self.max_positions == 0 {
            return Err(EngineError::ConfigurationInvalid {
                field: "MAX_POSITIONS".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, default: T) -> EngineResult<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v.parse::<T>().map_err(|e| EngineError::ConfigurationInvalid {
            field: key.to_string(),
            value: format!("{v} ({e})"),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => v.trim().to_lowercase() == "true",
        Err(_) => default,
    }
}

/// Parses `COST_OVERRIDES="EPIC:commission:spread:point_value,EPIC2:..."`
/// into a per-epic override map. A missing leg in a triple (empty string)
/// leaves that field unset so the global default still applies to it.
/// Malformed entries are skipped rather than rejected at startup — cost
/// overrides are an optimization, not a correctness requirement.
fn parse_cost_overrides(key: &str) -> AHashMap<String, CostOverride> {
    let mut out = AHashMap::new();
    let raw = match env::var(key) {
        Ok(v) => v,
        Err(_) => return out,
    };
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let parts: Vec<&str> = entry.split(':').collect();
        if parts.len() != 4 {
            continue;
        }
        let epic = parts[0].to_string();
        let parse_opt = |s: &str| -> Option<f64> { if s.is_empty() { None } else { s.parse::<f64>().ok() } };
        out.insert(
            epic,
            CostOverride {
                commission_per_trade: parse_opt(parts[1]),
                spread_points: parse_opt(parts[2]),
                point_value: parse_opt(parts[3]),
            },
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_without_any_env() {
        // Exercises the same validation path as from_env() without
        // depending on the process environment being clean.
        let cfg = AppConfig {
            epics: vec!["GOLD".into()],
            resolution: "HOUR".into(),
            start_hour: 9,
            end_hour: 22,
            scan_interval_secs: 900,
            rsi_period: 14,
            rsi_oversold: 35.0,
            rsi_overbought: 65.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            sma_short: 10,
            sma_long: 50,
            momentum_period: 10,
            min_signals_to_trade: 2,
            min_confidence: 0.50,
            atr_period: 14,
            atr_min_pct: 0.5,
            atr_max_pct: 5.0,
            atr_optimal_low: 1.0,
            atr_optimal_high: 3.0,
            adx_period: 14,
            adx_filter_enabled: true,
            adx_min_trend: 20.0,
            adx_strong: 40.0,
            mtf_enabled: false,
            mtf_sma_short: 10,
            mtf_sma_long: 50,
            mtf_rsi_period: 14,
            regime_filter_enabled: true,
            regime_filter_block: "lateral".into(),
            regime_adx_threshold: 25.0,
            regime_atr_pct_threshold: 0.5,
            use_capital_tracker: true,
            daily_budget_pct: 0.08,
            per_trade_cap_pct: 0.03,
            min_allocation_eur: 0.0,
            allow_partial_allocation: true,
            capital_mode: CapitalMode::Percent,
            max_capital_percent: 40.0,
            max_capital_fixed: 400.0,
            distribution_mode: DistributionMode::Equal,
            size_safety_margin: 0.85,
            max_capital_risk: 0.70,
            max_margin_per_asset: 0.35,
            max_positions: 8,
            min_position_size: 0.01,
            target_percent_of_available: 0.60,
            sl_tp_mode: SlTpMode::Static,
            sl_buy_pct: 0.02,
            tp_buy_pct: 0.04,
            sl_sell_pct: 0.02,
            tp_sell_pct: 0.04,
            atr_multiplier_sl: 1.5,
            atr_multiplier_tp: 3.0,
            commission_per_trade: 0.0,
            spread_points: 0.0,
            point_value: 1.0,
            spread_mode: "once".into(),
            cost_overrides: AHashMap::new(),
            enable_circuit_breaker: true,
            max_daily_loss_percent: 3.0,
            max_weekly_loss_percent: 8.0,
            max_consecutive_losses: 5,
            max_total_drawdown_percent: 15.0,
            trading_days_per_week: 5,
            initial_capital: 10000.0,
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_positions() {
        let mut cfg = minimal_valid();
        cfg.max_positions = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_start_hour_after_end_hour() {
        let mut cfg = minimal_valid();
        cfg.start_hour = 23;
        cfg.end_hour = 9;
        assert!(cfg.validate().is_err());
    }

    fn minimal_valid() -> AppConfig {
        AppConfig {
            epics: vec!["GOLD".into()],
            resolution: "HOUR".into(),
            start_hour: 9,
            end_hour: 22,
            scan_interval_secs: 900,
            rsi_period: 14,
            rsi_oversold: 35.0,
            rsi_overbought: 65.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            sma_short: 10,
            sma_long: 50,
            momentum_period: 10,
            min_signals_to_trade: 2,
            min_confidence: 0.50,
            atr_period: 14,
            atr_min_pct: 0.5,
            atr_max_pct: 5.0,
            atr_optimal_low: 1.0,
            atr_optimal_high: 3.0,
            adx_period: 14,
            adx_filter_enabled: true,
            adx_min_trend: 20.0,
            adx_strong: 40.0,
            mtf_enabled: false,
            mtf_sma_short: 10,
            mtf_sma_long: 50,
            mtf_rsi_period: 14,
            regime_filter_enabled: true,
            regime_filter_block: "lateral".into(),
            regime_adx_threshold: 25.0,
            regime_atr_pct_threshold: 0.5,
            use_capital_tracker: true,
            daily_budget_pct: 0.08,
            per_trade_cap_pct: 0.03,
            min_allocation_eur: 0.0,
            allow_partial_allocation: true,
            capital_mode: CapitalMode::Percent,
            max_capital_percent: 40.0,
            max_capital_fixed: 400.0,
            distribution_mode: DistributionMode::Equal,
            size_safety_margin: 0.85,
            max_capital_risk: 0.70,
            max_margin_per_asset: 0.35,
            max_positions: 8,
            min_position_size: 0.01,
            target_percent_of_available: 0.60,
            sl_tp_mode: SlTpMode::Static,
            sl_buy_pct: 0.02,
            tp_buy_pct: 0.04,
            sl_sell_pct: 0.02,
            tp_sell_pct: 0.04,
            atr_multiplier_sl: 1.5,
            atr_multiplier_tp: 3.0,
            commission_per_trade: 0.0,
            spread_points: 0.0,
            point_value: 1.0,
            spread_mode: "once".into(),
            cost_overrides: AHashMap::new(),
            enable_circuit_breaker: true,
            max_daily_loss_percent: 3.0,
            max_weekly_loss_percent: 8.0,
            max_consecutive_losses: 5,
            max_total_drawdown_percent: 15.0,
            trading_days_per_week: 5,
            initial_capital: 10000.0,
        }
    }
}
