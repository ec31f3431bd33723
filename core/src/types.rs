use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLC sample for one epic at one resolution. Immutable once
/// ingested; the bar series as a whole is required to be strictly
/// monotonic in `ts` with no duplicate timestamps and no NaN `close`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

/// Directional recommendation produced by the strategy evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
    Neutral,
}

/// Market regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Trending,
    Lateral,
}

impl Regime {
    pub fn as_str(self) -> &'static str {
        match self {
            Regime::Trending => "trending",
            Regime::Lateral => "lateral",
        }
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    EndOfRun,
    Manual,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::EndOfRun => "END_OF_RUN",
            ExitReason::Manual => "MANUAL",
        }
    }
}

/// Coarse EU/US trading-hours bucket, classified in Europe/Madrid local
/// time at metrics stage. `UsOpen` takes priority when windows overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionBucket {
    UsOpen,
    EuOpen,
    EuPm,
    UsPm,
    Other,
}

impl SessionBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionBucket::UsOpen => "us_open",
            SessionBucket::EuOpen => "eu_open",
            SessionBucket::EuPm => "eu_pm",
            SessionBucket::UsPm => "us_pm",
            SessionBucket::Other => "other",
        }
    }
}

/// Snapshot of the indicators that fed a scoring decision, carried on the
/// Signal for diagnostics and reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub sma_short: f64,
    pub sma_long: f64,
    pub momentum_pct: f64,
    pub atr_pct: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Per-epic leverage/margin/sizing constraints, lazily acquired from the
/// broker and cached by the instrument model (component E).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub leverage: Option<f64>,
    pub margin_rate: f64,
    pub min_size: f64,
    pub step_size: f64,
    pub precision: u32,
}

/// One epic's directional recommendation at one evaluation timestamp.
/// NEUTRAL signals always carry confidence 0.0 and are never allocated
/// capital.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub epic: String,
    pub ts: DateTime<Utc>,
    pub direction: Direction,
    pub confidence: f64,
    pub current_price: f64,
    pub reasons: Vec<String>,
    pub indicators: IndicatorSnapshot,
    pub regime: Regime,
}

impl Signal {
    pub fn neutral(epic: &str, ts: DateTime<Utc>, reason: &str, indicators: IndicatorSnapshot, regime: Regime) -> Self {
        Signal {
            epic: epic.to_string(),
            ts,
            direction: Direction::Neutral,
            confidence: 0.0,
            current_price: 0.0,
            reasons: vec![reason.to_string()],
            indicators,
            regime,
        }
    }
}

/// An exposure currently held by the position manager. Exclusively owned
/// by the position manager while open; converted to a [`Trade`] on close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub epic: String,
    pub direction: Direction,
    pub entry_ts: DateTime<Utc>,
    pub entry_price: f64,
    pub units: f64,
    pub size_eur: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: f64,
    pub regime_at_open: Regime,
    /// Latest mark-to-market price observed while open.
    pub current_price: f64,
}

impl Position {
    pub fn unrealized_pnl(&self) -> f64 {
        match self.direction {
            Direction::Buy => (self.current_price - self.entry_price) * self.units,
            Direction::Sell => (self.entry_price - self.current_price) * self.units,
            Direction::Neutral => 0.0,
        }
    }
}

/// Immutable closed position. `pnl`/`pnl_percent` start as gross values
/// and are overwritten with net values by the cost model (component G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub epic: String,
    pub direction: Direction,
    pub entry_ts: DateTime<Utc>,
    pub exit_ts: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub units: f64,
    pub size_eur: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub exit_reason: ExitReason,
    pub confidence: f64,
    pub duration_hours: f64,
    pub day_of_week: String,
    pub hour_of_day: u32,
    pub session: SessionBucket,
    pub regime_at_exit: Regime,
}

/// One step of the equity curve. The series as a whole must be strictly
/// non-decreasing in `ts`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: DateTime<Utc>,
    pub equity: f64,
    pub cash: f64,
    pub open_positions: u32,
}
