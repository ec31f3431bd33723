//! External collaborator traits: the engine core is
//! agnostic to where bars, account state, order execution, instrument
//! specs, and persisted reports come from. Binaries wire concrete,
//! I/O-capable implementations against these object-safe traits; the
//! core crate ships only no-op defaults for persistence.

use crate::error::EngineResult;
use crate::types::{Bar, InstrumentSpec, Signal};
use chrono::{DateTime, Utc};

/// Supplies historical or streaming bars for one epic at the configured
/// resolution. Implementations must return bars in non-decreasing `ts`
/// order; the engine never reorders what it's given.
pub trait BarSource: Send + Sync {
    fn bars(&self, epic: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> EngineResult<Vec<Bar>>;
}

/// A snapshot of broker-reported account equity.
#[derive(Debug, Clone, Copy)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub available: f64,
}

/// A broker-reported open position, used only to reconcile live state;
/// the simulation loop tracks its own positions independently.
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub epic: String,
    pub units: f64,
    pub direction: crate::types::Direction,
}

/// Supplies account balance for the live loop's equity/risk checks.
pub trait AccountSource: Send + Sync {
    fn account(&self) -> EngineResult<AccountSnapshot>;
    fn open_positions(&self) -> EngineResult<Vec<BrokerPosition>>;
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub epic: String,
    pub direction: crate::types::Direction,
    pub units: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub deal_reference: String,
    pub fill_price: f64,
}

#[derive(Debug, Clone)]
pub struct CloseAck {
    pub fill_price: f64,
}

/// Places and closes orders against a live or paper broker. Live-only;
/// the simulation loop never calls this.
pub trait OrderRouter: Send + Sync {
    fn open(&self, req: &OrderRequest) -> EngineResult<OrderAck>;
    fn close(&self, epic: &str, units: f64) -> EngineResult<CloseAck>;
}

/// Supplies per-epic leverage/margin/sizing metadata, consulted by the
/// instrument model on a cache miss.
pub trait InstrumentSource: Send + Sync {
    fn fetch_spec(&self, epic: &str) -> EngineResult<InstrumentSpec>;
}

/// Sink for trades, equity points, and the final metrics report. The
/// engine never blocks or aborts a run on a persistence failure; callers
/// log [`crate::error::EngineError::PersistenceUnavailable`] and continue.
pub trait PersistenceSink: Send + Sync {
    fn record_trade(&self, trade: &crate::types::Trade) -> EngineResult<()>;
    fn record_equity_point(&self, point: &crate::types::EquityPoint) -> EngineResult<()>;
    fn record_metrics(&self, metrics: &crate::metrics::BacktestResult) -> EngineResult<()>;
    /// Optional: most sinks no-op this. Kept distinct from `record_trade`
    /// since a signal is emitted whether or not it ever becomes a Trade.
    fn record_signal(&self, _signal: &Signal) -> EngineResult<()> {
        Ok(())
    }
}

/// No-op sink: every call succeeds and discards its argument. Used by
/// default when no persistence backend is configured.
pub struct NullPersistence;

impl PersistenceSink for NullPersistence {
    fn record_trade(&self, _trade: &crate::types::Trade) -> EngineResult<()> {
        Ok(())
    }
    fn record_equity_point(&self, _point: &crate::types::EquityPoint) -> EngineResult<()> {
        Ok(())
    }
    fn record_metrics(&self, _metrics: &crate::metrics::BacktestResult) -> EngineResult<()> {
        Ok(())
    }
}
