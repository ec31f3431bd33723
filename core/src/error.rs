use thiserror::Error;

/// Error taxonomy for the engine core.
///
/// Kinds, not exhaustive wrapped causes: most variants carry just enough
/// context to log and continue. Only [`EngineError::ConfigurationInvalid`]
/// is meant to be fatal at startup — everything else is handled locally by
/// the caller per the policy documented on each variant.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required numeric parameter is non-finite or out of its domain.
    /// Fatal at startup.
    #[error("configuration invalid: {field} = {value}")]
    ConfigurationInvalid { field: String, value: String },

    /// The requested epic has no bar with timestamp <= evaluation timestamp.
    /// Callers treat this as NEUTRAL for that epic on that date.
    #[error("no bar data for epic {epic} at or before {ts}")]
    BarDataMissing { epic: String, ts: String },

    /// A bar row was missing its close price or carried a non-finite value.
    /// Ingestion skips the row; the error is only raised when no valid rows
    /// remain for the epic.
    #[error("no usable bar rows remain for epic {epic} after filtering malformed rows")]
    BarDataMalformed { epic: String },

    /// The broker-backed instrument lookup failed. Callers fall back to the
    /// conservative default margin rate and cache the fallback.
    #[error("instrument spec unavailable for epic {epic}")]
    InstrumentSpecUnavailable { epic: String },

    /// Live-only: the order router returned no deal reference. The signal
    /// is abandoned for that tick; no retry is attempted.
    #[error("order rejected for epic {epic}: {reason}")]
    OrderRejected { epic: String, reason: String },

    /// A persistence sink call failed. The engine never blocks on
    /// persistence; this is surfaced as a warning-level diagnostic.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
