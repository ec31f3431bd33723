//! Instrument model (component E): per-epic leverage/margin/sizing cache,
//! lazily populated from a broker collaborator, with a conservative
//! fallback when the broker has nothing on file for an epic.

use crate::collaborators::InstrumentSource;
use crate::types::InstrumentSpec;
use ahash::AHashMap;
use parking_lot::Mutex;

/// Fallback margin rate applied to epics that look like equities (no
/// leverage/marginRate reported by the broker).
const FALLBACK_MARGIN_RATE_EQUITY: f64 = 0.20;
/// Fallback margin rate applied to everything else (FX, indices, metals).
const FALLBACK_MARGIN_RATE_OTHER: f64 = 0.05;

/// Heuristic used when the broker has no leverage/marginRate for an epic:
/// epics with at least two consecutive letters that don't end in two or
/// more digits are treated as equity-like (e.g. "TSLA", not "US500" or
/// "DE40"). Reimplemented by hand rather than pulling in a regex crate.
pub fn looks_like_equity(epic: &str) -> bool {
    let bytes: Vec<char> = epic.chars().collect();
    let has_letter_run = bytes.windows(2).any(|w| w[0].is_ascii_alphabetic() && w[1].is_ascii_alphabetic());
    if !has_letter_run {
        return false;
    }
    let trailing_digits = bytes.iter().rev().take_while(|c| c.is_ascii_digit()).count();
    trailing_digits < 2
}

fn fallback_margin_rate(epic: &str) -> f64 {
    if looks_like_equity(epic) {
        FALLBACK_MARGIN_RATE_EQUITY
    } else {
        FALLBACK_MARGIN_RATE_OTHER
    }
}

fn fallback_spec(epic: &str) -> InstrumentSpec {
    InstrumentSpec {
        leverage: None,
        margin_rate: fallback_margin_rate(epic),
        min_size: 0.01,
        step_size: 0.01,
        precision: 2,
    }
}

/// Estimated margin required to open `units` of `epic` at `price`:
/// leverage first, else margin_rate, else the conservative fallback
/// rate baked into `spec` when neither was reported by the broker.
pub fn margin_required(price: f64, units: f64, spec: &InstrumentSpec) -> f64 {
    let notional = price * units;
    match spec.leverage {
        Some(lev) if lev > 0.0 => notional / lev,
        _ => notional * spec.margin_rate,
    }
}

/// Result of sizing a position for a target margin budget: the instrument-
/// adjusted unit count plus the margin that sizing is estimated to use.
#[derive(Debug, Clone, Copy)]
pub struct SizingResult {
    pub units: f64,
    pub estimated_margin: f64,
    /// Set when `estimated_margin` exceeds 1.3x `target_margin` — a
    /// non-fatal diagnostic the caller may log, never a rejection.
    pub margin_overshoot: bool,
}

/// Lazily-populated, broker-backed cache of [`InstrumentSpec`]s. Falls
/// back to a conservative synthetic spec when the broker errors or has no
/// record for the epic; the fallback is itself cached so repeated lookups
/// for an unresolvable epic don't repeatedly hit the broker.
pub struct InstrumentModel {
    cache: Mutex<AHashMap<String, InstrumentSpec>>,
}

impl Default for InstrumentModel {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentModel {
    pub fn new() -> Self {
        InstrumentModel {
            cache: Mutex::new(AHashMap::new()),
        }
    }

    /// Returns the cached spec for `epic`, fetching from `source` on a
    /// cache miss and falling back to a synthetic conservative spec if the
    /// broker has nothing (or errors).
    pub fn spec_for(&self, epic: &str, source: &dyn InstrumentSource) -> InstrumentSpec {
        if let Some(spec) = self.cache.lock().get(epic).copied() {
            return spec;
        }
        let spec = match source.fetch_spec(epic) {
            Ok(mut spec) => {
                // Percent-to-decimal normalisation: brokers sometimes report
                // marginRate as e.g. 20 meaning 20%, not 0.20.
                if spec.margin_rate > 1.0 {
                    spec.margin_rate /= 100.0;
                }
                if spec.leverage.is_none() && spec.margin_rate <= 0.0 {
                    spec.margin_rate = fallback_margin_rate(epic);
                }
                spec
            }
            Err(_) => {
                tracing::warn!(epic, "instrument spec unavailable, using fallback margin rate");
                fallback_spec(epic)
            }
        };
        self.cache.lock().insert(epic.to_string(), spec);
        spec
    }

    /// Sizes a position for `epic` at `price` against a `target_margin`
    /// budget: computes raw units from the margin rate/leverage, floors to
    /// the instrument's step size, clamps to its minimum size, and rounds
    /// to its quoted precision.
    pub fn size_for_target_margin(&self, epic: &str, price: f64, target_margin: f64, source: &dyn InstrumentSource) -> SizingResult {
        let spec = self.spec_for(epic, source);
        if price <= 0.0 || target_margin <= 0.0 {
            return SizingResult {
                units: 0.0,
                estimated_margin: 0.0,
                margin_overshoot: false,
            };
        }
        let rate_divisor = match spec.leverage {
            Some(lev) if lev > 0.0 => price / lev,
            _ => price * spec.margin_rate,
        };
        let units_raw = if rate_divisor > 0.0 { target_margin / rate_divisor } else { 0.0 };

        let step = if spec.step_size > 0.0 { spec.step_size } else { 1.0 };
        let mut units = (units_raw / step).floor() * step;
        if units < spec.min_size {
            units = spec.min_size;
        }
        let precision = spec.precision;
        let factor = 10f64.powi(precision as i32);
        units = (units * factor).round() / factor;

        let estimated_margin = margin_required(price, units, &spec);
        SizingResult {
            units,
            estimated_margin,
            margin_overshoot: estimated_margin > target_margin * 1.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, EngineResult};

    struct FixedSource(InstrumentSpec);
    impl InstrumentSource for FixedSource {
        fn fetch_spec(&self, _epic: &str) -> EngineResult<InstrumentSpec> {
            Ok(self.0)
        }
    }

    struct FailingSource;
    impl InstrumentSource for FailingSource {
        fn fetch_spec(&self, epic: &str) -> EngineResult<InstrumentSpec> {
            Err(EngineError::InstrumentSpecUnavailable { epic: epic.to_string() })
        }
    }

    #[test]
    fn looks_like_equity_classifies_letters_vs_codes() {
        assert!(looks_like_equity("TSLA"));
        assert!(!looks_like_equity("DE40"));
        assert!(!looks_like_equity("US500"));
        assert!(looks_like_equity("GOLD"));
    }

    #[test]
    fn falls_back_to_conservative_rate_on_broker_error() {
        let model = InstrumentModel::new();
        let spec = model.spec_for("TSLA", &FailingSource);
        assert_eq!(spec.margin_rate, FALLBACK_MARGIN_RATE_EQUITY);
        let spec2 = model.spec_for("DE40", &FailingSource);
        assert_eq!(spec2.margin_rate, FALLBACK_MARGIN_RATE_OTHER);
    }

    #[test]
    fn normalizes_percent_margin_rate() {
        let model = InstrumentModel::new();
        let source = FixedSource(InstrumentSpec {
            leverage: None,
            margin_rate: 20.0,
            min_size: 0.01,
            step_size: 0.01,
            precision: 2,
        });
        let spec = model.spec_for("X", &source);
        assert!((spec.margin_rate - 0.20).abs() < 1e-9);
    }

    #[test]
    fn sizing_clamps_to_min_and_rounds_to_precision() {
        let model = InstrumentModel::new();
        let source = FixedSource(InstrumentSpec {
            leverage: Some(10.0),
            margin_rate: 0.05,
            min_size: 1.0,
            step_size: 1.0,
            precision: 0,
        });
        let result = model.size_for_target_margin("X", 100.0, 5.0, &source);
        assert!(result.units >= 1.0);
        assert_eq!(result.units.fract(), 0.0);
    }

    #[test]
    fn flags_margin_overshoot_without_rejecting() {
        let model = InstrumentModel::new();
        let source = FixedSource(InstrumentSpec {
            leverage: None,
            margin_rate: 1.0,
            min_size: 10.0,
            step_size: 1.0,
            precision: 0,
        });
        let result = model.size_for_target_margin("X", 100.0, 1.0, &source);
        assert!(result.margin_overshoot);
    }
}
