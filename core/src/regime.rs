//! Market regime detector (component B). Labels each bar `trending` or
//! `lateral` from ADX and ATR%, and exposes a "last known label at or
//! before a timestamp" query for callers that don't walk the bar series
//! in lockstep.

use chrono::{DateTime, Utc};

use crate::indicators::{adx, atr_pct};
use crate::types::{Bar, Regime};

#[derive(Debug, Clone, Copy)]
pub struct RegimeConfig {
    pub adx_period: usize,
    pub atr_period: usize,
    pub adx_threshold: f64,
    pub atr_pct_threshold: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            adx_period: 14,
            atr_period: 14,
            adx_threshold: 25.0,
            atr_pct_threshold: 0.5,
        }
    }
}

/// Labels a single evaluation point given the bars available up to and
/// including it (no look-ahead — the caller passes the prefix it wants
/// classified).
pub fn classify(bars: &[Bar], cfg: &RegimeConfig) -> Regime {
    let (adx_v, _, _) = adx(bars, cfg.adx_period);
    let atr_v = atr_pct(bars, cfg.atr_period);
    if adx_v > cfg.adx_threshold && atr_v > cfg.atr_pct_threshold {
        Regime::Trending
    } else {
        Regime::Lateral
    }
}

/// Precomputed regime labels aligned 1:1 to a bar series, plus a
/// timestamp-indexed lookup for "most recent label at or before T".
pub struct RegimeMap {
    timestamps: Vec<DateTime<Utc>>,
    labels: Vec<Regime>,
}

impl RegimeMap {
    /// Builds the map by classifying every prefix `bars[..=i]`. O(n) calls
    /// to indicator kernels that are themselves O(period); acceptable for
    /// the bar counts this engine targets, and keeps the kernels pure and
    /// recomputation-light per call.
    pub fn build(bars: &[Bar], cfg: &RegimeConfig) -> Self {
        let mut timestamps = Vec::with_capacity(bars.len());
        let mut labels = Vec::with_capacity(bars.len());
        for i in 0..bars.len() {
            let prefix = &bars[..=i];
            timestamps.push(bars[i].ts);
            labels.push(classify(prefix, cfg));
        }
        RegimeMap { timestamps, labels }
    }

    /// Regime at or before `ts`; `Lateral` if the map is empty or `ts`
    /// precedes every bar.
    pub fn at(&self, ts: DateTime<Utc>) -> Regime {
        match self.timestamps.partition_point(|t| *t <= ts) {
            0 => Regime::Lateral,
            idx => self.labels[idx - 1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(i: i64, base: f64) -> Bar {
        Bar {
            ts: Utc.timestamp_opt(1_700_000_000 + i * 3600, 0).unwrap(),
            open: base,
            high: base + 0.1,
            low: base - 0.1,
            close: base,
            volume: None,
        }
    }

    #[test]
    fn flat_series_is_lateral() {
        let bars: Vec<Bar> = (0..30).map(|i| bar(i, 100.0)).collect();
        assert_eq!(classify(&bars, &RegimeConfig::default()), Regime::Lateral);
    }

    #[test]
    fn regime_map_before_first_bar_is_lateral() {
        let bars: Vec<Bar> = (0..5).map(|i| bar(i, 100.0)).collect();
        let map = RegimeMap::build(&bars, &RegimeConfig::default());
        let before = bars[0].ts - chrono::Duration::hours(10);
        assert_eq!(map.at(before), Regime::Lateral);
    }
}
