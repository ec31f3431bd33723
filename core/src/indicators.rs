//! Pure indicator kernels over a close-price (or OHLC) series.
//!
//! Every function here is deterministic and allocation-light: given the
//! same slice it returns the same value, performs no I/O, and never
//! panics on a short series — it returns the documented neutral value
//! instead (RSI 50, ADX 0, etc.), matching the "undefined is a value, not
//! a failure" contract these kernels are built to.

use crate::types::Bar;

/// Wilder-style RSI(n). Rolling mean of gains and losses over the last
/// `period` deltas; returns 50.0 (neutral) if fewer than `period + 1`
/// closes are available.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let window = &deltas[deltas.len() - period..];
    let avg_gain: f64 = window.iter().map(|d| d.max(0.0)).sum::<f64>() / period as f64;
    let avg_loss: f64 = window.iter().map(|d| (-d).max(0.0)).sum::<f64>() / period as f64;
    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Simple moving average over the last `period` closes. Returns the mean
/// of all available closes if the series is shorter than `period`
/// (consistent with the "neutral value, never fail" contract); callers
/// that require a strict sufficiency gate check length beforehand (the
/// strategy evaluator's gate does this explicitly).
pub fn sma(closes: &[f64], period: usize) -> f64 {
    if closes.is_empty() {
        return 0.0;
    }
    let n = period.min(closes.len()).max(1);
    let window = &closes[closes.len() - n..];
    window.iter().sum::<f64>() / window.len() as f64
}

/// Standard exponential moving average, seeded with the SMA of the first
/// `period` values, over the full series.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if closes.is_empty() || period == 0 {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(closes.len());
    let seed_len = period.min(closes.len());
    let seed = closes[..seed_len].iter().sum::<f64>() / seed_len as f64;
    let mut prev = seed;
    for (i, &c) in closes.iter().enumerate() {
        if i < seed_len {
            out.push(seed);
            continue;
        }
        prev = alpha * c + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

/// Last value of [`ema_series`]; 0.0 on an empty series.
pub fn ema(closes: &[f64], period: usize) -> f64 {
    ema_series(closes, period).last().copied().unwrap_or(0.0)
}

/// MACD(fast, slow, signal): returns `(macd, signal, histogram)` from the
/// EMA difference and its own EMA.
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> (f64, f64, f64) {
    if closes.len() < slow.max(fast) + 1 {
        return (0.0, 0.0, 0.0);
    }
    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    let macd_line: Vec<f64> = fast_series
        .iter()
        .zip(slow_series.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = ema_series(&macd_line, signal_period);
    let macd_v = macd_line.last().copied().unwrap_or(0.0);
    let signal_v = signal_line.last().copied().unwrap_or(0.0);
    (macd_v, signal_v, macd_v - signal_v)
}

/// Percent change between `close[t]` and `close[t-period]`; 0.0 if the
/// series is too short.
pub fn momentum_pct(closes: &[f64], period: usize) -> f64 {
    if closes.len() <= period || period == 0 {
        return 0.0;
    }
    let past = closes[closes.len() - 1 - period];
    let now = closes[closes.len() - 1];
    if past == 0.0 || !past.is_finite() {
        return 0.0;
    }
    (now - past) / past * 100.0
}

fn true_range_series(bars: &[Bar]) -> Vec<f64> {
    if bars.len() < 2 {
        return Vec::new();
    }
    bars.windows(2)
        .map(|w| {
            let (prev, cur) = (w[0], w[1]);
            let hl = cur.high - cur.low;
            let hc = (cur.high - prev.close).abs();
            let lc = (cur.low - prev.close).abs();
            hl.max(hc).max(lc)
        })
        .collect()
}

/// Mean true range over the last `period` true-range samples; 0.0 if
/// fewer than 2 bars are available.
pub fn atr(bars: &[Bar], period: usize) -> f64 {
    let tr = true_range_series(bars);
    if tr.is_empty() {
        return 0.0;
    }
    let n = period.min(tr.len()).max(1);
    tr[tr.len() - n..].iter().sum::<f64>() / n as f64
}

/// ATR normalized by the latest close, in percent, for cross-asset
/// comparability. 0.0 if the latest close is non-finite or zero.
pub fn atr_pct(bars: &[Bar], period: usize) -> f64 {
    let Some(last) = bars.last() else { return 0.0 };
    if !last.close.is_finite() || last.close == 0.0 {
        return 0.0;
    }
    atr(bars, period) / last.close * 100.0
}

/// Wilder's ADX/+DI/-DI over `period`. Returns `(adx, +di, -di)`, all
/// 0.0 if fewer than `period + 1` bars are available.
pub fn adx(bars: &[Bar], period: usize) -> (f64, f64, f64) {
    if bars.len() < period + 1 || period == 0 {
        return (0.0, 0.0, 0.0);
    }
    let tr = true_range_series(bars);
    let mut plus_dm = Vec::with_capacity(bars.len() - 1);
    let mut minus_dm = Vec::with_capacity(bars.len() - 1);
    for w in bars.windows(2) {
        let (prev, cur) = (w[0], w[1]);
        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;
        let plus = if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 };
        let minus = if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 };
        plus_dm.push(plus);
        minus_dm.push(minus);
    }

    // Wilder smoothing: ewm(alpha = 1/period).
    let smooth = |series: &[f64]| -> Vec<f64> {
        let alpha = 1.0 / period as f64;
        let mut out = Vec::with_capacity(series.len());
        let mut prev = series.first().copied().unwrap_or(0.0);
        for (i, &v) in series.iter().enumerate() {
            if i == 0 {
                out.push(prev);
                continue;
            }
            prev = alpha * v + (1.0 - alpha) * prev;
            out.push(prev);
        }
        out
    };

    let atr_sm = smooth(&tr);
    let plus_dm_sm = smooth(&plus_dm);
    let minus_dm_sm = smooth(&minus_dm);

    let mut dx_series = Vec::with_capacity(atr_sm.len());
    let mut plus_di_last = 0.0;
    let mut minus_di_last = 0.0;
    for i in 0..atr_sm.len() {
        let atr_i = atr_sm[i];
        if atr_i == 0.0 {
            dx_series.push(0.0);
            continue;
        }
        let plus_di = 100.0 * plus_dm_sm[i] / atr_i;
        let minus_di = 100.0 * minus_dm_sm[i] / atr_i;
        plus_di_last = plus_di;
        minus_di_last = minus_di;
        let sum = plus_di + minus_di;
        let dx = if sum == 0.0 { 0.0 } else { 100.0 * (plus_di - minus_di).abs() / sum };
        dx_series.push(dx);
    }
    let adx_series = smooth(&dx_series);
    let adx_last = adx_series.last().copied().unwrap_or(0.0);
    (adx_last, plus_di_last, minus_di_last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(i: i64, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            ts: Utc.timestamp_opt(1_700_000_000 + i * 3600, 0).unwrap(),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: None,
        }
    }

    #[test]
    fn rsi_neutral_on_short_series() {
        assert_eq!(rsi(&[1.0, 2.0], 14), 50.0);
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&closes, 14), 100.0);
    }

    #[test]
    fn sma_matches_manual_mean() {
        let closes = vec![1.0, 2.0, 3.0, 4.0];
        assert!((sma(&closes, 2) - 3.5).abs() < 1e-9);
    }

    #[test]
    fn momentum_zero_on_short_series() {
        assert_eq!(momentum_pct(&[1.0, 2.0], 10), 0.0);
    }

    #[test]
    fn atr_zero_on_single_bar() {
        let bars = vec![bar(0, 100.0, 101.0, 99.0, 100.0)];
        assert_eq!(atr(&bars, 14), 0.0);
    }

    #[test]
    fn atr_pct_flat_market_near_zero() {
        let bars: Vec<Bar> = (0..20).map(|i| bar(i, 100.0, 100.0, 100.0, 100.0)).collect();
        assert!(atr_pct(&bars, 14).abs() < 1e-9);
    }

    #[test]
    fn adx_zero_on_short_series() {
        let bars = vec![bar(0, 100.0, 101.0, 99.0, 100.0)];
        let (a, p, m) = adx(&bars, 14);
        assert_eq!((a, p, m), (0.0, 0.0, 0.0));
    }

    #[test]
    fn adx_trending_series_rises_above_zero() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                bar(i, base, base + 1.5, base - 0.2, base + 1.2)
            })
            .collect();
        let (a, plus_di, minus_di) = adx(&bars, 14);
        assert!(a > 0.0);
        assert!(plus_di > minus_di);
    }
}
