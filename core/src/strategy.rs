//! Strategy evaluator (component C): scores a bar-subset into one
//! [`Signal`] via sufficiency/volatility/trend gates and additive scoring.

use crate::indicators::{adx, atr_pct, macd, momentum_pct, rsi, sma};
use crate::regime::{classify, RegimeConfig};
use crate::types::{Bar, Direction, IndicatorSnapshot, Regime, Signal};

#[derive(Debug, Clone, Copy)]
pub struct StrategyConfig {
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub sma_short: usize,
    pub sma_long: usize,
    pub momentum_period: usize,
    pub atr_period: usize,
    pub atr_min_pct: f64,
    pub atr_max_pct: f64,
    pub atr_optimal_low: f64,
    pub atr_optimal_high: f64,
    pub adx_period: usize,
    pub adx_filter_enabled: bool,
    pub adx_min_trend: f64,
    pub adx_strong: f64,
    pub min_signals_to_trade: u32,
    pub min_confidence: f64,
    pub regime: RegimeConfig,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            sma_short: 9,
            sma_long: 21,
            momentum_period: 10,
            atr_period: 14,
            atr_min_pct: 0.5,
            atr_max_pct: 5.0,
            atr_optimal_low: 1.0,
            atr_optimal_high: 3.0,
            adx_period: 14,
            adx_filter_enabled: true,
            adx_min_trend: 20.0,
            adx_strong: 40.0,
            min_signals_to_trade: 2,
            min_confidence: 0.0,
            regime: RegimeConfig::default(),
        }
    }
}

/// Optional slower-timeframe context for multi-timeframe confirmation
/// (the final MTF confirmation step). `bars` must already be filtered to ts <= evaluation ts.
pub struct MtfContext<'a> {
    pub bars: &'a [Bar],
    pub sma_short: usize,
    pub sma_long: usize,
    pub rsi_period: usize,
}

fn snapshot(bars: &[Bar], closes: &[f64], cfg: &StrategyConfig) -> IndicatorSnapshot {
    let (macd_v, signal_v, hist) = macd(closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal);
    let (adx_v, plus_di, minus_di) = adx(bars, cfg.adx_period);
    IndicatorSnapshot {
        rsi: rsi(closes, cfg.rsi_period),
        macd: macd_v,
        macd_signal: signal_v,
        macd_histogram: hist,
        sma_short: sma(closes, cfg.sma_short),
        sma_long: sma(closes, cfg.sma_long),
        momentum_pct: momentum_pct(closes, cfg.momentum_period),
        atr_pct: atr_pct(bars, cfg.atr_period),
        adx: adx_v,
        plus_di,
        minus_di,
    }
}

/// Evaluates one epic's bar-subset (`bars`, strictly ts <= evaluation ts)
/// into a [`Signal`]. `mtf` is consulted only when present, as the final confirmation step.
pub fn evaluate(epic: &str, bars: &[Bar], cfg: &StrategyConfig, mtf: Option<&MtfContext>) -> Signal {
    let ts = match bars.last() {
        Some(b) => b.ts,
        None => {
            return Signal::neutral(
                epic,
                chrono::Utc::now(),
                "insufficient data",
                zero_snapshot(),
                Regime::Lateral,
            )
        }
    };
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let regime = classify(bars, &cfg.regime);

    // 1. Sufficiency gate.
    if bars.len() < cfg.sma_long {
        return Signal::neutral(epic, ts, "insufficient data", snapshot(bars, &closes, cfg), regime);
    }

    let snap = snapshot(bars, &closes, cfg);
    let current_price = closes[closes.len() - 1];

    // 2. Volatility gate.
    if snap.atr_pct < cfg.atr_min_pct || snap.atr_pct > cfg.atr_max_pct {
        return neutral_with(epic, ts, current_price, "volatility out of band", snap, regime);
    }

    // 3. Trend-strength gate (optional).
    if cfg.adx_filter_enabled && snap.adx < cfg.adx_min_trend {
        return neutral_with(epic, ts, current_price, "ADX below minimum trend strength", snap, regime);
    }

    // 4. Scoring.
    let mut buy_score: i32 = 0;
    let mut sell_score: i32 = 0;
    let mut reasons: Vec<String> = Vec::new();

    if snap.sma_short > snap.sma_long && current_price > snap.sma_long {
        buy_score += 2;
        reasons.push("SMA short above SMA long, price above SMA long".into());
    } else if snap.sma_short < snap.sma_long && current_price < snap.sma_long {
        sell_score += 2;
        reasons.push("SMA short below SMA long, price below SMA long".into());
    }

    if snap.rsi < cfg.rsi_oversold {
        buy_score += 2;
        reasons.push(format!("RSI {:.1} oversold", snap.rsi));
    } else if snap.rsi > cfg.rsi_overbought {
        sell_score += 2;
        reasons.push(format!("RSI {:.1} overbought", snap.rsi));
    }

    if snap.macd > snap.macd_signal && snap.macd_histogram > 0.0 {
        buy_score += 2;
        reasons.push("MACD above signal, rising histogram".into());
    } else if snap.macd < snap.macd_signal && snap.macd_histogram < 0.0 {
        sell_score += 2;
        reasons.push("MACD below signal, falling histogram".into());
    }

    if snap.momentum_pct > 2.0 {
        buy_score += 1;
        reasons.push(format!("momentum {:.1}%", snap.momentum_pct));
    } else if snap.momentum_pct < -2.0 {
        sell_score += 1;
        reasons.push(format!("momentum {:.1}%", snap.momentum_pct));
    }

    if current_price > snap.sma_short && current_price > snap.sma_long {
        buy_score += 1;
        reasons.push("price above both SMAs".into());
    } else if current_price < snap.sma_short && current_price < snap.sma_long {
        sell_score += 1;
        reasons.push("price below both SMAs".into());
    }

    if cfg.adx_filter_enabled && snap.adx > cfg.adx_min_trend {
        if snap.plus_di > snap.minus_di {
            buy_score += 2;
            reasons.push(format!("+DI {:.1} > -DI {:.1}", snap.plus_di, snap.minus_di));
        } else {
            sell_score += 2;
            reasons.push(format!("-DI {:.1} > +DI {:.1}", snap.minus_di, snap.plus_di));
        }
        if snap.adx > cfg.adx_strong {
            if buy_score >= sell_score {
                buy_score += 1;
            } else {
                sell_score += 1;
            }
            reasons.push(format!("strong trend, ADX {:.1}", snap.adx));
        }
    }

    if snap.atr_pct >= cfg.atr_optimal_low && snap.atr_pct <= cfg.atr_optimal_high {
        if buy_score >= sell_score {
            buy_score += 1;
        } else {
            sell_score += 1;
        }
        reasons.push(format!("ATR% {:.2} in optimal band", snap.atr_pct));
    }

    // 5. Decision.
    let max_score = buy_score.max(sell_score);
    let mut direction = if max_score >= cfg.min_signals_to_trade as i32 && buy_score != sell_score {
        if buy_score > sell_score { Direction::Buy } else { Direction::Sell }
    } else {
        Direction::Neutral
    };
    let mut confidence = if direction == Direction::Neutral {
        0.0
    } else {
        (max_score as f64 / 10.0).min(1.0)
    };

    // 6. MTF confirmation (optional).
    if direction != Direction::Neutral {
        if let Some(m) = mtf {
            let slow_closes: Vec<f64> = m.bars.iter().map(|b| b.close).collect();
            if slow_closes.len() >= m.sma_long {
                let slow_sma_short = sma(&slow_closes, m.sma_short);
                let slow_sma_long = sma(&slow_closes, m.sma_long);
                let slow_rsi = rsi(&slow_closes, m.rsi_period);
                let aligned = match direction {
                    Direction::Buy => slow_sma_short > slow_sma_long && slow_rsi > 50.0,
                    Direction::Sell => slow_sma_short < slow_sma_long && slow_rsi < 50.0,
                    Direction::Neutral => false,
                };
                if !aligned {
                    direction = Direction::Neutral;
                    confidence = 0.0;
                    reasons.push("MTF misalignment".into());
                } else {
                    confidence = (confidence * 1.2).min(1.0);
                    reasons.push("MTF perfect alignment".into());
                }
            }
        }
    }

    if direction == Direction::Neutral {
        return neutral_with(epic, ts, current_price, "score below threshold", snap, regime);
    }

    Signal {
        epic: epic.to_string(),
        ts,
        direction,
        confidence,
        current_price,
        reasons,
        indicators: snap,
        regime,
    }
}

fn neutral_with(epic: &str, ts: chrono::DateTime<chrono::Utc>, current_price: f64, reason: &str, snap: IndicatorSnapshot, regime: Regime) -> Signal {
    Signal {
        epic: epic.to_string(),
        ts,
        direction: Direction::Neutral,
        confidence: 0.0,
        current_price,
        reasons: vec![reason.to_string()],
        indicators: snap,
        regime,
    }
}

fn zero_snapshot() -> IndicatorSnapshot {
    IndicatorSnapshot {
        rsi: 50.0,
        macd: 0.0,
        macd_signal: 0.0,
        macd_histogram: 0.0,
        sma_short: 0.0,
        sma_long: 0.0,
        momentum_pct: 0.0,
        atr_pct: 0.0,
        adx: 0.0,
        plus_di: 0.0,
        minus_di: 0.0,
    }
}
