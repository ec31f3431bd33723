//! Metrics engine (component J): turns a closed-trade list and equity
//! curve into the aggregate [`BacktestResult`], grounded on the original
//! `backtesting/metrics.py`.

use crate::types::{Direction, EquityPoint, Regime, SessionBucket, Trade};
use chrono_tz::Europe::Madrid;

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Sample standard deviation (ddof = 1); 0.0 below two points.
fn std_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

fn sanitize(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CapitalStats {
    pub initial_capital: f64,
    pub final_capital: f64,
    pub total_return: f64,
    pub total_return_percent: f64,
    pub cagr_percent: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TradeStats {
    pub total_trades: u32,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub profit_factor: f64,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DrawdownStats {
    pub max_drawdown_percent: f64,
    pub avg_drawdown_percent: f64,
    pub max_drawdown_duration_days: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RiskStats {
    pub annualized_volatility_percent: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bucket {
    pub total_trades: u32,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_pnl: f64,
    pub avg_pnl: f64,
}

impl Bucket {
    fn from_trades(trades: &[&Trade]) -> Self {
        let total_trades = trades.len() as u32;
        let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
        Bucket {
            total_trades,
            win_rate: win_rate(&pnls),
            profit_factor: profit_factor(&pnls),
            total_pnl: sanitize(pnls.iter().sum()),
            avg_pnl: sanitize(mean(&pnls)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemporalBuckets {
    pub by_day_of_week: Vec<(String, Bucket)>,
    pub morning: Bucket,
    pub afternoon: Bucket,
    pub evening: Bucket,
    pub us_open: Bucket,
    pub eu_open: Bucket,
    pub eu_pm: Bucket,
    pub us_pm: Bucket,
    pub other_session: Bucket,
}

#[derive(Debug, Clone, Default)]
pub struct RegimeBuckets {
    pub trending: Bucket,
    pub lateral: Bucket,
}

#[derive(Debug, Clone, Default)]
pub struct BacktestResult {
    pub capital: CapitalStats,
    pub trades: TradeStats,
    pub drawdown: DrawdownStats,
    pub risk: RiskStats,
    pub temporal: TemporalBuckets,
    pub regime: RegimeBuckets,
    pub equity_curve: Vec<EquityPoint>,
    pub daily_returns: Vec<f64>,
    pub trade_list: Vec<Trade>,
}

/// Fraction of trades that are winners; trades with exactly-zero P&L are
/// excluded from the denominator (neither a win nor a loss).
pub fn win_rate(pnls: &[f64]) -> f64 {
    let denom = pnls.iter().filter(|p| **p != 0.0).count();
    if denom == 0 {
        return 0.0;
    }
    let wins = pnls.iter().filter(|p| **p > 0.0).count();
    sanitize(wins as f64 / denom as f64 * 100.0)
}

/// gross_profit / |gross_loss|; +inf when there are winners and no
/// losers, 0.0 when there is no profit at all.
pub fn profit_factor(pnls: &[f64]) -> f64 {
    let gross_profit: f64 = pnls.iter().filter(|p| **p > 0.0).sum();
    let gross_loss: f64 = pnls.iter().filter(|p| **p < 0.0).sum::<f64>().abs();
    if gross_loss == 0.0 {
        if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        gross_profit / gross_loss
    }
}

/// Running-peak-relative drawdown at every point, expressed as a
/// percentage (negative or zero).
fn drawdown_series(equity: &[f64]) -> Vec<f64> {
    let mut peak = f64::MIN;
    equity
        .iter()
        .map(|&e| {
            if e > peak {
                peak = e;
            }
            if peak > 0.0 {
                (e - peak) / peak * 100.0
            } else {
                0.0
            }
        })
        .collect()
}

fn max_drawdown_duration_days(points: &[EquityPoint]) -> f64 {
    let dd: Vec<f64> = drawdown_series(&points.iter().map(|p| p.equity).collect::<Vec<_>>());
    let mut longest = 0.0_f64;
    let mut run_start: Option<usize> = None;
    for (i, &d) in dd.iter().enumerate() {
        if d < -1.0 {
            if run_start.is_none() {
                run_start = Some(i);
            }
        } else if let Some(start) = run_start.take() {
            let days = (points[i.saturating_sub(1)].ts - points[start].ts).num_seconds() as f64 / 86400.0;
            longest = longest.max(days);
        }
    }
    if let Some(start) = run_start {
        let days = (points[points.len() - 1].ts - points[start].ts).num_seconds() as f64 / 86400.0;
        longest = longest.max(days);
    }
    longest
}

/// Classifies a UTC timestamp into the EU/US session bucket by
/// converting to Europe/Madrid local time. US open wins on overlap.
pub fn classify_session(ts: chrono::DateTime<chrono::Utc>) -> SessionBucket {
    use chrono::{NaiveTime, TimeZone};
    let local = ts.with_timezone(&Madrid);
    let t = local.time();
    let in_range = |start: (u32, u32), end: (u32, u32)| {
        let s = NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap();
        let e = NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap();
        t >= s && t < e
    };
    if in_range((15, 30), (18, 0)) {
        SessionBucket::UsOpen
    } else if in_range((8, 0), (12, 0)) {
        SessionBucket::EuOpen
    } else if in_range((12, 0), (16, 0)) {
        SessionBucket::EuPm
    } else if in_range((18, 0), (22, 0)) {
        SessionBucket::UsPm
    } else {
        SessionBucket::Other
    }
}

/// Coarse intraday bucket by UTC hour: morning [07,12), afternoon
/// [12,18), evening otherwise.
pub fn classify_intraday(hour_utc: u32) -> &'static str {
    if (7..12).contains(&hour_utc) {
        "morning"
    } else if (12..18).contains(&hour_utc) {
        "afternoon"
    } else {
        "evening"
    }
}

fn streaks(trades: &[Trade]) -> (u32, u32) {
    let (mut max_win, mut max_loss, mut cur_win, mut cur_loss) = (0u32, 0u32, 0u32, 0u32);
    for t in trades {
        if t.pnl > 0.0 {
            cur_win += 1;
            cur_loss = 0;
        } else if t.pnl < 0.0 {
            cur_loss += 1;
            cur_win = 0;
        } else {
            cur_win = 0;
            cur_loss = 0;
        }
        max_win = max_win.max(cur_win);
        max_loss = max_loss.max(cur_loss);
    }
    (max_win, max_loss)
}

/// Computes the full [`BacktestResult`] from a trade list and equity
/// curve. `trades` is assumed ordered by exit_ts ascending (streak
/// scanning depends on it).
pub fn compute(trades: &[Trade], equity_curve: &[EquityPoint], initial_capital: f64) -> BacktestResult {
    // final_capital is derived from the net trade pnl, not the gross
    // mark-to-market equity curve, so it equals initial_capital + the sum
    // of realized net pnl regardless of whether costs shifted the curve's
    // last point (cash conservation, §8 property 3).
    let net_pnl_sum: f64 = trades.iter().map(|t| t.pnl).sum();
    let final_capital = initial_capital + net_pnl_sum;
    let total_return = final_capital - initial_capital;
    let total_return_percent = if initial_capital.abs() > 1e-12 { total_return / initial_capital * 100.0 } else { 0.0 };

    let years = equity_curve
        .first()
        .zip(equity_curve.last())
        .map(|(a, b)| ((b.ts - a.ts).num_seconds() as f64 / 86400.0 / 365.25).max(1.0 / 365.25))
        .unwrap_or(1.0);
    let cagr_percent = if initial_capital > 0.0 && final_capital > 0.0 {
        sanitize(((final_capital / initial_capital).powf(1.0 / years) - 1.0) * 100.0)
    } else {
        0.0
    };

    let capital = CapitalStats {
        initial_capital,
        final_capital,
        total_return,
        total_return_percent: sanitize(total_return_percent),
        cagr_percent,
    };

    let equity_values: Vec<f64> = equity_curve.iter().map(|p| p.equity).collect();
    let dd_series = drawdown_series(&equity_values);
    let max_drawdown_percent = dd_series.iter().cloned().fold(0.0_f64, |acc, d| acc.min(d)).abs();
    let negative: Vec<f64> = dd_series.iter().cloned().filter(|d| *d < 0.0).collect();
    let avg_drawdown_percent = sanitize(mean(&negative).abs());
    let drawdown = DrawdownStats {
        max_drawdown_percent: sanitize(max_drawdown_percent),
        avg_drawdown_percent,
        max_drawdown_duration_days: max_drawdown_duration_days(equity_curve),
    };

    let daily_returns: Vec<f64> = equity_values
        .windows(2)
        .map(|w| if w[0].abs() > 1e-12 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect();
    let vol = std_dev(&daily_returns);
    let annualized_volatility_percent = sanitize(vol * 252f64.sqrt() * 100.0);
    let sharpe = if vol > 0.0 { sanitize(mean(&daily_returns) / vol * 252f64.sqrt()) } else { 0.0 };
    let downside: Vec<f64> = daily_returns.iter().cloned().filter(|r| *r < 0.0).collect();
    let downside_std = std_dev(&downside);
    let sortino = if downside_std > 0.0 { sanitize(mean(&daily_returns) / downside_std * 252f64.sqrt()) } else { 0.0 };
    let calmar = if max_drawdown_percent > 0.0 { sanitize(cagr_percent / max_drawdown_percent) } else { 0.0 };
    let risk = RiskStats {
        annualized_volatility_percent,
        sharpe,
        sortino,
        calmar,
    };

    let pnls: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
    let wins: Vec<f64> = pnls.iter().cloned().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().cloned().filter(|p| *p < 0.0).collect();
    let (max_consecutive_wins, max_consecutive_losses) = streaks(trades);
    let trade_stats = TradeStats {
        total_trades: trades.len() as u32,
        win_rate: win_rate(&pnls),
        avg_win: sanitize(mean(&wins)),
        avg_loss: sanitize(mean(&losses)),
        largest_win: wins.iter().cloned().fold(0.0_f64, f64::max),
        largest_loss: losses.iter().cloned().fold(0.0_f64, f64::min),
        profit_factor: profit_factor(&pnls),
        max_consecutive_wins,
        max_consecutive_losses,
    };

    let mut by_dow: Vec<(String, Bucket)> = Vec::new();
    for day in ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday"] {
        let subset: Vec<&Trade> = trades.iter().filter(|t| t.day_of_week == day).collect();
        if !subset.is_empty() {
            by_dow.push((day.to_string(), Bucket::from_trades(&subset)));
        }
    }
    let bucket_for = |pred: &dyn Fn(&Trade) -> bool| {
        let subset: Vec<&Trade> = trades.iter().filter(|t| pred(t)).collect();
        Bucket::from_trades(&subset)
    };
    let temporal = TemporalBuckets {
        by_day_of_week: by_dow,
        morning: bucket_for(&|t| classify_intraday(t.hour_of_day) == "morning"),
        afternoon: bucket_for(&|t| classify_intraday(t.hour_of_day) == "afternoon"),
        evening: bucket_for(&|t| classify_intraday(t.hour_of_day) == "evening"),
        us_open: bucket_for(&|t| t.session == SessionBucket::UsOpen),
        eu_open: bucket_for(&|t| t.session == SessionBucket::EuOpen),
        eu_pm: bucket_for(&|t| t.session == SessionBucket::EuPm),
        us_pm: bucket_for(&|t| t.session == SessionBucket::UsPm),
        other_session: bucket_for(&|t| t.session == SessionBucket::Other),
    };

    let regime = RegimeBuckets {
        trending: bucket_for(&|t| t.regime_at_exit == Regime::Trending),
        lateral: bucket_for(&|t| t.regime_at_exit == Regime::Lateral),
    };

    BacktestResult {
        capital,
        trades: trade_stats,
        drawdown,
        risk,
        temporal,
        regime,
        equity_curve: equity_curve.to_vec(),
        daily_returns,
        trade_list: trades.to_vec(),
    }
}
