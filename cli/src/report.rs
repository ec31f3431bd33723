//! report.rs — file-based persistence sink and the run-report writer:
//! one `run_<YYYYMMDD_HHMMSS>/` directory per run holding `trades.csv`,
//! `equity.csv`, and `metrics.json`.
//!
//! [`FileReportSink`] implements [`PersistenceSink`] so both binaries
//! share the exact same boundary the core already calls per-trade and
//! per-tick; the backtest binary additionally writes `metrics.json` once
//! from the returned [`BacktestResult`] after the run completes.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use intraday_core::collaborators::PersistenceSink;
use intraday_core::error::{EngineError, EngineResult};
use intraday_core::metrics::{BacktestResult, Bucket};
use intraday_core::types::{EquityPoint, Signal, Trade};
use serde::Serialize;

/// `run_<YYYYMMDD_HHMMSS>` under `base`, created fresh for this run.
pub fn new_run_dir(base: &Path, now: DateTime<Utc>) -> std::io::Result<PathBuf> {
    let dir = base.join(format!("run_{}", now.format("%Y%m%d_%H%M%S")));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Trade CSV row, column order fixed for downstream tooling.
#[derive(Serialize)]
struct TradeRow<'a> {
    epic: &'a str,
    direction: &'static str,
    entry_date: String,
    exit_date: String,
    entry_price: f64,
    exit_price: f64,
    units: f64,
    position_size: f64,
    pnl: f64,
    pnl_percent: f64,
    exit_reason: &'static str,
    confidence: f64,
    duration_hours: f64,
    day_of_week: &'a str,
    hour_of_day: u32,
    regime: &'static str,
}

#[derive(Serialize)]
struct EquityRow {
    date: String,
    equity: f64,
    cash: f64,
    open_positions: u32,
}

/// Writes trades and equity points as they're produced, and the final
/// metrics summary once at the end of a run. Interior mutability over
/// `Mutex` because [`PersistenceSink`] methods take `&self` — the engine
/// core is single-owner but the trait is `Send + Sync` for the live
/// binary's async context.
pub struct FileReportSink {
    dir: PathBuf,
    trades: Mutex<csv::Writer<File>>,
    equity: Mutex<csv::Writer<File>>,
}

impl FileReportSink {
    pub fn create(dir: &Path) -> anyhow::Result<Self> {
        let trades = csv::Writer::from_path(dir.join("trades.csv"))?;
        let equity = csv::Writer::from_path(dir.join("equity.csv"))?;
        Ok(FileReportSink {
            dir: dir.to_path_buf(),
            trades: Mutex::new(trades),
            equity: Mutex::new(equity),
        })
    }

    pub fn write_metrics(&self, result: &BacktestResult) -> anyhow::Result<()> {
        let summary = ReportSummary::from(result);
        let file = File::create(self.dir.join("metrics.json"))?;
        serde_json::to_writer_pretty(file, &summary)?;
        Ok(())
    }
}

impl PersistenceSink for FileReportSink {
    fn record_trade(&self, trade: &Trade) -> EngineResult<()> {
        let row = TradeRow {
            epic: &trade.epic,
            direction: match trade.direction {
                intraday_core::types::Direction::Buy => "BUY",
                intraday_core::types::Direction::Sell => "SELL",
                intraday_core::types::Direction::Neutral => "NEUTRAL",
            },
            entry_date: trade.entry_ts.to_rfc3339(),
            exit_date: trade.exit_ts.to_rfc3339(),
            entry_price: trade.entry_price,
            exit_price: trade.exit_price,
            units: trade.units,
            position_size: trade.size_eur,
            pnl: trade.pnl,
            pnl_percent: trade.pnl_percent,
            exit_reason: trade.exit_reason.as_str(),
            confidence: trade.confidence,
            duration_hours: trade.duration_hours,
            day_of_week: &trade.day_of_week,
            hour_of_day: trade.hour_of_day,
            regime: trade.regime_at_exit.as_str(),
        };
        let mut w = self.trades.lock().unwrap();
        w.serialize(row).map_err(|e| EngineError::PersistenceUnavailable(e.to_string()))?;
        w.flush().map_err(|e| EngineError::PersistenceUnavailable(e.to_string()))
    }

    fn record_equity_point(&self, point: &EquityPoint) -> EngineResult<()> {
        let row = EquityRow {
            date: point.ts.to_rfc3339(),
            equity: point.equity,
            cash: point.cash,
            open_positions: point.open_positions,
        };
        let mut w = self.equity.lock().unwrap();
        w.serialize(row).map_err(|e| EngineError::PersistenceUnavailable(e.to_string()))?;
        w.flush().map_err(|e| EngineError::PersistenceUnavailable(e.to_string()))
    }

    fn record_metrics(&self, metrics: &BacktestResult) -> EngineResult<()> {
        self.write_metrics(metrics).map_err(|e| EngineError::PersistenceUnavailable(e.to_string()))
    }

    fn record_signal(&self, _signal: &Signal) -> EngineResult<()> {
        // The persisted trade/equity trail is enough for the offline
        // report; signals that never became trades aren't written here.
        Ok(())
    }
}

#[derive(Serialize)]
struct BucketJson {
    total_trades: u32,
    win_rate: f64,
    profit_factor: f64,
    total_pnl: f64,
    avg_pnl: f64,
}

impl From<&Bucket> for BucketJson {
    fn from(b: &Bucket) -> Self {
        BucketJson {
            total_trades: b.total_trades,
            win_rate: b.win_rate,
            // serde_json serializes non-finite floats as `null`; the
            // profit-factor "no losses" case (+inf) round-trips as null
            // rather than a JSON number too large to represent.
            profit_factor: b.profit_factor,
            total_pnl: b.total_pnl,
            avg_pnl: b.avg_pnl,
        }
    }
}

#[derive(Serialize)]
struct CapitalJson {
    initial_capital: f64,
    final_capital: f64,
    total_return: f64,
    total_return_percent: f64,
    cagr_percent: f64,
}

#[derive(Serialize)]
struct TradesJson {
    total_trades: u32,
    win_rate: f64,
    avg_win: f64,
    avg_loss: f64,
    largest_win: f64,
    largest_loss: f64,
    profit_factor: f64,
    max_consecutive_wins: u32,
    max_consecutive_losses: u32,
}

#[derive(Serialize)]
struct RiskJson {
    annualized_volatility_percent: f64,
    sharpe: f64,
    sortino: f64,
    calmar: f64,
    max_drawdown_percent: f64,
    avg_drawdown_percent: f64,
    max_drawdown_duration_days: f64,
}

#[derive(Serialize)]
struct TemporalJson {
    by_day: std::collections::BTreeMap<String, BucketJson>,
    by_hour: std::collections::BTreeMap<String, BucketJson>,
    by_session: std::collections::BTreeMap<String, BucketJson>,
    by_regime: std::collections::BTreeMap<String, BucketJson>,
}

/// The flattened JSON report shape: groups `capital`, `trades`, `risk`,
/// `temporal`, dates as ISO-8601 UTC strings. Drawdown stats fold into
/// `risk`; the regime breakdown folds into `temporal.by_regime`.
#[derive(Serialize)]
pub struct ReportSummary {
    capital: CapitalJson,
    trades: TradesJson,
    risk: RiskJson,
    temporal: TemporalJson,
}

impl From<&BacktestResult> for ReportSummary {
    fn from(r: &BacktestResult) -> Self {
        let mut by_day = std::collections::BTreeMap::new();
        for (day, bucket) in &r.temporal.by_day_of_week {
            by_day.insert(day.clone(), BucketJson::from(bucket));
        }
        let mut by_hour = std::collections::BTreeMap::new();
        by_hour.insert("morning".to_string(), BucketJson::from(&r.temporal.morning));
        by_hour.insert("afternoon".to_string(), BucketJson::from(&r.temporal.afternoon));
        by_hour.insert("evening".to_string(), BucketJson::from(&r.temporal.evening));

        let mut by_session = std::collections::BTreeMap::new();
        by_session.insert("us_open".to_string(), BucketJson::from(&r.temporal.us_open));
        by_session.insert("eu_open".to_string(), BucketJson::from(&r.temporal.eu_open));
        by_session.insert("eu_pm".to_string(), BucketJson::from(&r.temporal.eu_pm));
        by_session.insert("us_pm".to_string(), BucketJson::from(&r.temporal.us_pm));
        by_session.insert("other".to_string(), BucketJson::from(&r.temporal.other_session));

        let mut by_regime = std::collections::BTreeMap::new();
        by_regime.insert("trending".to_string(), BucketJson::from(&r.regime.trending));
        by_regime.insert("lateral".to_string(), BucketJson::from(&r.regime.lateral));

        ReportSummary {
            capital: CapitalJson {
                initial_capital: r.capital.initial_capital,
                final_capital: r.capital.final_capital,
                total_return: r.capital.total_return,
                total_return_percent: r.capital.total_return_percent,
                cagr_percent: r.capital.cagr_percent,
            },
            trades: TradesJson {
                total_trades: r.trades.total_trades,
                win_rate: r.trades.win_rate,
                avg_win: r.trades.avg_win,
                avg_loss: r.trades.avg_loss,
                largest_win: r.trades.largest_win,
                largest_loss: r.trades.largest_loss,
                profit_factor: r.trades.profit_factor,
                max_consecutive_wins: r.trades.max_consecutive_wins,
                max_consecutive_losses: r.trades.max_consecutive_losses,
            },
            risk: RiskJson {
                annualized_volatility_percent: r.risk.annualized_volatility_percent,
                sharpe: r.risk.sharpe,
                sortino: r.risk.sortino,
                calmar: r.risk.calmar,
                max_drawdown_percent: r.drawdown.max_drawdown_percent,
                avg_drawdown_percent: r.drawdown.avg_drawdown_percent,
                max_drawdown_duration_days: r.drawdown.max_drawdown_duration_days,
            },
            temporal: TemporalJson { by_day, by_hour, by_session, by_regime },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_run_dir_is_created_and_named_by_utc_timestamp() {
        let base = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 13, 5, 9).unwrap();
        let dir = new_run_dir(base.path(), now).unwrap();
        assert!(dir.ends_with("run_20260728_130509"));
        assert!(dir.exists());
    }

    #[test]
    fn empty_result_serializes_without_panicking() {
        let result = BacktestResult::default();
        let summary = ReportSummary::from(&result);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"capital\""));
        assert!(json.contains("\"temporal\""));
    }
}
