//! main.rs — Backtesting Entry Point
//!
//! Runs the intraday engine's simulation loop over historical bars:
//!   1. Load config from .env
//!   2. Load per-epic CSV bar series (and an optional MTF series) from disk
//!   3. Run the event-driven backtest
//!   4. Write the `run_<YYYYMMDD_HHMMSS>/` report directory
//!   5. Print a short summary to stdout

mod bars;
mod report;

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use intraday_core::collaborators::InstrumentSource;
use intraday_core::config::AppConfig;
use intraday_core::error::{EngineError, EngineResult};
use intraday_core::types::InstrumentSpec;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Conservative-default instrument source: the backtest runs against a
/// historical dataset only, so it never dials out to the broker for
/// sizing metadata — every epic gets a fallback margin rate instead.
struct DefaultInstrumentSource;

impl InstrumentSource for DefaultInstrumentSource {
    fn fetch_spec(&self, epic: &str) -> EngineResult<InstrumentSpec> {
        let margin_rate = if intraday_core::instrument::looks_like_equity(epic) { 0.20 } else { 0.05 };
        Ok(InstrumentSpec {
            leverage: None,
            margin_rate,
            min_size: 0.01,
            step_size: 0.01,
            precision: 2,
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    info!("intraday-engine backtest starting");

    let cfg = AppConfig::from_env().map_err(|e: EngineError| anyhow::anyhow!(e))?;
    info!(epics = ?cfg.epics, resolution = %cfg.resolution, initial_capital = cfg.initial_capital, "config loaded");

    let bars_dir = env::var("BARS_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./data/bars"));
    let mtf_bars_dir = env::var("MTF_BARS_DIR").ok().map(PathBuf::from);
    let output_dir = env::var("OUTPUT_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./reports"));

    let bars_by_epic = bars::load_bars_dir(&bars_dir, &cfg.epics).with_context(|| format!("loading bars from {}", bars_dir.display()))?;
    if bars_by_epic.is_empty() {
        info!("no usable bar data for any configured epic; emitting an empty result");
    }
    for epic in &cfg.epics {
        if let Some(series) = bars_by_epic.get(epic) {
            info!(epic, bars = series.len(), "loaded");
        } else {
            info!(epic, "no bar data, epic skipped for this run");
        }
    }

    let mtf_bars_by_epic = match &mtf_bars_dir {
        Some(dir) if cfg.mtf_enabled => Some(bars::load_bars_dir(dir, &cfg.epics).with_context(|| format!("loading MTF bars from {}", dir.display()))?),
        _ => None,
    };

    let instrument_source = DefaultInstrumentSource;

    let now = chrono::Utc::now();
    let run_dir = report::new_run_dir(&output_dir, now).context("creating report directory")?;
    let sink = report::FileReportSink::create(&run_dir).context("creating report files")?;

    let result = intraday_core::simulation::run_backtest(&cfg, &bars_by_epic, mtf_bars_by_epic.as_ref(), &instrument_source, &sink);

    info!(
        trades = result.trades.total_trades,
        win_rate = result.trades.win_rate,
        final_capital = result.capital.final_capital,
        cagr_percent = result.capital.cagr_percent,
        max_drawdown_percent = result.drawdown.max_drawdown_percent,
        sharpe = result.risk.sharpe,
        "backtest complete"
    );
    println!("Report written to {}", run_dir.display());
    println!(
        "trades={} win_rate={:.1}% final_capital={:.2} total_return={:.2}% cagr={:.2}% max_dd={:.2}% sharpe={:.2} sortino={:.2} calmar={:.2}",
        result.trades.total_trades,
        result.trades.win_rate,
        result.capital.final_capital,
        result.capital.total_return_percent,
        result.capital.cagr_percent,
        result.drawdown.max_drawdown_percent,
        result.risk.sharpe,
        result.risk.sortino,
        result.risk.calmar,
    );

    Ok(())
}
