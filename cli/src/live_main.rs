//! live_main.rs — Live Trading Entry Point
//!
//! Runs the intraday engine against Capital.com on a wall-clock cadence
//! (component L):
//!   1. Load config from .env (reads CAPITAL_* credentials)
//!   2. Authenticate and warm up each epic's bar history
//!   3. Start the bot state controller and enter the poll loop
//!   4. Each tick: fetch new bars, drive [`LiveEngine::tick`], persist,
//!      sleep until the next cadence
//!
//! The live binary owns the only async boundary in the system (HTTP
//! fetch, persistence I/O, inter-tick sleep); every collaborator trait
//! call into `intraday-core` stays synchronous.

mod capital_client;
mod report;

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use capital_client::{CapitalClient, CapitalClientConfig};
use intraday_core::collaborators::{AccountSource, BarSource};
use intraday_core::config::AppConfig;
use intraday_core::error::EngineError;
use intraday_core::live::LiveEngine;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    info!("intraday-engine live loop starting");

    let cfg = AppConfig::from_env().map_err(|e: EngineError| anyhow::anyhow!(e))?;
    info!(epics = ?cfg.epics, resolution = %cfg.resolution, scan_interval_secs = cfg.scan_interval_secs, "config loaded");

    let broker_cfg = CapitalClientConfig::from_env().context("broker credentials")?;
    let broker = CapitalClient::new(broker_cfg).context("building broker client")?;
    broker.authenticate().await.context("authenticating with broker")?;
    info!("broker session established");

    let output_dir = env::var("OUTPUT_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./reports"));
    let run_dir = report::new_run_dir(&output_dir, chrono::Utc::now()).context("creating report directory")?;
    let sink = report::FileReportSink::create(&run_dir).context("creating report files")?;
    info!(dir = %run_dir.display(), "persisting to");

    let mut engine = LiveEngine::new(cfg.clone());

    // ── Warm up: fetch recent bars to fill indicator windows without
    // trading on them.
    let warmup_points = cfg.sma_long.max(cfg.atr_period).max(cfg.adx_period) * 3;
    let warmup_from = chrono::Utc::now() - chrono::Duration::hours(warmup_points as i64 * 4);
    let warmup_to = chrono::Utc::now();
    for epic in &cfg.epics {
        info!(epic, "warming up");
        let warmup_bars = broker.bars(epic, warmup_from, warmup_to).unwrap_or_else(|e| {
            warn!(epic, error = %e, "warmup bar fetch failed, starting with an empty series");
            Vec::new()
        });
        engine.warmup(epic, warmup_bars, None);
    }

    let starting_balance = match broker.account() {
        Ok(snapshot) => snapshot.balance,
        Err(e) => {
            warn!(error = %e, initial_capital = cfg.initial_capital, "account snapshot unavailable at startup, seeding breaker from config");
            cfg.initial_capital
        }
    };
    engine.start(starting_balance, chrono::Utc::now());
    intraday_core::botstate::start();
    info!(starting_balance, "warmup complete, bot running");

    loop {
        tokio::select! {
            _ = sleep(Duration::from_secs(cfg.scan_interval_secs)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, stopping after this tick");
                intraday_core::botstate::stop();
                break;
            }
        }

        let now = chrono::Utc::now();
        let mut new_bars = ahash::AHashMap::new();
        for epic in &cfg.epics {
            match broker.fetch_latest(epic, &cfg.resolution, 3).await {
                Ok(bars) => {
                    new_bars.insert(epic.clone(), bars);
                }
                Err(e) => {
                    error!(epic, error = %e, "failed to fetch latest bars, skipping epic this tick");
                }
            }
        }

        let outcome = engine.tick(now, &new_bars, &broker, &broker, &broker, &sink);
        if !outcome.opened.is_empty() {
            info!(opened = ?outcome.opened, "positions opened");
        }
        if !outcome.closed.is_empty() {
            info!(closed = ?outcome.closed, "positions closed");
        }
        info!(equity = outcome.equity, breaker_active = outcome.breaker_active, "tick complete");

        if !intraday_core::botstate::is_running() {
            info!("bot paused, idling until resumed");
        }
    }

    let snapshot = intraday_core::botstate::snapshot();
    info!(last_heartbeat = ?snapshot.last_heartbeat, "live loop stopped");
    Ok(())
}
