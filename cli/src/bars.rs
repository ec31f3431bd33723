//! bars.rs — CSV bar ingestion for the backtest binary.
//!
//! One file per epic, named `<epic>.csv` under the configured bars
//! directory, columns `ts,open,high,low,close,volume` (volume optional,
//! may be blank). `ts` is parsed as RFC3339; naive timestamps are
//! rejected rather than silently assumed UTC.
//!
//! Malformed rows (unparseable `ts`, non-finite `close`) are skipped in
//! place; if no valid row remains for an epic, the epic is dropped from
//! the run and a diagnostic is logged rather than aborting the whole
//! backtest.

use std::path::Path;

use chrono::{DateTime, Utc};
use intraday_core::types::Bar;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct BarRow {
    ts: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: Option<f64>,
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).ok()
}

/// Loads and sorts one epic's bar series from `<dir>/<epic>.csv`. Returns
/// `Ok(None)` (not an error) when the file is absent — callers treat a
/// missing epic file the same as an epic with no usable rows.
pub fn load_epic_csv(dir: &Path, epic: &str) -> anyhow::Result<Option<Vec<Bar>>> {
    let path = dir.join(format!("{epic}.csv"));
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(&path)?;
    let mut bars = Vec::new();
    let mut skipped = 0u32;
    for record in reader.deserialize::<BarRow>() {
        let row = match record {
            Ok(r) => r,
            Err(e) => {
                warn!(epic, error = %e, "malformed bar row, skipping");
                skipped += 1;
                continue;
            }
        };
        let ts = match parse_ts(&row.ts) {
            Some(ts) => ts,
            None => {
                warn!(epic, ts = %row.ts, "unparseable bar timestamp, skipping row");
                skipped += 1;
                continue;
            }
        };
        if !row.close.is_finite() || !row.open.is_finite() || !row.high.is_finite() || !row.low.is_finite() {
            warn!(epic, %ts, "non-finite OHLC value, skipping row");
            skipped += 1;
            continue;
        }
        bars.push(Bar {
            ts,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume.filter(|v| v.is_finite()),
        });
    }
    if skipped > 0 {
        warn!(epic, skipped, "skipped malformed rows during ingestion");
    }
    // De-duplicate and enforce strict ascending order: the loader is a
    // trust boundary, the engine assumes this afterward.
    bars.sort_by_key(|b| b.ts);
    bars.dedup_by_key(|b| b.ts);
    if bars.is_empty() {
        warn!(epic, "no usable bar rows after filtering, epic unusable for this run");
        return Ok(None);
    }
    Ok(Some(bars))
}

/// Loads every configured epic's bars from `dir`, skipping epics with no
/// usable file or rows rather than failing the whole run.
pub fn load_bars_dir(dir: &Path, epics: &[String]) -> anyhow::Result<ahash::AHashMap<String, Vec<Bar>>> {
    let mut out = ahash::AHashMap::new();
    for epic in epics {
        if let Some(bars) = load_epic_csv(dir, epic)? {
            out.insert(epic.clone(), bars);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn skips_malformed_rows_and_keeps_valid_ones() {
        let dir = tempdir();
        let path = dir.path().join("E.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "ts,open,high,low,close,volume").unwrap();
        writeln!(f, "2024-01-01T00:00:00Z,100,101,99,100,10").unwrap();
        writeln!(f, "not-a-date,100,101,99,100,10").unwrap();
        writeln!(f, "2024-01-01T01:00:00Z,100,101,99,NaN,10").unwrap();
        writeln!(f, "2024-01-01T02:00:00Z,100,101,99,102,").unwrap();
        drop(f);

        let bars = load_epic_csv(dir.path(), "E").unwrap().unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 102.0);
        assert!(bars[1].volume.is_none());
    }

    #[test]
    fn missing_file_yields_none_not_error() {
        let dir = tempdir();
        assert!(load_epic_csv(dir.path(), "GHOST").unwrap().is_none());
    }

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }
}
