//! Capital allocator (component D): daily-budget + per-trade-cap
//! confidence-priority allocation across a batch of signals, grounded on
//! the original `CapitalTracker`.

use crate::types::Signal;
use ahash::AHashMap;
use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    pub daily_budget_pct: f64,
    pub per_trade_cap_pct: f64,
    pub min_allocation_eur: f64,
    pub allow_partial: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            daily_budget_pct: 0.08,
            per_trade_cap_pct: 0.03,
            min_allocation_eur: 0.0,
            allow_partial: true,
        }
    }
}

/// Tracks how much of today's budget has already been committed. Resets
/// automatically the first time it observes a UTC date past the one it
/// last reset on.
pub struct CapitalAllocator {
    cfg: AllocatorConfig,
    reset_date: Option<NaiveDate>,
    spent_today: f64,
}

impl CapitalAllocator {
    pub fn new(cfg: AllocatorConfig) -> Self {
        CapitalAllocator {
            cfg,
            reset_date: None,
            spent_today: 0.0,
        }
    }

    fn reset_if_needed(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.reset_date != Some(today) {
            self.reset_date = Some(today);
            self.spent_today = 0.0;
        }
    }

    pub fn budget_today_eur(&self, equity: f64) -> f64 {
        equity * self.cfg.daily_budget_pct
    }

    pub fn remaining_today_eur(&mut self, equity: f64, now: DateTime<Utc>) -> f64 {
        self.reset_if_needed(now);
        (self.budget_today_eur(equity) - self.spent_today).max(0.0)
    }

    pub fn per_trade_cap_eur(&self, equity: f64) -> f64 {
        equity * self.cfg.per_trade_cap_pct
    }

    /// Allocates the day's remaining budget across `signals` in
    /// confidence-descending order (stable: ties keep input order). Each
    /// signal receives min(remaining, per-trade cap), or the partial tail
    /// if `allow_partial` and that's all that's left; below
    /// `min_allocation_eur` the signal gets nothing. Does not mutate
    /// internal state — call [`Self::record_fill`] for each position that
    /// is actually opened.
    pub fn allocate_for_signals(&mut self, equity: f64, signals: &[Signal], now: DateTime<Utc>) -> Vec<(String, f64)> {
        self.reset_if_needed(now);
        let mut ordered: Vec<&Signal> = signals.iter().collect();
        ordered.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));

        let mut remaining = self.remaining_today_eur(equity, now);
        let per_trade_cap = self.per_trade_cap_eur(equity);
        let mut out = Vec::with_capacity(ordered.len());

        for sig in ordered {
            if remaining <= 0.0 {
                out.push((sig.epic.clone(), 0.0));
                continue;
            }
            let desired = per_trade_cap;
            let amount = if remaining >= desired {
                desired
            } else if self.cfg.allow_partial {
                remaining
            } else {
                0.0
            };
            let amount = if amount < self.cfg.min_allocation_eur { 0.0 } else { amount };
            out.push((sig.epic.clone(), amount));
        }
        out
    }

    /// Records that `amount` was actually committed against today's
    /// budget (called once a position is confirmed open, not at the time
    /// of allocation — an allocated amount the caller declines to use
    /// should never be recorded).
    pub fn record_fill(&mut self, amount: f64, now: DateTime<Utc>) {
        self.reset_if_needed(now);
        self.spent_today += amount;
    }
}

/// Legacy proportional-budget mode (`USE_CAPITAL_TRACKER=false`): splits a
/// fixed slice of equity evenly across the open slots still available,
/// independent of the daily/per-trade caps above. `budget_total` is
/// `equity * target_percent_of_available` (or the fixed amount, per
/// `CapitalMode`); it is divided by `MAX_POSITIONS` regardless of how many
/// signals actually show up, so a run with few signals leaves budget
/// unused rather than concentrating it.
///
/// `distribution_mode` only changes how that per-slot share is spread
/// across the signals actually present this date: `Equal` gives every
/// surviving signal the same per-slot share; `Weighted` scales each
/// signal's share by its confidence relative to the sum of confidences in
/// the batch, still bounded above by `slots_available * per_slot`.
pub fn legacy_allocate(
    equity: f64,
    signals: &[Signal],
    open_count: u32,
    max_positions: u32,
    capital_mode: crate::config::CapitalMode,
    max_capital_percent: f64,
    max_capital_fixed: f64,
    distribution_mode: crate::config::DistributionMode,
) -> Vec<(String, f64)> {
    let slots_available = max_positions.saturating_sub(open_count);
    if slots_available == 0 || signals.is_empty() || max_positions == 0 {
        return signals.iter().map(|s| (s.epic.clone(), 0.0)).collect();
    }
    let budget_total = match capital_mode {
        crate::config::CapitalMode::Percent => equity * (max_capital_percent / 100.0),
        crate::config::CapitalMode::Fixed => max_capital_fixed,
    };
    let per_slot = budget_total / max_positions as f64;
    let pool = per_slot * slots_available as f64;

    let mut ordered: Vec<&Signal> = signals.iter().collect();
    ordered.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    let take: Vec<&Signal> = ordered.iter().take(slots_available as usize).copied().collect();
    let funded: AHashMap<&str, f64> = match distribution_mode {
        crate::config::DistributionMode::Equal => {
            let share = if !take.is_empty() { pool / take.len() as f64 } else { 0.0 };
            take.iter().map(|s| (s.epic.as_str(), share)).collect()
        }
        crate::config::DistributionMode::Weighted => {
            let total_confidence: f64 = take.iter().map(|s| s.confidence).sum();
            take.iter()
                .map(|s| {
                    let weight = if total_confidence > 0.0 { s.confidence / total_confidence } else { 1.0 / take.len() as f64 };
                    (s.epic.as_str(), pool * weight)
                })
                .collect()
        }
    };
    ordered.iter().map(|s| (s.epic.clone(), funded.get(s.epic.as_str()).copied().unwrap_or(0.0))).collect()
}
