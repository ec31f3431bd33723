//! Risk supervisor / circuit breaker (component H): tracks balance
//! drawdown against daily/weekly/consecutive-loss/total-drawdown
//! thresholds and trips on the first one breached. Grounded on the
//! original `CircuitBreaker`.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub max_daily_loss_percent: f64,
    pub max_weekly_loss_percent: f64,
    pub max_consecutive_losses: u32,
    pub max_total_drawdown_percent: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            enabled: true,
            max_daily_loss_percent: 3.0,
            max_weekly_loss_percent: 8.0,
            max_consecutive_losses: 5,
            max_total_drawdown_percent: 15.0,
        }
    }
}

/// Why the breaker tripped; the first limit breached, checked in this
/// priority order: daily loss, weekly loss, consecutive losses, drawdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    DailyLoss,
    WeeklyLoss,
    ConsecutiveLosses,
    Drawdown,
}

impl TripReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TripReason::DailyLoss => "daily_loss",
            TripReason::WeeklyLoss => "weekly_loss",
            TripReason::ConsecutiveLosses => "consecutive_losses",
            TripReason::Drawdown => "drawdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub initial_balance: f64,
    pub current_balance: f64,
    pub peak_balance: f64,
    pub daily_start_balance: f64,
    pub weekly_start_balance: f64,
    pub consecutive_losses: u32,
    pub active: bool,
    pub trip_reason: Option<TripReason>,
    pub trip_ts: Option<DateTime<Utc>>,
    daily_reset_date: Option<chrono::NaiveDate>,
    week_start_ts: Option<DateTime<Utc>>,
}

/// Event-driven circuit breaker: the caller feeds it balance updates and
/// trade outcomes; it decides internally whether a daily/weekly reset is
/// due and whether any limit has been breached. Reset is never automatic
/// once tripped — only [`CircuitBreaker::reset`] clears it.
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: CircuitBreakerState,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            cfg,
            state: CircuitBreakerState {
                initial_balance: 0.0,
                current_balance: 0.0,
                peak_balance: 0.0,
                daily_start_balance: 0.0,
                weekly_start_balance: 0.0,
                consecutive_losses: 0,
                active: false,
                trip_reason: None,
                trip_ts: None,
                daily_reset_date: None,
                week_start_ts: None,
            },
        }
    }

    pub fn initialize(&mut self, starting_balance: f64, now: DateTime<Utc>) {
        self.state.initial_balance = starting_balance;
        self.state.current_balance = starting_balance;
        self.state.peak_balance = starting_balance;
        self.state.daily_start_balance = starting_balance;
        self.state.weekly_start_balance = starting_balance;
        self.state.daily_reset_date = Some(now.date_naive());
        self.state.week_start_ts = Some(now);
        self.state.consecutive_losses = 0;
        self.state.active = false;
        self.state.trip_reason = None;
        self.state.trip_ts = None;
    }

    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    /// Updates current/peak balance and re-evaluates the resets and the
    /// trip conditions, in that order.
    pub fn update_balance(&mut self, new_balance: f64, now: DateTime<Utc>) {
        self.state.current_balance = new_balance;
        if new_balance > self.state.peak_balance {
            self.state.peak_balance = new_balance;
        }
        self.check_daily_reset(now);
        self.check_weekly_reset(now);
        self.check_limits(now);
    }

    /// Records a closed trade's P&L for the consecutive-loss streak: any
    /// loss extends the streak, any non-loss (including breakeven) resets
    /// it to zero.
    pub fn register_trade_result(&mut self, pnl: f64) {
        if pnl < 0.0 {
            self.state.consecutive_losses += 1;
        } else {
            self.state.consecutive_losses = 0;
        }
    }

    pub fn is_active(&self) -> bool {
        self.cfg.enabled && self.state.active
    }

    /// Explicit operator action: clears the tripped flag and reason, and
    /// re-anchors daily/weekly/peak balance to the current balance so the
    /// breaker cannot immediately re-trip on stale anchors (e.g. a peak
    /// left over from before the drawdown that tripped it). Never called
    /// automatically.
    pub fn reset(&mut self) {
        tracing::warn!("circuit breaker manually reset");
        self.state.active = false;
        self.state.trip_reason = None;
        self.state.trip_ts = None;
        self.state.daily_start_balance = self.state.current_balance;
        self.state.weekly_start_balance = self.state.current_balance;
        self.state.peak_balance = self.state.current_balance;
    }

    fn check_daily_reset(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.state.daily_reset_date != Some(today) {
            self.state.daily_reset_date = Some(today);
            self.state.daily_start_balance = self.state.current_balance;
        }
    }

    fn check_weekly_reset(&mut self, now: DateTime<Utc>) {
        let start = match self.state.week_start_ts {
            Some(ts) => ts,
            None => {
                self.state.week_start_ts = Some(now);
                return;
            }
        };
        if (now - start).num_days() >= 7 {
            self.state.weekly_start_balance = self.state.current_balance;
            self.state.week_start_ts = Some(now);
        }
    }

    fn check_limits(&mut self, now: DateTime<Utc>) {
        if self.state.active {
            return;
        }
        if self.state.daily_start_balance > 0.0 {
            let daily_pct = ((self.state.current_balance - self.state.daily_start_balance) / self.state.daily_start_balance) * 100.0;
            if daily_pct <= -self.cfg.max_daily_loss_percent {
                self.activate(TripReason::DailyLoss, now);
                return;
            }
        }
        if self.state.weekly_start_balance > 0.0 {
            let weekly_pct = ((self.state.current_balance - self.state.weekly_start_balance) / self.state.weekly_start_balance) * 100.0;
            if weekly_pct <= -self.cfg.max_weekly_loss_percent {
                self.activate(TripReason::WeeklyLoss, now);
                return;
            }
        }
        if self.state.consecutive_losses >= self.cfg.max_consecutive_losses {
            self.activate(TripReason::ConsecutiveLosses, now);
            return;
        }
        if self.state.peak_balance > 0.0 {
            let drawdown_pct = ((self.state.peak_balance - self.state.current_balance) / self.state.peak_balance) * 100.0;
            if drawdown_pct >= self.cfg.max_total_drawdown_percent {
                self.activate(TripReason::Drawdown, now);
            }
        }
    }

    fn activate(&mut self, reason: TripReason, now: DateTime<Utc>) {
        tracing::error!(reason = reason.as_str(), "circuit breaker tripped");
        self.state.active = true;
        self.state.trip_reason = Some(reason);
        self.state.trip_ts = Some(now);
    }
}
