//! Bot state controller (component K): the single switch a live binary
//! exposes to an operator (or a control surface calling into it) for
//! pausing and resuming trading without killing the process. Grounded on
//! the original `bot_state.py` singleton.

use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};

/// Who issued the last start/stop: useful for an operator dashboard to
/// distinguish "never started" from "stopped by a human".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None,
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct BotState {
    running: bool,
    manual_override: bool,
    last_command: Command,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl Default for BotState {
    fn default() -> Self {
        // Starts paused: a freshly launched live binary never trades until
        // something explicitly calls `start()`.
        BotState {
            running: false,
            manual_override: false,
            last_command: Command::None,
            last_heartbeat: None,
        }
    }
}

/// Immutable snapshot of the controller's state at one instant, safe to
/// hand out past the lock guard's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct BotStateSnapshot {
    pub running: bool,
    /// Operator intent to keep the bot paused, distinct from `running`:
    /// set by an explicit `stop()`, cleared by the next `start()`. Lets a
    /// watchdog or dashboard tell "paused because an operator said so"
    /// from "paused because it never started".
    pub manual_override: bool,
    pub last_command: Command,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Process-wide singleton guarding [`BotState`]. `ReentrantMutex` because
/// the live loop's tick handler and an operator-facing control call (e.g.
/// a signal handler or an admin endpoint) may both want to read/update it
/// from the same thread without deadlocking.
static SINGLETON: OnceLock<ReentrantMutex<RefCell<BotState>>> = OnceLock::new();

fn cell() -> &'static ReentrantMutex<RefCell<BotState>> {
    SINGLETON.get_or_init(|| ReentrantMutex::new(RefCell::new(BotState::default())))
}

/// Resumes trading; idempotent. Clears `manual_override` — an operator
/// calling `start()` supersedes any earlier `stop()`.
pub fn start() {
    let guard = cell().lock();
    let mut state = guard.borrow_mut();
    state.running = true;
    state.manual_override = false;
    state.last_command = Command::Start;
    tracing::info!("bot state: started");
}

/// Pauses trading; idempotent. Existing open positions are left alone —
/// this only gates whether new signals are evaluated/acted on. Sets
/// `manual_override` so the pause reads as operator intent rather than
/// "never started".
pub fn stop() {
    let guard = cell().lock();
    let mut state = guard.borrow_mut();
    state.running = false;
    state.manual_override = true;
    state.last_command = Command::Stop;
    tracing::info!("bot state: stopped");
}

/// Records that the live loop is still alive, independent of running/
/// paused status — a paused bot still heartbeats so a watchdog can tell
/// "intentionally paused" from "process hung".
pub fn update_heartbeat(now: DateTime<Utc>) {
    let guard = cell().lock();
    guard.borrow_mut().last_heartbeat = Some(now);
}

pub fn is_running() -> bool {
    cell().lock().borrow().running
}

pub fn snapshot() -> BotStateSnapshot {
    let guard = cell().lock();
    let state = guard.borrow();
    BotStateSnapshot {
        running: state.running,
        manual_override: state.manual_override,
        last_command: state.last_command,
        last_heartbeat: state.last_heartbeat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // These tests share the process-wide singleton; each leaves it in a
    // known state so ordering between tests doesn't matter.

    #[test]
    fn start_then_stop_toggles_running() {
        start();
        assert!(is_running());
        stop();
        assert!(!is_running());
    }

    #[test]
    fn heartbeat_is_recorded_independent_of_running_state() {
        stop();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        update_heartbeat(now);
        let snap = snapshot();
        assert_eq!(snap.last_heartbeat, Some(now));
        assert!(!snap.running);
    }

    #[test]
    fn last_command_reflects_most_recent_call() {
        start();
        assert_eq!(snapshot().last_command, Command::Start);
        stop();
        assert_eq!(snapshot().last_command, Command::Stop);
    }

    #[test]
    fn stop_sets_manual_override_and_start_clears_it() {
        start();
        assert!(!snapshot().manual_override);
        stop();
        assert!(snapshot().manual_override, "an explicit stop() should record operator intent");
        start();
        assert!(!snapshot().manual_override, "a subsequent start() should clear the override");
    }
}
