//! Deterministic Kanban board orchestrator.
//!
//! A tick-driven reconciler keeps an external board in sync with worker,
//! reviewer, and docs child processes. Each tick: snapshot the board,
//! materialize run artifacts, ask the pure policy engine for proposals,
//! clamp them to the action budget, apply, persist, heartbeat.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod state;
pub mod test_support;
pub mod tick;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
