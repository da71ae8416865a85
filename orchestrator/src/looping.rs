//! Periodic tick driver for `boardloop run`.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::io::board::Board;
use crate::io::config::Config;
use crate::io::spawn::Spawner;
use crate::tick::{TickOutcome, run_tick};

/// Why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The configured tick limit was reached.
    MaxTicksReached { ticks: u64 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub ticks_completed: u64,
    pub ticks_contended: u64,
    pub stop: LoopStop,
}

/// Run ticks every `config.tick_seconds` until `max_ticks` have fired
/// (`None` loops forever). Lock contention skips the tick and keeps
/// looping; tick errors are logged and the loop continues, which is what a
/// supervised long-running reconciler wants.
pub fn run_loop<B: Board, S: Spawner, F: FnMut(&TickOutcome)>(
    board: &B,
    spawner: &S,
    config: &Config,
    max_ticks: Option<u64>,
    mut on_tick: F,
) -> Result<LoopOutcome> {
    let period = Duration::from_secs(config.tick_seconds);
    let mut ticks_completed = 0u64;
    let mut ticks_contended = 0u64;
    let mut fired = 0u64;

    loop {
        if let Some(limit) = max_ticks {
            if fired >= limit {
                return Ok(LoopOutcome {
                    ticks_completed,
                    ticks_contended,
                    stop: LoopStop::MaxTicksReached { ticks: fired },
                });
            }
        }
        fired += 1;
        match run_tick(board, spawner, config) {
            Ok(outcome) => {
                match &outcome {
                    TickOutcome::Completed(report) => {
                        ticks_completed += 1;
                        info!(
                            actions = report.actions.len(),
                            errors = report.errors.len(),
                            "tick completed"
                        );
                    }
                    TickOutcome::LockContention => {
                        ticks_contended += 1;
                        warn!("tick skipped: lock contention");
                    }
                }
                on_tick(&outcome);
            }
            Err(err) => {
                // One bad tick must not kill the loop; the next tick
                // retries from a fresh snapshot.
                warn!(err = %format!("{err:#}"), "tick failed");
            }
        }
        if max_ticks.map(|limit| fired >= limit).unwrap_or(false) {
            continue;
        }
        thread::sleep(period);
    }
}
