//! Thrash and cooldown guards.
//!
//! Windowed counting over timestamps recorded in state. Guards never mutate
//! anything; the policy consults them and the reconciler records the events.

use crate::state::ReworkAttempt;

/// True when another respawn is allowed: strictly fewer than `max_respawns`
/// spawns fall inside the trailing window. Zero limits disable the guard.
pub fn respawn_allowed(history: &[i64], now_ms: i64, window_min: u32, max_respawns: u32) -> bool {
    if max_respawns == 0 || window_min == 0 {
        return true;
    }
    let window_ms = i64::from(window_min) * 60 * 1000;
    let recent = history
        .iter()
        .filter(|at| now_ms.saturating_sub(**at) <= window_ms)
        .count();
    recent < max_respawns as usize
}

/// Number of rework attempts for `revision` inside the trailing window.
pub fn reworks_for_revision(
    history: &[ReworkAttempt],
    revision: &str,
    now_ms: i64,
    window_min: u32,
) -> usize {
    let window_ms = i64::from(window_min) * 60 * 1000;
    history
        .iter()
        .filter(|attempt| {
            attempt.review_revision == revision
                && now_ms.saturating_sub(attempt.at_ms) <= window_ms
        })
        .count()
}

/// Prune rework history to the trailing window (applied before persisting).
pub fn prune_rework_history(history: &mut Vec<ReworkAttempt>, now_ms: i64, window_min: u32) {
    let window_ms = i64::from(window_min) * 60 * 1000;
    history.retain(|attempt| now_ms.saturating_sub(attempt.at_ms) <= window_ms);
}

/// Cross-tick move cooldown. `last_action_ms` is the value snapshotted at
/// the start of the tick, so several transitions within one tick are never
/// throttled against each other.
pub fn cooled(last_action_ms: Option<i64>, now_ms: i64, cooldown_min: u32) -> bool {
    match last_action_ms {
        None => true,
        Some(last) => now_ms.saturating_sub(last) >= i64::from(cooldown_min) * 60 * 1000,
    }
}
