//! Guardian decision logic.
//!
//! The guardian is a separate process that watches the reconciler heartbeat
//! and restarts the loop via a configured bring-up command when the
//! heartbeat goes stale. Restart history is persisted so a broken bring-up
//! command cannot produce a restart loop.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use boardloop::io::heartbeat::{Heartbeat, read_heartbeat};
use serde::{Deserialize, Serialize};

/// Heartbeats older than `factor * tickSeconds` are stale.
pub const DEFAULT_STALE_FACTOR: u64 = 3;

/// What the guardian decided to do this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardianDecision {
    /// Heartbeat is fresh; nothing to do.
    Healthy { age_s: i64 },
    /// Heartbeat is stale and a restart is allowed.
    Restart { age_s: Option<i64> },
    /// Heartbeat is stale but the restart limiter refused.
    RestartSuppressed { recent_restarts: usize },
}

/// Persisted restart history (epoch seconds of each restart).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartHistory {
    pub restarts: Vec<i64>,
}

impl RestartHistory {
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let mut payload = serde_json::to_string_pretty(self).context("serialize history")?;
        payload.push('\n');
        fs::write(path, payload).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn recent(&self, now_s: i64, window_min: u32) -> usize {
        let window_s = i64::from(window_min) * 60;
        self.restarts
            .iter()
            .filter(|at| now_s.saturating_sub(**at) <= window_s)
            .count()
    }

    pub fn record(&mut self, now_s: i64, window_min: u32) {
        let window_s = i64::from(window_min) * 60;
        self.restarts.retain(|at| now_s.saturating_sub(*at) <= window_s);
        self.restarts.push(now_s);
    }
}

/// Decide whether the reconciler needs a restart.
///
/// A missing or unreadable heartbeat counts as stale: a reconciler that
/// never got far enough to write one needs bringing up too.
pub fn decide(
    heartbeat: Option<&Heartbeat>,
    history: &RestartHistory,
    now_s: i64,
    stale_factor: u64,
    fallback_tick_seconds: u64,
    max_restarts: u32,
    restart_window_min: u32,
) -> GuardianDecision {
    let stale = match heartbeat {
        Some(hb) => {
            let mut hb = hb.clone();
            if hb.tick_seconds == 0 {
                hb.tick_seconds = fallback_tick_seconds;
            }
            if !hb.is_stale(now_s, stale_factor) {
                return GuardianDecision::Healthy { age_s: hb.age_s(now_s) };
            }
            Some(hb.age_s(now_s))
        }
        None => None,
    };

    let recent = history.recent(now_s, restart_window_min);
    if recent >= max_restarts as usize {
        return GuardianDecision::RestartSuppressed { recent_restarts: recent };
    }
    GuardianDecision::Restart { age_s: stale }
}

/// Read the heartbeat and decide, in one step.
pub fn check_heartbeat(
    heartbeat_path: &Path,
    history: &RestartHistory,
    now_s: i64,
    stale_factor: u64,
    fallback_tick_seconds: u64,
    max_restarts: u32,
    restart_window_min: u32,
) -> GuardianDecision {
    let heartbeat = read_heartbeat(heartbeat_path);
    decide(
        heartbeat.as_ref(),
        history,
        now_s,
        stale_factor,
        fallback_tick_seconds,
        max_restarts,
        restart_window_min,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(ts_epoch_s: i64, tick_seconds: u64) -> Heartbeat {
        Heartbeat {
            ts_epoch_s,
            tick_seconds,
            ..Heartbeat::default()
        }
    }

    #[test]
    fn fresh_heartbeat_is_healthy() {
        let hb = heartbeat(1000, 20);
        let decision = decide(Some(&hb), &RestartHistory::default(), 1030, 3, 20, 3, 30);
        assert_eq!(decision, GuardianDecision::Healthy { age_s: 30 });
    }

    #[test]
    fn stale_heartbeat_requests_restart() {
        let hb = heartbeat(1000, 20);
        let decision = decide(Some(&hb), &RestartHistory::default(), 1100, 3, 20, 3, 30);
        assert_eq!(decision, GuardianDecision::Restart { age_s: Some(100) });
    }

    #[test]
    fn missing_heartbeat_requests_restart() {
        let decision = decide(None, &RestartHistory::default(), 1000, 3, 20, 3, 30);
        assert_eq!(decision, GuardianDecision::Restart { age_s: None });
    }

    #[test]
    fn restart_limiter_suppresses_loops() {
        let mut history = RestartHistory::default();
        for _ in 0..3 {
            history.record(1000, 30);
        }
        let decision = decide(None, &history, 1001, 3, 20, 3, 30);
        assert_eq!(decision, GuardianDecision::RestartSuppressed { recent_restarts: 3 });

        // Outside the window the limiter resets.
        let decision = decide(None, &history, 1000 + 31 * 60, 3, 20, 3, 30);
        assert!(matches!(decision, GuardianDecision::Restart { .. }));
    }

    #[test]
    fn history_round_trips_and_prunes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("restarts.json");
        let mut history = RestartHistory::default();
        history.record(100, 30);
        history.record(100 + 31 * 60, 30);
        assert_eq!(history.restarts.len(), 1, "old entries pruned on record");
        history.save(&path).expect("save");
        let loaded = RestartHistory::load(&path);
        assert_eq!(loaded, history);
    }

    #[test]
    fn zero_tick_seconds_falls_back() {
        let hb = heartbeat(1000, 0);
        let decision = decide(Some(&hb), &RestartHistory::default(), 1030, 3, 20, 3, 30);
        assert_eq!(decision, GuardianDecision::Healthy { age_s: 30 });
    }
}
