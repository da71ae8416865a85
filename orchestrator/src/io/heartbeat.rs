//! Reconciler heartbeat file.
//!
//! Written at the end of every tick; the guardian restarts the loop when it
//! goes stale. Small and atomic so readers never see a torn document.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Heartbeat {
    /// RFC3339-ish UTC timestamp, for humans.
    pub ts: String,
    pub ts_epoch_s: i64,
    pub pid: u32,
    pub version: String,
    /// Last phase the reconciler reported ("tick", "idle", ...).
    pub phase: String,
    pub tick_seconds: u64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            ts: String::new(),
            ts_epoch_s: 0,
            pid: 0,
            version: String::new(),
            phase: String::new(),
            tick_seconds: 0,
        }
    }
}

impl Heartbeat {
    pub fn now(phase: &str, tick_seconds: u64, now_ms: i64) -> Self {
        let epoch_s = now_ms / 1000;
        let ts = Utc
            .timestamp_opt(epoch_s, 0)
            .single()
            .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_default();
        Self {
            ts,
            ts_epoch_s: epoch_s,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            phase: phase.to_string(),
            tick_seconds,
        }
    }

    /// Seconds since this heartbeat, clamped at zero.
    pub fn age_s(&self, now_s: i64) -> i64 {
        (now_s - self.ts_epoch_s).max(0)
    }

    /// Stale when older than `factor * tick_seconds` (both at least 1).
    pub fn is_stale(&self, now_s: i64, factor: u64) -> bool {
        if self.ts_epoch_s <= 0 {
            return true;
        }
        let threshold = (self.tick_seconds.max(1) * factor.max(1)) as i64;
        self.age_s(now_s) >= threshold
    }
}

pub fn write_heartbeat(path: &Path, heartbeat: &Heartbeat) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create heartbeat dir {}", parent.display()))?;
        }
    }
    let mut payload = serde_json::to_string_pretty(heartbeat).context("serialize heartbeat")?;
    payload.push('\n');
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

pub fn read_heartbeat(path: &Path) -> Option<Heartbeat> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("heartbeat.json");
        let hb = Heartbeat::now("tick", 20, 1_700_000_000_000);
        write_heartbeat(&path, &hb).expect("write");
        let loaded = read_heartbeat(&path).expect("read");
        assert_eq!(loaded, hb);
        assert!(loaded.ts.ends_with('Z'));
    }

    #[test]
    fn staleness_uses_tick_factor() {
        let hb = Heartbeat {
            ts_epoch_s: 1000,
            tick_seconds: 20,
            ..Heartbeat::default()
        };
        assert!(!hb.is_stale(1000 + 59, 3));
        assert!(hb.is_stale(1000 + 60, 3));
    }

    #[test]
    fn missing_or_zero_timestamp_is_stale() {
        let hb = Heartbeat::default();
        assert!(hb.is_stale(1, 3));
        assert!(read_heartbeat(Path::new("/nonexistent/heartbeat.json")).is_none());
    }
}
