//! Orchestrator configuration (`boardloop.toml`).
//!
//! Intended to be edited by humans; missing fields default to values that
//! match the reference deployment. A handful of deployment-specific settings
//! (board credentials, spawn commands) fall back to `BOARDLOOP_*`
//! environment variables when the file leaves them empty — the file always
//! wins when it sets a value.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::policy::{MissingWorkerPolicy, PolicyConfig};

/// Tick lock strategy (§ Clock & Lock): OS advisory lock by default; the
/// stale-file strategy is an explicit opt-in for filesystems without flock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockStrategy {
    OsLock,
    StaleFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    /// Tick period in seconds (5..=60).
    pub tick_seconds: u64,
    /// Max board mutations per tick.
    pub action_budget: u32,
    /// Per-task cross-tick cooldown in minutes (Ready -> WIP is exempt).
    pub cooldown_min: u32,
    /// Active (non-paused) WIP cap; criticals can exceed it.
    pub wip_limit: u32,
    pub docs_wip_limit: u32,
    /// Minimum PASS score.
    pub review_threshold: u32,
    /// Whether PASS auto-advances Review -> Documentation/Done.
    pub review_auto_done: bool,
    pub missing_worker_policy: MissingWorkerPolicy,
    pub thrash_window_min: u32,
    pub max_respawns: u32,
    pub max_reworks_per_revision: u32,
    /// Legacy `<key>:` title-prefix repo mapping.
    pub allow_title_repo_hint: bool,
    /// Dry-run ticks on a brand-new state document.
    pub first_run_dry_runs: u32,

    pub lock_strategy: LockStrategy,
    pub lock_wait_ms: u64,

    pub runs_root: PathBuf,
    pub state_root: PathBuf,
    /// Heartbeat file; defaults to `<state_root>/orchestrator-heartbeat.json`.
    pub heartbeat_path: PathBuf,
    /// Lock file; defaults to `<state_root>/board-orchestrator.lock`.
    pub lock_path: PathBuf,

    /// Root directory scanned for repo checkouts (`<root>/<name>` becomes
    /// repo key `name`).
    pub repo_root: PathBuf,
    /// Optional JSON file mapping repo keys to absolute paths.
    pub repo_map_path: PathBuf,

    pub board_base_url: String,
    pub board_project: String,
    pub board_user: String,
    pub board_token: String,
    /// Per-call board timeout in milliseconds.
    pub board_call_timeout_ms: u64,
    /// Soft wall-clock deadline for one tick; remaining proposals are
    /// surrendered once it passes.
    pub tick_budget_ms: u64,

    pub worker_spawn_cmd: String,
    pub reviewer_spawn_cmd: String,
    pub docs_spawn_cmd: String,
    /// Spawn handshake must arrive within this many milliseconds.
    pub spawn_handshake_ms: u64,

    pub worker_run_timeout_min: u32,
    pub review_run_timeout_min: u32,
    pub docs_run_timeout_min: u32,
    /// Worker log mtime staleness threshold; 0 disables the watchdog.
    pub worker_log_stale_ms: u64,

    pub notify_cmd: String,
    pub notify_deny_targets: Vec<String>,
    pub notify_dedup_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_seconds: 20,
            action_budget: 3,
            cooldown_min: 30,
            wip_limit: 2,
            docs_wip_limit: 1,
            review_threshold: 90,
            review_auto_done: true,
            missing_worker_policy: MissingWorkerPolicy::Pause,
            thrash_window_min: 30,
            max_respawns: 3,
            max_reworks_per_revision: 3,
            allow_title_repo_hint: true,
            first_run_dry_runs: 1,
            lock_strategy: LockStrategy::OsLock,
            lock_wait_ms: 0,
            runs_root: PathBuf::from("runs"),
            state_root: PathBuf::from("state"),
            heartbeat_path: PathBuf::new(),
            lock_path: PathBuf::new(),
            repo_root: PathBuf::new(),
            repo_map_path: PathBuf::new(),
            board_base_url: "http://localhost:8401/jsonrpc.php".to_string(),
            board_project: String::new(),
            board_user: String::new(),
            board_token: String::new(),
            board_call_timeout_ms: 10_000,
            tick_budget_ms: 60_000,
            worker_spawn_cmd: String::new(),
            reviewer_spawn_cmd: String::new(),
            docs_spawn_cmd: String::new(),
            spawn_handshake_ms: 3_000,
            worker_run_timeout_min: 180,
            review_run_timeout_min: 60,
            docs_run_timeout_min: 60,
            worker_log_stale_ms: 0,
            notify_cmd: String::new(),
            notify_deny_targets: Vec::new(),
            notify_dedup_seconds: 60,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !(5..=60).contains(&self.tick_seconds) {
            return Err(anyhow!("tick_seconds must be within 5..=60"));
        }
        if self.action_budget == 0 {
            return Err(anyhow!("action_budget must be > 0"));
        }
        if self.wip_limit == 0 {
            return Err(anyhow!("wip_limit must be > 0"));
        }
        if !(1..=100).contains(&self.review_threshold) {
            return Err(anyhow!("review_threshold must be within 1..=100"));
        }
        if self.board_base_url.trim().is_empty() {
            return Err(anyhow!("board_base_url must be set"));
        }
        if self.board_project.trim().is_empty() {
            return Err(anyhow!("board_project must be set"));
        }
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_root.join("board-orchestrator-state.json")
    }

    pub fn heartbeat_path(&self) -> PathBuf {
        if self.heartbeat_path.as_os_str().is_empty() {
            self.state_root.join("orchestrator-heartbeat.json")
        } else {
            self.heartbeat_path.clone()
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        if self.lock_path.as_os_str().is_empty() {
            self.state_root.join("board-orchestrator.lock")
        } else {
            self.lock_path.clone()
        }
    }

    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            wip_limit: self.wip_limit,
            docs_wip_limit: self.docs_wip_limit,
            review_threshold: self.review_threshold,
            review_auto_done: self.review_auto_done,
            missing_worker_policy: self.missing_worker_policy,
            cooldown_min: self.cooldown_min,
            thrash_window_min: self.thrash_window_min,
            max_respawns: self.max_respawns,
            max_reworks_per_revision: self.max_reworks_per_revision,
            allow_title_repo_hint: self.allow_title_repo_hint,
        }
    }

    /// Fill empty deployment-specific fields from the environment.
    fn apply_env_fallbacks(&mut self) {
        let fallback = |value: &mut String, key: &str| {
            if value.trim().is_empty() {
                if let Ok(env_value) = env::var(key) {
                    *value = env_value;
                }
            }
        };
        fallback(&mut self.board_base_url, "BOARDLOOP_BOARD_BASE_URL");
        fallback(&mut self.board_project, "BOARDLOOP_BOARD_PROJECT");
        fallback(&mut self.board_user, "BOARDLOOP_BOARD_USER");
        fallback(&mut self.board_token, "BOARDLOOP_BOARD_TOKEN");
        fallback(&mut self.worker_spawn_cmd, "BOARDLOOP_WORKER_SPAWN_CMD");
        fallback(&mut self.reviewer_spawn_cmd, "BOARDLOOP_REVIEWER_SPAWN_CMD");
        fallback(&mut self.docs_spawn_cmd, "BOARDLOOP_DOCS_SPAWN_CMD");
        fallback(&mut self.notify_cmd, "BOARDLOOP_NOTIFY_CMD");
    }
}

/// Load config from a TOML file, apply environment fallbacks, validate.
///
/// A missing file yields the defaults (plus fallbacks), so a fully
/// env-configured deployment needs no file at all.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut cfg: Config = if path.as_os_str().is_empty() || !path.exists() {
        Config::default()
    } else {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    };
    cfg.apply_env_fallbacks();
    cfg.validate()?;
    Ok(cfg)
}
