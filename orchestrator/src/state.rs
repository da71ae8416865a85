//! Persisted orchestrator state document.
//!
//! A single JSON blob keyed by task id. The reconciler is the only writer;
//! it overwrites the document atomically at the end of each tick. Unknown
//! fields survive a load/save round-trip so newer fields added by other
//! versions are never dropped (migrations are field-additive).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Kind of child run an entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Worker,
    Reviewer,
    Docs,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Worker => "worker",
            RunKind::Reviewer => "review",
            RunKind::Docs => "docs",
        }
    }
}

/// State record pointing at the *current* run for a task and kind.
///
/// Only the paths recorded here are authoritative; completion files found
/// anywhere else are ignored (stale-path rule).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunEntry {
    pub kind: RunKind,
    pub run_id: String,
    pub run_dir: PathBuf,
    pub exec_session_id: Option<String>,
    pub log_path: PathBuf,
    pub patch_path: Option<PathBuf>,
    pub comment_path: Option<PathBuf>,
    pub done_path: Option<PathBuf>,
    pub result_path: Option<PathBuf>,
    pub started_at_ms: i64,
    pub repo_key: String,
    pub repo_path: String,
    pub review_revision: Option<String>,
}

impl Default for RunEntry {
    fn default() -> Self {
        Self {
            kind: RunKind::Worker,
            run_id: String::new(),
            run_dir: PathBuf::new(),
            exec_session_id: None,
            log_path: PathBuf::new(),
            patch_path: None,
            comment_path: None,
            done_path: None,
            result_path: None,
            started_at_ms: 0,
            repo_key: String::new(),
            repo_path: String::new(),
            review_revision: None,
        }
    }
}

/// Stored review outcome, kept so the checklist comment is posted once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StoredReview {
    pub score: u32,
    pub verdict: String,
    pub critical_items: Vec<String>,
    pub notes: String,
    pub review_revision: Option<String>,
    pub stored_at_ms: i64,
}

/// Patch produced by the last completed worker run for a task.
///
/// Recorded when a task moves WIP -> Review so reviewers and docs workers can
/// be pointed at the patch after the worker entry is cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PatchRecord {
    pub patch_path: PathBuf,
    pub revision: String,
    pub recorded_at_ms: i64,
}

/// Bookkeeping for a task paused because a critical preempted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PausedByCritical {
    pub critical_task_id: i64,
    pub paused_at_ms: i64,
    /// True when the generic `paused` tag was added by us (and only for the
    /// critical); it is removed again on resume iff no other pause reason
    /// remains.
    pub added_paused: bool,
}

/// One review rework attempt (for the same-revision thrash guard).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ReworkAttempt {
    pub at_ms: i64,
    pub review_revision: String,
    pub score: u32,
    pub verdict: String,
}

/// Repo mapping resolved for a task (diagnostics only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RepoRecord {
    pub key: String,
    pub path: String,
    pub resolved_at_ms: i64,
}

/// Notification dedup window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifyDedup {
    pub last_digest: String,
    pub last_at_s: i64,
}

/// The whole persisted state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateDoc {
    pub schema_version: u32,
    pub dry_run: bool,
    pub dry_run_runs_remaining: u32,
    /// Last board mutation per task (epoch ms), for the cross-tick cooldown.
    pub last_actions_by_task_id: BTreeMap<String, i64>,
    pub swimlane_priority: Vec<String>,
    pub repo_map: BTreeMap<String, String>,
    pub repo_by_task_id: BTreeMap<String, RepoRecord>,
    pub workers_by_task_id: BTreeMap<String, RunEntry>,
    pub reviewers_by_task_id: BTreeMap<String, RunEntry>,
    pub docs_by_task_id: BTreeMap<String, RunEntry>,
    pub patches_by_task_id: BTreeMap<String, PatchRecord>,
    pub review_results_by_task_id: BTreeMap<String, StoredReview>,
    pub review_rework_history_by_task_id: BTreeMap<String, Vec<ReworkAttempt>>,
    pub respawn_history_by_task_id: BTreeMap<String, Vec<i64>>,
    pub paused_by_critical: BTreeMap<String, PausedByCritical>,
    pub auto_blocked_by_orchestrator: BTreeMap<String, String>,
    pub repo_comment_by_task_id: BTreeMap<String, i64>,
    pub reviewer_spawn_failures_by_task_id: BTreeMap<String, u32>,
    pub docs_spawn_failures_by_task_id: BTreeMap<String, u32>,
    pub docs_timeout_restarts_by_task_id: BTreeMap<String, u32>,
    pub notify: Option<NotifyDedup>,
    /// Fields written by other (newer) versions; preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for StateDoc {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            dry_run: false,
            dry_run_runs_remaining: 0,
            last_actions_by_task_id: BTreeMap::new(),
            swimlane_priority: vec!["Default swimlane".to_string()],
            repo_map: BTreeMap::new(),
            repo_by_task_id: BTreeMap::new(),
            workers_by_task_id: BTreeMap::new(),
            reviewers_by_task_id: BTreeMap::new(),
            docs_by_task_id: BTreeMap::new(),
            patches_by_task_id: BTreeMap::new(),
            review_results_by_task_id: BTreeMap::new(),
            review_rework_history_by_task_id: BTreeMap::new(),
            respawn_history_by_task_id: BTreeMap::new(),
            paused_by_critical: BTreeMap::new(),
            auto_blocked_by_orchestrator: BTreeMap::new(),
            repo_comment_by_task_id: BTreeMap::new(),
            reviewer_spawn_failures_by_task_id: BTreeMap::new(),
            docs_spawn_failures_by_task_id: BTreeMap::new(),
            docs_timeout_restarts_by_task_id: BTreeMap::new(),
            notify: None,
            extra: BTreeMap::new(),
        }
    }
}

impl StateDoc {
    /// Fresh document for a first run, armed with the configured number of
    /// dry-run ticks.
    pub fn first_run(dry_runs: u32) -> Self {
        Self {
            dry_run: dry_runs > 0,
            dry_run_runs_remaining: dry_runs,
            ..Self::default()
        }
    }

    pub fn entry(&self, kind: RunKind, task_id: i64) -> Option<&RunEntry> {
        self.entries(kind).get(&task_id.to_string())
    }

    pub fn entries(&self, kind: RunKind) -> &BTreeMap<String, RunEntry> {
        match kind {
            RunKind::Worker => &self.workers_by_task_id,
            RunKind::Reviewer => &self.reviewers_by_task_id,
            RunKind::Docs => &self.docs_by_task_id,
        }
    }

    pub fn entries_mut(&mut self, kind: RunKind) -> &mut BTreeMap<String, RunEntry> {
        match kind {
            RunKind::Worker => &mut self.workers_by_task_id,
            RunKind::Reviewer => &mut self.reviewers_by_task_id,
            RunKind::Docs => &mut self.docs_by_task_id,
        }
    }

    /// True if `run_id` already appears in any entry map. Each run id must be
    /// recorded at most once over the lifetime of the document.
    pub fn run_id_in_use(&self, run_id: &str) -> bool {
        [RunKind::Worker, RunKind::Reviewer, RunKind::Docs]
            .iter()
            .flat_map(|kind| self.entries(*kind).values())
            .any(|entry| entry.run_id == run_id)
    }

    pub fn last_action_ms(&self, task_id: i64) -> Option<i64> {
        self.last_actions_by_task_id
            .get(&task_id.to_string())
            .copied()
    }
}
