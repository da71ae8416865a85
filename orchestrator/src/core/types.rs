//! Shared deterministic types for the policy core.
//!
//! Everything here is plain data: the snapshot of the board, the registry
//! view materialized from run directories, and the proposals the policy
//! engine emits. None of these types perform I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::state::{RunKind, StoredReview};

/// Board columns in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Column {
    Backlog,
    Ready,
    Wip,
    Review,
    Documentation,
    Blocked,
    Done,
}

impl Column {
    /// Exact column title on the external board.
    pub fn title(self) -> &'static str {
        match self {
            Column::Backlog => "Backlog",
            Column::Ready => "Ready",
            Column::Wip => "Work in progress",
            Column::Review => "Review",
            Column::Documentation => "Documentation",
            Column::Blocked => "Blocked",
            Column::Done => "Done",
        }
    }

    pub fn from_title(title: &str) -> Option<Self> {
        match title.trim() {
            "Backlog" => Some(Column::Backlog),
            "Ready" => Some(Column::Ready),
            "Work in progress" => Some(Column::Wip),
            "Review" => Some(Column::Review),
            "Documentation" => Some(Column::Documentation),
            "Blocked" => Some(Column::Blocked),
            "Done" => Some(Column::Done),
            _ => None,
        }
    }
}

/// One task as seen on the board, tags already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardTask {
    pub id: i64,
    pub column: Column,
    /// Lower = higher priority within the column.
    pub position: i64,
    pub swimlane: String,
    pub title: String,
    pub description: String,
    pub tags: BTreeSet<String>,
}

impl BoardTask {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

/// Immutable view of the board taken at the start of a tick.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Whether the board exposes a Documentation column.
    pub has_docs_column: bool,
    pub tasks: Vec<BoardTask>,
}

impl Snapshot {
    pub fn in_column(&self, column: Column) -> impl Iterator<Item = &BoardTask> {
        self.tasks.iter().filter(move |t| t.column == column)
    }

    pub fn get(&self, id: i64) -> Option<&BoardTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn is_done(&self, id: i64) -> bool {
        self.get(id).map(|t| t.column == Column::Done).unwrap_or(false)
    }
}

/// Reviewer verdict after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Rework,
    Blocker,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Rework => "REWORK",
            Verdict::Blocker => "BLOCKER",
        }
    }
}

/// A parsed `review.json`, before applying the PASS gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewResult {
    pub score: u32,
    pub verdict: Verdict,
    pub critical_items: Vec<String>,
    pub notes: String,
    pub review_revision: Option<String>,
}

/// A parsed `done.json` from a worker or docs run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneReport {
    pub ok: bool,
    pub patch_exists: bool,
    pub comment_exists: bool,
    pub patch_bytes: u64,
    pub comment_bytes: u64,
    pub patch_path: PathBuf,
    pub comment_path: PathBuf,
}

impl DoneReport {
    /// A worker run is usable only with a non-empty patch and a comment.
    pub fn worker_usable(&self) -> bool {
        self.ok && self.patch_exists && self.comment_exists && self.patch_bytes > 0
    }

    /// A docs run may deliberately produce a zero-byte patch ("skip"), but
    /// always needs the comment.
    pub fn docs_usable(&self) -> bool {
        self.ok && self.patch_exists && self.comment_exists && self.comment_bytes > 0
    }
}

/// Completion status of the run a recorded entry points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Completion file present and structurally valid.
    Complete {
        report: DoneReport,
        /// Contents of the worker-prepared board comment (may be empty).
        comment: String,
    },
    /// Completion file present but unusable; reason is human-readable.
    Invalid { reason: String },
    /// No completion file yet.
    Running,
}

/// Everything the policy needs to know about run artifacts, materialized
/// before the (pure) policy call. Keys are task ids.
#[derive(Debug, Clone, Default)]
pub struct RegistryView {
    pub worker_status: BTreeMap<i64, RunStatus>,
    /// Worker runs whose `done.json` never appeared within the run timeout.
    pub worker_timed_out: BTreeSet<i64>,
    /// Workers whose log file has gone stale while the handle is alive.
    pub worker_log_stale: BTreeSet<i64>,
    /// Normalized reviewer results, already matched against the current
    /// patch revision (entry result or newest eligible recovery file).
    pub reviewer_results: BTreeMap<i64, ReviewResult>,
    /// Reviewer runs that exceeded the review run timeout with no result.
    pub reviewer_timed_out: BTreeSet<i64>,
    pub docs_status: BTreeMap<i64, RunStatus>,
    pub docs_timed_out: BTreeSet<i64>,
    /// Current patch revision per task (hash of the recorded patch bytes).
    pub patch_revisions: BTreeMap<i64, String>,
}

/// A single mutation of the world. Actions are applied in order within a
/// proposal; board failures skip the action, never the tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Move { id: i64, to: Column },
    AddTags { id: i64, tags: Vec<String> },
    RemoveTags { id: i64, tags: Vec<String> },
    PostComment { id: i64, text: String },
    CreateTask {
        column: Column,
        title: String,
        description: String,
        tags: Vec<String>,
    },
    SpawnWorker { id: i64, repo_key: String, repo_path: String },
    SpawnReviewer {
        id: i64,
        repo_key: String,
        repo_path: String,
        patch_path: String,
        review_revision: String,
    },
    SpawnDocs {
        id: i64,
        repo_key: String,
        repo_path: String,
        patch_path: String,
    },
    ClearEntry { kind: RunKind, id: i64 },
    RecordPatch { id: i64, patch_path: PathBuf, revision: String },
    ClearPatch { id: i64 },
    StoreReviewResult { id: i64, result: StoredReview },
    ClearReviewResult { id: i64 },
    RecordRework {
        id: i64,
        revision: String,
        score: u32,
        verdict: Verdict,
    },
    PauseForCritical {
        id: i64,
        critical_id: i64,
        added_paused: bool,
    },
    ResumeFromCritical { id: i64, remove_paused: bool },
    MarkAutoBlocked { id: i64, reason: String },
    ClearAutoBlocked { id: i64 },
    MarkRepoCommented { id: i64 },
    BumpSpawnFailures { kind: RunKind, id: i64 },
    ClearSpawnFailures { kind: RunKind, id: i64 },
    BumpDocsTimeoutRestarts { id: i64 },
    NotifyBlocker { id: i64, message: String },
}

/// One decision: an all-or-nothing group of actions with a single board
/// mutation cost. A move plus its tag churn plus its comment is one logical
/// move against the per-tick action budget.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Human-readable summary, used for the tick report and dry-run output.
    pub label: String,
    pub task_id: Option<i64>,
    /// Board mutations this proposal consumes from the action budget.
    pub cost: u32,
    /// Ready -> WIP (and critical handling) bypass the per-task cooldown.
    pub cooldown_exempt: bool,
    pub actions: Vec<Action>,
    /// Applied instead of the remaining actions when a spawn inside
    /// `actions` fails (reversal / missing-worker policy).
    pub on_spawn_failure: Vec<Action>,
}

impl Proposal {
    pub fn new(label: impl Into<String>, task_id: Option<i64>, cost: u32) -> Self {
        Self {
            label: label.into(),
            task_id,
            cost,
            cooldown_exempt: false,
            actions: Vec::new(),
            on_spawn_failure: Vec::new(),
        }
    }

    pub fn exempt(mut self) -> Self {
        self.cooldown_exempt = true;
        self
    }

    pub fn with(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn on_failure(mut self, actions: Vec<Action>) -> Self {
        self.on_spawn_failure = actions;
        self
    }
}

/// Summary of one tick, printed as a JSON line and fed to the notifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TickReport {
    pub mode: String,
    pub actions: Vec<String>,
    #[serde(rename = "promotedToReady")]
    pub promoted_to_ready: Vec<i64>,
    #[serde(rename = "movedToWip")]
    pub moved_to_wip: Vec<i64>,
    #[serde(rename = "createdTasks")]
    pub created_tasks: Vec<i64>,
    pub errors: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_titles_round_trip() {
        for col in [
            Column::Backlog,
            Column::Ready,
            Column::Wip,
            Column::Review,
            Column::Documentation,
            Column::Blocked,
            Column::Done,
        ] {
            assert_eq!(Column::from_title(col.title()), Some(col));
        }
        assert_eq!(Column::from_title("WIP"), None);
    }

    #[test]
    fn done_report_gates_differ_for_docs() {
        let report = DoneReport {
            ok: true,
            patch_exists: true,
            comment_exists: true,
            patch_bytes: 0,
            comment_bytes: 12,
            patch_path: PathBuf::from("patch.patch"),
            comment_path: PathBuf::from("kanboard-comment.md"),
        };
        assert!(!report.worker_usable());
        assert!(report.docs_usable());
    }
}
