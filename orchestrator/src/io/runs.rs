//! Run registry.
//!
//! Runs live under `runs/<kind>/task-<id>/<runId>/` and complete by writing
//! `done.json` (workers, docs) or `review.json` (reviewers). Only the paths
//! recorded in the current state entry are authoritative; completion files
//! in other run directories are ignored, with one exception: reviewer
//! results may be *recovered* from the task's review root when the stored
//! entry was lost, gated on the result matching the current patch revision.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::core::types::{
    Column, DoneReport, RegistryView, ReviewResult, RunStatus, Snapshot, Verdict,
};
use crate::io::config::Config;
use crate::state::{RunEntry, RunKind, StateDoc};

const COMMENT_READ_LIMIT: usize = 20_000;

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mint a globally unique run id: UTC stamp, pid, process-local sequence.
pub fn mint_run_id(now_ms: i64) -> String {
    let stamp = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .map(|t| t.format("%Y%m%dT%H%M%SZ").to_string())
        .unwrap_or_else(|| "00000000T000000Z".to_string());
    let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{stamp}-p{}-{seq:04x}", std::process::id())
}

/// `runs/<kind>/task-<id>/<runId>/`
pub fn run_dir(runs_root: &Path, kind: RunKind, task_id: i64, run_id: &str) -> PathBuf {
    runs_root
        .join(kind.as_str())
        .join(format!("task-{task_id}"))
        .join(run_id)
}

fn review_task_root(runs_root: &Path, task_id: i64) -> PathBuf {
    runs_root
        .join(RunKind::Reviewer.as_str())
        .join(format!("task-{task_id}"))
}

// ---------------------------------------------------------------------
// Completion file parsing
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DoneFile {
    schema_version: u32,
    #[allow(dead_code)]
    task_id: i64,
    #[allow(dead_code)]
    run_id: String,
    ok: bool,
    patch_path: String,
    comment_path: String,
    patch_exists: bool,
    comment_exists: bool,
    patch_bytes: u64,
    comment_bytes: u64,
}

/// Strictly parse a `done.json`. Structural problems are errors; whether the
/// run is *usable* is the policy's call (`DoneReport::worker_usable`).
pub fn parse_done_file(path: &Path) -> Result<DoneReport> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let done: DoneFile =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if done.schema_version != 1 {
        return Err(anyhow!(
            "unsupported done.json schemaVersion {} in {}",
            done.schema_version,
            path.display()
        ));
    }
    Ok(DoneReport {
        ok: done.ok,
        patch_exists: done.patch_exists,
        comment_exists: done.comment_exists,
        patch_bytes: done.patch_bytes,
        comment_bytes: done.comment_bytes,
        patch_path: PathBuf::from(done.patch_path),
        comment_path: PathBuf::from(done.comment_path),
    })
}

#[derive(Debug, Deserialize)]
struct ReviewFile {
    score: i64,
    verdict: String,
    #[serde(default)]
    critical_items: Vec<String>,
    #[serde(default)]
    notes: String,
    #[serde(default, rename = "reviewRevision")]
    review_revision: Option<String>,
}

/// Strictly parse a `review.json`: integer score in 1..=100 and one of the
/// three verdicts, or the file is rejected.
pub fn parse_review_file(path: &Path) -> Result<ReviewResult> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let review: ReviewFile =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    if !(1..=100).contains(&review.score) {
        return Err(anyhow!("score {} out of range in {}", review.score, path.display()));
    }
    let verdict = match review.verdict.trim().to_ascii_uppercase().as_str() {
        "PASS" => Verdict::Pass,
        "REWORK" => Verdict::Rework,
        "BLOCKER" => Verdict::Blocker,
        other => return Err(anyhow!("unknown verdict {:?} in {}", other, path.display())),
    };
    Ok(ReviewResult {
        score: review.score as u32,
        verdict,
        critical_items: review.critical_items,
        notes: review.notes,
        review_revision: review.review_revision,
    })
}

/// Content hash of the patch bytes; the review revision.
pub fn patch_revision(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    Some(hex::encode(Sha256::digest(&bytes)))
}

fn read_text_limited(path: &Path, limit: usize) -> String {
    match fs::read(path) {
        Ok(bytes) => {
            let slice = &bytes[..bytes.len().min(limit)];
            String::from_utf8_lossy(slice).into_owned()
        }
        Err(_) => String::new(),
    }
}

fn mtime_ms(path: &Path) -> Option<i64> {
    let meta = fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let since = mtime.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since.as_millis() as i64)
}

// ---------------------------------------------------------------------
// Reviewer recovery
// ---------------------------------------------------------------------

/// Newest recovery-eligible reviewer result for a task.
///
/// Eligible iff the file lives under the task's review root, its revision
/// matches `current_revision`, and the stored entry is missing or older
/// than the file.
pub fn recover_review_result(
    runs_root: &Path,
    task_id: i64,
    current_revision: Option<&str>,
    entry_started_at_ms: Option<i64>,
) -> Option<ReviewResult> {
    let root = review_task_root(runs_root, task_id);
    let dirs = fs::read_dir(&root).ok()?;
    let mut best: Option<(i64, ReviewResult)> = None;
    for dir in dirs.flatten() {
        let candidate = dir.path().join("review.json");
        if !candidate.is_file() {
            continue;
        }
        let Ok(result) = parse_review_file(&candidate) else {
            continue;
        };
        if !crate::core::review::revision_matches(current_revision, result.review_revision.as_deref())
        {
            continue;
        }
        let modified = mtime_ms(&candidate).unwrap_or(0);
        if let Some(started) = entry_started_at_ms {
            if modified <= started {
                continue;
            }
        }
        if best.as_ref().map(|(m, _)| modified > *m).unwrap_or(true) {
            best = Some((modified, result));
        }
    }
    best.map(|(_, result)| result)
}

// ---------------------------------------------------------------------
// Registry materialization
// ---------------------------------------------------------------------

/// Read every run artifact the policy may act on this tick. All file I/O
/// for decisions happens here so the policy itself stays pure.
pub fn materialize(snapshot: &Snapshot, state: &StateDoc, config: &Config, now_ms: i64) -> RegistryView {
    let mut view = RegistryView::default();

    // Current patch revision per task, from the recorded patch artifacts.
    for (key, record) in &state.patches_by_task_id {
        let Ok(id) = key.parse::<i64>() else { continue };
        if let Some(revision) = patch_revision(&record.patch_path) {
            view.patch_revisions.insert(id, revision);
        }
    }

    // Worker runs: consulted for WIP tasks and for Blocked recovery.
    for (key, entry) in &state.workers_by_task_id {
        let Ok(id) = key.parse::<i64>() else { continue };
        let relevant = snapshot
            .get(id)
            .map(|t| matches!(t.column, Column::Wip | Column::Blocked))
            .unwrap_or(false);
        if !relevant {
            continue;
        }
        match worker_status(entry, now_ms, config.worker_run_timeout_min) {
            WorkerProbe::Status(status) => {
                if let RunStatus::Complete { report, .. } = &status {
                    if let Some(revision) = patch_revision(&report.patch_path) {
                        view.patch_revisions.insert(id, revision);
                    }
                }
                view.worker_status.insert(id, status);
            }
            WorkerProbe::TimedOut => {
                view.worker_timed_out.insert(id);
            }
            WorkerProbe::Running => {
                view.worker_status.insert(id, RunStatus::Running);
                if config.worker_log_stale_ms > 0 {
                    let stale = mtime_ms(&entry.log_path)
                        .map(|m| now_ms - m > config.worker_log_stale_ms as i64)
                        .unwrap_or(false);
                    if stale {
                        view.worker_log_stale.insert(id);
                    }
                }
            }
        }
    }

    // Reviewer runs and recovery, for tasks currently in Review.
    for task in snapshot.in_column(Column::Review) {
        let id = task.id;
        let key = id.to_string();
        let current_rev = view.patch_revisions.get(&id).cloned();
        let entry = state.reviewers_by_task_id.get(&key);

        let mut found = false;
        if let Some(entry) = entry {
            if let Some(result_path) = &entry.result_path {
                if result_path.is_file() {
                    match parse_review_file(result_path) {
                        Ok(mut result) => {
                            if result.review_revision.is_none() {
                                result.review_revision = entry.review_revision.clone();
                            }
                            if crate::core::review::revision_matches(
                                current_rev.as_deref(),
                                result.review_revision.as_deref(),
                            ) {
                                view.reviewer_results.insert(id, result);
                                found = true;
                            }
                        }
                        Err(err) => {
                            debug!(task = id, %err, "unparseable review.json; ignoring");
                        }
                    }
                }
            }
            if !found {
                let timeout_ms = i64::from(config.review_run_timeout_min) * 60 * 1000;
                if timeout_ms > 0 && now_ms - entry.started_at_ms > timeout_ms {
                    view.reviewer_timed_out.insert(id);
                }
            }
        }
        if !found {
            if let Some(result) = recover_review_result(
                &config.runs_root,
                id,
                current_rev.as_deref(),
                entry.map(|e| e.started_at_ms),
            ) {
                view.reviewer_results.insert(id, result);
            }
        }
    }

    // Docs runs, for tasks currently in Documentation.
    for (key, entry) in &state.docs_by_task_id {
        let Ok(id) = key.parse::<i64>() else { continue };
        let relevant = snapshot
            .get(id)
            .map(|t| t.column == Column::Documentation)
            .unwrap_or(false);
        if !relevant {
            continue;
        }
        match worker_status(entry, now_ms, config.docs_run_timeout_min) {
            WorkerProbe::Status(status) => {
                view.docs_status.insert(id, status);
            }
            WorkerProbe::TimedOut => {
                view.docs_status.insert(id, RunStatus::Running);
                view.docs_timed_out.insert(id);
            }
            WorkerProbe::Running => {
                view.docs_status.insert(id, RunStatus::Running);
            }
        }
    }

    view
}

enum WorkerProbe {
    Status(RunStatus),
    TimedOut,
    Running,
}

fn worker_status(entry: &RunEntry, now_ms: i64, run_timeout_min: u32) -> WorkerProbe {
    let Some(done_path) = &entry.done_path else {
        // An entry without a recorded completion path cannot ever finish;
        // treat the run as lost.
        return WorkerProbe::TimedOut;
    };
    if done_path.is_file() {
        return match parse_done_file(done_path) {
            Ok(report) => {
                let comment = if report.comment_exists {
                    read_text_limited(&report.comment_path, COMMENT_READ_LIMIT)
                } else {
                    String::new()
                };
                WorkerProbe::Status(RunStatus::Complete { report, comment })
            }
            Err(err) => WorkerProbe::Status(RunStatus::Invalid { reason: format!("{err:#}") }),
        };
    }
    let timeout_ms = i64::from(run_timeout_min) * 60 * 1000;
    if timeout_ms > 0 && entry.started_at_ms > 0 && now_ms - entry.started_at_ms > timeout_ms {
        return WorkerProbe::TimedOut;
    }
    WorkerProbe::Running
}
