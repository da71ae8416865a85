//! Test-only scripted collaborators.
//!
//! `ScriptedBoard` is an in-memory board that honors the full [`Board`]
//! contract; `ScriptedSpawner` returns well-formed handshakes (or scripted
//! failures) without starting processes. Used by unit tests here and by the
//! lifecycle scenarios in `tests/`.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};

use crate::core::types::{BoardTask, Column, Snapshot};
use crate::io::board::{Board, merged_tags, pruned_tags};
use crate::io::config::Config;
use crate::io::spawn::{Handshake, SpawnRequest, Spawner};

/// Build a board task with deterministic defaults.
pub fn board_task(id: i64, column: Column, title: &str, tags: &[&str]) -> BoardTask {
    BoardTask {
        id,
        column,
        position: id,
        swimlane: "Default swimlane".to_string(),
        title: title.to_string(),
        description: String::new(),
        tags: tags.iter().map(|s| s.to_string()).collect(),
    }
}

/// Config rooted in a temp directory, tuned for scenario tests: no dry-run
/// arming, no cooldown, repo map provided explicitly by the test.
pub fn test_config(root: &Path) -> Config {
    Config {
        state_root: root.join("state"),
        runs_root: root.join("runs"),
        board_project: "Test".to_string(),
        first_run_dry_runs: 0,
        cooldown_min: 0,
        ..Config::default()
    }
}

#[derive(Default)]
struct BoardInner {
    has_docs_column: bool,
    tasks: BTreeMap<i64, BoardTask>,
    comments: Vec<(i64, String)>,
    next_id: i64,
    fail_moves: bool,
}

/// In-memory board.
pub struct ScriptedBoard {
    inner: RefCell<BoardInner>,
}

impl Default for ScriptedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBoard {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(BoardInner { next_id: 1000, ..BoardInner::default() }),
        }
    }

    pub fn with_docs_column(self) -> Self {
        self.inner.borrow_mut().has_docs_column = true;
        self
    }

    pub fn add_task(&self, task: BoardTask) {
        self.inner.borrow_mut().tasks.insert(task.id, task);
    }

    pub fn column_of(&self, id: i64) -> Column {
        self.inner.borrow().tasks.get(&id).map(|t| t.column).expect("task exists")
    }

    pub fn tags_of(&self, id: i64) -> BTreeSet<String> {
        self.inner
            .borrow()
            .tasks
            .get(&id)
            .map(|t| t.tags.clone())
            .expect("task exists")
    }

    pub fn has_tag(&self, id: i64, tag: &str) -> bool {
        self.tags_of(id).iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn comments_for(&self, id: i64) -> Vec<String> {
        self.inner
            .borrow()
            .comments
            .iter()
            .filter(|(task, _)| *task == id)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn task_titled(&self, title: &str) -> Option<i64> {
        self.inner
            .borrow()
            .tasks
            .values()
            .find(|t| t.title == title)
            .map(|t| t.id)
    }

    pub fn task_count(&self) -> usize {
        self.inner.borrow().tasks.len()
    }

    pub fn set_fail_moves(&self, fail: bool) {
        self.inner.borrow_mut().fail_moves = fail;
    }
}

impl Board for ScriptedBoard {
    fn snapshot(&self) -> Result<Snapshot> {
        let inner = self.inner.borrow();
        Ok(Snapshot {
            has_docs_column: inner.has_docs_column,
            tasks: inner.tasks.values().cloned().collect(),
        })
    }

    fn move_task(&self, id: i64, to: Column) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_moves {
            return Err(anyhow!("scripted move failure"));
        }
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no task #{id}"))?;
        task.column = to;
        task.position = 1;
        Ok(())
    }

    fn add_tags(&self, id: i64, tags: &[String]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no task #{id}"))?;
        let existing: Vec<String> = task.tags.iter().cloned().collect();
        if let Some(merged) = merged_tags(&existing, tags) {
            task.tags = merged.into_iter().collect();
        }
        Ok(())
    }

    fn remove_tags(&self, id: i64, tags: &[String]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no task #{id}"))?;
        let existing: Vec<String> = task.tags.iter().cloned().collect();
        if let Some(pruned) = pruned_tags(&existing, tags) {
            task.tags = pruned.into_iter().collect();
        }
        Ok(())
    }

    fn post_comment(&self, id: i64, text: &str) -> Result<()> {
        self.inner.borrow_mut().comments.push((id, text.to_string()));
        Ok(())
    }

    fn create_task(
        &self,
        column: Column,
        title: &str,
        description: &str,
        tags: &[String],
    ) -> Result<i64> {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        let id = inner.next_id;
        let mut task = board_task(id, column, title, &[]);
        task.description = description.to_string();
        task.tags = tags.iter().cloned().collect();
        inner.tasks.insert(id, task);
        Ok(id)
    }

    fn get_task(&self, id: i64) -> Result<Option<BoardTask>> {
        Ok(self.inner.borrow().tasks.get(&id).cloned())
    }
}

/// Spawner that fabricates handshakes without starting processes.
pub struct ScriptedSpawner {
    fail: Cell<bool>,
    spawned: RefCell<Vec<SpawnRequest>>,
}

impl Default for ScriptedSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self { fail: Cell::new(false), spawned: RefCell::new(Vec::new()) }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.set(fail);
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.spawned.borrow().clone()
    }
}

impl Spawner for ScriptedSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Handshake> {
        if self.fail.get() {
            return Err(anyhow!("scripted spawn failure"));
        }
        self.spawned.borrow_mut().push(request.clone());
        Ok(Handshake {
            exec_session_id: Some(format!(
                "exec-{}-{}",
                request.kind.as_str(),
                request.task_id
            )),
            run_id: request.run_id.clone(),
            run_dir: request.run_dir.clone(),
            log_path: None,
            patch_path: None,
            comment_path: None,
            done_path: None,
            result_path: None,
            started_at_ms: 0,
        })
    }
}

/// Write a complete, valid worker/docs run into `run_dir`.
pub fn write_done_artifacts(run_dir: &Path, task_id: i64, run_id: &str, patch_bytes: usize) {
    fs::create_dir_all(run_dir).expect("create run dir");
    let patch_path = run_dir.join("patch.patch");
    let comment_path = run_dir.join("kanboard-comment.md");
    fs::write(&patch_path, vec![b'd'; patch_bytes]).expect("write patch");
    fs::write(&comment_path, format!("Summary for task {task_id}")).expect("write comment");
    let payload = serde_json::json!({
        "schemaVersion": 1,
        "taskId": task_id,
        "runId": run_id,
        "startedAtMs": 1,
        "finishedAtMs": 2,
        "exitCode": 0,
        "ok": true,
        "patchPath": patch_path,
        "commentPath": comment_path,
        "patchExists": true,
        "commentExists": true,
        "patchBytes": patch_bytes,
        "commentBytes": 17,
    });
    fs::write(run_dir.join("done.json"), payload.to_string()).expect("write done.json");
}

/// Write an invalid completion (ok=false) into `run_dir`.
pub fn write_failed_done(run_dir: &Path, task_id: i64, run_id: &str) {
    fs::create_dir_all(run_dir).expect("create run dir");
    let payload = serde_json::json!({
        "schemaVersion": 1,
        "taskId": task_id,
        "runId": run_id,
        "startedAtMs": 1,
        "finishedAtMs": 2,
        "exitCode": 1,
        "ok": false,
        "patchPath": run_dir.join("patch.patch"),
        "commentPath": run_dir.join("kanboard-comment.md"),
        "patchExists": false,
        "commentExists": false,
        "patchBytes": 0,
        "commentBytes": 0,
    });
    fs::write(run_dir.join("done.json"), payload.to_string()).expect("write done.json");
}

/// Write a reviewer result into `run_dir`.
pub fn write_review_artifacts(
    run_dir: &Path,
    score: u32,
    verdict: &str,
    critical_items: &[&str],
    revision: Option<&str>,
) {
    fs::create_dir_all(run_dir).expect("create run dir");
    let mut payload = serde_json::json!({
        "score": score,
        "verdict": verdict,
        "critical_items": critical_items,
        "notes": "scripted review",
    });
    if let Some(rev) = revision {
        payload["reviewRevision"] = serde_json::Value::String(rev.to_string());
    }
    fs::write(run_dir.join("review.json"), payload.to_string()).expect("write review.json");
}
