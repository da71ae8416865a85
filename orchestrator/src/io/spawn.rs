//! Child process spawning.
//!
//! The [`Spawner`] trait decouples the reconciler from the concrete spawn
//! commands; tests use scripted spawners that return canned handshakes.
//! A spawn command receives the minted run id and run directory, starts the
//! long-running child in the background, and prints exactly one JSON
//! handshake object on its first stdout line.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;
use crate::state::{RunEntry, RunKind};

const SPAWN_OUTPUT_LIMIT: usize = 64 * 1024;

/// Parameters for one spawn invocation.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub kind: RunKind,
    pub task_id: i64,
    pub repo_key: String,
    pub repo_path: String,
    /// Patch under review; empty for worker runs.
    pub patch_path: String,
    pub review_revision: String,
    /// Minted by the run registry; the child must echo it back.
    pub run_id: String,
    pub run_dir: PathBuf,
}

/// The one-line JSON object a child prints on stdout at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default)]
    pub exec_session_id: Option<String>,
    pub run_id: String,
    pub run_dir: PathBuf,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub patch_path: Option<PathBuf>,
    #[serde(default)]
    pub comment_path: Option<PathBuf>,
    #[serde(default)]
    pub done_path: Option<PathBuf>,
    #[serde(default)]
    pub result_path: Option<PathBuf>,
    #[serde(default)]
    pub started_at_ms: i64,
}

pub trait Spawner {
    /// Start a child for the request and return its validated handshake.
    fn spawn(&self, request: &SpawnRequest) -> Result<Handshake>;
}

/// Spawner that renders configured shell command templates.
pub struct CommandSpawner {
    pub worker_cmd: String,
    pub reviewer_cmd: String,
    pub docs_cmd: String,
    pub handshake_timeout: Duration,
}

impl CommandSpawner {
    fn template(&self, kind: RunKind) -> &str {
        match kind {
            RunKind::Worker => &self.worker_cmd,
            RunKind::Reviewer => &self.reviewer_cmd,
            RunKind::Docs => &self.docs_cmd,
        }
    }
}

impl Spawner for CommandSpawner {
    #[instrument(skip_all, fields(kind = request.kind.as_str(), task_id = request.task_id))]
    fn spawn(&self, request: &SpawnRequest) -> Result<Handshake> {
        let template = self.template(request.kind);
        if template.trim().is_empty() {
            return Err(anyhow!("no spawn command configured for {}", request.kind.as_str()));
        }
        let rendered = render_template(template, request);
        debug!(cmd = %rendered, "spawning child");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&rendered);
        let output = run_command_with_timeout(cmd, self.handshake_timeout, SPAWN_OUTPUT_LIMIT)
            .context("run spawn command")?;
        if output.timed_out {
            return Err(anyhow!("spawn handshake timed out after {:?}", self.handshake_timeout));
        }
        if !output.status.success() {
            warn!(code = ?output.status.code(), "spawn command failed");
            return Err(anyhow!("spawn command exited with status {:?}", output.status.code()));
        }
        let stdout = output.stdout_text();
        let first_line = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| anyhow!("spawn command produced no handshake line"))?;
        let handshake: Handshake = serde_json::from_str(first_line)
            .with_context(|| format!("parse spawn handshake {first_line:?}"))?;
        validate_handshake(request, &handshake)?;
        Ok(handshake)
    }
}

fn validate_handshake(request: &SpawnRequest, handshake: &Handshake) -> Result<()> {
    if handshake.run_id != request.run_id {
        return Err(anyhow!(
            "handshake runId {:?} does not match issued run id {:?}",
            handshake.run_id,
            request.run_id
        ));
    }
    if handshake.run_dir != request.run_dir {
        return Err(anyhow!(
            "handshake runDir {} does not match issued run dir {}",
            handshake.run_dir.display(),
            request.run_dir.display()
        ));
    }
    Ok(())
}

/// Fill a state entry from a validated handshake, defaulting any artifact
/// path the child omitted to the standard layout inside the run directory.
pub fn entry_from_handshake(request: &SpawnRequest, handshake: &Handshake, now_ms: i64) -> RunEntry {
    let dir = &request.run_dir;
    let log_name = match request.kind {
        RunKind::Worker => "worker.log",
        RunKind::Reviewer => "review.log",
        RunKind::Docs => "docs.log",
    };
    let started_at_ms = if handshake.started_at_ms > 0 {
        handshake.started_at_ms
    } else {
        now_ms
    };
    let mut entry = RunEntry {
        kind: request.kind,
        run_id: request.run_id.clone(),
        run_dir: dir.clone(),
        exec_session_id: handshake.exec_session_id.clone(),
        log_path: handshake.log_path.clone().unwrap_or_else(|| dir.join(log_name)),
        started_at_ms,
        repo_key: request.repo_key.clone(),
        repo_path: request.repo_path.clone(),
        ..RunEntry::default()
    };
    match request.kind {
        RunKind::Worker | RunKind::Docs => {
            entry.patch_path =
                Some(handshake.patch_path.clone().unwrap_or_else(|| dir.join("patch.patch")));
            entry.comment_path = Some(
                handshake
                    .comment_path
                    .clone()
                    .unwrap_or_else(|| dir.join("kanboard-comment.md")),
            );
            entry.done_path =
                Some(handshake.done_path.clone().unwrap_or_else(|| dir.join("done.json")));
        }
        RunKind::Reviewer => {
            entry.result_path =
                Some(handshake.result_path.clone().unwrap_or_else(|| dir.join("review.json")));
            entry.review_revision = if request.review_revision.is_empty() {
                None
            } else {
                Some(request.review_revision.clone())
            };
        }
    }
    entry
}

fn render_template(template: &str, request: &SpawnRequest) -> String {
    template
        .replace("{task_id}", &request.task_id.to_string())
        .replace("{repo_key}", &sh_quote(&request.repo_key))
        .replace("{repo_path}", &sh_quote(&request.repo_path))
        .replace("{patch_path}", &sh_quote(&request.patch_path))
        .replace("{review_revision}", &sh_quote(&request.review_revision))
        .replace("{run_id}", &sh_quote(&request.run_id))
        .replace("{run_dir}", &sh_quote(&request.run_dir.display().to_string()))
}

fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: RunKind) -> SpawnRequest {
        SpawnRequest {
            kind,
            task_id: 20,
            repo_key: "server".to_string(),
            repo_path: "/repos/server".to_string(),
            patch_path: String::new(),
            review_revision: String::new(),
            run_id: "run-1".to_string(),
            run_dir: PathBuf::from("/runs/worker/task-20/run-1"),
        }
    }

    fn spawner(cmd: &str) -> CommandSpawner {
        CommandSpawner {
            worker_cmd: cmd.to_string(),
            reviewer_cmd: cmd.to_string(),
            docs_cmd: cmd.to_string(),
            handshake_timeout: Duration::from_secs(5),
        }
    }

    fn handshake_json(run_id: &str, run_dir: &str) -> String {
        format!(
            "{{\"execSessionId\":\"s-1\",\"runId\":\"{run_id}\",\"runDir\":\"{run_dir}\",\
             \"startedAtMs\":123}}"
        )
    }

    #[test]
    fn spawn_parses_first_line_handshake() {
        let json = handshake_json("run-1", "/runs/worker/task-20/run-1");
        let cmd = format!("echo '{json}'; echo ignored trailing output");
        let handshake = spawner(&cmd).spawn(&request(RunKind::Worker)).expect("spawn");
        assert_eq!(handshake.run_id, "run-1");
        assert_eq!(handshake.exec_session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn spawn_rejects_wrong_run_id() {
        let json = handshake_json("other-run", "/runs/worker/task-20/run-1");
        let cmd = format!("echo '{json}'");
        let err = spawner(&cmd).spawn(&request(RunKind::Worker)).unwrap_err();
        assert!(err.to_string().contains("runId"));
    }

    #[test]
    fn spawn_rejects_non_json_and_nonzero_exit() {
        let err = spawner("echo not-json").spawn(&request(RunKind::Worker)).unwrap_err();
        assert!(format!("{err:#}").contains("handshake"));

        let err = spawner("exit 3").spawn(&request(RunKind::Worker)).unwrap_err();
        assert!(err.to_string().contains("status"));
    }

    #[test]
    fn template_substitutes_and_quotes_arguments() {
        let mut req = request(RunKind::Reviewer);
        req.repo_path = "/repos/with space".to_string();
        let rendered = render_template("spawn.sh {task_id} {repo_key} {repo_path}", &req);
        assert_eq!(rendered, "spawn.sh 20 'server' '/repos/with space'");
    }

    #[test]
    fn entry_defaults_artifact_paths_per_kind() {
        let req = request(RunKind::Worker);
        let handshake = Handshake {
            exec_session_id: Some("s".to_string()),
            run_id: "run-1".to_string(),
            run_dir: req.run_dir.clone(),
            log_path: None,
            patch_path: None,
            comment_path: None,
            done_path: None,
            result_path: None,
            started_at_ms: 0,
        };
        let entry = entry_from_handshake(&req, &handshake, 999);
        assert_eq!(entry.done_path, Some(req.run_dir.join("done.json")));
        assert_eq!(entry.patch_path, Some(req.run_dir.join("patch.patch")));
        assert_eq!(entry.log_path, req.run_dir.join("worker.log"));
        assert_eq!(entry.started_at_ms, 999);

        let mut rev_req = request(RunKind::Reviewer);
        rev_req.review_revision = "abc".to_string();
        let handshake = Handshake { run_dir: rev_req.run_dir.clone(), ..handshake };
        let entry = entry_from_handshake(&rev_req, &handshake, 999);
        assert_eq!(entry.result_path, Some(rev_req.run_dir.join("review.json")));
        assert_eq!(entry.review_revision.as_deref(), Some("abc"));
        assert!(entry.done_path.is_none());
    }
}
