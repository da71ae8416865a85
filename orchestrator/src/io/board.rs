//! Board port.
//!
//! The [`Board`] trait is the only surface the reconciler uses to observe
//! and mutate the external board; tests script it in memory. The production
//! implementation speaks Kanboard-flavoured JSON-RPC 2.0 over HTTP with
//! Basic auth. Tag writes converge a full tag set, so every operation is
//! idempotent from the orchestrator's perspective.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::core::types::{BoardTask, Column, Snapshot};

/// Typed operations over the external board.
pub trait Board {
    fn snapshot(&self) -> Result<Snapshot>;
    fn move_task(&self, id: i64, to: Column) -> Result<()>;
    fn add_tags(&self, id: i64, tags: &[String]) -> Result<()>;
    fn remove_tags(&self, id: i64, tags: &[String]) -> Result<()>;
    fn post_comment(&self, id: i64, text: &str) -> Result<()>;
    fn create_task(
        &self,
        column: Column,
        title: &str,
        description: &str,
        tags: &[String],
    ) -> Result<i64>;
    fn get_task(&self, id: i64) -> Result<Option<BoardTask>>;
}

/// Merge `add` into an existing tag list, case-insensitively.
pub fn merged_tags(existing: &[String], add: &[String]) -> Option<Vec<String>> {
    let mut lower: BTreeSet<String> =
        existing.iter().map(|t| t.trim().to_ascii_lowercase()).collect();
    let mut merged = existing.to_vec();
    let mut changed = false;
    for tag in add {
        let l = tag.trim().to_ascii_lowercase();
        if !l.is_empty() && !lower.contains(&l) {
            merged.push(tag.clone());
            lower.insert(l);
            changed = true;
        }
    }
    changed.then_some(merged)
}

/// Remove `remove` from an existing tag list, case-insensitively.
pub fn pruned_tags(existing: &[String], remove: &[String]) -> Option<Vec<String>> {
    let remove_lower: BTreeSet<String> =
        remove.iter().map(|t| t.trim().to_ascii_lowercase()).collect();
    let pruned: Vec<String> = existing
        .iter()
        .filter(|t| !remove_lower.contains(&t.trim().to_ascii_lowercase()))
        .cloned()
        .collect();
    (pruned.len() != existing.len()).then_some(pruned)
}

#[derive(Default)]
struct BoardCache {
    project_id: Option<i64>,
    comment_user_id: Option<i64>,
    column_ids: BTreeMap<Column, i64>,
    swimlane_by_task: BTreeMap<i64, i64>,
    default_swimlane: Option<i64>,
}

/// Kanboard JSON-RPC client.
pub struct KanboardClient {
    base_url: String,
    user: String,
    token: String,
    project: String,
    client: reqwest::blocking::Client,
    cache: RefCell<BoardCache>,
}

const RPC_ATTEMPTS: u32 = 3;

impl KanboardClient {
    pub fn new(
        base_url: &str,
        project: &str,
        user: &str,
        token: &str,
        call_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(call_timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            base_url: base_url.to_string(),
            user: user.to_string(),
            token: token.to_string(),
            project: project.to_string(),
            client,
            cache: RefCell::new(BoardCache::default()),
        })
    }

    /// One JSON-RPC call. Transport failures and 5xx responses are retried
    /// up to twice; semantic errors from the board are surfaced immediately.
    fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "id": 1,
            "params": params,
        });
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=RPC_ATTEMPTS {
            match self.rpc_once(method, &payload) {
                Ok(result) => return Ok(result),
                Err(RpcError::Transport(err)) => {
                    warn!(method, attempt, %err, "board call failed; retrying");
                    last_err = Some(err);
                }
                Err(RpcError::Board(err)) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("board call {method} failed")))
    }

    fn rpc_once(&self, method: &str, payload: &Value) -> std::result::Result<Value, RpcError> {
        let response = self
            .client
            .post(&self.base_url)
            .basic_auth(&self.user, Some(&self.token))
            .json(payload)
            .send()
            .map_err(|e| RpcError::Transport(anyhow!(e)))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(RpcError::Transport(anyhow!("board returned HTTP {status}")));
        }
        if !status.is_success() {
            return Err(RpcError::Board(anyhow!("board returned HTTP {status} for {method}")));
        }
        let body = response
            .text()
            .map_err(|e| RpcError::Transport(anyhow!(e)))?;
        // The board can emit fatals as HTML; guard the parse.
        let out: Value = serde_json::from_str(&body).map_err(|_| {
            RpcError::Transport(anyhow!("non-JSON response from board: {:.200}", body))
        })?;
        if let Some(err) = out.get("error") {
            if !err.is_null() {
                return Err(RpcError::Board(anyhow!("board error for {method}: {err}")));
            }
        }
        Ok(out.get("result").cloned().unwrap_or(Value::Null))
    }

    fn project_id(&self) -> Result<i64> {
        if let Some(id) = self.cache.borrow().project_id {
            return Ok(id);
        }
        let result = self.rpc("getProjectByName", json!({ "name": self.project }))?;
        let id = result
            .get("id")
            .and_then(as_i64)
            .ok_or_else(|| anyhow!("project {:?} not found on board", self.project))?;
        self.cache.borrow_mut().project_id = Some(id);
        Ok(id)
    }

    fn comment_user_id(&self) -> Result<i64> {
        if let Some(id) = self.cache.borrow().comment_user_id {
            return Ok(id);
        }
        let me = self.rpc("getMe", Value::Null)?;
        let id = me.get("id").and_then(as_i64).unwrap_or(0);
        self.cache.borrow_mut().comment_user_id = Some(id);
        Ok(id)
    }

    fn column_id(&self, column: Column) -> Result<i64> {
        if let Some(id) = self.cache.borrow().column_ids.get(&column) {
            return Ok(*id);
        }
        // Column ids are learned from the board layout.
        self.snapshot()?;
        self.cache
            .borrow()
            .column_ids
            .get(&column)
            .copied()
            .ok_or_else(|| anyhow!("board has no {:?} column", column.title()))
    }

    fn swimlane_for(&self, task_id: i64) -> Result<i64> {
        if let Some(id) = self.cache.borrow().swimlane_by_task.get(&task_id) {
            return Ok(*id);
        }
        let task = self.rpc("getTask", json!([task_id]))?;
        let swimlane = task.get("swimlane_id").and_then(as_i64);
        match swimlane {
            Some(id) => Ok(id),
            None => self
                .cache
                .borrow()
                .default_swimlane
                .ok_or_else(|| anyhow!("no swimlane known for task #{task_id}")),
        }
    }

    fn task_tags(&self, task_id: i64) -> Result<Vec<String>> {
        let result = self.rpc("getTaskTags", json!({ "task_id": task_id }))?;
        // Kanboard returns {tag_id: tag_name}.
        let mut tags: Vec<String> = match result {
            Value::Object(map) => map
                .values()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Value::Array(list) => list
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        tags.sort();
        Ok(tags)
    }

    fn set_task_tags(&self, task_id: i64, tags: &[String]) -> Result<()> {
        let pid = self.project_id()?;
        self.rpc("setTaskTags", json!([pid, task_id, tags]))?;
        Ok(())
    }
}

enum RpcError {
    /// Network problems, 5xx, non-JSON bodies: worth retrying.
    Transport(anyhow::Error),
    /// The board understood the request and refused it.
    Board(anyhow::Error),
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        // Kanboard serializes most ids as strings.
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl Board for KanboardClient {
    fn snapshot(&self) -> Result<Snapshot> {
        let pid = self.project_id()?;
        let board = self.rpc("getBoard", json!({ "project_id": pid }))?;
        let swimlanes = board
            .as_array()
            .ok_or_else(|| anyhow!("unexpected getBoard payload"))?;

        let mut column_ids: BTreeMap<Column, i64> = BTreeMap::new();
        let mut swimlane_by_task: BTreeMap<i64, i64> = BTreeMap::new();
        let mut default_swimlane: Option<i64> = None;
        let mut snapshot = Snapshot::default();

        for swimlane in swimlanes {
            let swimlane_id = swimlane.get("id").and_then(as_i64).unwrap_or(0);
            let swimlane_name = swimlane
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("Default swimlane")
                .to_string();
            default_swimlane.get_or_insert(swimlane_id);
            let columns = swimlane
                .get("columns")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for column_value in columns {
                let title = column_value
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let Some(column) = Column::from_title(title) else {
                    continue;
                };
                if let Some(col_id) = column_value.get("id").and_then(as_i64) {
                    column_ids.entry(column).or_insert(col_id);
                }
                if column == Column::Documentation {
                    snapshot.has_docs_column = true;
                }
                let tasks = column_value
                    .get("tasks")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                for task_value in tasks {
                    let Some(id) = task_value.get("id").and_then(as_i64) else {
                        continue;
                    };
                    swimlane_by_task.insert(id, swimlane_id);
                    let position = task_value
                        .get("position")
                        .and_then(as_i64)
                        .unwrap_or(i64::MAX);
                    let title = task_value
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    // getBoard omits descriptions in some board versions.
                    let description = match task_value.get("description") {
                        Some(Value::String(s)) => s.clone(),
                        _ => {
                            let full = self.rpc("getTask", json!([id]))?;
                            full.get("description")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string()
                        }
                    };
                    let tags = self.task_tags(id)?;
                    snapshot.tasks.push(BoardTask {
                        id,
                        column,
                        position,
                        swimlane: swimlane_name.clone(),
                        title,
                        description,
                        tags: tags.into_iter().collect(),
                    });
                }
            }
        }

        let mut cache = self.cache.borrow_mut();
        cache.column_ids = column_ids;
        cache.swimlane_by_task = swimlane_by_task;
        if cache.default_swimlane.is_none() {
            cache.default_swimlane = default_swimlane;
        }
        drop(cache);

        debug!(tasks = snapshot.tasks.len(), docs = snapshot.has_docs_column, "board snapshot");
        Ok(snapshot)
    }

    fn move_task(&self, id: i64, to: Column) -> Result<()> {
        let pid = self.project_id()?;
        let column_id = self.column_id(to)?;
        let swimlane_id = self.swimlane_for(id)?;
        self.rpc(
            "moveTaskPosition",
            json!({
                "project_id": pid,
                "task_id": id,
                "column_id": column_id,
                "position": 1,
                "swimlane_id": swimlane_id,
            }),
        )?;
        Ok(())
    }

    fn add_tags(&self, id: i64, tags: &[String]) -> Result<()> {
        let existing = self.task_tags(id)?;
        if let Some(merged) = merged_tags(&existing, tags) {
            self.set_task_tags(id, &merged)?;
        }
        Ok(())
    }

    fn remove_tags(&self, id: i64, tags: &[String]) -> Result<()> {
        let existing = self.task_tags(id)?;
        if let Some(pruned) = pruned_tags(&existing, tags) {
            self.set_task_tags(id, &pruned)?;
        }
        Ok(())
    }

    fn post_comment(&self, id: i64, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let user_id = self.comment_user_id()?;
        self.rpc(
            "createComment",
            json!({ "task_id": id, "user_id": user_id, "content": text }),
        )?;
        Ok(())
    }

    fn create_task(
        &self,
        column: Column,
        title: &str,
        description: &str,
        tags: &[String],
    ) -> Result<i64> {
        let pid = self.project_id()?;
        let column_id = self.column_id(column)?;
        let result = self.rpc(
            "createTask",
            json!({
                "title": title,
                "project_id": pid,
                "column_id": column_id,
                "description": description,
            }),
        )?;
        let id = as_i64(&result).ok_or_else(|| anyhow!("createTask returned no id"))?;
        if !tags.is_empty() {
            self.set_task_tags(id, tags)?;
        }
        Ok(id)
    }

    fn get_task(&self, id: i64) -> Result<Option<BoardTask>> {
        let task = self.rpc("getTask", json!([id]))?;
        if task.is_null() {
            return Ok(None);
        }
        let title = task.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let description = task
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let tags = self.task_tags(id)?;
        Ok(Some(BoardTask {
            id,
            column: Column::Backlog,
            position: task.get("position").and_then(as_i64).unwrap_or(i64::MAX),
            swimlane: String::new(),
            title,
            description,
            tags: tags.into_iter().collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merged_tags_is_case_insensitive_and_stable() {
        let existing = strings(&["repo:server", "Critical"]);
        let merged = merged_tags(&existing, &strings(&["critical", "paused"])).expect("changed");
        assert_eq!(merged, strings(&["repo:server", "Critical", "paused"]));
        assert!(merged_tags(&existing, &strings(&["CRITICAL"])).is_none());
    }

    #[test]
    fn pruned_tags_only_reports_real_changes() {
        let existing = strings(&["paused", "paused:critical", "repo:server"]);
        let pruned = pruned_tags(&existing, &strings(&["PAUSED:CRITICAL"])).expect("changed");
        assert_eq!(pruned, strings(&["paused", "repo:server"]));
        assert!(pruned_tags(&existing, &strings(&["absent"])).is_none());
    }

    #[test]
    fn as_i64_accepts_numbers_and_strings() {
        assert_eq!(as_i64(&json!(7)), Some(7));
        assert_eq!(as_i64(&json!("42")), Some(42));
        assert_eq!(as_i64(&json!("x")), None);
        assert_eq!(as_i64(&Value::Null), None);
    }
}
