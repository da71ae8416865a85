//! Deterministic classification of board tasks.
//!
//! Derives the attributes the policy engine works with: repo mapping hints,
//! dependencies, exclusivity keys, and the hold/critical/epic predicates.
//! Everything here is a pure function over the task's title, description,
//! and tag set.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::types::BoardTask;

pub const TAG_EPIC: &str = "epic";
pub const TAG_HOLD: &str = "hold";
pub const TAG_HOLD_QUEUED_CRITICAL: &str = "hold:queued-critical";
pub const TAG_NO_AUTO: &str = "no-auto";
pub const TAG_NO_REPO: &str = "no-repo";
pub const TAG_CRITICAL: &str = "critical";
pub const TAG_STORY: &str = "story";
pub const TAG_EPIC_CHILD: &str = "epic-child";

pub const TAG_PAUSED: &str = "paused";
pub const TAG_PAUSED_CRITICAL: &str = "paused:critical";
pub const TAG_PAUSED_MISSING_WORKER: &str = "paused:missing-worker";
pub const TAG_PAUSED_STALE_WORKER: &str = "paused:stale-worker";
pub const TAG_PAUSED_THRASH: &str = "paused:thrash";
pub const TAG_PAUSED_ARTIFACT: &str = "paused:artifact";

pub const TAG_AUTO_BLOCKED: &str = "auto-blocked";
pub const TAG_BLOCKED_DEPS: &str = "blocked:deps";
pub const TAG_BLOCKED_EXCLUSIVE: &str = "blocked:exclusive";
pub const TAG_BLOCKED_REPO: &str = "blocked:repo";
pub const TAG_BLOCKED_THRASH: &str = "blocked:thrash";
pub const TAG_BLOCKED_ARTIFACT: &str = "blocked:artifact";

pub const TAG_NEEDS_REWORK: &str = "needs-rework";
pub const TAG_REVIEW_AUTO: &str = "review:auto";
pub const TAG_REVIEW_PENDING: &str = "review:pending";
pub const TAG_REVIEW_INFLIGHT: &str = "review:inflight";
pub const TAG_REVIEW_PASS: &str = "review:pass";
pub const TAG_REVIEW_REWORK: &str = "review:rework";
pub const TAG_REVIEW_BLOCKED_WIP: &str = "review:blocked:wip";
pub const TAG_REVIEW_ERROR: &str = "review:error";
pub const TAG_REVIEW_SKIP: &str = "review:skip";
pub const TAG_REVIEW_RERUN: &str = "review:rerun";
pub const TAG_REVIEW_RETRY: &str = "review:retry";

pub const TAG_DOCS_AUTO: &str = "docs:auto";
pub const TAG_DOCS_PENDING: &str = "docs:pending";
pub const TAG_DOCS_INFLIGHT: &str = "docs:inflight";
pub const TAG_DOCS_COMPLETED: &str = "docs:completed";
pub const TAG_DOCS_SKIP: &str = "docs:skip";
pub const TAG_DOCS_ERROR: &str = "docs:error";
pub const TAG_DOCS_RETRY: &str = "docs:retry";

/// Where a repo hint was found (diagnostics only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoHintSource {
    Tag,
    Description,
    Title,
}

/// Outcome of resolving a task's repo mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoResolution {
    /// Explicit `no-repo` opt-out: automation proceeds with an empty path.
    NoRepo,
    /// Hint resolved to a concrete key + path.
    Resolved {
        key: String,
        path: String,
        source: RepoHintSource,
    },
    /// A hint exists but the key is not in the repo map.
    Unmapped { key: String },
    /// No hint anywhere.
    Missing,
}

impl RepoResolution {
    pub fn is_actionable(&self) -> bool {
        matches!(self, RepoResolution::NoRepo | RepoResolution::Resolved { .. })
    }

    /// (repo_key, repo_path) as passed to spawn commands.
    pub fn spawn_args(&self) -> (String, String) {
        match self {
            RepoResolution::Resolved { key, path, .. } => (key.clone(), path.clone()),
            _ => (String::new(), String::new()),
        }
    }
}

fn lower_tags(tags: &BTreeSet<String>) -> BTreeSet<String> {
    tags.iter().map(|t| t.trim().to_ascii_lowercase()).collect()
}

/// Any tag that makes a task non-actionable for normal flow: manual holds,
/// pause tags, and durable blocked reasons.
pub fn is_held(tags: &BTreeSet<String>) -> bool {
    let lower = lower_tags(tags);
    lower.contains(TAG_HOLD)
        || lower.contains(TAG_NO_AUTO)
        || lower.contains(TAG_PAUSED)
        || lower
            .iter()
            .any(|t| t.starts_with("hold:") || t.starts_with("paused:") || t.starts_with("blocked:"))
}

/// Hard holds are human intent to stop automation. Orchestrator-owned fences
/// (`hold:queued-critical`) do not count, so a queued critical can still be
/// selected and unfenced. Pause/blocked tags do not count either: a paused
/// critical must still preempt throughput.
pub fn is_hard_hold(tags: &BTreeSet<String>) -> bool {
    let lower = lower_tags(tags);
    if lower.contains(TAG_HOLD) {
        // `hold` alongside the orchestrator fence is a legacy artifact of
        // older runs; treat it as orchestrator-managed so we can unqueue.
        return !lower.contains(TAG_HOLD_QUEUED_CRITICAL);
    }
    if lower.contains(TAG_NO_AUTO) {
        return true;
    }
    lower
        .iter()
        .any(|t| t.starts_with("hold:") && t != TAG_HOLD_QUEUED_CRITICAL)
}

pub fn is_epic(task: &BoardTask) -> bool {
    task.has_tag(TAG_EPIC) || task.title.to_ascii_lowercase().starts_with("epic:")
}

pub fn is_critical(tags: &BTreeSet<String>) -> bool {
    lower_tags(tags).contains(TAG_CRITICAL)
}

/// Pause tags currently present on the task (`paused` and `paused:*`).
pub fn paused_tags(tags: &BTreeSet<String>) -> Vec<String> {
    tags.iter()
        .filter(|t| {
            let l = t.trim().to_ascii_lowercase();
            l == TAG_PAUSED || l.starts_with("paused:")
        })
        .cloned()
        .collect()
}

/// Parse `Depends on:` / `Dependencies:` / `Dependency:` from a description.
/// Accepts comma- or whitespace-separated `#id` tokens.
pub fn parse_dependencies(description: &str) -> Vec<i64> {
    let mut out = Vec::new();
    for line in description.lines() {
        // Ids are digits, so parsing the lowercased line is lossless.
        let lower = line.trim().to_ascii_lowercase();
        let rest = ["depends on", "dependencies", "dependency"]
            .iter()
            .find_map(|prefix| lower.strip_prefix(*prefix)?.trim_start().strip_prefix(':'));
        let Some(rest) = rest else { continue };
        for token in rest.split(|c: char| c == ',' || c.is_whitespace()) {
            let token = token.trim().trim_start_matches('#');
            if token.is_empty() {
                continue;
            }
            if let Ok(id) = token.parse::<i64>() {
                out.push(id);
            }
        }
        break;
    }
    out
}

/// Union of `exclusive:<key>` tags and the `Exclusive: k1,k2` description
/// line, normalized to lowercase, first occurrence wins.
pub fn parse_exclusive_keys(tags: &BTreeSet<String>, description: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |key: &str| {
        let key = key.trim().to_ascii_lowercase();
        if !key.is_empty() && !out.contains(&key) {
            out.push(key);
        }
    };

    for tag in tags {
        if let Some((head, tail)) = tag.split_once(':') {
            if head.trim().eq_ignore_ascii_case("exclusive") {
                push(tail);
            }
        }
    }
    for line in description.lines() {
        let lower = line.trim().to_ascii_lowercase();
        if let Some(tail) = lower.strip_prefix("exclusive") {
            if let Some(tail) = tail.trim_start().strip_prefix(':') {
                for part in tail.split(',') {
                    push(part);
                }
                break;
            }
        }
    }
    out
}

/// Normalize a repo key: lowercase, non-alphanumeric runs collapse to `-`.
pub fn normalize_repo_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut pending_dash = false;
    for c in key.trim().chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// First-match repo hint: tag `repo:<key>`, description `Repo: ...`, then
/// (optionally) a legacy `<key>:` title prefix.
pub fn parse_repo_hint(
    tags: &BTreeSet<String>,
    description: &str,
    title: &str,
    allow_title_prefix: bool,
) -> Option<(String, RepoHintSource)> {
    for tag in tags {
        if let Some((head, tail)) = tag.split_once(':') {
            if head.trim().eq_ignore_ascii_case("repo") && !tail.trim().is_empty() {
                return Some((tail.trim().to_string(), RepoHintSource::Tag));
            }
        }
    }
    for line in description.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        if let Some(tail) = lower.strip_prefix("repo") {
            if let Some(tail) = tail.trim_start().strip_prefix(':') {
                let offset = trimmed.len() - tail.len();
                let value = trimmed[offset..].trim();
                if !value.is_empty() {
                    return Some((value.to_string(), RepoHintSource::Description));
                }
            }
        }
    }
    if allow_title_prefix {
        if let Some((prefix, _rest)) = title.split_once(':') {
            let prefix = prefix.trim();
            let valid = !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '/');
            if valid {
                // Multi-segment prefixes like "Web/Playground:" hint the
                // first segment.
                let head = prefix.split('/').next().unwrap_or(prefix).trim();
                if !head.is_empty() {
                    return Some((head.to_string(), RepoHintSource::Title));
                }
            }
        }
    }
    None
}

/// Resolve a task's repo mapping against the merged repo map.
pub fn resolve_repo(
    task: &BoardTask,
    repo_map: &BTreeMap<String, String>,
    allow_title_prefix: bool,
) -> RepoResolution {
    if task.has_tag(TAG_NO_REPO) {
        return RepoResolution::NoRepo;
    }
    let Some((hint, source)) =
        parse_repo_hint(&task.tags, &task.description, &task.title, allow_title_prefix)
    else {
        return RepoResolution::Missing;
    };

    // Direct path hint (Repo: /path/to/repo).
    if hint.contains('/') {
        let key = normalize_repo_key(hint.rsplit('/').next().unwrap_or(&hint));
        return RepoResolution::Resolved {
            key,
            path: hint.clone(),
            source,
        };
    }

    let key = normalize_repo_key(&hint);
    if key.is_empty() {
        return RepoResolution::Missing;
    }
    match repo_map.get(&key) {
        Some(path) => RepoResolution::Resolved {
            key,
            path: path.clone(),
            source,
        },
        None => RepoResolution::Unmapped { key },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn task_with(tags_list: &[&str], description: &str, title: &str) -> BoardTask {
        BoardTask {
            id: 1,
            column: crate::core::types::Column::Backlog,
            position: 1,
            swimlane: "Default swimlane".to_string(),
            title: title.to_string(),
            description: description.to_string(),
            tags: tags(tags_list),
        }
    }

    #[test]
    fn dependencies_accept_all_header_spellings() {
        assert_eq!(parse_dependencies("Depends on: #12, #13"), vec![12, 13]);
        assert_eq!(parse_dependencies("dependencies: 7 8"), vec![7, 8]);
        assert_eq!(parse_dependencies("Dependency: #99"), vec![99]);
        assert!(parse_dependencies("No deps here").is_empty());
    }

    #[test]
    fn dependencies_only_first_header_line_counts() {
        let desc = "Depends on: #1\nDepends on: #2";
        assert_eq!(parse_dependencies(desc), vec![1]);
    }

    #[test]
    fn exclusive_keys_union_tags_and_description() {
        let keys = parse_exclusive_keys(
            &tags(&["exclusive:DB", "repo:server"]),
            "Exclusive: db, migrations",
        );
        assert_eq!(keys, vec!["db".to_string(), "migrations".to_string()]);
    }

    #[test]
    fn held_covers_hold_pause_and_blocked_tags() {
        assert!(is_held(&tags(&["hold"])));
        assert!(is_held(&tags(&["no-auto"])));
        assert!(is_held(&tags(&["paused:thrash"])));
        assert!(is_held(&tags(&["blocked:deps"])));
        assert!(!is_held(&tags(&["critical", "repo:server"])));
    }

    #[test]
    fn queued_critical_fence_is_not_a_hard_hold() {
        assert!(!is_hard_hold(&tags(&["hold:queued-critical", "critical"])));
        assert!(!is_hard_hold(&tags(&["hold", "hold:queued-critical"])));
        assert!(is_hard_hold(&tags(&["hold"])));
        assert!(is_hard_hold(&tags(&["hold:manual"])));
        assert!(!is_hard_hold(&tags(&["paused:critical", "critical"])));
    }

    #[test]
    fn repo_hint_prefers_tag_over_description_over_title() {
        let task = task_with(&["repo:server"], "Repo: web", "api: do thing");
        let (hint, source) =
            parse_repo_hint(&task.tags, &task.description, &task.title, true).expect("hint");
        assert_eq!(hint, "server");
        assert_eq!(source, RepoHintSource::Tag);

        let task = task_with(&[], "Repo: web", "api: do thing");
        let (hint, source) =
            parse_repo_hint(&task.tags, &task.description, &task.title, true).expect("hint");
        assert_eq!(hint, "web");
        assert_eq!(source, RepoHintSource::Description);

        let task = task_with(&[], "", "Web/Playground: fix layout");
        let (hint, source) =
            parse_repo_hint(&task.tags, &task.description, &task.title, true).expect("hint");
        assert_eq!(hint, "Web");
        assert_eq!(source, RepoHintSource::Title);

        let task = task_with(&[], "", "api: do thing");
        assert!(parse_repo_hint(&task.tags, &task.description, &task.title, false).is_none());
    }

    #[test]
    fn repo_resolution_uses_map_and_no_repo_opt_out() {
        let mut map = BTreeMap::new();
        map.insert("server".to_string(), "/repos/server".to_string());

        let task = task_with(&["repo:Server"], "", "t");
        match resolve_repo(&task, &map, true) {
            RepoResolution::Resolved { key, path, .. } => {
                assert_eq!(key, "server");
                assert_eq!(path, "/repos/server");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }

        let task = task_with(&["repo:unknown"], "", "t");
        assert_eq!(
            resolve_repo(&task, &map, true),
            RepoResolution::Unmapped { key: "unknown".to_string() }
        );

        let task = task_with(&["no-repo"], "", "t");
        assert_eq!(resolve_repo(&task, &map, true), RepoResolution::NoRepo);

        let task = task_with(&[], "", "plain title");
        assert_eq!(resolve_repo(&task, &map, true), RepoResolution::Missing);
    }

    #[test]
    fn normalize_repo_key_collapses_punctuation() {
        assert_eq!(normalize_repo_key("My Repo!"), "my-repo");
        assert_eq!(normalize_repo_key("--server--"), "server");
        assert_eq!(normalize_repo_key(""), "");
    }
}
