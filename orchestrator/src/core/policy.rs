//! The policy engine.
//!
//! `plan` is a pure function from (snapshot, state, registry view, config,
//! now) to an ordered list of proposals. It performs no I/O: every file the
//! decisions depend on has already been materialized into the
//! [`RegistryView`], and every proposal is applied (or not) by the
//! reconciler. Replaying the same inputs yields the same proposals.
//!
//! Decision order: critical management, WIP reconciliation, blocked-run
//! recovery, review servicing, documentation servicing, auto-heal,
//! promotion. Ties inside a phase break by ascending task id (or board
//! order where the phase is position-driven).

use std::collections::BTreeSet;

use crate::core::classifier::{
    self, RepoResolution, TAG_AUTO_BLOCKED, TAG_BLOCKED_ARTIFACT, TAG_BLOCKED_DEPS,
    TAG_BLOCKED_EXCLUSIVE, TAG_BLOCKED_REPO, TAG_BLOCKED_THRASH, TAG_DOCS_AUTO,
    TAG_DOCS_COMPLETED, TAG_DOCS_ERROR, TAG_DOCS_INFLIGHT, TAG_DOCS_PENDING, TAG_DOCS_RETRY,
    TAG_DOCS_SKIP, TAG_EPIC_CHILD, TAG_HOLD, TAG_HOLD_QUEUED_CRITICAL, TAG_NEEDS_REWORK,
    TAG_PAUSED, TAG_PAUSED_ARTIFACT, TAG_PAUSED_CRITICAL, TAG_PAUSED_MISSING_WORKER,
    TAG_PAUSED_STALE_WORKER, TAG_PAUSED_THRASH, TAG_REVIEW_AUTO, TAG_REVIEW_BLOCKED_WIP,
    TAG_REVIEW_ERROR, TAG_REVIEW_INFLIGHT, TAG_REVIEW_PASS, TAG_REVIEW_PENDING,
    TAG_REVIEW_RERUN, TAG_REVIEW_RETRY, TAG_REVIEW_REWORK, TAG_REVIEW_SKIP, TAG_STORY,
};
use crate::core::guards;
use crate::core::review::{self, ReviewOutcome};
use crate::core::types::{
    Action, BoardTask, Column, Proposal, RegistryView, ReviewResult, RunStatus, Snapshot, Verdict,
};
use crate::state::{RunKind, StateDoc};

/// What to do with a WIP task that has no recorded worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingWorkerPolicy {
    Spawn,
    Pause,
}

/// The policy knobs, a pure-data subset of the full configuration.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub wip_limit: u32,
    pub docs_wip_limit: u32,
    pub review_threshold: u32,
    pub review_auto_done: bool,
    pub missing_worker_policy: MissingWorkerPolicy,
    pub cooldown_min: u32,
    pub thrash_window_min: u32,
    pub max_respawns: u32,
    pub max_reworks_per_revision: u32,
    pub allow_title_repo_hint: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            wip_limit: 2,
            docs_wip_limit: 1,
            review_threshold: 90,
            review_auto_done: true,
            missing_worker_policy: MissingWorkerPolicy::Pause,
            cooldown_min: 30,
            thrash_window_min: 30,
            max_respawns: 3,
            max_reworks_per_revision: 3,
            allow_title_repo_hint: true,
        }
    }
}

pub struct PolicyInput<'a> {
    pub snapshot: &'a Snapshot,
    pub state: &'a StateDoc,
    pub registry: &'a RegistryView,
    pub config: &'a PolicyConfig,
    pub now_ms: i64,
}

/// Compute the proposals for one tick.
pub fn plan(input: &PolicyInput) -> Vec<Proposal> {
    let mut planner = Planner::new(input);
    planner.critical_phase();
    planner.wip_phase();
    planner.blocked_recovery_phase();
    planner.review_phase();
    planner.docs_phase();
    planner.critical_resume_phase();
    planner.auto_heal_phase();
    planner.promotion_phase();
    planner.proposals
}

struct Planner<'a> {
    snap: &'a Snapshot,
    state: &'a StateDoc,
    reg: &'a RegistryView,
    cfg: &'a PolicyConfig,
    now: i64,
    proposals: Vec<Proposal>,
    /// Active critical task id, if any.
    active_critical: Option<i64>,
    /// Queued (fenced) critical ids.
    queued_criticals: BTreeSet<i64>,
    /// True while a critical is (or will this tick be) in WIP.
    critical_exclusive: bool,
    /// Non-held WIP count, tracked through this tick's own decisions.
    sim_active_wip: u32,
    /// Exclusivity keys held by non-held WIP tasks (plus tasks started this
    /// tick).
    sim_wip_keys: BTreeSet<String>,
    /// Tasks moved into Ready by this tick's proposals (auto-heal).
    sim_healed: Vec<i64>,
}

impl<'a> Planner<'a> {
    fn new(input: &PolicyInput<'a>) -> Self {
        let snap = input.snapshot;
        let mut sim_active_wip = 0;
        let mut sim_wip_keys = BTreeSet::new();
        for task in snap.in_column(Column::Wip) {
            if classifier::is_held(&task.tags) {
                continue;
            }
            sim_active_wip += 1;
            for key in classifier::parse_exclusive_keys(&task.tags, &task.description) {
                sim_wip_keys.insert(key);
            }
        }
        Self {
            snap,
            state: input.state,
            reg: input.registry,
            cfg: input.config,
            now: input.now_ms,
            proposals: Vec::new(),
            active_critical: None,
            queued_criticals: BTreeSet::new(),
            critical_exclusive: false,
            sim_active_wip,
            sim_wip_keys,
            sim_healed: Vec::new(),
        }
    }

    fn key(&self, task: &BoardTask) -> (usize, i64, i64) {
        let pri = self
            .state
            .swimlane_priority
            .iter()
            .position(|name| name == &task.swimlane)
            .unwrap_or(self.state.swimlane_priority.len());
        (pri, task.position, task.id)
    }

    fn column_sorted(&self, column: Column) -> Vec<&'a BoardTask> {
        let mut tasks: Vec<&BoardTask> = self.snap.in_column(column).collect();
        tasks.sort_by_key(|t| self.key(t));
        tasks
    }

    fn column_by_id(&self, column: Column) -> Vec<&'a BoardTask> {
        let mut tasks: Vec<&BoardTask> = self.snap.in_column(column).collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    fn repo(&self, task: &BoardTask) -> RepoResolution {
        classifier::resolve_repo(task, &self.state.repo_map, self.cfg.allow_title_repo_hint)
    }

    fn cooled(&self, id: i64) -> bool {
        guards::cooled(self.state.last_action_ms(id), self.now, self.cfg.cooldown_min)
    }

    fn unmet_dependencies(&self, task: &BoardTask) -> Vec<i64> {
        classifier::parse_dependencies(&task.description)
            .into_iter()
            .filter(|dep| !self.snap.is_done(*dep))
            .collect()
    }

    fn respawn_allowed(&self, id: i64) -> bool {
        let history = self
            .state
            .respawn_history_by_task_id
            .get(&id.to_string())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        guards::respawn_allowed(
            history,
            self.now,
            self.cfg.thrash_window_min,
            self.cfg.max_respawns,
        )
    }

    fn patch_revision(&self, id: i64) -> Option<String> {
        self.reg.patch_revisions.get(&id).cloned()
    }

    fn patch_path(&self, id: i64) -> Option<String> {
        self.state
            .patches_by_task_id
            .get(&id.to_string())
            .map(|rec| rec.patch_path.display().to_string())
    }

    fn push(&mut self, proposal: Proposal) {
        self.proposals.push(proposal);
    }

    /// One-time "needs repo mapping" guidance comment.
    fn needs_repo_actions(&self, id: i64, actions: &mut Vec<Action>) {
        if self.state.repo_comment_by_task_id.contains_key(&id.to_string()) {
            return;
        }
        actions.push(Action::PostComment {
            id,
            text: "Automation is paused: this card needs an explicit repo mapping.\n\
                   Add ONE of:\n\
                   - `Repo: /absolute/path/to/repo` (in the description)\n\
                   - tag `repo:<key>`\n\
                   - tag `no-repo` (explicit opt-out)\n\n\
                   The orchestrator clears `blocked:repo` automatically once fixed."
                .to_string(),
        });
        actions.push(Action::MarkRepoCommented { id });
    }

    // ------------------------------------------------------------------
    // Critical management
    // ------------------------------------------------------------------

    fn critical_phase(&mut self) {
        let mut candidates: Vec<&BoardTask> = self
            .snap
            .tasks
            .iter()
            .filter(|t| t.column != Column::Done)
            .filter(|t| classifier::is_critical(&t.tags))
            .filter(|t| !classifier::is_hard_hold(&t.tags))
            .collect();
        if candidates.is_empty() {
            return;
        }
        let column_rank = |c: Column| match c {
            Column::Wip => 0,
            Column::Review => 1,
            Column::Ready => 2,
            _ => 3,
        };
        candidates.sort_by_key(|t| (column_rank(t.column), self.key(t)));
        let active = candidates[0];
        self.active_critical = Some(active.id);
        self.queued_criticals = candidates[1..].iter().map(|t| t.id).collect();

        // Unfence the single active critical.
        if active.has_tag(TAG_HOLD_QUEUED_CRITICAL) {
            self.push(
                Proposal::new(format!("Unqueued active critical #{}", active.id), Some(active.id), 1)
                    .with(Action::RemoveTags {
                        id: active.id,
                        tags: vec![TAG_HOLD.to_string(), TAG_HOLD_QUEUED_CRITICAL.to_string()],
                    }),
            );
        }
        // Fence every other critical.
        for task in &candidates[1..] {
            if task.has_tag(TAG_HOLD_QUEUED_CRITICAL) || classifier::is_held(&task.tags) {
                continue;
            }
            self.push(
                Proposal::new(format!("Queued critical #{}", task.id), Some(task.id), 1).with(
                    Action::AddTags {
                        id: task.id,
                        tags: vec![TAG_HOLD_QUEUED_CRITICAL.to_string()],
                    },
                ),
            );
        }

        self.critical_exclusive = active.column == Column::Wip;
        if self.critical_exclusive {
            self.pause_noncritical_wip(active.id);
        } else if matches!(active.column, Column::Backlog | Column::Ready) {
            // Starting the critical also pauses the rest of WIP.
            self.try_start_critical(active);
        }
    }

    fn try_start_critical(&mut self, active: &BoardTask) {
        let id = active.id;
        if self.state.entry(RunKind::Worker, id).is_some() {
            // A handle already exists; the move either happened last tick or
            // will be reconciled by the WIP phase once the board catches up.
            return;
        }
        let unmet = self.unmet_dependencies(active);
        if !unmet.is_empty() {
            let deps = unmet
                .iter()
                .map(|d| format!("#{d}"))
                .collect::<Vec<_>>()
                .join(", ");
            self.push(
                Proposal::new(format!("Critical #{id} cannot start"), Some(id), 0).with(
                    Action::NotifyBlocker {
                        id,
                        message: format!("critical #{id} cannot start: depends on {deps}"),
                    },
                ),
            );
            return;
        }
        // Exclusivity conflicts only matter against other critical WIP work;
        // non-critical WIP is about to be paused anyway.
        let critical_wip_keys: BTreeSet<String> = self
            .snap
            .in_column(Column::Wip)
            .filter(|t| t.id != id && classifier::is_critical(&t.tags))
            .flat_map(|t| classifier::parse_exclusive_keys(&t.tags, &t.description))
            .collect();
        let conflicts: Vec<String> =
            classifier::parse_exclusive_keys(&active.tags, &active.description)
                .into_iter()
                .filter(|k| critical_wip_keys.contains(k))
                .collect();
        if !conflicts.is_empty() {
            self.push(
                Proposal::new(format!("Critical #{id} cannot start"), Some(id), 0).with(
                    Action::NotifyBlocker {
                        id,
                        message: format!(
                            "critical #{id} cannot start: exclusive conflict: {}",
                            conflicts.join(", ")
                        ),
                    },
                ),
            );
            return;
        }
        let repo = self.repo(active);
        if !repo.is_actionable() {
            let mut actions = vec![
                Action::AddTags {
                    id,
                    tags: vec![TAG_BLOCKED_REPO.to_string(), TAG_AUTO_BLOCKED.to_string()],
                },
                Action::MarkAutoBlocked {
                    id,
                    reason: "no repo mapping".to_string(),
                },
            ];
            self.needs_repo_actions(id, &mut actions);
            let mut proposal =
                Proposal::new(format!("Kept critical #{id} in Backlog (blocked:repo)"), Some(id), 1);
            proposal.actions = actions;
            self.push(proposal);
            return;
        }
        let (repo_key, repo_path) = repo.spawn_args();
        self.push(
            Proposal::new(format!("Started critical #{id} -> WIP"), Some(id), 1)
                .exempt()
                .with(Action::SpawnWorker { id, repo_key, repo_path })
                .with(Action::RemoveTags {
                    id,
                    tags: vec![
                        TAG_AUTO_BLOCKED.to_string(),
                        TAG_BLOCKED_DEPS.to_string(),
                        TAG_BLOCKED_EXCLUSIVE.to_string(),
                        TAG_BLOCKED_REPO.to_string(),
                    ],
                })
                .with(Action::ClearAutoBlocked { id })
                .with(Action::Move { id, to: Column::Wip })
                .on_failure(vec![
                    Action::AddTags {
                        id,
                        tags: vec![TAG_PAUSED.to_string(), TAG_PAUSED_MISSING_WORKER.to_string()],
                    },
                    Action::Move { id, to: Column::Blocked },
                ]),
        );
        self.critical_exclusive = true;
        self.sim_active_wip += 1;
        self.pause_noncritical_wip(active.id);
    }

    fn pause_noncritical_wip(&mut self, critical_id: i64) {
        let wip = self.column_by_id(Column::Wip);
        for task in wip {
            let id = task.id;
            if id == critical_id || classifier::is_critical(&task.tags) {
                continue;
            }
            if self.state.paused_by_critical.contains_key(&id.to_string()) {
                continue;
            }
            if task.has_tag(TAG_PAUSED_CRITICAL) {
                continue;
            }
            let added_paused = !task.has_tag(TAG_PAUSED);
            self.push(
                Proposal::new(
                    format!("Tagged WIP #{id} as paused:critical (for critical #{critical_id})"),
                    Some(id),
                    1,
                )
                .exempt()
                .with(Action::AddTags {
                    id,
                    tags: vec![TAG_PAUSED.to_string(), TAG_PAUSED_CRITICAL.to_string()],
                })
                .with(Action::PauseForCritical { id, critical_id, added_paused }),
            );
        }
    }

    fn critical_resume_phase(&mut self) {
        if self.critical_exclusive || self.state.paused_by_critical.is_empty() {
            return;
        }
        let mut entries: Vec<(i64, bool)> = Vec::new();
        for (key, info) in &self.state.paused_by_critical {
            if let Ok(id) = key.parse::<i64>() {
                entries.push((id, info.added_paused));
            }
        }
        entries.sort();
        for (id, added_paused) in entries {
            let Some(task) = self.snap.get(id) else {
                // Task vanished (done, deleted); just drop the record.
                self.push(
                    Proposal::new(format!("Dropped stale critical pause for #{id}"), Some(id), 0)
                        .with(Action::ResumeFromCritical { id, remove_paused: false }),
                );
                continue;
            };
            let other_reasons: Vec<String> = classifier::paused_tags(&task.tags)
                .into_iter()
                .filter(|t| {
                    let l = t.to_ascii_lowercase();
                    l != TAG_PAUSED && l != TAG_PAUSED_CRITICAL
                })
                .collect();
            let remove_paused =
                added_paused && other_reasons.is_empty() && task.has_tag(TAG_PAUSED);
            let mut tags = vec![TAG_PAUSED_CRITICAL.to_string()];
            if remove_paused {
                tags.push(TAG_PAUSED.to_string());
            }
            self.push(
                Proposal::new(format!("Cleared paused:critical for #{id}"), Some(id), 1)
                    .exempt()
                    .with(Action::RemoveTags { id, tags })
                    .with(Action::ResumeFromCritical { id, remove_paused }),
            );
        }
    }

    // ------------------------------------------------------------------
    // WIP reconciliation
    // ------------------------------------------------------------------

    fn wip_phase(&mut self) {
        for task in self.column_by_id(Column::Wip) {
            let id = task.id;
            if self.queued_criticals.contains(&id) {
                continue;
            }
            match self.state.entry(RunKind::Worker, id) {
                Some(_) => self.reconcile_wip_entry(task),
                None => {
                    if Some(id) == self.active_critical {
                        // Spawn already handled by the critical phase.
                        continue;
                    }
                    let critical = classifier::is_critical(&task.tags);
                    if classifier::is_held(&task.tags) && !critical {
                        continue;
                    }
                    self.handle_missing_worker(task, critical);
                }
            }
        }
    }

    fn reconcile_wip_entry(&mut self, task: &BoardTask) {
        let id = task.id;
        let status = self.reg.worker_status.get(&id).cloned().unwrap_or(RunStatus::Running);
        match status {
            RunStatus::Complete { report, comment } if report.worker_usable() => {
                let mut proposal = Proposal::new(
                    format!("Moved WIP #{id} -> Review (worker output complete)"),
                    Some(id),
                    1,
                );
                if !comment.trim().is_empty() {
                    proposal = proposal.with(Action::PostComment { id, text: comment });
                }
                let mut remove = vec![
                    TAG_REVIEW_PASS.to_string(),
                    TAG_REVIEW_REWORK.to_string(),
                    TAG_REVIEW_BLOCKED_WIP.to_string(),
                    TAG_REVIEW_ERROR.to_string(),
                    TAG_REVIEW_INFLIGHT.to_string(),
                    TAG_NEEDS_REWORK.to_string(),
                ];
                remove.extend(classifier::paused_tags(&task.tags));
                proposal = proposal
                    .with(Action::RemoveTags { id, tags: remove })
                    .with(Action::AddTags {
                        id,
                        tags: vec![TAG_REVIEW_AUTO.to_string(), TAG_REVIEW_PENDING.to_string()],
                    });
                if let Some(revision) = self.patch_revision_for_done(id, &report.patch_path) {
                    proposal = proposal.with(Action::RecordPatch {
                        id,
                        patch_path: report.patch_path.clone(),
                        revision,
                    });
                }
                proposal = proposal
                    .with(Action::Move { id, to: Column::Review })
                    .with(Action::ClearEntry { kind: RunKind::Worker, id });
                if self.sim_active_wip > 0 && !classifier::is_held(&task.tags) {
                    self.sim_active_wip -= 1;
                }
                self.push(proposal);
            }
            RunStatus::Complete { report, .. } => {
                let reason = if !report.ok {
                    "worker exited non-zero (see done.json)"
                } else if report.patch_exists && report.patch_bytes == 0 {
                    "worker produced empty patch"
                } else {
                    "worker finished without usable artifacts"
                };
                self.park_unusable_worker(task, reason);
            }
            RunStatus::Invalid { reason } => {
                self.park_unusable_worker(task, &reason);
            }
            RunStatus::Running => {
                if self.reg.worker_timed_out.contains(&id) {
                    // Treat the run as lost; the missing-worker policy takes
                    // over on the next tick.
                    self.push(
                        Proposal::new(format!("Dropped timed-out worker run for WIP #{id}"), Some(id), 0)
                            .with(Action::ClearEntry { kind: RunKind::Worker, id }),
                    );
                } else if self.reg.worker_log_stale.contains(&id)
                    && !task.has_tag(TAG_PAUSED_STALE_WORKER)
                {
                    self.push(
                        Proposal::new(
                            format!("Tagged WIP #{id} as paused:stale-worker (worker log stale)"),
                            Some(id),
                            1,
                        )
                        .with(Action::AddTags {
                            id,
                            tags: vec![TAG_PAUSED.to_string(), TAG_PAUSED_STALE_WORKER.to_string()],
                        }),
                    );
                }
            }
        }
    }

    /// Revision recorded alongside the patch when a worker completes. The
    /// registry computes it for every completed worker run.
    fn patch_revision_for_done(&self, id: i64, _patch_path: &std::path::Path) -> Option<String> {
        self.reg.patch_revisions.get(&id).cloned()
    }

    fn park_unusable_worker(&mut self, task: &BoardTask, reason: &str) {
        let id = task.id;
        if classifier::is_critical(&task.tags) {
            // Criticals stay in WIP, paused, so they keep preempting until a
            // human looks at them.
            self.push(
                Proposal::new(
                    format!("Paused critical WIP #{id} (paused:artifact: {reason})"),
                    Some(id),
                    1,
                )
                .with(Action::AddTags {
                    id,
                    tags: vec![TAG_PAUSED.to_string(), TAG_PAUSED_ARTIFACT.to_string()],
                })
                .with(Action::RemoveTags {
                    id,
                    tags: vec![TAG_REVIEW_PENDING.to_string(), TAG_REVIEW_INFLIGHT.to_string()],
                })
                .with(Action::PostComment {
                    id,
                    text: format!(
                        "Worker finished without usable artifacts ({reason}).\n\
                         This critical card is paused in place to prevent respawn thrash.\n\
                         Inspect the run directory, then remove the paused tags to rerun."
                    ),
                })
                .with(Action::ClearEntry { kind: RunKind::Worker, id }),
            );
        } else {
            self.push(
                Proposal::new(
                    format!("Kept WIP #{id} in Backlog (blocked:artifact: {reason})"),
                    Some(id),
                    1,
                )
                .with(Action::Move { id, to: Column::Backlog })
                .with(Action::AddTags { id, tags: vec![TAG_BLOCKED_ARTIFACT.to_string()] })
                .with(Action::ClearEntry { kind: RunKind::Worker, id }),
            );
            if self.sim_active_wip > 0 && !classifier::is_held(&task.tags) {
                self.sim_active_wip -= 1;
            }
        }
    }

    fn handle_missing_worker(&mut self, task: &BoardTask, critical: bool) {
        let id = task.id;
        let spawn_allowed =
            critical || self.cfg.missing_worker_policy == MissingWorkerPolicy::Spawn;
        if spawn_allowed {
            if !self.respawn_allowed(id) {
                self.push(
                    Proposal::new(
                        format!("Paused WIP #{id} (paused:thrash: worker respawn thrash)"),
                        Some(id),
                        1,
                    )
                    .with(Action::AddTags {
                        id,
                        tags: vec![TAG_PAUSED.to_string(), TAG_PAUSED_THRASH.to_string()],
                    })
                    .with(Action::Move { id, to: Column::Blocked }),
                );
                return;
            }
            let repo = self.repo(task);
            if repo.is_actionable() {
                let (repo_key, repo_path) = repo.spawn_args();
                self.push(
                    Proposal::new(format!("Spawned worker for WIP #{id}"), Some(id), 1)
                        .exempt()
                        .with(Action::SpawnWorker { id, repo_key, repo_path })
                        .on_failure(vec![
                            Action::AddTags {
                                id,
                                tags: vec![
                                    TAG_PAUSED.to_string(),
                                    TAG_PAUSED_MISSING_WORKER.to_string(),
                                ],
                            },
                            Action::Move { id, to: Column::Blocked },
                        ]),
                );
                return;
            }
            // Cannot spawn without a repo mapping; fall through to pause.
        }
        let mut actions = vec![
            Action::AddTags {
                id,
                tags: vec![TAG_PAUSED.to_string(), TAG_PAUSED_MISSING_WORKER.to_string()],
            },
            Action::Move { id, to: Column::Blocked },
        ];
        if !self.repo(task).is_actionable() {
            self.needs_repo_actions(id, &mut actions);
        }
        let mut proposal = Proposal::new(
            format!("Paused WIP #{id} (paused:missing-worker) and moved to Blocked"),
            Some(id),
            1,
        );
        proposal.actions = actions;
        self.push(proposal);
    }

    // ------------------------------------------------------------------
    // Blocked-run recovery
    // ------------------------------------------------------------------

    /// A card parked in Blocked for a worker problem whose recorded run
    /// nevertheless completed moves on to Review instead of rotting.
    fn blocked_recovery_phase(&mut self) {
        for task in self.column_by_id(Column::Blocked) {
            let id = task.id;
            let parked = task.has_tag(TAG_PAUSED_MISSING_WORKER)
                || task.has_tag(TAG_PAUSED_THRASH)
                || task.has_tag(TAG_PAUSED_STALE_WORKER);
            if !parked {
                continue;
            }
            let Some(RunStatus::Complete { report, comment }) = self.reg.worker_status.get(&id)
            else {
                continue;
            };
            if !report.worker_usable() {
                continue;
            }
            let mut proposal = Proposal::new(
                format!("Moved Blocked #{id} -> Review (worker output complete)"),
                Some(id),
                1,
            );
            if !comment.trim().is_empty() {
                proposal = proposal.with(Action::PostComment { id, text: comment.clone() });
            }
            let mut remove = vec![
                TAG_REVIEW_PASS.to_string(),
                TAG_REVIEW_REWORK.to_string(),
                TAG_REVIEW_BLOCKED_WIP.to_string(),
                TAG_REVIEW_ERROR.to_string(),
                TAG_REVIEW_INFLIGHT.to_string(),
                TAG_NEEDS_REWORK.to_string(),
            ];
            remove.extend(classifier::paused_tags(&task.tags));
            proposal = proposal
                .with(Action::RemoveTags { id, tags: remove })
                .with(Action::AddTags {
                    id,
                    tags: vec![TAG_REVIEW_AUTO.to_string(), TAG_REVIEW_PENDING.to_string()],
                });
            if let Some(revision) = self.reg.patch_revisions.get(&id).cloned() {
                proposal = proposal.with(Action::RecordPatch {
                    id,
                    patch_path: report.patch_path.clone(),
                    revision,
                });
            }
            proposal = proposal
                .with(Action::Move { id, to: Column::Review })
                .with(Action::ClearEntry { kind: RunKind::Worker, id });
            self.push(proposal);
        }
    }

    // ------------------------------------------------------------------
    // Review servicing
    // ------------------------------------------------------------------

    fn review_phase(&mut self) {
        let review_tasks = self.column_sorted(Column::Review);
        for task in review_tasks {
            if self.critical_exclusive && Some(task.id) != self.active_critical {
                continue;
            }
            if task.has_tag(TAG_REVIEW_SKIP) || classifier::is_held(&task.tags) {
                continue;
            }
            self.service_review(task);
        }
    }

    fn service_review(&mut self, task: &BoardTask) {
        let id = task.id;
        let key = id.to_string();
        let rerun = task.has_tag(TAG_REVIEW_RERUN) || task.has_tag(TAG_REVIEW_RETRY);
        let current_rev = self.patch_revision(id);

        let mut stored = self.state.review_results_by_task_id.get(&key);
        if let Some(s) = stored {
            let matches = review::revision_matches(current_rev.as_deref(), s.review_revision.as_deref());
            if rerun || !matches {
                self.push(
                    Proposal::new(format!("Cleared stale review result for #{id}"), Some(id), 0)
                        .with(Action::ClearReviewResult { id }),
                );
                stored = None;
            }
        }

        let mut entry = self.state.entry(RunKind::Reviewer, id);
        if let Some(e) = entry {
            let matches =
                review::revision_matches(current_rev.as_deref(), e.review_revision.as_deref());
            if rerun || !matches {
                self.push(
                    Proposal::new(format!("Reset reviewer handle for #{id}"), Some(id), 0)
                        .with(Action::ClearEntry { kind: RunKind::Reviewer, id }),
                );
                entry = None;
            }
        }

        if rerun {
            self.push(
                Proposal::new(format!("Reset review state for #{id} (rerun requested)"), Some(id), 1)
                    .with(Action::RemoveTags {
                        id,
                        tags: vec![
                            TAG_REVIEW_PASS.to_string(),
                            TAG_REVIEW_REWORK.to_string(),
                            TAG_NEEDS_REWORK.to_string(),
                            TAG_REVIEW_ERROR.to_string(),
                            TAG_REVIEW_INFLIGHT.to_string(),
                            TAG_REVIEW_PENDING.to_string(),
                            TAG_REVIEW_RERUN.to_string(),
                            TAG_REVIEW_RETRY.to_string(),
                        ],
                    })
                    .with(Action::AddTags { id, tags: vec![TAG_REVIEW_PENDING.to_string()] })
                    .with(Action::ClearSpawnFailures { kind: RunKind::Reviewer, id }),
            );
        }

        if task.has_tag(TAG_REVIEW_PASS) && !rerun && stored.is_none() {
            // Already passed and nothing stored to act on; the next move
            // belongs to a human (or reviewAutoDone already fired).
            return;
        }

        let result: Option<ReviewResult> = match stored {
            Some(s) => Some(stored_to_result(s)),
            None if !rerun => self.reg.reviewer_results.get(&id).cloned(),
            None => None,
        };

        let Some(result) = result else {
            if entry.is_some() && self.reg.reviewer_timed_out.contains(&id) {
                self.push(
                    Proposal::new(format!("Dropped timed-out reviewer run for #{id}"), Some(id), 0)
                        .with(Action::ClearEntry { kind: RunKind::Reviewer, id }),
                );
                entry = None;
            }
            if task.has_tag(TAG_REVIEW_ERROR) && !rerun {
                // Parked; a human must request a rerun. Just keep the tag
                // set clean.
                let lingering: Vec<String> = [TAG_REVIEW_INFLIGHT, TAG_REVIEW_PENDING]
                    .iter()
                    .filter(|t| task.has_tag(t))
                    .map(|t| t.to_string())
                    .collect();
                if !lingering.is_empty() {
                    self.push(
                        Proposal::new(format!("Cleared stale review tags on parked #{id}"), Some(id), 1)
                            .with(Action::RemoveTags { id, tags: lingering }),
                    );
                }
                return;
            }
            if entry.is_none() {
                self.spawn_reviewer(task, current_rev);
            }
            return;
        };

        self.consume_review_result(task, &result, stored.is_some(), current_rev);
    }

    fn spawn_reviewer(&mut self, task: &BoardTask, current_rev: Option<String>) {
        let id = task.id;
        let failures = self
            .state
            .reviewer_spawn_failures_by_task_id
            .get(&id.to_string())
            .copied()
            .unwrap_or(0);
        if failures >= 3 {
            self.push(
                Proposal::new(
                    format!("Parked Review #{id} with review:error (spawn failed {failures}x)"),
                    Some(id),
                    1,
                )
                .with(Action::AddTags { id, tags: vec![TAG_REVIEW_ERROR.to_string()] })
                .with(Action::RemoveTags {
                    id,
                    tags: vec![TAG_REVIEW_INFLIGHT.to_string(), TAG_REVIEW_PENDING.to_string()],
                })
                .with(Action::PostComment {
                    id,
                    text: format!(
                        "Reviewer spawn failed {failures} times; parking this card with \
                         review:error. Add tag review:rerun (or review:retry) after fixing \
                         the reviewer environment."
                    ),
                })
                .with(Action::ClearSpawnFailures { kind: RunKind::Reviewer, id }),
            );
            return;
        }
        let Some(patch_path) = self.patch_path(id) else {
            self.push(
                Proposal::new(
                    format!("Parked Review #{id} with review:error (no recorded patch)"),
                    Some(id),
                    1,
                )
                .with(Action::AddTags { id, tags: vec![TAG_REVIEW_ERROR.to_string()] })
                .with(Action::RemoveTags {
                    id,
                    tags: vec![TAG_REVIEW_INFLIGHT.to_string(), TAG_REVIEW_PENDING.to_string()],
                })
                .with(Action::PostComment {
                    id,
                    text: "No recorded patch artifact for this card; a reviewer cannot be \
                           started. Move the card back through WIP (or attach a worker run) \
                           and the review will restart."
                        .to_string(),
                }),
            );
            return;
        };
        let repo = self.repo(task);
        let (repo_key, repo_path) = repo.spawn_args();
        let mut proposal =
            Proposal::new(format!("Spawned reviewer for Review #{}", id), Some(id), 1).exempt();
        if !task.has_tag(TAG_REVIEW_AUTO) {
            proposal = proposal.with(Action::AddTags { id, tags: vec![TAG_REVIEW_AUTO.to_string()] });
        }
        proposal = proposal
            .with(Action::SpawnReviewer {
                id,
                repo_key,
                repo_path,
                patch_path,
                review_revision: current_rev.unwrap_or_default(),
            })
            .with(Action::RemoveTags {
                id,
                tags: vec![TAG_REVIEW_PENDING.to_string(), TAG_REVIEW_ERROR.to_string()],
            })
            .with(Action::AddTags { id, tags: vec![TAG_REVIEW_INFLIGHT.to_string()] })
            .with(Action::ClearSpawnFailures { kind: RunKind::Reviewer, id })
            .on_failure(vec![Action::BumpSpawnFailures { kind: RunKind::Reviewer, id }]);
        self.push(proposal);
    }

    fn consume_review_result(
        &mut self,
        task: &BoardTask,
        result: &ReviewResult,
        already_stored: bool,
        current_rev: Option<String>,
    ) {
        let id = task.id;
        let outcome = review::normalize(result, self.cfg.review_threshold);

        match outcome {
            ReviewOutcome::Pass => {
                // Idempotence: a stored PASS with nothing left to do emits
                // nothing.
                if already_stored && task.has_tag(TAG_REVIEW_PASS) && !self.cfg.review_auto_done {
                    return;
                }
                let mut proposal =
                    Proposal::new(format!("Review #{id} passed"), Some(id), 1);
                if !already_stored {
                    proposal = proposal
                        .with(Action::PostComment {
                            id,
                            text: review::checklist_comment(result, self.cfg.review_threshold),
                        })
                        .with(Action::StoreReviewResult {
                            id,
                            result: review::to_stored(result, self.now),
                        });
                }
                proposal = proposal
                    .with(Action::RemoveTags {
                        id,
                        tags: vec![
                            TAG_REVIEW_PENDING.to_string(),
                            TAG_REVIEW_INFLIGHT.to_string(),
                            TAG_REVIEW_REWORK.to_string(),
                            TAG_NEEDS_REWORK.to_string(),
                            TAG_REVIEW_BLOCKED_WIP.to_string(),
                            TAG_REVIEW_ERROR.to_string(),
                        ],
                    })
                    .with(Action::AddTags { id, tags: vec![TAG_REVIEW_PASS.to_string()] })
                    .with(Action::ClearEntry { kind: RunKind::Reviewer, id });
                if self.cfg.review_auto_done {
                    if self.snap.has_docs_column {
                        proposal = proposal
                            .with(Action::RemoveTags {
                                id,
                                tags: vec![
                                    TAG_DOCS_COMPLETED.to_string(),
                                    TAG_DOCS_SKIP.to_string(),
                                    TAG_DOCS_INFLIGHT.to_string(),
                                ],
                            })
                            .with(Action::AddTags {
                                id,
                                tags: vec![TAG_DOCS_AUTO.to_string(), TAG_DOCS_PENDING.to_string()],
                            })
                            .with(Action::Move { id, to: Column::Documentation })
                            .with(Action::ClearReviewResult { id });
                        proposal.label =
                            format!("Moved Review #{id} -> Documentation (review pass)");
                    } else {
                        proposal = proposal
                            .with(Action::Move { id, to: Column::Done })
                            .with(Action::ClearReviewResult { id })
                            .with(Action::ClearPatch { id });
                        proposal.label = format!("Moved Review #{id} -> Done (review pass)");
                    }
                }
                self.push(proposal);
            }
            ReviewOutcome::Rework => {
                let already_tagged =
                    task.has_tag(TAG_REVIEW_REWORK) && task.has_tag(TAG_NEEDS_REWORK);
                if !already_stored || !already_tagged {
                    let mut proposal = Proposal::new(
                        format!(
                            "Tagged Review #{id} as review:rework (score {}, verdict {})",
                            result.score,
                            result.verdict.as_str()
                        ),
                        Some(id),
                        1,
                    );
                    if !already_stored {
                        proposal = proposal
                            .with(Action::PostComment {
                                id,
                                text: review::checklist_comment(result, self.cfg.review_threshold),
                            })
                            .with(Action::StoreReviewResult {
                                id,
                                result: review::to_stored(result, self.now),
                            });
                    }
                    proposal = proposal
                        .with(Action::RemoveTags {
                            id,
                            tags: vec![
                                TAG_REVIEW_PENDING.to_string(),
                                TAG_REVIEW_INFLIGHT.to_string(),
                                TAG_REVIEW_PASS.to_string(),
                                TAG_REVIEW_ERROR.to_string(),
                            ],
                        })
                        .with(Action::AddTags {
                            id,
                            tags: vec![TAG_REVIEW_REWORK.to_string(), TAG_NEEDS_REWORK.to_string()],
                        })
                        .with(Action::ClearEntry { kind: RunKind::Reviewer, id });
                    self.push(proposal);
                }
                self.propose_rework_move(task, result, current_rev);
            }
        }
    }

    fn propose_rework_move(
        &mut self,
        task: &BoardTask,
        result: &ReviewResult,
        current_rev: Option<String>,
    ) {
        let id = task.id;
        let revision = current_rev
            .or_else(|| result.review_revision.clone())
            .unwrap_or_default();
        let history = self
            .state
            .review_rework_history_by_task_id
            .get(&id.to_string())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let same_rev_reworks =
            guards::reworks_for_revision(history, &revision, self.now, self.cfg.thrash_window_min);
        if self.cfg.max_reworks_per_revision > 0
            && same_rev_reworks >= self.cfg.max_reworks_per_revision as usize
        {
            self.push(
                Proposal::new(
                    format!("Kept Review #{id} in Backlog (blocked:thrash: same patch keeps failing review)"),
                    Some(id),
                    1,
                )
                .with(Action::RemoveTags {
                    id,
                    tags: vec![
                        TAG_REVIEW_PENDING.to_string(),
                        TAG_REVIEW_INFLIGHT.to_string(),
                        TAG_REVIEW_PASS.to_string(),
                        TAG_REVIEW_REWORK.to_string(),
                        TAG_NEEDS_REWORK.to_string(),
                        TAG_REVIEW_BLOCKED_WIP.to_string(),
                        TAG_REVIEW_ERROR.to_string(),
                        TAG_REVIEW_RERUN.to_string(),
                        TAG_REVIEW_RETRY.to_string(),
                    ],
                })
                .with(Action::Move { id, to: Column::Backlog })
                .with(Action::AddTags { id, tags: vec![TAG_BLOCKED_THRASH.to_string()] })
                .with(Action::ClearReviewResult { id })
                .with(Action::ClearPatch { id }),
            );
            return;
        }

        let critical = classifier::is_critical(&task.tags);
        if self.sim_active_wip < self.cfg.wip_limit || critical {
            self.push(
                Proposal::new(format!("Moved Review #{id} -> WIP (rework)"), Some(id), 1)
                    .with(Action::RecordRework {
                        id,
                        revision,
                        score: result.score,
                        verdict: result.verdict,
                    })
                    .with(Action::RemoveTags {
                        id,
                        tags: vec![
                            TAG_REVIEW_BLOCKED_WIP.to_string(),
                            TAG_REVIEW_PASS.to_string(),
                            TAG_REVIEW_PENDING.to_string(),
                            TAG_REVIEW_INFLIGHT.to_string(),
                            TAG_REVIEW_REWORK.to_string(),
                            TAG_NEEDS_REWORK.to_string(),
                        ],
                    })
                    .with(Action::Move { id, to: Column::Wip })
                    .with(Action::ClearReviewResult { id })
                    .with(Action::ClearPatch { id }),
            );
            self.sim_active_wip += 1;
        } else if !task.has_tag(TAG_REVIEW_BLOCKED_WIP) {
            self.push(
                Proposal::new(
                    format!("Tagged Review #{id} as review:blocked:wip (waiting for WIP capacity)"),
                    Some(id),
                    1,
                )
                .with(Action::AddTags { id, tags: vec![TAG_REVIEW_BLOCKED_WIP.to_string()] }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Documentation servicing
    // ------------------------------------------------------------------

    fn docs_phase(&mut self) {
        if !self.snap.has_docs_column {
            return;
        }
        let mut docs_inflight: u32 = 0;
        for (key, _entry) in &self.state.docs_by_task_id {
            if let Ok(id) = key.parse::<i64>() {
                if matches!(self.reg.docs_status.get(&id), Some(RunStatus::Running) | None) {
                    docs_inflight += 1;
                }
            }
        }
        for task in self.column_sorted(Column::Documentation) {
            if self.critical_exclusive && Some(task.id) != self.active_critical {
                continue;
            }
            if classifier::is_held(&task.tags) {
                continue;
            }
            self.service_docs(task, &mut docs_inflight);
        }
    }

    fn service_docs(&mut self, task: &BoardTask, docs_inflight: &mut u32) {
        let id = task.id;
        if task.has_tag(TAG_DOCS_RETRY) {
            self.push(
                Proposal::new(format!("Cleared docs:error for #{id} (docs:retry)"), Some(id), 1)
                    .with(Action::RemoveTags {
                        id,
                        tags: vec![TAG_DOCS_ERROR.to_string(), TAG_DOCS_RETRY.to_string()],
                    })
                    .with(Action::AddTags { id, tags: vec![TAG_DOCS_PENDING.to_string()] })
                    .with(Action::ClearSpawnFailures { kind: RunKind::Docs, id }),
            );
            return;
        }
        if task.has_tag(TAG_DOCS_COMPLETED) || task.has_tag(TAG_DOCS_SKIP) {
            self.push(
                Proposal::new(format!("Moved Documentation #{id} -> Done (docs complete)"), Some(id), 1)
                    .with(Action::RemoveTags {
                        id,
                        tags: vec![TAG_DOCS_PENDING.to_string(), TAG_DOCS_INFLIGHT.to_string()],
                    })
                    .with(Action::Move { id, to: Column::Done })
                    .with(Action::ClearEntry { kind: RunKind::Docs, id })
                    .with(Action::ClearPatch { id })
                    .with(Action::ClearReviewResult { id }),
            );
            return;
        }

        if self.state.entry(RunKind::Docs, id).is_some() {
            let status = self.reg.docs_status.get(&id).cloned().unwrap_or(RunStatus::Running);
            match status {
                RunStatus::Complete { report, comment } if report.docs_usable() => {
                    let result_tag = if report.patch_bytes > 0 {
                        TAG_DOCS_COMPLETED
                    } else {
                        TAG_DOCS_SKIP
                    };
                    let mut proposal = Proposal::new(
                        format!("Moved Documentation #{id} -> Done ({result_tag}; docs worker complete)"),
                        Some(id),
                        1,
                    )
                    .with(Action::AddTags { id, tags: vec![result_tag.to_string()] })
                    .with(Action::RemoveTags {
                        id,
                        tags: vec![
                            TAG_DOCS_PENDING.to_string(),
                            TAG_DOCS_INFLIGHT.to_string(),
                            TAG_DOCS_ERROR.to_string(),
                            TAG_DOCS_RETRY.to_string(),
                        ],
                    });
                    if !comment.trim().is_empty() {
                        proposal = proposal.with(Action::PostComment { id, text: comment });
                    }
                    proposal = proposal
                        .with(Action::Move { id, to: Column::Done })
                        .with(Action::ClearEntry { kind: RunKind::Docs, id })
                        .with(Action::ClearPatch { id })
                        .with(Action::ClearReviewResult { id });
                    self.push(proposal);
                }
                RunStatus::Complete { .. } | RunStatus::Invalid { .. } => {
                    self.push(
                        Proposal::new(
                            format!("Tagged Documentation #{id} as docs:error (docs worker output unusable)"),
                            Some(id),
                            1,
                        )
                        .with(Action::AddTags { id, tags: vec![TAG_DOCS_ERROR.to_string()] })
                        .with(Action::RemoveTags {
                            id,
                            tags: vec![
                                TAG_DOCS_PENDING.to_string(),
                                TAG_DOCS_INFLIGHT.to_string(),
                                TAG_DOCS_RETRY.to_string(),
                            ],
                        })
                        .with(Action::PostComment {
                            id,
                            text: "Docs worker finished without usable artifacts; parked with \
                                   docs:error. Add tag docs:retry after fixing the docs worker \
                                   environment."
                                .to_string(),
                        })
                        .with(Action::ClearEntry { kind: RunKind::Docs, id }),
                    );
                }
                RunStatus::Running => {
                    if self.reg.docs_timed_out.contains(&id) {
                        let restarts = self
                            .state
                            .docs_timeout_restarts_by_task_id
                            .get(&id.to_string())
                            .copied()
                            .unwrap_or(0);
                        if restarts + 1 >= 3 {
                            self.push(
                                Proposal::new(
                                    format!("Tagged Documentation #{id} as docs:error (docs worker hung {}x)", restarts + 1),
                                    Some(id),
                                    1,
                                )
                                .with(Action::AddTags { id, tags: vec![TAG_DOCS_ERROR.to_string()] })
                                .with(Action::RemoveTags {
                                    id,
                                    tags: vec![
                                        TAG_DOCS_PENDING.to_string(),
                                        TAG_DOCS_INFLIGHT.to_string(),
                                    ],
                                })
                                .with(Action::PostComment {
                                    id,
                                    text: "Docs worker hung repeatedly (no done.json before the \
                                           run timeout); parked with docs:error. Add tag \
                                           docs:retry to try again."
                                        .to_string(),
                                })
                                .with(Action::BumpDocsTimeoutRestarts { id })
                                .with(Action::ClearEntry { kind: RunKind::Docs, id }),
                            );
                        } else {
                            self.push(
                                Proposal::new(
                                    format!("Restarted stale docs worker for Documentation #{id}"),
                                    Some(id),
                                    1,
                                )
                                .with(Action::ClearEntry { kind: RunKind::Docs, id })
                                .with(Action::RemoveTags {
                                    id,
                                    tags: vec![TAG_DOCS_INFLIGHT.to_string()],
                                })
                                .with(Action::AddTags { id, tags: vec![TAG_DOCS_PENDING.to_string()] })
                                .with(Action::BumpDocsTimeoutRestarts { id }),
                            );
                        }
                    }
                }
            }
            return;
        }

        let pending = task.has_tag(TAG_DOCS_PENDING);
        let auto = task.has_tag(TAG_DOCS_AUTO);
        let errored = task.has_tag(TAG_DOCS_ERROR);
        if auto && pending && !errored {
            if *docs_inflight >= self.cfg.docs_wip_limit {
                return;
            }
            let failures = self
                .state
                .docs_spawn_failures_by_task_id
                .get(&id.to_string())
                .copied()
                .unwrap_or(0);
            if failures >= 3 {
                self.push(
                    Proposal::new(
                        format!("Parked Documentation #{id} with docs:error (spawn failed {failures}x)"),
                        Some(id),
                        1,
                    )
                    .with(Action::AddTags { id, tags: vec![TAG_DOCS_ERROR.to_string()] })
                    .with(Action::RemoveTags {
                        id,
                        tags: vec![TAG_DOCS_PENDING.to_string(), TAG_DOCS_INFLIGHT.to_string()],
                    })
                    .with(Action::PostComment {
                        id,
                        text: format!(
                            "Docs worker spawn failed {failures} times; parking this card with \
                             docs:error. Add tag docs:retry after fixing the docs worker \
                             environment."
                        ),
                    })
                    .with(Action::ClearSpawnFailures { kind: RunKind::Docs, id }),
                );
                return;
            }
            let repo = self.repo(task);
            if !repo.is_actionable() {
                self.push(
                    Proposal::new(
                        format!("Tagged Documentation #{id} as docs:error (no source repo mapping)"),
                        Some(id),
                        1,
                    )
                    .with(Action::AddTags { id, tags: vec![TAG_DOCS_ERROR.to_string()] })
                    .with(Action::RemoveTags {
                        id,
                        tags: vec![
                            TAG_DOCS_PENDING.to_string(),
                            TAG_DOCS_INFLIGHT.to_string(),
                            TAG_DOCS_RETRY.to_string(),
                        ],
                    })
                    .with(Action::PostComment {
                        id,
                        text: "Docs automation cannot resolve the source repo mapping for this \
                               card. Fix the repo mapping (repo:<key> tag or Repo: line), then \
                               add docs:retry."
                            .to_string(),
                    }),
                );
                return;
            }
            let (repo_key, repo_path) = repo.spawn_args();
            let patch_path = self.patch_path(id).unwrap_or_default();
            self.push(
                Proposal::new(format!("Spawned docs worker for Documentation #{id}"), Some(id), 1)
                    .exempt()
                    .with(Action::SpawnDocs { id, repo_key, repo_path, patch_path })
                    .with(Action::RemoveTags { id, tags: vec![TAG_DOCS_PENDING.to_string()] })
                    .with(Action::AddTags { id, tags: vec![TAG_DOCS_INFLIGHT.to_string()] })
                    .with(Action::ClearSpawnFailures { kind: RunKind::Docs, id })
                    .on_failure(vec![Action::BumpSpawnFailures { kind: RunKind::Docs, id }]),
            );
            *docs_inflight += 1;
            return;
        }
        if !errored && !pending && !task.has_tag(TAG_DOCS_INFLIGHT) {
            self.push(
                Proposal::new(format!("Tagged Documentation #{id} as docs:pending"), Some(id), 1)
                    .with(Action::AddTags {
                        id,
                        tags: vec![TAG_DOCS_AUTO.to_string(), TAG_DOCS_PENDING.to_string()],
                    }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Auto-heal
    // ------------------------------------------------------------------

    fn auto_heal_phase(&mut self) {
        let mut candidates = self.column_sorted(Column::Blocked);
        candidates.extend(self.column_sorted(Column::Backlog));
        for task in candidates {
            let id = task.id;
            if !task.has_tag(TAG_AUTO_BLOCKED) {
                continue;
            }
            let reason_tags: Vec<&str> = [TAG_BLOCKED_DEPS, TAG_BLOCKED_EXCLUSIVE, TAG_BLOCKED_REPO]
                .into_iter()
                .filter(|t| task.has_tag(t))
                .collect();
            if reason_tags.is_empty() {
                continue;
            }
            if classifier::is_hard_hold(&task.tags) {
                continue;
            }
            // A pause reason other than the blocked tags keeps the card put.
            if !classifier::paused_tags(&task.tags).is_empty() {
                continue;
            }
            if !self.cooled(id) {
                continue;
            }
            if !self.unmet_dependencies(task).is_empty() {
                continue;
            }
            let keys = classifier::parse_exclusive_keys(&task.tags, &task.description);
            if keys.iter().any(|k| self.sim_wip_keys.contains(k)) {
                continue;
            }
            if !self.repo(task).is_actionable() {
                continue;
            }
            let mut proposal = Proposal::new(
                format!("Auto-healed #{id} -> Ready (blocked reason cleared)"),
                Some(id),
                1,
            )
            .with(Action::Move { id, to: Column::Ready })
            .with(Action::RemoveTags {
                id,
                tags: vec![
                    TAG_AUTO_BLOCKED.to_string(),
                    TAG_BLOCKED_DEPS.to_string(),
                    TAG_BLOCKED_EXCLUSIVE.to_string(),
                    TAG_BLOCKED_REPO.to_string(),
                ],
            })
            .with(Action::ClearAutoBlocked { id });
            proposal.cooldown_exempt = false;
            self.push(proposal);
            self.sim_healed.push(id);
        }
    }

    // ------------------------------------------------------------------
    // Promotion
    // ------------------------------------------------------------------

    fn promotion_phase(&mut self) {
        if self.critical_exclusive {
            return;
        }
        let snap = self.snap;
        let mut ready: Vec<&'a BoardTask> = self.column_sorted(Column::Ready);
        let healed_ids: Vec<i64> = self.sim_healed.clone();
        ready.extend(healed_ids.iter().filter_map(|id| snap.get(*id)));

        if ready.is_empty() {
            if let Some(promoted) = self.fill_ready() {
                ready.push(promoted);
            }
        }

        let mut idx = 0;
        while self.sim_active_wip < self.cfg.wip_limit && idx < ready.len() {
            let task = ready[idx];
            idx += 1;
            let id = task.id;
            // Auto-healed tasks still carry their blocked tags in this
            // snapshot; the heal proposal removes them before these apply.
            let healed = healed_ids.contains(&id);
            if (!healed && classifier::is_held(&task.tags)) || classifier::is_epic(task) {
                continue;
            }
            let unmet = self.unmet_dependencies(task);
            if !unmet.is_empty() {
                if !self.cooled(id) {
                    continue;
                }
                let deps = unmet
                    .iter()
                    .map(|d| format!("#{d}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let mut proposal = Proposal::new(
                    format!("Moved Ready #{id} -> Backlog (blocked:deps: depends on {deps})"),
                    Some(id),
                    1,
                )
                .with(Action::Move { id, to: Column::Backlog })
                .with(Action::AddTags {
                    id,
                    tags: vec![TAG_BLOCKED_DEPS.to_string(), TAG_AUTO_BLOCKED.to_string()],
                })
                .with(Action::MarkAutoBlocked {
                    id,
                    reason: format!("depends on {deps}"),
                });
                proposal.cooldown_exempt = false;
                self.push(proposal);
                continue;
            }
            let keys = classifier::parse_exclusive_keys(&task.tags, &task.description);
            if keys.iter().any(|k| self.sim_wip_keys.contains(k)) {
                // Exclusive conflict: leave in Ready, try again once the key
                // frees up.
                continue;
            }
            let repo = self.repo(task);
            if !repo.is_actionable() {
                if !self.cooled(id) {
                    continue;
                }
                let mut actions = vec![
                    Action::Move { id, to: Column::Backlog },
                    Action::AddTags {
                        id,
                        tags: vec![TAG_BLOCKED_REPO.to_string(), TAG_AUTO_BLOCKED.to_string()],
                    },
                    Action::MarkAutoBlocked { id, reason: "no repo mapping".to_string() },
                ];
                self.needs_repo_actions(id, &mut actions);
                let mut proposal = Proposal::new(
                    format!("Moved Ready #{id} -> Backlog (blocked:repo: no repo mapping)"),
                    Some(id),
                    1,
                );
                proposal.actions = actions;
                proposal.cooldown_exempt = false;
                self.push(proposal);
                continue;
            }
            if !self.respawn_allowed(id) {
                self.push(
                    Proposal::new(
                        format!("Paused Ready #{id} (paused:thrash: worker respawn thrash)"),
                        Some(id),
                        1,
                    )
                    .with(Action::AddTags {
                        id,
                        tags: vec![TAG_PAUSED.to_string(), TAG_PAUSED_THRASH.to_string()],
                    })
                    .with(Action::Move { id, to: Column::Blocked }),
                );
                continue;
            }
            let (repo_key, repo_path) = repo.spawn_args();
            self.push(
                Proposal::new(format!("Moved Ready #{id} -> WIP"), Some(id), 1)
                    .exempt()
                    .with(Action::SpawnWorker { id, repo_key, repo_path })
                    .with(Action::Move { id, to: Column::Wip })
                    .on_failure(vec![Action::AddTags {
                        id,
                        tags: vec![TAG_PAUSED.to_string(), TAG_PAUSED_MISSING_WORKER.to_string()],
                    }]),
            );
            self.sim_active_wip += 1;
            for key in keys {
                self.sim_wip_keys.insert(key);
            }
        }
    }

    /// Promote the top actionable Backlog task into Ready. Returns it when a
    /// promotion was proposed. Falls back to tagging the first blocked
    /// candidate or ensuring an epic breakdown card exists.
    fn fill_ready(&mut self) -> Option<&'a BoardTask> {
        let backlog = self.column_sorted(Column::Backlog);
        let mut first_epic: Option<&'a BoardTask> = None;
        let mut blocked: Option<(&'a BoardTask, String, &'static str)> = None;

        for &task in &backlog {
            let id = task.id;
            if classifier::is_held(&task.tags) {
                continue;
            }
            if classifier::is_epic(task) {
                if first_epic.is_none() {
                    first_epic = Some(task);
                }
                continue;
            }
            if !self.cooled(id) {
                continue;
            }
            let unmet = self.unmet_dependencies(task);
            if !unmet.is_empty() {
                if blocked.is_none() {
                    let deps = unmet
                        .iter()
                        .map(|d| format!("#{d}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    blocked = Some((task, format!("depends on {deps}"), TAG_BLOCKED_DEPS));
                }
                continue;
            }
            let keys = classifier::parse_exclusive_keys(&task.tags, &task.description);
            if keys.iter().any(|k| self.sim_wip_keys.contains(k)) {
                if blocked.is_none() {
                    blocked = Some((task, "exclusive conflict".to_string(), TAG_BLOCKED_EXCLUSIVE));
                }
                continue;
            }
            if !self.repo(task).is_actionable() {
                if blocked.is_none() {
                    blocked = Some((task, "no repo mapping".to_string(), TAG_BLOCKED_REPO));
                }
                continue;
            }
            let mut proposal =
                Proposal::new(format!("Promoted Backlog #{id} -> Ready"), Some(id), 1)
                    .with(Action::Move { id, to: Column::Ready });
            proposal.cooldown_exempt = false;
            self.push(proposal);
            return Some(task);
        }

        if let Some((task, reason, tag)) = blocked {
            let id = task.id;
            if !task.has_tag(tag) {
                let mut actions = vec![
                    Action::AddTags {
                        id,
                        tags: vec![tag.to_string(), TAG_AUTO_BLOCKED.to_string()],
                    },
                    Action::MarkAutoBlocked { id, reason: reason.clone() },
                ];
                if tag == TAG_BLOCKED_REPO {
                    self.needs_repo_actions(id, &mut actions);
                }
                let mut proposal = Proposal::new(
                    format!("Kept Backlog #{id} in Backlog ({tag}: {reason})"),
                    Some(id),
                    1,
                );
                proposal.actions = actions;
                proposal.cooldown_exempt = false;
                self.push(proposal);
            }
            return None;
        }

        if let Some(epic) = first_epic {
            self.ensure_epic_breakdown(epic);
        }
        None
    }

    fn ensure_epic_breakdown(&mut self, epic: &BoardTask) {
        let title = format!("Break down epic #{}: {}", epic.id, epic.title.trim());
        let exists = self
            .snap
            .tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.column,
                    Column::Backlog | Column::Ready | Column::Wip | Column::Review
                )
            })
            .any(|t| t.title.trim() == title);
        if exists {
            return;
        }
        self.push(
            Proposal::new(
                format!("Created breakdown task for epic #{}", epic.id),
                None,
                1,
            )
            .with(Action::CreateTask {
                column: Column::Backlog,
                title: title.clone(),
                description: format!(
                    "Breakdown for epic #{}: {}\n\nEpic: #{}",
                    epic.id,
                    epic.title.trim(),
                    epic.id
                ),
                tags: vec![TAG_STORY.to_string(), TAG_EPIC_CHILD.to_string()],
            }),
        );
    }
}

fn stored_to_result(stored: &crate::state::StoredReview) -> ReviewResult {
    let verdict = match stored.verdict.to_ascii_uppercase().as_str() {
        "PASS" => Verdict::Pass,
        "BLOCKER" => Verdict::Blocker,
        _ => Verdict::Rework,
    };
    ReviewResult {
        score: stored.score,
        verdict,
        critical_items: stored.critical_items.clone(),
        notes: stored.notes.clone(),
        review_revision: stored.review_revision.clone(),
    }
}

/// Map a proposal stream to (task ids, labels) for quick assertions.
#[cfg(test)]
pub fn labels(proposals: &[Proposal]) -> Vec<String> {
    proposals.iter().map(|p| p.label.clone()).collect()
}
