//! One reconciler tick.
//!
//! Acquire the tick lock (abort on contention), snapshot the board, load
//! state, materialize run artifacts, run the pure policy, clamp the
//! proposals to the action budget and per-task cooldown, apply them,
//! persist, heartbeat. Board failures on individual actions degrade to
//! `errors[]` entries; a failed state persist aborts the tick.

use std::fs;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::guards;
use crate::core::policy::{self, PolicyInput};
use crate::core::types::{Action, Column, Proposal, Snapshot, TickReport};
use crate::io::board::Board;
use crate::io::config::Config;
use crate::io::heartbeat::{Heartbeat, write_heartbeat};
use crate::io::lock;
use crate::io::notify::Notifier;
use crate::io::repo_map;
use crate::io::runs;
use crate::io::spawn::{SpawnRequest, Spawner, entry_from_handshake};
use crate::io::state_store::{load_state, save_state};
use crate::state::{PausedByCritical, RepoRecord, ReworkAttempt, RunKind, StateDoc};

/// Result of one tick invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Completed(TickReport),
    /// Another reconciler holds the tick lock; nothing was touched.
    LockContention,
}

/// Run a single reconciler tick.
#[instrument(skip_all)]
pub fn run_tick<B: Board, S: Spawner>(
    board: &B,
    spawner: &S,
    config: &Config,
) -> Result<TickOutcome> {
    let now = crate::now_ms();
    let tick_id = runs::mint_run_id(now);

    let Some(_lock) = lock::acquire(
        &config.lock_path(),
        config.lock_strategy,
        config.lock_wait_ms,
        &tick_id,
        now,
    )?
    else {
        return Ok(TickOutcome::LockContention);
    };

    let mut state = load_state(&config.state_path(), config.first_run_dry_runs);

    // Self-healing repo map: discovered checkouts, explicit file, persisted.
    let discovered = repo_map::discover_repo_map(&config.repo_root);
    let from_file = repo_map::load_repo_map_file(&config.repo_map_path);
    let merged = repo_map::merge_repo_maps(&[&discovered, &from_file, &state.repo_map]);
    if !merged.is_empty() {
        state.repo_map = merged;
    }

    let snapshot = board.snapshot().context("board snapshot")?;
    prune_state(&mut state, &snapshot);

    let registry = runs::materialize(&snapshot, &state, config, now);
    let proposals = policy::plan(&PolicyInput {
        snapshot: &snapshot,
        state: &state,
        registry: &registry,
        config: &config.policy(),
        now_ms: now,
    });

    let dry_run = state.dry_run;
    let mut report = TickReport {
        mode: if dry_run { "DRY_RUN" } else { "LIVE" }.to_string(),
        ..TickReport::default()
    };

    apply_proposals(
        board,
        spawner,
        config,
        &mut state,
        proposals,
        now,
        dry_run,
        &mut report,
    );

    if dry_run && state.dry_run_runs_remaining > 0 {
        state.dry_run_runs_remaining -= 1;
        if state.dry_run_runs_remaining == 0 {
            state.dry_run = false;
            info!("dry-run complete; orchestrator armed");
        }
    }

    for history in state.review_rework_history_by_task_id.values_mut() {
        guards::prune_rework_history(history, now, config.thrash_window_min);
    }

    let notifier = Notifier::new(
        &config.notify_cmd,
        &config.notify_deny_targets,
        config.notify_dedup_seconds,
    );
    notifier.notify(&mut state, &report.actions, &report.errors, now / 1000);

    // Persist before anything else depends on the new truth; a failure here
    // aborts the tick and leaves the heartbeat stale for the guardian.
    save_state(&config.state_path(), &state).context("persist state")?;

    let heartbeat = Heartbeat::now("tick", config.tick_seconds, crate::now_ms());
    write_heartbeat(&config.heartbeat_path(), &heartbeat).context("write heartbeat")?;

    Ok(TickOutcome::Completed(report))
}

/// Drop bookkeeping for tasks that left the columns it belongs to.
fn prune_state(state: &mut StateDoc, snapshot: &Snapshot) {
    let column_of = |key: &str| -> Option<Column> {
        key.parse::<i64>().ok().and_then(|id| snapshot.get(id)).map(|t| t.column)
    };
    state
        .workers_by_task_id
        .retain(|k, _| matches!(column_of(k), Some(Column::Wip | Column::Blocked)));
    state
        .reviewers_by_task_id
        .retain(|k, _| matches!(column_of(k), Some(Column::Review)));
    state
        .docs_by_task_id
        .retain(|k, _| matches!(column_of(k), Some(Column::Documentation)));
    state
        .review_results_by_task_id
        .retain(|k, _| matches!(column_of(k), Some(Column::Review)));
    state
        .reviewer_spawn_failures_by_task_id
        .retain(|k, _| matches!(column_of(k), Some(Column::Review)));
    state
        .docs_spawn_failures_by_task_id
        .retain(|k, _| matches!(column_of(k), Some(Column::Documentation)));
    state
        .docs_timeout_restarts_by_task_id
        .retain(|k, _| matches!(column_of(k), Some(Column::Documentation)));
    state
        .patches_by_task_id
        .retain(|k, _| !matches!(column_of(k), Some(Column::Done) | None));
    state
        .auto_blocked_by_orchestrator
        .retain(|k, _| matches!(column_of(k), Some(Column::Blocked | Column::Backlog)));
}

#[allow(clippy::too_many_arguments)]
fn apply_proposals<B: Board, S: Spawner>(
    board: &B,
    spawner: &S,
    config: &Config,
    state: &mut StateDoc,
    proposals: Vec<Proposal>,
    now: i64,
    dry_run: bool,
    report: &mut TickReport,
) {
    let started = std::time::Instant::now();
    let deadline = std::time::Duration::from_millis(config.tick_budget_ms.max(1));
    let mut budget = config.action_budget;
    // Cooldown decisions use the timestamps as of the start of the tick, so
    // Backlog -> Ready -> WIP can happen within a single tick.
    let last_actions_prev = state.last_actions_by_task_id.clone();

    for proposal in proposals {
        if started.elapsed() >= deadline {
            report
                .errors
                .push("tick budget exceeded; remaining proposals surrendered".to_string());
            break;
        }
        if !proposal.cooldown_exempt {
            if let Some(id) = proposal.task_id {
                let last = last_actions_prev.get(&id.to_string()).copied();
                if !guards::cooled(last, now, config.cooldown_min) {
                    continue;
                }
            }
        }
        if proposal.cost > 0 && budget == 0 {
            continue;
        }

        if dry_run {
            report.actions.push(format!("Would: {}", proposal.label));
            budget = budget.saturating_sub(proposal.cost);
            continue;
        }

        let applied = apply_actions(board, spawner, config, state, &proposal, now, report);
        if proposal.cost > 0 {
            if let Some(id) = proposal.task_id {
                state.last_actions_by_task_id.insert(id.to_string(), now);
            }
        }
        match applied {
            AppliedProposal::Completed => report.actions.push(proposal.label),
            AppliedProposal::Aborted(why) => {
                report.actions.push(format!("{} ({why})", proposal.label));
            }
        }
        budget = budget.saturating_sub(proposal.cost);
    }
}

enum AppliedProposal {
    Completed,
    /// The proposal stopped early; the suffix says why.
    Aborted(&'static str),
}

fn apply_actions<B: Board, S: Spawner>(
    board: &B,
    spawner: &S,
    config: &Config,
    state: &mut StateDoc,
    proposal: &Proposal,
    now: i64,
    report: &mut TickReport,
) -> AppliedProposal {
    // Entries recorded while applying this proposal; reversed if a later
    // board move in the same proposal fails (promotion + record are one
    // logical step).
    let mut recorded: Vec<(RunKind, i64)> = Vec::new();

    for action in &proposal.actions {
        match apply_action(board, spawner, config, state, action, now, report) {
            ActionResult::Ok => {}
            ActionResult::BoardFailed(err) => {
                warn!(label = %proposal.label, %err, "board action failed; continuing");
                report.errors.push(format!("{}: {err:#}", proposal.label));
                if matches!(action, Action::Move { .. }) && !recorded.is_empty() {
                    // The move half of a spawn+move step failed; reverse the
                    // recorded entry so the task stays eligible next tick.
                    for (kind, id) in recorded.drain(..) {
                        state.entries_mut(kind).remove(&id.to_string());
                    }
                    return AppliedProposal::Aborted("move failed; spawn reversed");
                }
            }
            ActionResult::Recorded(kind, id) => recorded.push((kind, id)),
            ActionResult::SpawnFailed(err) => {
                warn!(label = %proposal.label, %err, "spawn failed");
                report.errors.push(format!("{}: spawn failed: {err:#}", proposal.label));
                for failure_action in &proposal.on_spawn_failure {
                    if let ActionResult::BoardFailed(err) =
                        apply_action(board, spawner, config, state, failure_action, now, report)
                    {
                        report.errors.push(format!("{}: {err:#}", proposal.label));
                    }
                }
                return AppliedProposal::Aborted("spawn failed");
            }
        }
    }
    AppliedProposal::Completed
}

enum ActionResult {
    Ok,
    Recorded(RunKind, i64),
    BoardFailed(anyhow::Error),
    SpawnFailed(anyhow::Error),
}

fn apply_action<B: Board, S: Spawner>(
    board: &B,
    spawner: &S,
    config: &Config,
    state: &mut StateDoc,
    action: &Action,
    now: i64,
    report: &mut TickReport,
) -> ActionResult {
    match action {
        Action::Move { id, to } => match board.move_task(*id, *to) {
            Ok(()) => {
                match to {
                    Column::Ready => report.promoted_to_ready.push(*id),
                    Column::Wip => report.moved_to_wip.push(*id),
                    _ => {}
                }
                ActionResult::Ok
            }
            Err(err) => ActionResult::BoardFailed(err),
        },
        Action::AddTags { id, tags } => match board.add_tags(*id, tags) {
            Ok(()) => ActionResult::Ok,
            Err(err) => ActionResult::BoardFailed(err),
        },
        Action::RemoveTags { id, tags } => match board.remove_tags(*id, tags) {
            Ok(()) => ActionResult::Ok,
            Err(err) => ActionResult::BoardFailed(err),
        },
        Action::PostComment { id, text } => match board.post_comment(*id, text) {
            Ok(()) => ActionResult::Ok,
            Err(err) => ActionResult::BoardFailed(err),
        },
        Action::CreateTask { column, title, description, tags } => {
            match board.create_task(*column, title, description, tags) {
                Ok(id) => {
                    report.created_tasks.push(id);
                    ActionResult::Ok
                }
                Err(err) => ActionResult::BoardFailed(err),
            }
        }
        Action::SpawnWorker { id, repo_key, repo_path } => spawn_run(
            spawner,
            config,
            state,
            RunKind::Worker,
            *id,
            repo_key,
            repo_path,
            "",
            "",
            now,
        ),
        Action::SpawnReviewer { id, repo_key, repo_path, patch_path, review_revision } => {
            spawn_run(
                spawner,
                config,
                state,
                RunKind::Reviewer,
                *id,
                repo_key,
                repo_path,
                patch_path,
                review_revision,
                now,
            )
        }
        Action::SpawnDocs { id, repo_key, repo_path, patch_path } => spawn_run(
            spawner,
            config,
            state,
            RunKind::Docs,
            *id,
            repo_key,
            repo_path,
            patch_path,
            "",
            now,
        ),
        Action::ClearEntry { kind, id } => {
            state.entries_mut(*kind).remove(&id.to_string());
            ActionResult::Ok
        }
        Action::RecordPatch { id, patch_path, revision } => {
            state.patches_by_task_id.insert(
                id.to_string(),
                crate::state::PatchRecord {
                    patch_path: patch_path.clone(),
                    revision: revision.clone(),
                    recorded_at_ms: now,
                },
            );
            ActionResult::Ok
        }
        Action::ClearPatch { id } => {
            state.patches_by_task_id.remove(&id.to_string());
            ActionResult::Ok
        }
        Action::StoreReviewResult { id, result } => {
            state
                .review_results_by_task_id
                .insert(id.to_string(), result.clone());
            ActionResult::Ok
        }
        Action::ClearReviewResult { id } => {
            state.review_results_by_task_id.remove(&id.to_string());
            ActionResult::Ok
        }
        Action::RecordRework { id, revision, score, verdict } => {
            state
                .review_rework_history_by_task_id
                .entry(id.to_string())
                .or_default()
                .push(ReworkAttempt {
                    at_ms: now,
                    review_revision: revision.clone(),
                    score: *score,
                    verdict: verdict.as_str().to_string(),
                });
            ActionResult::Ok
        }
        Action::PauseForCritical { id, critical_id, added_paused } => {
            state.paused_by_critical.insert(
                id.to_string(),
                PausedByCritical {
                    critical_task_id: *critical_id,
                    paused_at_ms: now,
                    added_paused: *added_paused,
                },
            );
            ActionResult::Ok
        }
        Action::ResumeFromCritical { id, .. } => {
            state.paused_by_critical.remove(&id.to_string());
            ActionResult::Ok
        }
        Action::MarkAutoBlocked { id, reason } => {
            state
                .auto_blocked_by_orchestrator
                .insert(id.to_string(), reason.clone());
            ActionResult::Ok
        }
        Action::ClearAutoBlocked { id } => {
            state.auto_blocked_by_orchestrator.remove(&id.to_string());
            ActionResult::Ok
        }
        Action::MarkRepoCommented { id } => {
            state.repo_comment_by_task_id.insert(id.to_string(), now);
            ActionResult::Ok
        }
        Action::BumpSpawnFailures { kind, id } => {
            let map = match kind {
                RunKind::Reviewer => &mut state.reviewer_spawn_failures_by_task_id,
                _ => &mut state.docs_spawn_failures_by_task_id,
            };
            *map.entry(id.to_string()).or_insert(0) += 1;
            ActionResult::Ok
        }
        Action::ClearSpawnFailures { kind, id } => {
            let map = match kind {
                RunKind::Reviewer => &mut state.reviewer_spawn_failures_by_task_id,
                _ => &mut state.docs_spawn_failures_by_task_id,
            };
            map.remove(&id.to_string());
            ActionResult::Ok
        }
        Action::BumpDocsTimeoutRestarts { id } => {
            *state
                .docs_timeout_restarts_by_task_id
                .entry(id.to_string())
                .or_insert(0) += 1;
            ActionResult::Ok
        }
        Action::NotifyBlocker { id: _, message } => {
            report.errors.push(message.clone());
            ActionResult::Ok
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_run<S: Spawner>(
    spawner: &S,
    config: &Config,
    state: &mut StateDoc,
    kind: RunKind,
    id: i64,
    repo_key: &str,
    repo_path: &str,
    patch_path: &str,
    review_revision: &str,
    now: i64,
) -> ActionResult {
    let run_id = runs::mint_run_id(now);
    if state.run_id_in_use(&run_id) {
        return ActionResult::SpawnFailed(anyhow::anyhow!("run id {run_id} already recorded"));
    }
    let run_dir = runs::run_dir(&config.runs_root, kind, id, &run_id);
    if let Err(err) = fs::create_dir_all(&run_dir) {
        return ActionResult::SpawnFailed(anyhow::anyhow!(
            "create run dir {}: {err}",
            run_dir.display()
        ));
    }
    let request = SpawnRequest {
        kind,
        task_id: id,
        repo_key: repo_key.to_string(),
        repo_path: repo_path.to_string(),
        patch_path: patch_path.to_string(),
        review_revision: review_revision.to_string(),
        run_id,
        run_dir,
    };
    match spawner.spawn(&request) {
        Ok(handshake) => {
            let entry = entry_from_handshake(&request, &handshake, now);
            state.entries_mut(kind).insert(id.to_string(), entry);
            if kind == RunKind::Worker {
                state
                    .respawn_history_by_task_id
                    .entry(id.to_string())
                    .or_default()
                    .push(now);
            }
            // Record the mapping used, for diagnostics.
            if !repo_key.is_empty() {
                state.repo_by_task_id.insert(
                    id.to_string(),
                    RepoRecord {
                        key: repo_key.to_string(),
                        path: repo_path.to_string(),
                        resolved_at_ms: now,
                    },
                );
            }
            ActionResult::Recorded(kind, id)
        }
        Err(err) => ActionResult::SpawnFailed(err),
    }
}
