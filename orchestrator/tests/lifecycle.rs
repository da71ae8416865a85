//! End-to-end reconciler scenarios.
//!
//! These drive `run_tick` against a scripted in-memory board and spawner
//! over a real temp filesystem: promotion + spawn + completion, critical
//! preemption, review rework, missing-worker policies, dependency gating
//! with auto-heal, epic breakdown idempotency, dry-run arming, budget
//! clamping, and lock contention.

use std::fs;
use std::path::Path;

use boardloop::core::types::Column;
use boardloop::io::board::Board;
use boardloop::io::config::Config;
use boardloop::io::lock;
use boardloop::io::runs::patch_revision;
use boardloop::io::state_store::{load_state, save_state};
use boardloop::state::{RunEntry, RunKind, StateDoc};
use boardloop::test_support::{
    ScriptedBoard, ScriptedSpawner, board_task, test_config, write_done_artifacts,
    write_failed_done, write_review_artifacts,
};
use boardloop::tick::{TickOutcome, run_tick};

fn setup(root: &Path) -> Config {
    // A real checkout directory so the repo map resolves `repo:server`.
    fs::create_dir_all(root.join("repos/server")).expect("create repo dir");
    Config {
        repo_root: root.join("repos"),
        ..test_config(root)
    }
}

fn tick(board: &ScriptedBoard, spawner: &ScriptedSpawner, config: &Config) -> Vec<String> {
    match run_tick(board, spawner, config).expect("tick") {
        TickOutcome::Completed(report) => {
            assert!(report.errors.is_empty(), "unexpected errors: {:?}", report.errors);
            report.actions
        }
        TickOutcome::LockContention => panic!("unexpected lock contention"),
    }
}

fn state_of(config: &Config) -> StateDoc {
    load_state(&config.state_path(), 0)
}

/// Seed a recorded (still running) worker entry for a WIP task.
fn seed_worker_entry(config: &Config, task_id: i64) {
    let mut state = state_of(config);
    let run_id = format!("seeded-{task_id}");
    let run_dir = config
        .runs_root
        .join("worker")
        .join(format!("task-{task_id}"))
        .join(&run_id);
    state.workers_by_task_id.insert(
        task_id.to_string(),
        RunEntry {
            kind: RunKind::Worker,
            run_id,
            run_dir: run_dir.clone(),
            log_path: run_dir.join("worker.log"),
            done_path: Some(run_dir.join("done.json")),
            started_at_ms: boardloop::now_ms(),
            ..RunEntry::default()
        },
    );
    save_state(&config.state_path(), &state).expect("seed state");
}

// ---------------------------------------------------------------------
// S1: epic breakdown idempotency
// ---------------------------------------------------------------------

#[test]
fn epic_breakdown_is_created_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    board.add_task(board_task(10, Column::Backlog, "E", &["epic"]));
    let spawner = ScriptedSpawner::new();

    tick(&board, &spawner, &config);
    let breakdown_id = board
        .task_titled("Break down epic #10: E")
        .expect("breakdown task created");
    assert_eq!(board.column_of(breakdown_id), Column::Backlog);
    assert!(board.has_tag(breakdown_id, "story"));
    assert!(board.has_tag(breakdown_id, "epic-child"));

    let count_after_first = board.task_count();
    tick(&board, &spawner, &config);
    assert_eq!(board.task_count(), count_after_first, "second tick creates nothing");
    // The epic container itself never moves to WIP.
    assert_eq!(board.column_of(10), Column::Backlog);
}

// ---------------------------------------------------------------------
// S2: promotion + spawn + completion
// ---------------------------------------------------------------------

#[test]
fn promotion_spawn_and_completion_reach_review() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    board.add_task(board_task(20, Column::Backlog, "server: do thing", &["repo:server"]));
    let spawner = ScriptedSpawner::new();

    // Tick 1: Backlog -> Ready -> WIP with a recorded worker entry.
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(20), Column::Wip);
    let spawned = spawner.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].kind, RunKind::Worker);
    assert_eq!(spawned[0].repo_key, "server");

    let state = state_of(&config);
    let entry = state.workers_by_task_id.get("20").expect("worker entry").clone();
    assert!(!entry.run_id.is_empty());

    // Child completes with valid artifacts.
    write_done_artifacts(&entry.run_dir, 20, &entry.run_id, 64);

    // Tick 2: comment posted, review tags seeded, card in Review, entry gone.
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(20), Column::Review);
    assert!(board.has_tag(20, "review:auto"));
    assert!(board.has_tag(20, "review:pending"));
    let comments = board.comments_for(20);
    assert!(comments.iter().any(|c| c.contains("Summary for task 20")));

    let state = state_of(&config);
    assert!(state.workers_by_task_id.get("20").is_none(), "worker entry cleared");
    let patch = state.patches_by_task_id.get("20").expect("patch recorded");
    assert_eq!(
        Some(patch.revision.clone()),
        patch_revision(&patch.patch_path),
    );
}

#[test]
fn invalid_worker_output_never_reaches_review() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    board.add_task(board_task(21, Column::Wip, "broken", &["repo:server"]));
    let spawner = ScriptedSpawner::new();

    seed_worker_entry(&config, 21);
    let state = state_of(&config);
    let entry = state.workers_by_task_id.get("21").expect("entry").clone();
    write_failed_done(&entry.run_dir, 21, &entry.run_id);

    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(21), Column::Backlog);
    assert!(board.has_tag(21, "blocked:artifact"));
    assert!(state_of(&config).workers_by_task_id.get("21").is_none());

    // Without a new spawn the card stays put.
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(21), Column::Backlog);
    assert_ne!(board.column_of(21), Column::Review);
}

// ---------------------------------------------------------------------
// S3: critical preemption
// ---------------------------------------------------------------------

#[test]
fn critical_preempts_wip_and_resumes_after_review() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    board.add_task(board_task(30, Column::Wip, "normal a", &["repo:server"]));
    board.add_task(board_task(31, Column::Wip, "normal b", &["repo:server"]));
    board.add_task(board_task(40, Column::Backlog, "urgent", &["critical", "repo:server"]));
    let spawner = ScriptedSpawner::new();

    seed_worker_entry(&config, 30);
    seed_worker_entry(&config, 31);

    // Tick 1: the critical reaches WIP; everything else is tag-paused.
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(40), Column::Wip);
    for id in [30, 31] {
        assert_eq!(board.column_of(id), Column::Wip, "pause is tag-only");
        assert!(board.has_tag(id, "paused"));
        assert!(board.has_tag(id, "paused:critical"));
    }
    let spawned = spawner.spawned();
    assert_eq!(spawned.len(), 1, "only the critical spawned");
    assert_eq!(spawned[0].task_id, 40);

    // The critical's worker finishes; tick 2 moves it to Review.
    let state = state_of(&config);
    let entry = state.workers_by_task_id.get("40").expect("entry").clone();
    write_done_artifacts(&entry.run_dir, 40, &entry.run_id, 64);
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(40), Column::Review);

    // Tick 3: no critical in WIP, so the paused tags are lifted again.
    tick(&board, &spawner, &config);
    for id in [30, 31] {
        assert!(!board.has_tag(id, "paused:critical"), "task {id}");
        assert!(!board.has_tag(id, "paused"), "task {id}");
    }
    assert!(state_of(&config).paused_by_critical.is_empty());
}

// ---------------------------------------------------------------------
// S4: review rework with WIP capacity
// ---------------------------------------------------------------------

#[test]
fn review_rework_returns_to_wip_with_fresh_run_id() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = setup(temp.path());
    config.missing_worker_policy = boardloop::core::policy::MissingWorkerPolicy::Spawn;
    let board = ScriptedBoard::new();
    board.add_task(board_task(50, Column::Review, "needs work", &["repo:server", "review:auto"]));
    board.add_task(board_task(51, Column::Wip, "other", &["repo:server"]));
    let spawner = ScriptedSpawner::new();

    seed_worker_entry(&config, 51);

    // Recorded patch + reviewer run whose result says REWORK.
    let patch_path = temp.path().join("patches/50.patch");
    fs::create_dir_all(patch_path.parent().unwrap()).expect("mkdir");
    fs::write(&patch_path, b"diff --git a b").expect("patch");
    let revision = patch_revision(&patch_path).expect("revision");

    let reviewer_run = config.runs_root.join("review/task-50/rev-run-1");
    write_review_artifacts(&reviewer_run, 60, "REWORK", &["oops"], Some(&revision));

    let mut state = state_of(&config);
    state.patches_by_task_id.insert(
        "50".to_string(),
        boardloop::state::PatchRecord {
            patch_path: patch_path.clone(),
            revision: revision.clone(),
            recorded_at_ms: 1,
        },
    );
    state.reviewers_by_task_id.insert(
        "50".to_string(),
        RunEntry {
            kind: RunKind::Reviewer,
            run_id: "rev-run-1".to_string(),
            run_dir: reviewer_run.clone(),
            result_path: Some(reviewer_run.join("review.json")),
            review_revision: Some(revision.clone()),
            started_at_ms: boardloop::now_ms(),
            ..RunEntry::default()
        },
    );
    save_state(&config.state_path(), &state).expect("seed state");

    // Tick 1: rework tags + checklist comment + Review -> WIP.
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(50), Column::Wip);
    let comments = board.comments_for(50);
    assert!(comments.iter().any(|c| c.contains("Review checklist")));
    let state = state_of(&config);
    assert!(state.reviewers_by_task_id.get("50").is_none());
    let history = state
        .review_rework_history_by_task_id
        .get("50")
        .expect("rework recorded");
    assert_eq!(history[0].review_revision, revision);

    // Tick 2: a fresh worker run starts with a brand new run id.
    tick(&board, &spawner, &config);
    let state = state_of(&config);
    let worker = state.workers_by_task_id.get("50").expect("worker respawned");
    assert_ne!(worker.run_id, "rev-run-1");
    assert!(!worker.run_id.is_empty());
}

// ---------------------------------------------------------------------
// S5: missing worker handle with policy=pause
// ---------------------------------------------------------------------

#[test]
fn missing_worker_pauses_and_moves_to_blocked() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    board.add_task(board_task(60, Column::Wip, "orphan", &["repo:server"]));
    let spawner = ScriptedSpawner::new();

    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(60), Column::Blocked);
    assert!(board.has_tag(60, "paused"));
    assert!(board.has_tag(60, "paused:missing-worker"));

    // No work is started for it on later ticks until the tags are cleared.
    tick(&board, &spawner, &config);
    assert!(spawner.spawned().is_empty());
    assert_eq!(board.column_of(60), Column::Blocked);
}

#[test]
fn wip_tasks_always_have_entry_or_pause_tag() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    board.add_task(board_task(61, Column::Wip, "a", &["repo:server"]));
    board.add_task(board_task(62, Column::Wip, "b", &["repo:server"]));
    let spawner = ScriptedSpawner::new();
    seed_worker_entry(&config, 62);

    tick(&board, &spawner, &config);

    let state = state_of(&config);
    let snapshot = board.snapshot().expect("snapshot");
    for task in snapshot.tasks.iter().filter(|t| t.column == Column::Wip) {
        let has_entry = state.workers_by_task_id.contains_key(&task.id.to_string());
        let paused = task
            .tags
            .iter()
            .any(|t| t == "paused" || t.starts_with("paused:"));
        assert!(has_entry || paused, "task {} violates the WIP invariant", task.id);
    }
}

// ---------------------------------------------------------------------
// S6: dependency gating and auto-heal
// ---------------------------------------------------------------------

#[test]
fn dependency_gates_promotion_until_done_then_heals() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    let mut dependent = board_task(70, Column::Backlog, "follow-up work", &["repo:server"]);
    dependent.description = "Depends on: #69".to_string();
    board.add_task(dependent);
    board.add_task(board_task(69, Column::Review, "base", &["review:skip"]));
    let spawner = ScriptedSpawner::new();

    // Tick 1: 70 cannot start; it is kept in Backlog with one reason tag.
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(70), Column::Backlog);
    assert!(board.has_tag(70, "blocked:deps"));
    assert!(board.has_tag(70, "auto-blocked"));
    assert!(spawner.spawned().is_empty());

    // 69 reaches Done; the next tick heals and promotes 70.
    board.move_task(69, Column::Done).expect("move");
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(70), Column::Wip);
    assert!(!board.has_tag(70, "blocked:deps"));
    assert!(!board.has_tag(70, "auto-blocked"));
    assert_eq!(spawner.spawned().len(), 1);
}

// ---------------------------------------------------------------------
// Cross-cutting properties
// ---------------------------------------------------------------------

#[test]
fn action_budget_clamps_board_mutations_per_tick() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    for id in 1..=5 {
        board.add_task(board_task(id, Column::Wip, "orphan", &["repo:server"]));
    }
    let spawner = ScriptedSpawner::new();

    // Five pause decisions pending, budget allows three per tick.
    tick(&board, &spawner, &config);
    let blocked_after_first = (1..=5)
        .filter(|id| board.column_of(*id) == Column::Blocked)
        .count();
    assert_eq!(blocked_after_first, 3);

    tick(&board, &spawner, &config);
    let blocked_after_second = (1..=5)
        .filter(|id| board.column_of(*id) == Column::Blocked)
        .count();
    assert_eq!(blocked_after_second, 5);
}

#[test]
fn run_ids_stay_unique_across_entry_maps() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    board.add_task(board_task(20, Column::Backlog, "server: a", &["repo:server"]));
    board.add_task(board_task(22, Column::Backlog, "server: b", &["repo:server"]));
    let spawner = ScriptedSpawner::new();

    tick(&board, &spawner, &config);
    tick(&board, &spawner, &config);

    let state = state_of(&config);
    let mut run_ids: Vec<String> = state
        .workers_by_task_id
        .values()
        .chain(state.reviewers_by_task_id.values())
        .chain(state.docs_by_task_id.values())
        .map(|e| e.run_id.clone())
        .collect();
    assert!(!run_ids.is_empty());
    run_ids.sort();
    run_ids.dedup();
    let distinct = run_ids.len();
    let total = state.workers_by_task_id.len()
        + state.reviewers_by_task_id.len()
        + state.docs_by_task_id.len();
    assert_eq!(distinct, total);
}

#[test]
fn dry_run_emits_without_applying_then_arms() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = setup(temp.path());
    config.first_run_dry_runs = 1;
    let board = ScriptedBoard::new();
    board.add_task(board_task(20, Column::Backlog, "server: thing", &["repo:server"]));
    let spawner = ScriptedSpawner::new();

    let report = match run_tick(&board, &spawner, &config).expect("tick") {
        TickOutcome::Completed(report) => report,
        TickOutcome::LockContention => panic!("contention"),
    };
    assert_eq!(report.mode, "DRY_RUN");
    assert!(report.actions.iter().all(|a| a.starts_with("Would: ")));
    assert_eq!(board.column_of(20), Column::Backlog, "nothing applied");
    assert!(spawner.spawned().is_empty());

    // The dry run auto-arms; the second tick acts for real.
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(20), Column::Wip);
}

#[test]
fn spawn_failure_leaves_task_in_ready() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    board.add_task(board_task(20, Column::Ready, "server: thing", &["repo:server"]));
    let spawner = ScriptedSpawner::new();
    spawner.set_fail(true);

    let report = match run_tick(&board, &spawner, &config).expect("tick") {
        TickOutcome::Completed(report) => report,
        TickOutcome::LockContention => panic!("contention"),
    };
    assert!(!report.errors.is_empty());
    assert_eq!(board.column_of(20), Column::Ready);
    assert!(board.has_tag(20, "paused:missing-worker"));
    assert!(state_of(&config).workers_by_task_id.get("20").is_none());
}

#[test]
fn tick_aborts_on_lock_contention_without_side_effects() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new();
    board.add_task(board_task(20, Column::Backlog, "server: thing", &["repo:server"]));
    let spawner = ScriptedSpawner::new();

    let _held = lock::acquire(
        &config.lock_path(),
        config.lock_strategy,
        0,
        "other-process",
        boardloop::now_ms(),
    )
    .expect("acquire")
    .expect("lock held");

    let outcome = run_tick(&board, &spawner, &config).expect("tick");
    assert_eq!(outcome, TickOutcome::LockContention);
    assert_eq!(board.column_of(20), Column::Backlog);
    assert!(spawner.spawned().is_empty());
    assert!(!config.state_path().exists(), "no state written on contention");
}

// ---------------------------------------------------------------------
// Documentation flow
// ---------------------------------------------------------------------

#[test]
fn pass_review_flows_through_documentation_to_done() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = setup(temp.path());
    let board = ScriptedBoard::new().with_docs_column();
    board.add_task(board_task(80, Column::Review, "server: docs flow", &["repo:server", "review:auto"]));
    let spawner = ScriptedSpawner::new();

    let patch_path = temp.path().join("patches/80.patch");
    fs::create_dir_all(patch_path.parent().unwrap()).expect("mkdir");
    fs::write(&patch_path, b"diff --git a b").expect("patch");
    let revision = patch_revision(&patch_path).expect("revision");

    let reviewer_run = config.runs_root.join("review/task-80/rev-run-1");
    write_review_artifacts(&reviewer_run, 95, "PASS", &[], Some(&revision));

    let mut state = state_of(&config);
    state.patches_by_task_id.insert(
        "80".to_string(),
        boardloop::state::PatchRecord {
            patch_path,
            revision: revision.clone(),
            recorded_at_ms: 1,
        },
    );
    state.reviewers_by_task_id.insert(
        "80".to_string(),
        RunEntry {
            kind: RunKind::Reviewer,
            run_id: "rev-run-1".to_string(),
            run_dir: reviewer_run.clone(),
            result_path: Some(reviewer_run.join("review.json")),
            review_revision: Some(revision),
            started_at_ms: boardloop::now_ms(),
            ..RunEntry::default()
        },
    );
    save_state(&config.state_path(), &state).expect("seed state");

    // Tick 1: PASS moves Review -> Documentation with docs tags.
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(80), Column::Documentation);
    assert!(board.has_tag(80, "review:pass"));
    assert!(board.has_tag(80, "docs:auto"));
    assert!(board.has_tag(80, "docs:pending"));

    // Tick 2: a docs worker is spawned.
    tick(&board, &spawner, &config);
    let spawned = spawner.spawned();
    let docs_spawn = spawned.iter().find(|r| r.kind == RunKind::Docs).expect("docs spawn");
    assert_eq!(docs_spawn.task_id, 80);
    assert!(board.has_tag(80, "docs:inflight"));
    assert!(!board.has_tag(80, "docs:pending"));

    // The docs run completes with an intentionally empty patch (skip).
    let state = state_of(&config);
    let entry = state.docs_by_task_id.get("80").expect("docs entry").clone();
    write_done_artifacts(&entry.run_dir, 80, &entry.run_id, 0);

    // Tick 3: Documentation -> Done, tagged docs:skip.
    tick(&board, &spawner, &config);
    assert_eq!(board.column_of(80), Column::Done);
    assert!(board.has_tag(80, "docs:skip"));
    assert!(state_of(&config).docs_by_task_id.get("80").is_none());
}
