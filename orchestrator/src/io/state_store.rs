//! State document storage.
//!
//! Reads return a fully owned document; writes are atomic (temp file +
//! rename) so readers never observe a torn document. A missing or corrupt
//! file initializes defaults instead of failing the tick.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::state::StateDoc;

/// Load the state document. Missing or unparseable files yield a fresh
/// first-run document (armed with `first_run_dry_runs` dry ticks).
pub fn load_state(path: &Path, first_run_dry_runs: u32) -> StateDoc {
    match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<StateDoc>(&contents) {
            Ok(doc) => {
                debug!(path = %path.display(), "state loaded");
                doc
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "state file corrupt; starting fresh");
                StateDoc::first_run(first_run_dry_runs)
            }
        },
        Err(_) => {
            debug!(path = %path.display(), "no state file; starting fresh");
            StateDoc::first_run(first_run_dry_runs)
        }
    }
}

/// Atomically write the state document (temp file, fsync, rename).
pub fn save_state(path: &Path, doc: &StateDoc) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let mut payload = serde_json::to_string_pretty(doc).context("serialize state")?;
    payload.push('\n');

    let tmp_path = path.with_extension("json.tmp");
    {
        use std::io::Write;
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("write temp state {}", tmp_path.display()))?;
        file.write_all(payload.as_bytes())
            .with_context(|| format!("write temp state {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("fsync temp state {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RunEntry, RunKind};

    #[test]
    fn missing_state_initializes_first_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let doc = load_state(&temp.path().join("missing.json"), 1);
        assert!(doc.dry_run);
        assert_eq!(doc.dry_run_runs_remaining, 1);
    }

    #[test]
    fn corrupt_state_initializes_fresh() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "{not json").expect("write");
        let doc = load_state(&path, 0);
        assert!(!doc.dry_run);
    }

    #[test]
    fn state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");

        let mut doc = StateDoc::default();
        doc.last_actions_by_task_id.insert("7".to_string(), 1234);
        doc.workers_by_task_id.insert(
            "7".to_string(),
            RunEntry {
                kind: RunKind::Worker,
                run_id: "20260101T000000Z-p1-0001".to_string(),
                started_at_ms: 42,
                ..RunEntry::default()
            },
        );

        save_state(&path, &doc).expect("save");
        let loaded = load_state(&path, 0);
        assert_eq!(loaded, doc);
    }

    #[test]
    fn save_replaces_existing_file_atomically() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        save_state(&path, &StateDoc::default()).expect("save 1");
        let mut doc = StateDoc::default();
        doc.swimlane_priority = vec!["Fast lane".to_string()];
        save_state(&path, &doc).expect("save 2");
        let loaded = load_state(&path, 0);
        assert_eq!(loaded.swimlane_priority, vec!["Fast lane".to_string()]);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
