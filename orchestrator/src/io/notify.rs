//! Best-effort operator notifications.
//!
//! One summary per tick, delivered by invoking a configured shell command
//! with the message in `BOARDLOOP_NOTIFY_MESSAGE`. Never fails the tick:
//! every error path degrades to a log line. Repeated identical messages are
//! suppressed for a short window, and a deny list refuses obviously
//! mis-wired commands.

use std::process::Command;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::io::process::run_command_with_timeout;
use crate::state::{NotifyDedup, StateDoc};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_OUTPUT_LIMIT: usize = 4096;

pub struct Notifier {
    cmd: String,
    deny_targets: Vec<String>,
    dedup_seconds: u64,
}

impl Notifier {
    pub fn new(cmd: &str, deny_targets: &[String], dedup_seconds: u64) -> Self {
        Self {
            cmd: cmd.trim().to_string(),
            deny_targets: deny_targets.to_vec(),
            dedup_seconds,
        }
    }

    /// Send the tick summary. Updates the dedup window in `state`.
    pub fn notify(&self, state: &mut StateDoc, actions: &[String], errors: &[String], now_s: i64) {
        if self.cmd.is_empty() || (actions.is_empty() && errors.is_empty()) {
            return;
        }
        if let Some(target) = self
            .deny_targets
            .iter()
            .find(|t| !t.trim().is_empty() && self.cmd.contains(t.as_str()))
        {
            warn!(%target, "notify command matches a denied target; not sending");
            return;
        }

        let message = render_message(actions, errors);
        if message.is_empty() {
            return;
        }

        let digest = hex::encode(Sha256::digest(message.as_bytes()));
        if let Some(dedup) = &state.notify {
            let within_window = now_s - dedup.last_at_s < self.dedup_seconds as i64;
            if dedup.last_digest == digest && within_window {
                debug!("suppressed duplicate notification");
                return;
            }
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.cmd)
            .env("BOARDLOOP_NOTIFY_MESSAGE", &message);
        match run_command_with_timeout(cmd, NOTIFY_TIMEOUT, NOTIFY_OUTPUT_LIMIT) {
            Ok(out) if !out.status.success() => {
                warn!(code = ?out.status.code(), "notify command exited non-zero");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "notify command failed to run"),
        }

        state.notify = Some(NotifyDedup { last_digest: digest, last_at_s: now_s });
    }
}

fn render_message(actions: &[String], errors: &[String]) -> String {
    let mut lines: Vec<String> = Vec::new();
    if !errors.is_empty() {
        lines.push("boardloop: errors".to_string());
        lines.extend(errors.iter().take(10).map(|e| format!("- {e}")));
    }
    if !actions.is_empty() {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push("boardloop: actions".to_string());
        lines.extend(actions.iter().take(12).map(|a| format!("- {a}")));
        let extra = actions.len().saturating_sub(12);
        if extra > 0 {
            lines.push(format!("- and {extra} more"));
        }
    }
    lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn silent_when_nothing_happened() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("notify.txt");
        let cmd = format!("printf \"%s\" \"$BOARDLOOP_NOTIFY_MESSAGE\" > {}", out.display());
        let notifier = Notifier::new(&cmd, &[], 60);
        let mut state = StateDoc::default();
        notifier.notify(&mut state, &[], &[], 100);
        assert!(!out.exists());
    }

    #[test]
    fn sends_and_dedupes_within_window() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("notify.txt");
        let cmd = format!("printf x >> {}", out.display());
        let notifier = Notifier::new(&cmd, &[], 60);
        let mut state = StateDoc::default();
        let actions = vec!["Moved #1".to_string()];

        notifier.notify(&mut state, &actions, &[], 100);
        notifier.notify(&mut state, &actions, &[], 130);
        assert_eq!(fs::read_to_string(&out).expect("read"), "x");

        // Outside the window the same message goes out again.
        notifier.notify(&mut state, &actions, &[], 200);
        assert_eq!(fs::read_to_string(&out).expect("read"), "xx");
    }

    #[test]
    fn deny_list_blocks_matching_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("notify.txt");
        let cmd = format!("printf x >> {}", out.display());
        let deny = vec!["printf".to_string()];
        let notifier = Notifier::new(&cmd, &deny, 60);
        let mut state = StateDoc::default();
        notifier.notify(&mut state, &["a".to_string()], &[], 100);
        assert!(!out.exists());
    }

    #[test]
    fn message_renders_errors_before_actions() {
        let msg = render_message(
            &["Moved #1".to_string()],
            &["board unreachable".to_string()],
        );
        let error_idx = msg.find("errors").expect("errors section");
        let action_idx = msg.find("actions").expect("actions section");
        assert!(error_idx < action_idx);
    }
}
