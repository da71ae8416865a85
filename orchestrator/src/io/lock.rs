//! Exclusive tick lock.
//!
//! The default strategy is an OS advisory lock (`flock`), so a crashed
//! reconciler frees the lock with no stale-file race. The `stale-file`
//! strategy (lock files older than 10 minutes are stolen) exists for
//! filesystems without flock support and must be opted into explicitly.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::io::config::LockStrategy;

const STALE_LOCK_MS: i64 = 10 * 60 * 1000;
const RETRY_SLEEP: Duration = Duration::from_millis(50);

#[derive(Serialize)]
struct LockInfo<'a> {
    pid: u32,
    created_at_ms: i64,
    run_id: &'a str,
}

/// Held tick lock. Dropping releases it.
#[derive(Debug)]
pub struct TickLock {
    // Kept open for the lifetime of the lock; flock releases on close.
    _file: File,
    path: PathBuf,
    strategy: LockStrategy,
}

impl Drop for TickLock {
    fn drop(&mut self) {
        if self.strategy == LockStrategy::StaleFile {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Try to acquire the tick lock. Returns `Ok(None)` on contention after
/// waiting at most `wait_ms`.
pub fn acquire(
    path: &Path,
    strategy: LockStrategy,
    wait_ms: u64,
    run_id: &str,
    now_ms: i64,
) -> Result<Option<TickLock>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
    }
    let deadline = now_ms + wait_ms as i64;
    loop {
        let acquired = match strategy {
            LockStrategy::OsLock => try_flock(path, run_id, now_ms)?,
            LockStrategy::StaleFile => try_stale_file(path, run_id, now_ms)?,
        };
        if let Some(lock) = acquired {
            debug!(path = %path.display(), ?strategy, "tick lock acquired");
            return Ok(Some(lock));
        }
        if wait_ms == 0 || crate::now_ms() >= deadline {
            return Ok(None);
        }
        thread::sleep(RETRY_SLEEP);
    }
}

fn write_diagnostics(file: &mut File, run_id: &str, now_ms: i64) {
    // Human diagnostics only; never read back for correctness.
    let info = LockInfo {
        pid: std::process::id(),
        created_at_ms: now_ms,
        run_id,
    };
    if let Ok(payload) = serde_json::to_string(&info) {
        let _ = file.set_len(0);
        let _ = file.write_all(payload.as_bytes());
        let _ = file.flush();
    }
}

#[cfg(unix)]
fn try_flock(path: &Path, run_id: &str, now_ms: i64) -> Result<Option<TickLock>> {
    use std::os::unix::io::AsRawFd;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock
            || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(None);
        }
        return Err(err).with_context(|| format!("flock {}", path.display()));
    }
    write_diagnostics(&mut file, run_id, now_ms);
    Ok(Some(TickLock {
        _file: file,
        path: path.to_path_buf(),
        strategy: LockStrategy::OsLock,
    }))
}

#[cfg(not(unix))]
fn try_flock(path: &Path, run_id: &str, now_ms: i64) -> Result<Option<TickLock>> {
    // No flock on this platform; fall back to the stale-file protocol.
    try_stale_file(path, run_id, now_ms)
}

fn try_stale_file(path: &Path, run_id: &str, now_ms: i64) -> Result<Option<TickLock>> {
    if let Ok(contents) = fs::read_to_string(path) {
        let created_at = serde_json::from_str::<serde_json::Value>(&contents)
            .ok()
            .and_then(|v| v.get("created_at_ms").and_then(|c| c.as_i64()))
            .unwrap_or(0);
        // An unreadable lock file counts as stale.
        if created_at > 0 && now_ms - created_at < STALE_LOCK_MS {
            return Ok(None);
        }
    } else if path.exists() {
        return Ok(None);
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("create lock file {}", path.display()))?;
    write_diagnostics(&mut file, run_id, now_ms);
    Ok(Some(TickLock {
        _file: file,
        path: path.to_path_buf(),
        strategy: LockStrategy::StaleFile,
    }))
}
