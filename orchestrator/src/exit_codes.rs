//! Stable exit codes for the boardloop binaries.

/// Tick completed (including "nothing to do").
pub const OK: i32 = 0;
/// Tick aborted because another reconciler holds the lock.
pub const LOCK_CONTENTION: i32 = 1;
/// Configuration invalid at startup.
pub const CONFIG_ERROR: i32 = 2;
