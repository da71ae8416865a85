//! I/O adapters: board, filesystem state, locks, runs, child processes.

pub mod board;
pub mod config;
pub mod heartbeat;
pub mod lock;
pub mod notify;
pub mod process;
pub mod repo_map;
pub mod runs;
pub mod spawn;
pub mod state_store;
