//! Boardloop CLI.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use boardloop::io::board::KanboardClient;
use boardloop::io::config::{Config, load_config};
use boardloop::io::spawn::CommandSpawner;
use boardloop::io::state_store::load_state;
use boardloop::looping::run_loop;
use boardloop::tick::{TickOutcome, run_tick};
use boardloop::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "boardloop",
    version,
    about = "Deterministic Kanban board orchestrator for code-generation workers"
)]
struct Cli {
    /// Configuration file (TOML); defaults fall back to BOARDLOOP_* env vars.
    #[arg(short, long, default_value = "boardloop.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single reconciler tick and exit.
    Tick,
    /// Run ticks on the configured period until interrupted.
    Run {
        /// Stop after this many ticks (for supervised smoke runs).
        #[arg(long)]
        max_ticks: Option<u64>,
    },
    /// Print the persisted state document.
    State,
    /// Validate the configuration and exit.
    CheckConfig,
}

fn main() {
    logging::init();
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(exit_codes::CONFIG_ERROR);
        }
    };

    let code = match run(&cli.command, &config) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::LOCK_CONTENTION
        }
    };
    std::process::exit(code);
}

fn run(command: &Command, config: &Config) -> Result<i32> {
    match command {
        Command::CheckConfig => {
            println!("configuration OK");
            Ok(exit_codes::OK)
        }
        Command::State => {
            let state = load_state(&config.state_path(), config.first_run_dry_runs);
            let payload = serde_json::to_string_pretty(&state).context("serialize state")?;
            println!("{payload}");
            Ok(exit_codes::OK)
        }
        Command::Tick => {
            let (board, spawner) = collaborators(config)?;
            match run_tick(&board, &spawner, config)? {
                TickOutcome::Completed(report) => {
                    emit_report(&report);
                    Ok(exit_codes::OK)
                }
                TickOutcome::LockContention => {
                    println!("NO_REPLY");
                    Ok(exit_codes::LOCK_CONTENTION)
                }
            }
        }
        Command::Run { max_ticks } => {
            let (board, spawner) = collaborators(config)?;
            run_loop(&board, &spawner, config, *max_ticks, |outcome| {
                if let TickOutcome::Completed(report) = outcome {
                    emit_report(report);
                }
            })?;
            Ok(exit_codes::OK)
        }
    }
}

fn collaborators(config: &Config) -> Result<(KanboardClient, CommandSpawner)> {
    let board = KanboardClient::new(
        &config.board_base_url,
        &config.board_project,
        &config.board_user,
        &config.board_token,
        Duration::from_millis(config.board_call_timeout_ms),
    )?;
    let spawner = CommandSpawner {
        worker_cmd: config.worker_spawn_cmd.clone(),
        reviewer_cmd: config.reviewer_spawn_cmd.clone(),
        docs_cmd: config.docs_spawn_cmd.clone(),
        handshake_timeout: Duration::from_millis(config.spawn_handshake_ms),
    };
    Ok((board, spawner))
}

fn emit_report(report: &boardloop::core::types::TickReport) {
    // Stay silent for cron when truly nothing happened.
    if report.is_empty() {
        println!("NO_REPLY");
        return;
    }
    match serde_json::to_string(report) {
        Ok(line) => println!("{line}"),
        Err(err) => eprintln!("failed to serialize tick report: {err}"),
    }
}
