//! Guardian CLI: watch the reconciler heartbeat, restart it when stale.

use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use boardloop_guardian::{
    DEFAULT_STALE_FACTOR, GuardianDecision, RestartHistory, check_heartbeat,
};

const OK: i32 = 0;
const RESTART_SUPPRESSED: i32 = 1;
const CONFIG_ERROR: i32 = 2;

#[derive(Parser)]
#[command(
    name = "boardloop-guardian",
    version,
    about = "Heartbeat watchdog that restarts the boardloop reconciler"
)]
struct Cli {
    /// Heartbeat file written by the reconciler.
    #[arg(long)]
    heartbeat: PathBuf,

    /// Shell command that brings the reconciler loop back up.
    #[arg(long)]
    bring_up_cmd: String,

    /// Restart history file (restart-loop protection).
    #[arg(long, default_value = "guardian-restarts.json")]
    history: PathBuf,

    /// Heartbeats older than `factor * tickSeconds` are stale.
    #[arg(long, default_value_t = DEFAULT_STALE_FACTOR)]
    stale_factor: u64,

    /// Tick period assumed when the heartbeat does not carry one.
    #[arg(long, default_value_t = 20)]
    tick_seconds: u64,

    /// Max restarts within the window before the guardian gives up.
    #[arg(long, default_value_t = 3)]
    max_restarts: u32,

    /// Restart window in minutes.
    #[arg(long, default_value_t = 30)]
    restart_window_min: u32,

    /// Check once and exit instead of watching continuously.
    #[arg(long)]
    once: bool,

    /// Seconds between checks in watch mode.
    #[arg(long, default_value_t = 30)]
    check_interval: u64,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();

    let cli = Cli::parse();
    if cli.bring_up_cmd.trim().is_empty() {
        eprintln!("configuration error: --bring-up-cmd must not be empty");
        std::process::exit(CONFIG_ERROR);
    }

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(RESTART_SUPPRESSED);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    loop {
        let code = check_once(cli)?;
        if cli.once {
            return Ok(code);
        }
        thread::sleep(Duration::from_secs(cli.check_interval.max(1)));
    }
}

fn check_once(cli: &Cli) -> Result<i32> {
    let now_s = boardloop::now_ms() / 1000;
    let mut history = RestartHistory::load(&cli.history);
    let decision = check_heartbeat(
        &cli.heartbeat,
        &history,
        now_s,
        cli.stale_factor,
        cli.tick_seconds,
        cli.max_restarts,
        cli.restart_window_min,
    );

    match decision {
        GuardianDecision::Healthy { age_s } => {
            info!(age_s, "heartbeat fresh");
            Ok(OK)
        }
        GuardianDecision::Restart { age_s } => {
            match age_s {
                Some(age) => warn!(age_s = age, "heartbeat stale; restarting reconciler"),
                None => warn!("heartbeat missing; restarting reconciler"),
            }
            history.record(now_s, cli.restart_window_min);
            history.save(&cli.history)?;
            bring_up(&cli.bring_up_cmd)?;
            Ok(OK)
        }
        GuardianDecision::RestartSuppressed { recent_restarts } => {
            warn!(
                recent_restarts,
                "heartbeat stale but restart limiter engaged; manual attention needed"
            );
            Ok(RESTART_SUPPRESSED)
        }
    }
}

fn bring_up(cmd: &str) -> Result<()> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .status()
        .context("run bring-up command")?;
    if !status.success() {
        return Err(anyhow!("bring-up command exited with status {:?}", status.code()));
    }
    Ok(())
}
