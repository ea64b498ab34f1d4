//! Compute node daemon.
//!
//! Accepts signed RPCs from the controller and from launch clients, starts a
//! detached step manager per job step and keeps a registry of what runs on
//! this node.

mod batch;
mod config;
mod cred;
mod dispatch;
mod fabric;
mod io;
mod launch;
mod logging;
mod manager;
mod pidfile;
mod proc;
mod registry;
mod script;
mod signals;
mod task;

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::unistd::{dup2, fork, setsid, ForkResult};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::dispatch::{Daemon, Overrides};
use crate::pidfile::PidFile;
use crate::signals::Intents;

const PREVIOUS_DAEMON_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "noded", version)]
#[command(about = "Compute node daemon")]
struct Cli {
    /// Stay in the foreground and keep stderr attached
    #[arg(short = 'D', long)]
    foreground: bool,

    /// Raise log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file
    #[arg(short = 'f', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log file, overriding the configured one
    #[arg(short = 'L', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Kill a previous daemon and remove its leftovers before starting
    #[arg(short = 'c', long)]
    cleanup: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Internal: run a step manager fed on stdin
    #[command(name = "step-manager", hide = true)]
    StepManager,
}

fn main() -> ExitCode {
    let mut cli = Cli::parse();
    let result = match cli.command.take() {
        Some(Command::StepManager) => manager::run(),
        None => run(cli),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            eprintln!("noded: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(mut cli: Cli) -> Result<()> {
    // Reconfigure re-reads this path after the chdir below.
    if let Ok(path) = std::fs::canonicalize(&cli.config) {
        cli.config = path;
    }
    let mut config = Config::load(&cli.config)?;
    if let Some(path) = cli.log_file.clone() {
        config.log_file = Some(path);
    }

    if cli.cleanup {
        if let Some(pid) = pidfile::kill_previous(&config.pid_file, PREVIOUS_DAEMON_GRACE) {
            eprintln!("noded: stopped previous daemon (pid {pid})");
        }
        dispatch::remove_stale_sockets(&config.spool_dir);
    }

    if !cli.foreground {
        daemonize()?;
    }

    let filter = logging::level_for(cli.verbose);
    logging::init(filter, config.log_file.as_deref())?;

    let _pid_file = PidFile::acquire(&config.pid_file)
        .with_context(|| format!("locking {}", config.pid_file.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(async move {
        let intents = Arc::new(Intents::default());
        signals::spawn_signal_handlers(intents.clone())?;

        let listen_addr = config.listen_addr.clone();
        let overrides = Overrides {
            log_file: cli.log_file,
        };
        let daemon = Daemon::new(config, cli.config, overrides, filter.to_string(), intents)?;
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("binding {listen_addr}"))?;
        daemon.serve(listener).await
    })?;
    info!("exiting");
    Ok(())
}

/// Fork into the background, start a new session and drop the terminal.
fn daemonize() -> Result<()> {
    // SAFETY: called before the runtime starts; the process is single threaded.
    match unsafe { fork() }.context("forking daemon")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid")?;
    std::env::set_current_dir("/").context("chdir /")?;
    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("opening /dev/null")?;
    for fd in 0..=2 {
        if let Err(err) = dup2(null.as_raw_fd(), fd) {
            warn!(fd, %err, "cannot redirect standard stream");
        }
    }
    Ok(())
}
