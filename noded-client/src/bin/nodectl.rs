//! nodectl: administrative requests to a node daemon.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use noded_client::NodeClient;
use noded_common::ReturnCode;
use nix::unistd::{getgid, getuid};

const AUTH_KEY_ENV: &str = "NODED_AUTH_KEY";

#[derive(Parser, Debug)]
#[command(name = "nodectl", version)]
#[command(about = "Send administrative requests to a node daemon")]
struct Cli {
    /// Daemon address
    #[arg(short, long, default_value = "127.0.0.1:6818")]
    addr: String,

    /// Message authentication key (or set NODED_AUTH_KEY)
    #[arg(long)]
    key: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Ping,
    Shutdown,
    Reconfigure,
    /// Terminate every step of a job and run its epilog
    KillJob { job_id: u32 },
    /// Like kill-job, with a SIGTERM grace period first
    KillTimelimit { job_id: u32 },
    /// Refuse further launches for a job
    Revoke { job_id: u32 },
    /// Signal the tasks of one step
    Signal {
        job_id: u32,
        step_id: u32,
        #[arg(default_value_t = 15)]
        signal: i32,
    },
    /// Report the job owning a local process
    PidToJob { pid: i32 },
    /// Set a job's time limit, in seconds from now; omit to clear it
    UpdateTime { job_id: u32, seconds: Option<u64> },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(ReturnCode::Ok) => ExitCode::SUCCESS,
        Ok(rc) => {
            eprintln!("nodectl: {rc}");
            ExitCode::from(2)
        }
        Err(err) => {
            eprintln!("nodectl: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ReturnCode> {
    let key = cli
        .key
        .or_else(|| std::env::var(AUTH_KEY_ENV).ok())
        .context("no key given; pass --key or set NODED_AUTH_KEY")?;
    let uid = getuid().as_raw();
    let client = NodeClient::new(&cli.addr, key.into_bytes(), uid, getgid().as_raw());
    let rc = match cli.command {
        Command::Ping => client.ping().await,
        Command::Shutdown => client.shutdown().await,
        Command::Reconfigure => client.reconfigure().await,
        Command::KillJob { job_id } => client.kill_job(job_id).await,
        Command::KillTimelimit { job_id } => client.kill_timelimit(job_id).await,
        Command::Revoke { job_id } => client.revoke(job_id).await,
        Command::Signal {
            job_id,
            step_id,
            signal,
        } => client.signal_tasks(job_id, step_id, signal).await,
        Command::PidToJob { pid } => {
            return match client.pid_to_job(pid).await.context("pid-to-job")? {
                Some(job_id) => {
                    println!("{job_id}");
                    Ok(ReturnCode::Ok)
                }
                None => Ok(ReturnCode::InvalidJobId),
            }
        }
        Command::UpdateTime { job_id, seconds } => client.update_time(job_id, seconds).await,
    };
    rc.with_context(|| format!("request to {}", cli.addr))
}
