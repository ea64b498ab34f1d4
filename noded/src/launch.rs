//! Daemon side of the step-manager handshake.
//!
//! The daemon executes `<manager_path> step-manager`, writes a
//! [`ManagerInput`] to its stdin and reads exactly one [`ManagerReport`] line
//! from its stdout. The executed process detaches its real worker with a
//! second fork and exits; the daemon reaps that intermediate right away.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, warn};

use noded_common::protocol::{BatchJobLaunchRequest, LaunchTasksRequest};
use noded_common::ReturnCode;

use crate::config::{Config, FabricKind};
use crate::fabric::FabricHandle;
use crate::proc;
use crate::registry::{StartedStep, TaskRecord};

pub const MANAGER_SUBCOMMAND: &str = "step-manager";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("cannot start step manager {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("step manager i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed step manager message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("step manager exited without reporting")]
    NoReport,
    #[error("step manager did not report within {0:?}")]
    Timeout(Duration),
}

/// Daemon settings a manager needs; the manager never reads the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    pub node_name: String,
    pub controller_addr: String,
    pub daemon_addr: String,
    pub auth_key: String,
    pub spool_dir: PathBuf,
    pub tmp_dir: PathBuf,
    /// Set only when this launch is the node's first sight of the job.
    pub prolog: Option<PathBuf>,
    pub epilog: Option<PathBuf>,
    pub script_timeout_secs: u64,
    pub want_epilog: bool,
    pub propagate_env: Option<Vec<String>>,
    pub fabric: FabricKind,
    pub control_socket: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub log_filter: String,
}

impl ManagerSettings {
    pub fn from_config(config: &Config, auth_key: String, log_filter: &str) -> Self {
        Self {
            node_name: config.node_name.clone(),
            controller_addr: config.controller_addr.clone(),
            daemon_addr: config.local_daemon_addr(),
            auth_key,
            spool_dir: config.spool_dir.clone(),
            tmp_dir: config.tmp_dir.clone(),
            prolog: None,
            epilog: config.epilog.clone(),
            script_timeout_secs: config.script_timeout_secs,
            want_epilog: config.epilog_per_step,
            propagate_env: config.propagate_env.clone(),
            fabric: config.fabric,
            control_socket: None,
            log_file: config.log_file.clone(),
            log_filter: log_filter.to_string(),
        }
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepLaunch {
    Tasks { request: LaunchTasksRequest },
    Batch {
        request: BatchJobLaunchRequest,
        script: PathBuf,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerInput {
    pub settings: ManagerSettings,
    pub launch: StepLaunch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ManagerReport {
    Started {
        manager_pid: i32,
        session_id: i32,
        tasks: Vec<TaskRecord>,
        fabric_handle: Option<FabricHandle>,
    },
    Failed {
        rc: ReturnCode,
        reason: String,
    },
}

impl ManagerReport {
    pub fn failed(rc: ReturnCode, reason: impl Into<String>) -> Self {
        ManagerReport::Failed {
            rc,
            reason: reason.into(),
        }
    }

    pub fn into_started(self) -> Result<StartedStep, (ReturnCode, String)> {
        match self {
            ManagerReport::Started {
                manager_pid,
                session_id,
                tasks,
                fabric_handle,
            } => Ok(StartedStep {
                manager_pid,
                session_id,
                tasks,
                fabric_handle,
            }),
            ManagerReport::Failed { rc, reason } => Err((rc, reason)),
        }
    }
}

/// Start a step manager and wait for its readiness report. A manager that
/// does not report is killed with everything it started.
pub async fn spawn_manager(
    program: &Path,
    input: &ManagerInput,
    wait: Duration,
) -> Result<ManagerReport, LaunchError> {
    let mut child = Command::new(program)
        .arg(MANAGER_SUBCOMMAND)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            path: program.to_path_buf(),
            source,
        })?;

    // The executed process calls setsid, so its pid names the session the
    // manager and every task end up in.
    let session = child.id().map(|pid| pid as i32);
    let report = read_report(&mut child, input, wait).await;
    if report.is_err() {
        if let Some(sid) = session {
            let killed = proc::kill_session(sid);
            if killed > 0 {
                warn!(session = sid, killed, "killed the session of an unreported step manager");
            }
        }
    }
    report
}

async fn read_report(
    child: &mut tokio::process::Child,
    input: &ManagerInput,
    wait: Duration,
) -> Result<ManagerReport, LaunchError> {
    let payload = serde_json::to_vec(input)?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await?;
    }
    let stdout = child.stdout.take().ok_or(LaunchError::NoReport)?;

    let mut line = String::new();
    let read = tokio::time::timeout(wait, BufReader::new(stdout).read_line(&mut line)).await;

    // The intermediate exits right after forking; reap it whatever happened.
    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) if !status.success() => {
            warn!(%status, "step manager intermediate exited abnormally")
        }
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(%err, "waiting for step manager intermediate"),
        Err(_) => {
            warn!("step manager intermediate did not exit; killing it");
            let _ = child.kill().await;
        }
    }

    match read {
        Err(_) => Err(LaunchError::Timeout(wait)),
        Ok(Err(err)) => Err(err.into()),
        Ok(Ok(0)) => Err(LaunchError::NoReport),
        Ok(Ok(_)) => {
            let report: ManagerReport = serde_json::from_str(line.trim())?;
            debug!(?report, "step manager reported");
            Ok(report)
        }
    }
}

/// Endpoint update pushed to a running manager over its control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub io_endpoint: Option<String>,
    pub reply_endpoint: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlReply {
    pub rc: ReturnCode,
}

pub async fn deliver_endpoints(
    socket: &Path,
    request: &ControlRequest,
    limit: Duration,
) -> Result<ReturnCode, LaunchError> {
    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        let line = serde_json::to_string(request)? + "\n";
        stream.write_all(line.as_bytes()).await?;
        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await?;
        if reply.trim().is_empty() {
            return Err(LaunchError::NoReport);
        }
        let reply: ControlReply = serde_json::from_str(reply.trim())?;
        Ok(reply.rc)
    };
    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| LaunchError::Timeout(limit))?
}
