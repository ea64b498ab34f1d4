//! Prolog and epilog runner.

use std::os::unix::fs::MetadataExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use noded_common::JobId;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("{kind} could not be started: {source}")]
    Spawn {
        kind: &'static str,
        source: std::io::Error,
    },
    #[error("{kind} exceeded {limit:?} and was killed")]
    TimedOut { kind: &'static str, limit: Duration },
    #[error("{kind} exited with status {code}")]
    Failed { kind: &'static str, code: i32 },
}

impl ScriptError {
    /// Status reported to the controller for this failure.
    pub fn code(&self) -> i32 {
        match self {
            ScriptError::Spawn { .. } => 127,
            ScriptError::TimedOut { .. } => 128 + libc::SIGKILL,
            ScriptError::Failed { code, .. } => *code,
        }
    }
}

/// One administrator script invocation.
#[derive(Debug, Clone)]
pub struct ScriptRun<'a> {
    pub kind: &'static str,
    pub path: &'a Path,
    pub job_id: JobId,
    pub uid: u32,
    pub node_name: &'a str,
    pub timeout: Duration,
}

impl ScriptRun<'_> {
    /// Run the script as the daemon's identity with a minimal environment.
    /// Paths that are relative or not owned by root (or by the daemon's own
    /// uid) are skipped and count as success.
    pub async fn run(&self) -> Result<(), ScriptError> {
        if !runnable(self.path) {
            warn!(kind = self.kind, path = %self.path.display(), "script skipped: must be absolute and root-owned");
            return Ok(());
        }
        debug!(kind = self.kind, job_id = self.job_id, path = %self.path.display(), "running script");

        let mut command = Command::new(self.path);
        command
            .env_clear()
            .env("JOB_ID", self.job_id.to_string())
            .env("UID", self.uid.to_string())
            .env("NODE_NAME", self.node_name)
            .env("PATH", "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin")
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);

        // A script that was just installed may still be open for writing in
        // some other forked process.
        let mut attempts = 0;
        let mut child = loop {
            match command.spawn() {
                Ok(child) => break child,
                Err(err) if err.raw_os_error() == Some(libc::ETXTBSY) && attempts < 5 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(source) => {
                    return Err(ScriptError::Spawn {
                        kind: self.kind,
                        source,
                    })
                }
            }
        };

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(ScriptError::Spawn {
                    kind: self.kind,
                    source,
                })
            }
            Err(_) => {
                if let Some(pid) = child.id() {
                    let _ = nix::sys::signal::killpg(
                        nix::unistd::Pid::from_raw(pid as i32),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
                let _ = child.wait().await;
                return Err(ScriptError::TimedOut {
                    kind: self.kind,
                    limit: self.timeout,
                });
            }
        };

        match exit_code(status) {
            0 => {
                info!(kind = self.kind, job_id = self.job_id, "script completed");
                Ok(())
            }
            code => Err(ScriptError::Failed {
                kind: self.kind,
                code,
            }),
        }
    }
}

fn runnable(path: &Path) -> bool {
    if !path.is_absolute() {
        return false;
    }
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    meta.uid() == 0 || meta.uid() == nix::unistd::geteuid().as_raw()
}

/// Exit code, or 128 + signal number for signalled processes.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
