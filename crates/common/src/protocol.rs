//! Message catalogue exchanged between controller, node daemon, step managers
//! and launch clients.
//!
//! Every message travels inside a signed [`Envelope`](crate::auth::Envelope).
//! Requests are answered with exactly one [`Message::Response`].

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::credential::LaunchCredential;
use crate::ids::{JobId, StepId, StepKey};

/// Wire-level outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCode {
    Ok,
    InvalidJobId,
    InvalidCredential,
    UserIdMissing,
    PrologFailed,
    EpilogFailed,
    TooManySteps,
    JobNotRunning,
    KillJobAlreadyComplete,
    InterconnectError,
    AlreadyInProgress,
    AlreadyExpiring,
    InvalidRequest,
    Transient,
    Fatal,
}

impl ReturnCode {
    pub fn is_ok(self) -> bool {
        self == ReturnCode::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReturnCode::Ok => "ok",
            ReturnCode::InvalidJobId => "invalid job id",
            ReturnCode::InvalidCredential => "invalid credential",
            ReturnCode::UserIdMissing => "user id missing",
            ReturnCode::PrologFailed => "prolog failed",
            ReturnCode::EpilogFailed => "epilog failed",
            ReturnCode::TooManySteps => "too many steps",
            ReturnCode::JobNotRunning => "job not running",
            ReturnCode::KillJobAlreadyComplete => "kill job already complete",
            ReturnCode::InterconnectError => "interconnect error",
            ReturnCode::AlreadyInProgress => "already in progress",
            ReturnCode::AlreadyExpiring => "already expiring",
            ReturnCode::InvalidRequest => "invalid request",
            ReturnCode::Transient => "transient error",
            ReturnCode::Fatal => "fatal error",
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launch of an interactive step (also used for single-task spawns).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchTasksRequest {
    pub job_id: JobId,
    pub step_id: StepId,
    pub uid: u32,
    pub gid: u32,
    pub credential: LaunchCredential,
    pub argv: Vec<String>,
    /// `KEY=VALUE` entries supplied by the launch client.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Global ids of the tasks placed on this node, in local order.
    pub global_task_ids: Vec<u32>,
    pub total_tasks: u32,
    pub node_count: u32,
    pub node_index: u32,
    pub reply_endpoint: String,
    #[serde(default)]
    pub io_endpoint: Option<String>,
    #[serde(default)]
    pub label_io: bool,
    /// Global task id receiving client stdin; `None` broadcasts.
    #[serde(default)]
    pub stdin_target: Option<u32>,
    #[serde(default)]
    pub kill_on_bad_exit: bool,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJobLaunchRequest {
    pub job_id: JobId,
    pub uid: u32,
    pub gid: u32,
    pub credential: LaunchCredential,
    pub script: String,
    /// Arguments passed to the script.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub stdout_path: Option<PathBuf>,
    #[serde(default)]
    pub stderr_path: Option<PathBuf>,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KillTasksRequest {
    pub job_id: JobId,
    pub step_id: StepId,
    pub signal: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReattachRequest {
    pub job_id: JobId,
    pub step_id: StepId,
    pub signature: String,
    pub io_endpoint: String,
    pub reply_endpoint: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UpdateJobTimeRequest {
    pub job_id: JobId,
    /// New limit in seconds from now; `None` removes the limit.
    pub time_limit_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidToJobIdRequest {
    pub pid: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepCompleteRequest {
    pub job_id: JobId,
    pub step_id: StepId,
    pub want_epilog: bool,
}

/// Node liveness report sent to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_name: String,
    pub cpus: u32,
    pub real_memory_mb: u64,
    pub tmp_disk_mb: u64,
    pub steps: Vec<StepKey>,
    #[serde(default)]
    pub startup: bool,
    pub status: ReturnCode,
    /// Job the status refers to, when it is not `Ok`.
    #[serde(default)]
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExit {
    pub job_id: JobId,
    pub step_id: StepId,
    pub task_count: u32,
    pub global_task_ids: Vec<u32>,
    /// Raw wait status shared by every task in this message.
    pub status: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpilogComplete {
    pub job_id: JobId,
    pub return_code: i32,
    pub node_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJobComplete {
    pub job_id: JobId,
    pub return_code: i32,
    pub node_name: String,
}

/// First line written by a step manager on every stdio connection; task
/// output follows as plain text lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoHeader {
    pub job_id: JobId,
    pub step_id: StepId,
    pub node_id: u32,
}

/// Task placement reported on launch and reattach.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskInfo {
    pub node_name: String,
    pub session_id: i32,
    pub pids: Vec<i32>,
    pub global_task_ids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResponseBody {
    Empty,
    Tasks(TaskInfo),
    JobId(JobId),
    Detail(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub rc: ReturnCode,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    BatchJobLaunch(BatchJobLaunchRequest),
    LaunchTasks(LaunchTasksRequest),
    SpawnTask(LaunchTasksRequest),
    KillTasks(KillTasksRequest),
    KillTimelimit(JobRequest),
    KillJob(JobRequest),
    ReattachTasks(ReattachRequest),
    UpdateJobTime(UpdateJobTimeRequest),
    RevokeCredential(JobRequest),
    Shutdown,
    Reconfigure,
    Ping,
    /// Controller request for a fresh registration.
    NodeRegistrationStatus,
    PidToJobId(PidToJobIdRequest),
    StepComplete(StepCompleteRequest),
    NodeRegistration(NodeRegistration),
    TaskExit(TaskExit),
    EpilogComplete(EpilogComplete),
    BatchJobComplete(BatchJobComplete),
    Response(Response),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::BatchJobLaunch(_) => "batch_job_launch",
            Message::LaunchTasks(_) => "launch_tasks",
            Message::SpawnTask(_) => "spawn_task",
            Message::KillTasks(_) => "kill_tasks",
            Message::KillTimelimit(_) => "kill_timelimit",
            Message::KillJob(_) => "kill_job",
            Message::ReattachTasks(_) => "reattach_tasks",
            Message::UpdateJobTime(_) => "update_job_time",
            Message::RevokeCredential(_) => "revoke_credential",
            Message::Shutdown => "shutdown",
            Message::Reconfigure => "reconfigure",
            Message::Ping => "ping",
            Message::NodeRegistrationStatus => "node_registration_status",
            Message::PidToJobId(_) => "pid_to_job_id",
            Message::StepComplete(_) => "step_complete",
            Message::NodeRegistration(_) => "node_registration",
            Message::TaskExit(_) => "task_exit",
            Message::EpilogComplete(_) => "epilog_complete",
            Message::BatchJobComplete(_) => "batch_job_complete",
            Message::Response(_) => "response",
        }
    }

    pub fn response(rc: ReturnCode) -> Self {
        Message::Response(Response {
            rc,
            body: ResponseBody::Empty,
        })
    }

    pub fn response_with(rc: ReturnCode, body: ResponseBody) -> Self {
        Message::Response(Response { rc, body })
    }

    /// Return code carried by a response, `None` for any other message.
    pub fn return_code(&self) -> Option<ReturnCode> {
        match self {
            Message::Response(resp) => Some(resp.rc),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_variants_have_no_body() {
        let encoded = serde_json::to_string(&Message::Ping).unwrap();
        assert_eq!(encoded, r#"{"type":"ping"}"#);
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert!(matches!(decoded, Message::Ping));
    }

    #[test]
    fn response_carries_return_code() {
        let msg = Message::response_with(ReturnCode::InvalidJobId, ResponseBody::JobId(7));
        let decoded: Message =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(decoded.return_code(), Some(ReturnCode::InvalidJobId));
        assert_eq!(Message::Ping.return_code(), None);
    }

    #[test]
    fn return_code_uses_snake_case_on_the_wire() {
        let encoded = serde_json::to_string(&ReturnCode::KillJobAlreadyComplete).unwrap();
        assert_eq!(encoded, r#""kill_job_already_complete""#);
    }
}
