//! Client side of the node daemon protocol.
//!
//! [`NodeClient`] issues requests the way a controller or launch client
//! would. [`MessageListener`] and [`IoListener`] stand in for the endpoints a
//! launch client exposes to step managers.

pub mod listener;
pub mod stdio;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use noded_common::protocol::{
    JobRequest, KillTasksRequest, LaunchTasksRequest, PidToJobIdRequest, ReattachRequest,
    TaskInfo, UpdateJobTimeRequest,
};
use noded_common::{
    JobId, LaunchCredential, Message, Response, ResponseBody, ReturnCode, Signer, StepId,
    TcpTransport, Transport, TransportError,
};

pub use listener::MessageListener;
pub use stdio::{IoListener, IoStream};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("daemon replied with {0}")]
    Refused(ReturnCode),
    #[error("unexpected reply: {0}")]
    InvalidResponse(String),
}

/// Requests to one node daemon, signed as `uid`/`gid`.
#[derive(Debug, Clone)]
pub struct NodeClient {
    addr: String,
    transport: TcpTransport,
}

impl NodeClient {
    pub fn new(addr: impl Into<String>, key: impl Into<Vec<u8>>, uid: u32, gid: u32) -> Self {
        Self {
            addr: addr.into(),
            transport: TcpTransport::new(Signer::new(key, uid, gid)),
        }
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.transport = self.transport.with_timeout(limit);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send `message` and return the daemon's response, whatever its code.
    pub async fn call(&self, message: Message) -> Result<Response, ClientError> {
        let kind = message.kind();
        let reply = self.transport.call(&self.addr, message).await?;
        match reply.message {
            Message::Response(response) => {
                debug!(kind, rc = %response.rc, "daemon replied");
                Ok(response)
            }
            other => Err(ClientError::InvalidResponse(other.kind().to_string())),
        }
    }

    /// Like [`call`](Self::call) but any code other than `Ok` is an error.
    pub async fn expect_ok(&self, message: Message) -> Result<ResponseBody, ClientError> {
        let response = self.call(message).await?;
        if response.rc.is_ok() {
            Ok(response.body)
        } else {
            Err(ClientError::Refused(response.rc))
        }
    }

    pub async fn ping(&self) -> Result<ReturnCode, ClientError> {
        Ok(self.call(Message::Ping).await?.rc)
    }

    pub async fn shutdown(&self) -> Result<ReturnCode, ClientError> {
        Ok(self.call(Message::Shutdown).await?.rc)
    }

    pub async fn reconfigure(&self) -> Result<ReturnCode, ClientError> {
        Ok(self.call(Message::Reconfigure).await?.rc)
    }

    pub async fn kill_job(&self, job_id: JobId) -> Result<ReturnCode, ClientError> {
        Ok(self.call(Message::KillJob(JobRequest { job_id })).await?.rc)
    }

    pub async fn kill_timelimit(&self, job_id: JobId) -> Result<ReturnCode, ClientError> {
        Ok(self
            .call(Message::KillTimelimit(JobRequest { job_id }))
            .await?
            .rc)
    }

    pub async fn revoke(&self, job_id: JobId) -> Result<ReturnCode, ClientError> {
        Ok(self
            .call(Message::RevokeCredential(JobRequest { job_id }))
            .await?
            .rc)
    }

    pub async fn signal_tasks(
        &self,
        job_id: JobId,
        step_id: StepId,
        signal: i32,
    ) -> Result<ReturnCode, ClientError> {
        let request = KillTasksRequest {
            job_id,
            step_id,
            signal,
        };
        Ok(self.call(Message::KillTasks(request)).await?.rc)
    }

    pub async fn update_time(
        &self,
        job_id: JobId,
        time_limit_secs: Option<u64>,
    ) -> Result<ReturnCode, ClientError> {
        let request = UpdateJobTimeRequest {
            job_id,
            time_limit_secs,
        };
        Ok(self.call(Message::UpdateJobTime(request)).await?.rc)
    }

    /// `Ok(None)` when the pid belongs to no job on the node.
    pub async fn pid_to_job(&self, pid: i32) -> Result<Option<JobId>, ClientError> {
        let response = self
            .call(Message::PidToJobId(PidToJobIdRequest { pid }))
            .await?;
        match (response.rc, response.body) {
            (ReturnCode::Ok, ResponseBody::JobId(job_id)) => Ok(Some(job_id)),
            (ReturnCode::InvalidJobId, _) => Ok(None),
            (rc, _) => Err(ClientError::Refused(rc)),
        }
    }

    pub async fn launch(&self, request: LaunchTasksRequest) -> Result<TaskInfo, ClientError> {
        match self.expect_ok(Message::LaunchTasks(request)).await? {
            ResponseBody::Tasks(info) => Ok(info),
            other => Err(ClientError::InvalidResponse(format!("{other:?}"))),
        }
    }

    pub async fn reattach(&self, request: ReattachRequest) -> Result<TaskInfo, ClientError> {
        match self.expect_ok(Message::ReattachTasks(request)).await? {
            ResponseBody::Tasks(info) => Ok(info),
            other => Err(ClientError::InvalidResponse(format!("{other:?}"))),
        }
    }
}

/// Launch request for `argv` as a single-node step; callers adjust the rest.
pub fn launch_request(
    credential: LaunchCredential,
    gid: u32,
    argv: Vec<String>,
    tasks: u32,
    reply_endpoint: impl Into<String>,
) -> LaunchTasksRequest {
    LaunchTasksRequest {
        job_id: credential.job_id,
        step_id: credential.step_id,
        uid: credential.uid,
        gid,
        credential,
        argv,
        env: Vec::new(),
        cwd: None,
        global_task_ids: (0..tasks).collect(),
        total_tasks: tasks,
        node_count: 1,
        node_index: 0,
        reply_endpoint: reply_endpoint.into(),
        io_endpoint: None,
        label_io: false,
        stdin_target: None,
        kill_on_bad_exit: false,
        time_limit_secs: None,
    }
}

/// Credential for `hosts`, valid until `expires_at`, signed with `key`.
pub fn credential(
    job_id: JobId,
    step_id: StepId,
    uid: u32,
    hosts: &str,
    expires_at: DateTime<Utc>,
    key: &[u8],
) -> anyhow::Result<LaunchCredential> {
    LaunchCredential::issue(job_id, step_id, uid, hosts, expires_at, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use noded_common::Connection;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn refused_codes_surface_as_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream);
            let request = conn.recv(b"key").await.unwrap().unwrap();
            assert!(matches!(request.message, Message::KillJob(JobRequest { job_id: 7 })));
            let signer = Signer::new(b"key".to_vec(), 0, 0);
            let reply = signer
                .seal(Message::response(ReturnCode::UserIdMissing))
                .unwrap();
            conn.send(&reply).await.unwrap();
        });

        let client = NodeClient::new(addr, b"key".to_vec(), 42, 42);
        let err = client
            .expect_ok(Message::KillJob(JobRequest { job_id: 7 }))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Refused(ReturnCode::UserIdMissing)));
        server.await.unwrap();
    }

    #[test]
    fn launch_request_numbers_tasks_from_zero() {
        let cred = credential(
            7,
            1,
            42,
            "n0",
            Utc::now() + chrono::Duration::hours(1),
            b"key",
        )
        .unwrap();
        let request = launch_request(cred, 42, vec!["/bin/true".into()], 3, "127.0.0.1:1");
        assert_eq!(request.global_task_ids, vec![0, 1, 2]);
        assert_eq!(request.job_id, 7);
        assert_eq!(request.uid, 42);
    }
}
