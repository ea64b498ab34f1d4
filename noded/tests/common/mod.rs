#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use noded_client::{credential, launch_request, MessageListener, NodeClient};
use noded_common::protocol::LaunchTasksRequest;
use noded_common::{Message, ReturnCode};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::sleep;

pub const KEY: &str = "integration-key";
pub const NODE: &str = "n0";

pub struct Options {
    pub prolog: Option<String>,
    pub epilog: Option<String>,
    pub max_steps: usize,
    pub kill_wait_secs: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            prolog: None,
            epilog: None,
            max_steps: 16,
            kill_wait_secs: 2,
        }
    }
}

/// A foreground daemon on a free port, with a listener standing in for the
/// controller.
pub struct Node {
    pub dir: TempDir,
    pub controller: MessageListener,
    pub client: NodeClient,
    pub uid: u32,
    pub gid: u32,
    child: Child,
}

impl Node {
    pub async fn start(options: Options) -> Node {
        let dir = tempfile::tempdir().expect("tempdir");
        let controller = MessageListener::bind(KEY.as_bytes().to_vec())
            .await
            .expect("controller listener");
        let port = free_port();
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        let spool = dir.path().join("spool");

        let mut config = format!(
            "node_name = \"{NODE}\"\n\
             listen_addr = \"127.0.0.1:{port}\"\n\
             controller_addr = \"{controller}\"\n\
             privileged_uid = {uid}\n\
             spool_dir = \"{spool}\"\n\
             pid_file = \"{pid}\"\n\
             tmp_dir = \"{tmp}\"\n\
             auth_key = \"{KEY}\"\n\
             max_steps = {max_steps}\n\
             kill_wait_secs = {kill_wait}\n\
             script_timeout_secs = 10\n",
            controller = controller.endpoint(),
            spool = spool.display(),
            pid = dir.path().join("noded.pid").display(),
            tmp = dir.path().display(),
            max_steps = options.max_steps,
            kill_wait = options.kill_wait_secs,
        );
        if let Some(body) = options.prolog.as_deref() {
            let path = script(dir.path(), "prolog", body);
            config.push_str(&format!("prolog = \"{}\"\n", path.display()));
        }
        if let Some(body) = options.epilog.as_deref() {
            let path = script(dir.path(), "epilog", body);
            config.push_str(&format!("epilog = \"{}\"\n", path.display()));
        }
        let config_path = dir.path().join("noded.toml");
        fs::write(&config_path, config).expect("write config");

        let child = Command::new(env!("CARGO_BIN_EXE_noded"))
            .arg("-D")
            .arg("-v")
            .arg("-f")
            .arg(&config_path)
            .arg("-L")
            .arg(dir.path().join("noded.log"))
            .env_remove("NODED_AUTH_KEY")
            .env_remove("RUST_LOG")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("spawn noded");

        let client = NodeClient::new(
            format!("127.0.0.1:{port}"),
            KEY.as_bytes().to_vec(),
            uid,
            gid,
        );
        let node = Node {
            dir,
            controller,
            client,
            uid,
            gid,
            child,
        };
        node.wait_ready().await;
        node
    }

    async fn wait_ready(&self) {
        for _ in 0..100 {
            if matches!(self.client.ping().await, Ok(ReturnCode::Ok)) {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
        panic!("noded did not come up; log:\n{}", self.log());
    }

    pub fn log(&self) -> String {
        fs::read_to_string(self.dir.path().join("noded.log")).unwrap_or_default()
    }

    pub fn launch(&self, job_id: u32, argv: &[&str], reply_endpoint: &str) -> LaunchTasksRequest {
        self.launch_step(job_id, 1, argv, reply_endpoint)
    }

    pub fn launch_step(
        &self,
        job_id: u32,
        step_id: u32,
        argv: &[&str],
        reply_endpoint: &str,
    ) -> LaunchTasksRequest {
        let cred = credential(
            job_id,
            step_id,
            self.uid,
            NODE,
            Utc::now() + chrono::Duration::hours(1),
            KEY.as_bytes(),
        )
        .expect("credential");
        launch_request(
            cred,
            self.gid,
            argv.iter().map(|arg| arg.to_string()).collect(),
            1,
            reply_endpoint,
        )
    }

    /// Steps listed by a requested registration. Failure reports sent on
    /// the daemon's own initiative are skipped.
    pub async fn registered_steps(&self) -> Vec<(u32, u32)> {
        let rc = self
            .client
            .call(Message::NodeRegistrationStatus)
            .await
            .expect("registration request")
            .rc;
        assert_eq!(rc, ReturnCode::Ok);
        let envelope = self
            .controller
            .wait_for(Duration::from_secs(5), |m| {
                matches!(m, Message::NodeRegistration(r)
                    if !r.startup && r.status == ReturnCode::Ok)
            })
            .await
            .expect("registration");
        match envelope.message {
            Message::NodeRegistration(registration) => registration
                .steps
                .iter()
                .map(|key| (key.job_id, key.step_id))
                .collect(),
            _ => unreachable!(),
        }
    }

    pub async fn stop(mut self) {
        let _ = self.client.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(10), self.child.wait()).await;
    }
}

/// Alive and not a zombie.
pub fn process_alive(pid: i32) -> bool {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| {
            !stat
                .rsplit(')')
                .next()
                .unwrap_or("")
                .trim_start()
                .starts_with('Z')
        })
        .unwrap_or(false)
}

pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("free port")
}
