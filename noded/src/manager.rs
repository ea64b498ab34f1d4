//! The step-manager process.
//!
//! Executed by the daemon as `noded step-manager`. It reads a
//! [`ManagerInput`] from stdin, detaches with a second fork, runs the prolog,
//! forks the tasks and reports readiness on stdout. From then on it only
//! talks RPC: task exits to the launch client, step completion to the
//! daemon, epilog completion to the controller.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getgid, getpid, getuid, ForkResult, Pid};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use noded_common::protocol::{
    BatchJobComplete, EpilogComplete, IoHeader, StepCompleteRequest, TaskExit,
};
use noded_common::{Message, ReturnCode, Signer, StepKey, TcpTransport, Transport, WHOLE_JOB};

use crate::batch;
use crate::fabric::{self, Fabric, FabricHandle, StepLayout};
use crate::io::{self as taskio, IoMux, MuxHandle, MuxOptions, TaskStreams};
use crate::launch::{ControlReply, ControlRequest, ManagerInput, ManagerReport, ManagerSettings, StepLaunch};
use crate::logging;
use crate::registry::{TaskRecord, TaskState};
use crate::script::ScriptRun;
use crate::task::{self, ChildStdio, Identity, PreparedTask};

const CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STEP_COMPLETE_ATTEMPTS: u32 = 3;

/// Entry point of the `step-manager` subcommand. Runs before any runtime or
/// subscriber exists in this process.
pub fn run() -> Result<()> {
    let mut raw = Vec::new();
    io::stdin()
        .read_to_end(&mut raw)
        .context("reading step manager input")?;
    let input: ManagerInput = match serde_json::from_slice(&raw) {
        Ok(input) => input,
        Err(err) => {
            write_report(&ManagerReport::failed(
                ReturnCode::Fatal,
                format!("malformed manager input: {err}"),
            ))?;
            return Err(err).context("decoding step manager input");
        }
    };

    nix::unistd::setsid().context("setsid")?;
    // SAFETY: no other thread exists yet in this process.
    match unsafe { fork() }.context("detaching step manager")? {
        ForkResult::Parent { .. } => Ok(()),
        ForkResult::Child => {
            logging::init(
                &input.settings.log_filter,
                input.settings.log_file.as_deref(),
            )?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("building step manager runtime")?;
            runtime.block_on(manage(input));
            Ok(())
        }
    }
}

/// Where a step's task stdio goes.
#[derive(Debug, Clone)]
enum StdioPlan {
    Null,
    Client {
        endpoint: String,
        label: bool,
        stdin_target: Option<u32>,
    },
    Files {
        stdout: PathBuf,
        stderr: PathBuf,
    },
}

/// Everything the manager needs to know about its step, independent of how
/// it was launched.
#[derive(Debug, Clone)]
struct StepPlan {
    key: StepKey,
    uid: u32,
    gid: u32,
    argv: Vec<String>,
    env: Vec<String>,
    cwd: PathBuf,
    global_ids: Vec<u32>,
    total_tasks: u32,
    node_count: u32,
    node_index: u32,
    kill_on_bad_exit: bool,
    stdio: StdioPlan,
    reply_endpoint: Option<String>,
    /// Spool directory of a batch job, removed once the job ends.
    job_dir: Option<PathBuf>,
}

impl StepPlan {
    fn from_launch(launch: StepLaunch, tmp_dir: &Path) -> Self {
        match launch {
            StepLaunch::Tasks { request } => Self {
                key: StepKey::new(request.job_id, request.step_id),
                uid: request.uid,
                gid: request.gid,
                argv: request.argv,
                env: request.env,
                cwd: request.cwd.unwrap_or_else(|| tmp_dir.to_path_buf()),
                global_ids: request.global_task_ids,
                total_tasks: request.total_tasks,
                node_count: request.node_count,
                node_index: request.node_index,
                kill_on_bad_exit: request.kill_on_bad_exit,
                stdio: match request.io_endpoint {
                    Some(endpoint) => StdioPlan::Client {
                        endpoint,
                        label: request.label_io,
                        stdin_target: request.stdin_target,
                    },
                    None => StdioPlan::Null,
                },
                reply_endpoint: Some(request.reply_endpoint),
                job_dir: None,
            },
            StepLaunch::Batch { request, script } => {
                let cwd = request.cwd.unwrap_or_else(|| tmp_dir.to_path_buf());
                let stdout = request
                    .stdout_path
                    .unwrap_or_else(|| cwd.join(format!("job{}.out", request.job_id)));
                let stderr = request.stderr_path.unwrap_or_else(|| stdout.clone());
                let mut argv = vec![script.to_string_lossy().into_owned()];
                argv.extend(request.args);
                Self {
                    key: StepKey::new(request.job_id, WHOLE_JOB),
                    uid: request.uid,
                    gid: request.gid,
                    argv,
                    env: request.env,
                    cwd,
                    global_ids: vec![0],
                    total_tasks: 1,
                    node_count: 1,
                    node_index: 0,
                    kill_on_bad_exit: false,
                    stdio: StdioPlan::Files { stdout, stderr },
                    reply_endpoint: None,
                    job_dir: script.parent().map(Path::to_path_buf),
                }
            }
        }
    }

    fn layout(&self) -> StepLayout {
        StepLayout {
            key: self.key,
            task_count: self.global_ids.len() as u32,
            total_tasks: self.total_tasks,
            node_count: self.node_count,
            node_index: self.node_index,
        }
    }

    /// Environment of the task with global id `global_id`. Client variables
    /// are filtered through `propagate` (`None` keeps all of them); the step
    /// variables and the fabric's additions always win.
    fn environment(
        &self,
        propagate: Option<&[String]>,
        global_id: u32,
        fabric_env: Vec<(String, String)>,
    ) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .filter(|(name, _)| propagate.map_or(true, |keep| keep.iter().any(|k| k == name)))
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        let step = if self.key.is_batch() {
            "batch".to_string()
        } else {
            self.key.step_id.to_string()
        };
        env.insert("JOB_ID".into(), self.key.job_id.to_string());
        env.insert("STEP_ID".into(), step);
        env.insert("NODE_ID".into(), self.node_index.to_string());
        env.insert("PROC_ID".into(), global_id.to_string());
        env.insert("N_NODES".into(), self.node_count.to_string());
        env.insert("N_PROCS".into(), self.total_tasks.to_string());
        env.extend(fabric_env);
        env
    }
}

struct Manager {
    settings: ManagerSettings,
    transport: TcpTransport,
    fabric: Arc<dyn Fabric>,
}

/// A step whose tasks are running.
struct Running {
    session: Pid,
    tasks: Vec<TaskRecord>,
    handle: FabricHandle,
    mux: Option<IoMux>,
    control: Option<ControlServer>,
    reply: Arc<Mutex<Option<String>>>,
}

async fn manage(input: ManagerInput) {
    let ManagerInput { settings, launch } = input;
    let plan = StepPlan::from_launch(launch, &settings.tmp_dir);
    let signer = Signer::new(
        settings.auth_key.clone().into_bytes(),
        getuid().as_raw(),
        getgid().as_raw(),
    );
    let manager = Manager {
        fabric: fabric::from_kind(settings.fabric),
        transport: TcpTransport::new(signer),
        settings,
    };
    info!(step = %plan.key, tasks = plan.global_ids.len(), "step manager started");

    match manager.start(&plan).await {
        Ok(running) => manager.supervise(&plan, running).await,
        Err(report) => {
            if let ManagerReport::Failed { rc, reason } = &report {
                warn!(step = %plan.key, %rc, reason, "step failed to start");
            }
            if let Err(err) = write_report(&report) {
                error!(%err, "cannot report launch failure to the daemon");
            }
        }
    }
}

impl Manager {
    async fn start(&self, plan: &StepPlan) -> Result<Running, ManagerReport> {
        if let Some(prolog) = self.settings.prolog.as_deref() {
            let run = ScriptRun {
                kind: "prolog",
                path: prolog,
                job_id: plan.key.job_id,
                uid: plan.uid,
                node_name: &self.settings.node_name,
                timeout: self.settings.script_timeout(),
            };
            run.run()
                .await
                .map_err(|err| ManagerReport::failed(ReturnCode::PrologFailed, err.to_string()))?;
        }

        let layout = plan.layout();
        let handle = self
            .fabric
            .init(&layout)
            .map_err(|err| ManagerReport::failed(ReturnCode::InterconnectError, err.to_string()))?;

        let identity = Identity::for_user(plan.uid, plan.gid);
        let (stdio, streams) = match self.prepare_stdio(plan, &identity) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.fabric_cleanup(&handle);
                return Err(ManagerReport::failed(
                    ReturnCode::Fatal,
                    format!("preparing task stdio: {err}"),
                ));
            }
        };

        let mux = match streams {
            Some(streams) => match self.start_mux(plan, streams) {
                Ok(mux) => Some(mux),
                Err(err) => {
                    self.fabric_cleanup(&handle);
                    return Err(ManagerReport::failed(
                        ReturnCode::Fatal,
                        format!("starting stdio forwarding: {err}"),
                    ));
                }
            },
            None => None,
        };

        let (session, tasks) = match self.spawn_tasks(plan, &identity, &handle, stdio) {
            Ok(spawned) => spawned,
            Err(report) => {
                if let Some(mux) = mux {
                    mux.finish();
                }
                self.fabric_cleanup(&handle);
                return Err(report);
            }
        };

        let reply = Arc::new(Mutex::new(plan.reply_endpoint.clone()));
        let control = match self.settings.control_socket.as_deref() {
            Some(path) => {
                match ControlServer::bind(path, mux.as_ref().map(IoMux::handle), reply.clone()) {
                    Ok(server) => Some(server),
                    Err(err) => {
                        warn!(path = %path.display(), %err, "control socket unavailable; reattach disabled");
                        None
                    }
                }
            }
            None => None,
        };

        let report = ManagerReport::Started {
            manager_pid: getpid().as_raw(),
            session_id: session.as_raw(),
            tasks: tasks.clone(),
            fabric_handle: Some(handle.clone()),
        };
        if let Err(err) = write_report(&report).and_then(|()| detach_stdout()) {
            // The daemon times out waiting and kills this whole session.
            error!(%err, "cannot report readiness to the daemon");
        }

        Ok(Running {
            session,
            tasks,
            handle,
            mux,
            control,
            reply,
        })
    }

    /// Child stdio per task, plus the parent ends to forward when a client
    /// endpoint was given.
    fn prepare_stdio(
        &self,
        plan: &StepPlan,
        identity: &Identity,
    ) -> io::Result<(Vec<ChildStdio>, Option<Vec<TaskStreams>>)> {
        match &plan.stdio {
            StdioPlan::Null => {
                let stdio = plan
                    .global_ids
                    .iter()
                    .map(|_| ChildStdio::null())
                    .collect::<io::Result<_>>()?;
                Ok((stdio, None))
            }
            StdioPlan::Client { .. } => {
                let mut stdio = Vec::with_capacity(plan.global_ids.len());
                let mut streams = Vec::with_capacity(plan.global_ids.len());
                for global_id in &plan.global_ids {
                    let (child, parent) = taskio::task_pipes(*global_id)?;
                    stdio.push(child);
                    streams.push(parent);
                }
                Ok((stdio, Some(streams)))
            }
            StdioPlan::Files { stdout, stderr } => {
                let (out, err) = identity.as_effective(|| {
                    let out = open_output(stdout)?;
                    let err = if stderr == stdout {
                        out.try_clone()?
                    } else {
                        open_output(stderr)?
                    };
                    Ok((out, err))
                })?;
                let null = ChildStdio::null()?;
                Ok((
                    vec![ChildStdio {
                        stdin: null.stdin,
                        stdout: out.into(),
                        stderr: err.into(),
                    }],
                    None,
                ))
            }
        }
    }

    fn start_mux(&self, plan: &StepPlan, streams: Vec<TaskStreams>) -> io::Result<IoMux> {
        let StdioPlan::Client {
            endpoint,
            label,
            stdin_target,
        } = &plan.stdio
        else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no client endpoint"));
        };
        let mux = IoMux::start(
            MuxOptions {
                header: IoHeader {
                    job_id: plan.key.job_id,
                    step_id: plan.key.step_id,
                    node_id: plan.node_index,
                },
                label: *label,
                stdin_target: *stdin_target,
            },
            streams,
        )?;
        match taskio::connect_client(endpoint, CLIENT_CONNECT_TIMEOUT) {
            Ok(stream) => mux.handle().attach(stream)?,
            Err(err) => warn!(endpoint, %err, "cannot reach stdio client; output is discarded until a reattach"),
        }
        Ok(mux)
    }

    fn spawn_tasks(
        &self,
        plan: &StepPlan,
        identity: &Identity,
        handle: &FabricHandle,
        stdio: Vec<ChildStdio>,
    ) -> Result<(Pid, Vec<TaskRecord>), ManagerReport> {
        let mut group: Option<Pid> = None;
        let mut tasks = Vec::with_capacity(plan.global_ids.len());
        let propagate = self.settings.propagate_env.as_deref();

        for ((local_id, global_id), child_stdio) in
            plan.global_ids.iter().copied().enumerate().zip(stdio)
        {
            let local_id = local_id as u32;
            let outcome = self
                .fabric
                .attach(handle, local_id)
                .map_err(|err| ManagerReport::failed(ReturnCode::InterconnectError, err.to_string()))
                .and_then(|fabric_env| {
                    let env = plan.environment(propagate, global_id, fabric_env);
                    PreparedTask::new(
                        local_id,
                        global_id,
                        &plan.argv,
                        &env,
                        &plan.cwd,
                        &self.settings.tmp_dir,
                    )
                    .map_err(|err| ManagerReport::failed(ReturnCode::InvalidRequest, err.to_string()))
                })
                .and_then(|prepared| {
                    task::spawn(&prepared, identity, child_stdio, group)
                        .map_err(|err| ManagerReport::failed(ReturnCode::Fatal, err.to_string()))
                });

            let spawned = match outcome {
                Ok(spawned) => spawned,
                Err(report) => {
                    abandon(group, &tasks);
                    return Err(report);
                }
            };
            if let Some(errno) = spawned.exec_error {
                warn!(step = %plan.key, global_id, %errno, program = %plan.argv[0], "exec failed");
            }
            group.get_or_insert(spawned.pid);
            tasks.push(TaskRecord {
                local_id,
                global_id,
                pid: spawned.pid.as_raw(),
                state: TaskState::Running,
            });
        }

        let session = group.ok_or_else(|| {
            ManagerReport::failed(ReturnCode::InvalidRequest, "step has no tasks on this node")
        })?;
        info!(step = %plan.key, session = session.as_raw(), tasks = tasks.len(), "tasks started");
        Ok((session, tasks))
    }

    async fn supervise(&self, plan: &StepPlan, running: Running) {
        let Running {
            session,
            mut tasks,
            handle,
            mux,
            control,
            reply,
        } = running;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pids: HashMap<i32, u32> = tasks.iter().map(|t| (t.pid, t.global_id)).collect();
        let waiter = tokio::task::spawn_blocking(move || wait_for_tasks(pids, tx));

        let mut killed = false;
        let mut last_status = 0;
        while let Some(exits) = rx.recv().await {
            let mut by_status: BTreeMap<i32, Vec<u32>> = BTreeMap::new();
            for (global_id, status) in exits {
                if let Some(task) = tasks.iter_mut().find(|t| t.global_id == global_id) {
                    task.state = TaskState::Exited(status);
                }
                by_status.entry(status).or_default().push(global_id);
                last_status = status;
            }
            if plan.kill_on_bad_exit && !killed && by_status.keys().any(|status| *status != 0) {
                info!(step = %plan.key, "task exited abnormally; killing the step");
                if let Err(errno) = killpg(session, Signal::SIGKILL) {
                    debug!(%errno, "kill on bad exit");
                }
                killed = true;
            }
            let endpoint = reply.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(endpoint) = endpoint {
                for (status, global_task_ids) in by_status {
                    self.report_exit(&endpoint, plan.key, status, global_task_ids)
                        .await;
                }
            }
        }
        if let Err(err) = waiter.await {
            error!(%err, "task wait loop panicked");
        }
        debug!(step = %plan.key, "all tasks exited");

        if let Some(mux) = mux {
            if let Err(err) = tokio::task::spawn_blocking(move || mux.finish()).await {
                warn!(%err, "stdio forwarding did not shut down cleanly");
            }
        }
        if let Some(control) = control {
            control.stop();
        }
        self.fabric_cleanup(&handle);

        let want_epilog = self.settings.want_epilog || plan.key.is_batch();
        if plan.key.is_batch() {
            let complete = Message::BatchJobComplete(BatchJobComplete {
                job_id: plan.key.job_id,
                return_code: last_status,
                node_name: self.settings.node_name.clone(),
            });
            if let Err(err) = self
                .transport
                .send(&self.settings.controller_addr, complete)
                .await
            {
                warn!(job_id = plan.key.job_id, %err, "cannot send batch completion");
            }
            if let Some(dir) = plan.job_dir.as_deref() {
                if let Err(err) = batch::remove_job_dir(dir) {
                    warn!(dir = %dir.display(), %err, "cannot remove batch spool");
                }
            }
        }

        match self.step_complete(plan.key, want_epilog).await {
            Some(ReturnCode::Ok) if want_epilog => self.run_epilog(plan).await,
            Some(ReturnCode::AlreadyExpiring) => {
                debug!(job_id = plan.key.job_id, "epilog already claimed")
            }
            Some(_) => {}
            None if want_epilog => {
                warn!(job_id = plan.key.job_id, "daemon unreachable; running epilog anyway");
                self.run_epilog(plan).await;
            }
            None => {}
        }
        info!(step = %plan.key, "step manager finished");
    }

    async fn report_exit(&self, endpoint: &str, key: StepKey, status: i32, global_task_ids: Vec<u32>) {
        let exit = Message::TaskExit(TaskExit {
            job_id: key.job_id,
            step_id: key.step_id,
            task_count: global_task_ids.len() as u32,
            global_task_ids,
            status,
        });
        if let Err(err) = self.transport.send(endpoint, exit).await {
            warn!(step = %key, endpoint, %err, "cannot deliver task exit");
        }
    }

    /// Tell the daemon the step is over. `None` when the daemon could not be
    /// reached at all.
    async fn step_complete(&self, key: StepKey, want_epilog: bool) -> Option<ReturnCode> {
        let request = StepCompleteRequest {
            job_id: key.job_id,
            step_id: key.step_id,
            want_epilog,
        };
        for attempt in 1..=STEP_COMPLETE_ATTEMPTS {
            match self
                .transport
                .call(&self.settings.daemon_addr, Message::StepComplete(request))
                .await
            {
                Ok(reply) => return reply.message.return_code(),
                Err(err) => {
                    debug!(step = %key, attempt, %err, "step completion not delivered");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        None
    }

    async fn run_epilog(&self, plan: &StepPlan) {
        let mut return_code = 0;
        if let Some(epilog) = self.settings.epilog.as_deref() {
            let run = ScriptRun {
                kind: "epilog",
                path: epilog,
                job_id: plan.key.job_id,
                uid: plan.uid,
                node_name: &self.settings.node_name,
                timeout: self.settings.script_timeout(),
            };
            if let Err(err) = run.run().await {
                warn!(job_id = plan.key.job_id, %err, "epilog failed");
                return_code = err.code();
            }
        }
        let complete = Message::EpilogComplete(EpilogComplete {
            job_id: plan.key.job_id,
            return_code,
            node_name: self.settings.node_name.clone(),
        });
        if let Err(err) = self
            .transport
            .send(&self.settings.controller_addr, complete)
            .await
        {
            warn!(job_id = plan.key.job_id, %err, "cannot send epilog completion");
        }
    }

    fn fabric_cleanup(&self, handle: &FabricHandle) {
        if let Err(err) = self.fabric.fini(handle) {
            warn!(%err, "fabric fini");
        }
        if let Err(err) = self.fabric.postfini(handle) {
            warn!(%err, "fabric postfini");
        }
    }
}

/// Kill and reap the tasks forked before a launch failed.
fn abandon(group: Option<Pid>, tasks: &[TaskRecord]) {
    if let Some(group) = group {
        let _ = killpg(group, Signal::SIGKILL);
    }
    for task in tasks {
        let _ = waitpid(Pid::from_raw(task.pid), None);
    }
}

fn open_output(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn write_report(report: &ManagerReport) -> io::Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, report)?;
    out.write_all(b"\n")?;
    out.flush()
}

/// Point fd 1 at `/dev/null` so the daemon's report pipe closes.
fn detach_stdout() -> io::Result<()> {
    let null = OpenOptions::new().write(true).open("/dev/null")?;
    nix::unistd::dup2(null.as_raw_fd(), libc::STDOUT_FILENO)?;
    Ok(())
}

/// Wait status in the classic encoding: exit code in the second byte,
/// terminating signal in the low seven bits, 0x80 for a core dump.
fn raw_status(status: WaitStatus) -> Option<(Pid, i32)> {
    match status {
        WaitStatus::Exited(pid, code) => Some((pid, (code & 0xff) << 8)),
        WaitStatus::Signaled(pid, signal, core) => {
            Some((pid, signal as i32 | if core { 0x80 } else { 0 }))
        }
        _ => None,
    }
}

/// Reap every task, handing each batch of exits to `tx` as
/// `(global id, raw status)` pairs.
fn wait_for_tasks(mut pids: HashMap<i32, u32>, tx: mpsc::UnboundedSender<Vec<(u32, i32)>>) {
    let any = Pid::from_raw(-1);
    while !pids.is_empty() {
        let first = match waitpid(any, None) {
            Ok(status) => status,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(errno) => {
                error!(%errno, "waitpid failed");
                break;
            }
        };
        let mut batch = Vec::new();
        let mut next = Some(first);
        while let Some(status) = next.take() {
            if let Some((pid, raw)) = raw_status(status) {
                if let Some(global_id) = pids.remove(&pid.as_raw()) {
                    debug!(pid = pid.as_raw(), global_id, status = raw, "task exited");
                    batch.push((global_id, raw));
                }
            }
            next = match waitpid(any, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => None,
                Ok(status) => Some(status),
            };
        }
        if !batch.is_empty() && tx.send(batch).is_err() {
            break;
        }
    }
    if !pids.is_empty() {
        warn!(remaining = pids.len(), "stopped waiting with tasks unaccounted for");
    }
}

/// Unix socket through which the daemon hands a running step new client
/// endpoints.
struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl ControlServer {
    fn bind(
        path: &Path,
        mux: Option<MuxHandle>,
        reply: Arc<Mutex<Option<String>>>,
    ) -> io::Result<Self> {
        let _ = fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("step-control".into())
                .spawn(move || {
                    for stream in listener.incoming() {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        match stream {
                            Ok(stream) => serve_control(stream, mux.as_ref(), &reply),
                            Err(err) => warn!(%err, "control socket accept"),
                        }
                    }
                })?
        };
        Ok(Self {
            path: path.to_path_buf(),
            stop,
            thread,
        })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = UnixStream::connect(&self.path);
        if self.thread.join().is_err() {
            warn!("control socket thread panicked");
        }
        let _ = fs::remove_file(&self.path);
    }
}

fn serve_control(stream: UnixStream, mux: Option<&MuxHandle>, reply: &Mutex<Option<String>>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut line = String::new();
    let request = match BufReader::new(&stream).read_line(&mut line) {
        Ok(n) if n > 0 => serde_json::from_str::<ControlRequest>(line.trim()),
        _ => return,
    };
    let rc = match request {
        Ok(request) => apply_control(request, mux, reply),
        Err(err) => {
            warn!(%err, "malformed control request");
            ReturnCode::InvalidRequest
        }
    };
    let mut answer = serde_json::to_vec(&ControlReply { rc }).unwrap_or_default();
    answer.push(b'\n');
    if let Err(err) = (&stream).write_all(&answer) {
        debug!(%err, "control reply not delivered");
    }
}

fn apply_control(
    request: ControlRequest,
    mux: Option<&MuxHandle>,
    reply: &Mutex<Option<String>>,
) -> ReturnCode {
    if let Some(endpoint) = request.io_endpoint.as_deref() {
        match mux {
            Some(mux) => {
                let attached = taskio::connect_client(endpoint, CLIENT_CONNECT_TIMEOUT)
                    .and_then(|stream| mux.attach(stream));
                if let Err(err) = attached {
                    warn!(endpoint, %err, "cannot attach new stdio client");
                    return ReturnCode::Transient;
                }
                info!(endpoint, "stdio client attached");
            }
            None => debug!(endpoint, "step has no forwarded stdio; ignoring io endpoint"),
        }
    }
    *reply.lock().unwrap_or_else(PoisonError::into_inner) = Some(request.reply_endpoint);
    ReturnCode::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use noded_common::protocol::{BatchJobLaunchRequest, LaunchTasksRequest};
    use noded_common::LaunchCredential;

    fn credential(step_id: u32) -> LaunchCredential {
        LaunchCredential::issue(
            7,
            step_id,
            42,
            "n0",
            chrono::Utc::now() + chrono::Duration::hours(1),
            b"key",
        )
        .unwrap()
    }

    fn tasks_plan() -> StepPlan {
        let request = LaunchTasksRequest {
            job_id: 7,
            step_id: 1,
            uid: 42,
            gid: 42,
            credential: credential(1),
            argv: vec!["/bin/true".into()],
            env: vec!["HOME=/home/u".into(), "SECRET=x".into(), "JOB_ID=forged".into()],
            cwd: None,
            global_task_ids: vec![4, 5],
            total_tasks: 8,
            node_count: 4,
            node_index: 2,
            reply_endpoint: "127.0.0.1:1".into(),
            io_endpoint: None,
            label_io: false,
            stdin_target: None,
            kill_on_bad_exit: false,
            time_limit_secs: None,
        };
        StepPlan::from_launch(StepLaunch::Tasks { request }, Path::new("/tmp"))
    }

    #[test]
    fn task_environment_describes_the_step() {
        let plan = tasks_plan();
        let env = plan.environment(None, 5, vec![("FABRIC_PORT".into(), "9".into())]);
        assert_eq!(env["JOB_ID"], "7");
        assert_eq!(env["STEP_ID"], "1");
        assert_eq!(env["NODE_ID"], "2");
        assert_eq!(env["PROC_ID"], "5");
        assert_eq!(env["N_NODES"], "4");
        assert_eq!(env["N_PROCS"], "8");
        assert_eq!(env["FABRIC_PORT"], "9");
        assert_eq!(env["SECRET"], "x");
        assert_eq!(plan.cwd, PathBuf::from("/tmp"));
    }

    #[test]
    fn propagation_list_filters_client_variables() {
        let plan = tasks_plan();
        let keep = vec!["HOME".to_string()];
        let env = plan.environment(Some(&keep), 4, Vec::new());
        assert_eq!(env["HOME"], "/home/u");
        assert!(!env.contains_key("SECRET"));
        assert_eq!(env["PROC_ID"], "4");
    }

    #[test]
    fn batch_plan_defaults_output_to_the_working_directory() {
        let request = BatchJobLaunchRequest {
            job_id: 7,
            uid: 42,
            gid: 42,
            credential: credential(WHOLE_JOB),
            script: "#!/bin/sh\n".into(),
            args: vec!["a".into()],
            env: Vec::new(),
            cwd: Some(PathBuf::from("/work")),
            stdout_path: None,
            stderr_path: None,
            time_limit_secs: None,
        };
        let plan = StepPlan::from_launch(
            StepLaunch::Batch {
                request,
                script: PathBuf::from("/spool/job7/script"),
            },
            Path::new("/tmp"),
        );
        assert!(plan.key.is_batch());
        assert_eq!(plan.argv, vec!["/spool/job7/script", "a"]);
        assert_eq!(plan.job_dir.as_deref(), Some(Path::new("/spool/job7")));
        match &plan.stdio {
            StdioPlan::Files { stdout, stderr } => {
                assert_eq!(*stdout, PathBuf::from("/work/job7.out"));
                assert_eq!(stderr, stdout);
            }
            other => panic!("unexpected stdio plan {other:?}"),
        }
        assert_eq!(plan.environment(None, 0, Vec::new())["STEP_ID"], "batch");
    }

    #[test]
    fn raw_status_encodes_exit_codes_and_signals() {
        let pid = Pid::from_raw(10);
        assert_eq!(raw_status(WaitStatus::Exited(pid, 0)), Some((pid, 0)));
        assert_eq!(raw_status(WaitStatus::Exited(pid, 3)), Some((pid, 0x300)));
        assert_eq!(
            raw_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            Some((pid, 9))
        );
        assert_eq!(
            raw_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            Some((pid, 11 | 0x80))
        );
        assert_eq!(raw_status(WaitStatus::StillAlive), None);
    }

    #[test]
    fn control_request_updates_the_reply_endpoint() {
        let reply = Mutex::new(Some("old:1".to_string()));
        let rc = apply_control(
            ControlRequest {
                io_endpoint: None,
                reply_endpoint: "new:2".into(),
            },
            None,
            &reply,
        );
        assert_eq!(rc, ReturnCode::Ok);
        assert_eq!(reply.lock().unwrap().as_deref(), Some("new:2"));
    }

    #[test]
    fn control_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step7.1.sock");
        let reply = Arc::new(Mutex::new(None));
        let server = ControlServer::bind(&path, None, reply.clone()).unwrap();

        let stream = UnixStream::connect(&path).unwrap();
        let request = serde_json::to_string(&ControlRequest {
            io_endpoint: None,
            reply_endpoint: "h:9".into(),
        })
        .unwrap();
        (&stream).write_all(format!("{request}\n").as_bytes()).unwrap();
        let mut line = String::new();
        BufReader::new(&stream).read_line(&mut line).unwrap();
        let answer: ControlReply = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(answer.rc, ReturnCode::Ok);
        assert_eq!(reply.lock().unwrap().as_deref(), Some("h:9"));

        server.stop();
        assert!(!path.exists());
    }
}
