//! RPC dispatch: accept loop and message handlers.
//!
//! Every accepted connection carries one signed request and gets one reply.
//! Long operations (kill-job, batch launch) reply first and report their
//! outcome later with a separate message to the controller.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use noded_common::protocol::{
    BatchJobComplete, BatchJobLaunchRequest, EpilogComplete, KillTasksRequest,
    LaunchTasksRequest, NodeRegistration, ReattachRequest, StepCompleteRequest, TaskInfo,
    UpdateJobTimeRequest,
};
use noded_common::transport::DEFAULT_TIMEOUT;
use noded_common::{
    Connection, JobId, Message, ResponseBody, ReturnCode, Signer, StepKey, TcpTransport,
    Transport, TransportError, WHOLE_JOB,
};

use crate::batch;
use crate::config::Config;
use crate::cred::{CredError, CredentialCache, Expected};
use crate::fabric::{self, Fabric, StepLayout};
use crate::launch::{
    self, ControlRequest, ManagerInput, ManagerReport, ManagerSettings, StepLaunch,
};
use crate::registry::{RegistryError, StartedStep, StepRecord, StepRegistry, StepState};
use crate::script::ScriptRun;
use crate::signals::Intents;

/// Slack on top of the prolog timeout for a manager's readiness report.
const MANAGER_REPORT_SLACK: Duration = Duration::from_secs(30);
const KILL_POLL: Duration = Duration::from_millis(100);
/// How long to wait for tasks to vanish after SIGKILL.
const SIGKILL_WAIT: Duration = Duration::from_secs(10);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);
const ENDPOINT_RETRIES: u32 = 50;

type Outcome = (ReturnCode, ResponseBody);

fn rc(code: ReturnCode) -> Outcome {
    (code, ResponseBody::Empty)
}

/// Authenticated identity of a request's sender.
#[derive(Debug, Clone, Copy)]
struct Peer {
    uid: u32,
    addr: Option<SocketAddr>,
}

/// The single response owed to a request. Sending closes the connection;
/// later sends are no-ops.
struct Reply {
    conn: Option<Connection>,
    signer: Signer,
}

impl Reply {
    async fn send(&mut self, (code, body): Outcome) -> Result<(), TransportError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let envelope = self.signer.seal(Message::response_with(code, body))?;
        conn.send(&envelope).await?;
        conn.close().await
    }
}

/// Outcome of a job's prolog; `None` while it runs.
type PrologState = Option<bool>;

type PrologGates = Mutex<HashMap<JobId, watch::Receiver<PrologState>>>;

/// Held by the launch that runs a job's prolog. Later launches of the job
/// wait on it. Dropping it unresolved counts as a failed prolog.
struct PrologGate<'a> {
    job_id: JobId,
    gates: &'a PrologGates,
    tx: watch::Sender<PrologState>,
}

impl PrologGate<'_> {
    fn resolve(self, passed: bool) {
        self.tx.send_replace(Some(passed));
    }
}

impl Drop for PrologGate<'_> {
    fn drop(&mut self) {
        self.tx.send_if_modified(|state| {
            let unresolved = state.is_none();
            if unresolved {
                *state = Some(false);
            }
            unresolved
        });
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer gate for the job stays in place.
        if gates.get(&self.job_id).map_or(false, |rx| rx.borrow().is_some()) {
            gates.remove(&self.job_id);
        }
    }
}

/// A launch's standing with the credential cache and the job's prolog.
struct Admission<'a> {
    was_cached: bool,
    first_sight: bool,
    /// This launch runs the prolog.
    gate: Option<PrologGate<'a>>,
    /// Another launch is running the prolog.
    pending: Option<watch::Receiver<PrologState>>,
}

/// Settings given on the command line that survive a reconfigure.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub log_file: Option<PathBuf>,
}

pub struct Daemon {
    config: RwLock<Arc<Config>>,
    config_path: PathBuf,
    overrides: Overrides,
    log_filter: String,
    signer: RwLock<Signer>,
    creds: CredentialCache,
    registry: StepRegistry,
    /// Jobs with a kill in progress.
    waiters: Mutex<HashSet<JobId>>,
    prologs: PrologGates,
    intents: Arc<Intents>,
    fabric: Arc<dyn Fabric>,
    self_exe: PathBuf,
}

impl Daemon {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        overrides: Overrides,
        log_filter: String,
        intents: Arc<Intents>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.spool_dir)
            .with_context(|| format!("creating spool dir {}", config.spool_dir.display()))?;
        let auth_key = config.auth_key()?;
        let cred_key = config.cred_key()?;

        let creds = CredentialCache::restore(
            cred_key.into_bytes(),
            config.cred_state_path(),
            config.cred_expire_grace(),
        );
        creds.purge_expired(Utc::now());

        let fabric = fabric::from_kind(config.fabric);
        fabric
            .node_init()
            .with_context(|| format!("initialising fabric {}", fabric.name()))?;

        let signer = Signer::new(
            auth_key.into_bytes(),
            nix::unistd::geteuid().as_raw(),
            nix::unistd::getegid().as_raw(),
        );
        let self_exe = std::env::current_exe().context("locating own executable")?;

        Ok(Arc::new(Self {
            registry: StepRegistry::new(config.max_steps),
            config: RwLock::new(Arc::new(config)),
            config_path,
            overrides,
            log_filter,
            signer: RwLock::new(signer),
            creds,
            waiters: Mutex::new(HashSet::new()),
            prologs: Mutex::new(HashMap::new()),
            intents,
            fabric,
            self_exe,
        }))
    }

    pub fn config(&self) -> Arc<Config> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn signer(&self) -> Signer {
        self.signer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transport(&self) -> TcpTransport {
        TcpTransport::new(self.signer())
    }

    fn waiters(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept connections until shutdown is requested, then cancel and join
    /// the in-flight handlers and persist the credential cache.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config().max_threads.max(1)));
        let mut workers = JoinSet::new();
        info!(
            addr = %listener.local_addr().context("reading listen address")?,
            node = %self.config().node_name,
            "node daemon listening"
        );

        {
            let daemon = self.clone();
            workers.spawn(async move {
                daemon
                    .send_registration(true, ReturnCode::Ok, None)
                    .await;
            });
        }

        loop {
            if self.intents.take_reconfigure() {
                self.reconfigure();
            }
            if self.intents.shutdown_requested() {
                break;
            }
            tokio::select! {
                _ = self.intents.woken() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(err) = joined {
                        if err.is_panic() {
                            error!(%err, "request handler panicked");
                        }
                    }
                }
                accepted = accept_with_permit(&listener, &permits) => match accepted {
                    Ok((stream, addr, permit)) => {
                        let daemon = self.clone();
                        workers.spawn(async move {
                            daemon.handle_connection(stream, addr).await;
                            drop(permit);
                        });
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                        tokio::time::sleep(KILL_POLL).await;
                    }
                },
            }
        }

        info!(in_flight = workers.len(), "shutting down");
        workers.shutdown().await;
        self.creds.persist();
        info!("node daemon stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut conn = Connection::new(stream);
        let signer = self.signer();
        let envelope = match tokio::time::timeout(DEFAULT_TIMEOUT, conn.recv(signer.key())).await
        {
            Ok(Ok(Some(envelope))) => envelope,
            Ok(Ok(None)) => return,
            Ok(Err(err)) => {
                warn!(%addr, %err, "dropping message");
                return;
            }
            Err(_) => {
                debug!(%addr, "client sent nothing");
                return;
            }
        };
        let peer = Peer {
            uid: envelope.uid,
            addr: Some(addr),
        };
        let kind = envelope.message.kind();
        debug!(%addr, uid = peer.uid, kind, "request");

        let mut reply = Reply {
            conn: Some(conn),
            signer,
        };
        let outcome = self.dispatch(envelope.message, peer, &mut reply).await;
        if !outcome.0.is_ok() {
            info!(%addr, uid = peer.uid, kind, rc = %outcome.0, "request refused");
        }
        if let Err(err) = reply.send(outcome).await {
            warn!(%addr, kind, %err, "reply not delivered; re-registering");
            self.send_registration(false, ReturnCode::Ok, None).await;
        }
    }

    async fn dispatch(&self, message: Message, peer: Peer, reply: &mut Reply) -> Outcome {
        match message {
            Message::LaunchTasks(request) => self.launch_tasks(request, peer, false).await,
            Message::SpawnTask(request) => self.launch_tasks(request, peer, true).await,
            Message::BatchJobLaunch(request) => self.launch_batch(request, peer, reply).await,
            Message::KillTasks(request) => self.kill_tasks(request, peer),
            Message::KillJob(request) => self.kill_job(request.job_id, false, peer, reply).await,
            Message::KillTimelimit(request) => {
                self.kill_job(request.job_id, true, peer, reply).await
            }
            Message::ReattachTasks(request) => self.reattach(request, peer).await,
            Message::UpdateJobTime(request) => self.update_job_time(request, peer),
            Message::RevokeCredential(request) => {
                if !self.privileged(peer) {
                    return rc(ReturnCode::UserIdMissing);
                }
                info!(job_id = request.job_id, "credential revoked");
                self.creds.revoke(request.job_id);
                rc(ReturnCode::Ok)
            }
            Message::Shutdown => {
                if !self.privileged(peer) {
                    return rc(ReturnCode::UserIdMissing);
                }
                self.intents.request_shutdown();
                rc(ReturnCode::Ok)
            }
            Message::Reconfigure => {
                if !self.privileged(peer) {
                    return rc(ReturnCode::UserIdMissing);
                }
                self.intents.request_reconfigure();
                rc(ReturnCode::Ok)
            }
            Message::Ping => {
                if !self.privileged(peer) {
                    return rc(ReturnCode::UserIdMissing);
                }
                rc(ReturnCode::Ok)
            }
            Message::NodeRegistrationStatus => {
                if !self.privileged(peer) {
                    return rc(ReturnCode::UserIdMissing);
                }
                if let Err(err) = reply.send(rc(ReturnCode::Ok)).await {
                    debug!(%err, "registration request reply not delivered");
                }
                self.send_registration(false, ReturnCode::Ok, None).await;
                rc(ReturnCode::Ok)
            }
            Message::PidToJobId(request) => match self.registry.pid_to_job(request.pid) {
                Some(job_id) => (ReturnCode::Ok, ResponseBody::JobId(job_id)),
                None => rc(ReturnCode::InvalidJobId),
            },
            Message::StepComplete(request) => self.step_complete(request, peer),
            other => {
                warn!(kind = other.kind(), addr = ?peer.addr, "unexpected message");
                rc(ReturnCode::InvalidRequest)
            }
        }
    }

    fn privileged(&self, peer: Peer) -> bool {
        self.config().is_privileged(peer.uid)
    }

    /// Privileged senders and this daemon's own step managers.
    fn trusted(&self, peer: Peer) -> bool {
        self.privileged(peer) || peer.uid == self.signer().uid()
    }

    async fn launch_tasks(
        &self,
        request: LaunchTasksRequest,
        peer: Peer,
        single: bool,
    ) -> Outcome {
        let config = self.config();
        let key = StepKey::new(request.job_id, request.step_id);
        if request.argv.is_empty()
            || request.global_task_ids.is_empty()
            || (single && request.global_task_ids.len() != 1)
        {
            return rc(ReturnCode::InvalidRequest);
        }
        if peer.uid != request.uid && !config.is_privileged(peer.uid) {
            warn!(step = %key, sender = peer.uid, owner = request.uid, "launch from another user");
            return rc(ReturnCode::InvalidCredential);
        }
        let time_limit = match time_limit(request.time_limit_secs) {
            Ok(limit) => limit,
            Err(code) => return rc(code),
        };
        let expected = Expected {
            job_id: request.job_id,
            step_id: request.step_id,
            uid: request.uid,
            node_name: &config.node_name,
        };
        let verified = match self.creds.verify(&request.credential, expected) {
            Ok(verified) => verified,
            Err(err) => {
                warn!(step = %key, %err, "credential rejected");
                return rc(ReturnCode::InvalidCredential);
            }
        };
        let admission = match self.admit(&config, request.job_id, verified.expires_at) {
            Ok(admission) => admission,
            Err(code) => return rc(code),
        };

        let mut record = StepRecord::new(key, request.uid, request.gid);
        record.task_count = request.global_task_ids.len() as u32;
        record.node_count = request.node_count;
        record.node_index = request.node_index;
        record.reply_endpoint = Some(request.reply_endpoint.clone());
        record.stdio_endpoint = request.io_endpoint.clone();
        record.client_signature = request.credential.signature.clone();
        record.exec_name = request.argv[0].clone();
        record.time_limit = time_limit;
        if let Err(code) = self.register_step(record, admission.was_cached) {
            return rc(code);
        }

        let layout = StepLayout {
            key,
            task_count: request.global_task_ids.len() as u32,
            total_tasks: request.total_tasks,
            node_count: request.node_count,
            node_index: request.node_index,
        };
        if let Err(err) = self.fabric.preinit(&layout) {
            warn!(step = %key, %err, "fabric preinit failed");
            self.abort_launch(key, admission.was_cached);
            return rc(ReturnCode::InterconnectError);
        }

        let mut settings = self.manager_settings(&config, admission.first_sight);
        settings.control_socket = Some(config.step_socket_path(key));
        match self
            .start_manager(key, settings, StepLaunch::Tasks { request }, admission)
            .await
        {
            Ok(started) => (
                ReturnCode::Ok,
                ResponseBody::Tasks(TaskInfo {
                    node_name: config.node_name.clone(),
                    session_id: started.session_id,
                    pids: started.tasks.iter().map(|t| t.pid).collect(),
                    global_task_ids: started.tasks.iter().map(|t| t.global_id).collect(),
                }),
            ),
            Err(code) => rc(code),
        }
    }

    async fn launch_batch(
        &self,
        request: BatchJobLaunchRequest,
        peer: Peer,
        reply: &mut Reply,
    ) -> Outcome {
        let config = self.config();
        if !config.is_privileged(peer.uid) {
            return rc(ReturnCode::UserIdMissing);
        }
        let job_id = request.job_id;
        let key = StepKey::new(job_id, WHOLE_JOB);
        let time_limit = match time_limit(request.time_limit_secs) {
            Ok(limit) => limit,
            Err(code) => return rc(code),
        };
        let expected = Expected {
            job_id,
            step_id: WHOLE_JOB,
            uid: request.uid,
            node_name: &config.node_name,
        };
        let verified = match self.creds.verify(&request.credential, expected) {
            Ok(verified) => verified,
            Err(err) => {
                warn!(job_id, %err, "batch credential rejected");
                return rc(ReturnCode::InvalidCredential);
            }
        };
        let admission = match self.admit(&config, job_id, verified.expires_at) {
            Ok(admission) => admission,
            Err(code) => return rc(code),
        };

        let mut record = StepRecord::new(key, request.uid, request.gid);
        record.task_count = 1;
        record.client_signature = request.credential.signature.clone();
        record.exec_name = "batch".to_string();
        record.time_limit = time_limit;
        if let Err(code) = self.register_step(record, admission.was_cached) {
            return rc(code);
        }

        let job_dir = config.job_spool_dir(job_id);
        let script = match batch::write_script(
            &job_dir,
            job_id,
            &request.script,
            request.uid,
            request.gid,
        ) {
            Ok(path) => path,
            Err(err) => {
                error!(job_id, %err, "cannot write batch script");
                self.abort_launch(key, admission.was_cached);
                return rc(ReturnCode::Fatal);
            }
        };

        if let Err(err) = reply.send(rc(ReturnCode::Ok)).await {
            debug!(job_id, %err, "batch launch reply not delivered");
        }

        let mut settings = self.manager_settings(&config, admission.first_sight);
        settings.want_epilog = true;
        let launch = StepLaunch::Batch { request, script };
        if let Err(code) = self.start_manager(key, settings, launch, admission).await {
            let complete = Message::BatchJobComplete(BatchJobComplete {
                job_id,
                return_code: 1,
                node_name: config.node_name.clone(),
            });
            warn!(job_id, %code, "batch job failed to start");
            if let Err(err) = self.transport().send(&config.controller_addr, complete).await {
                warn!(job_id, %err, "cannot report batch launch failure");
            }
            if let Err(err) = batch::remove_job_dir(&job_dir) {
                warn!(job_id, %err, "cannot remove batch spool");
            }
        }
        rc(ReturnCode::Ok)
    }

    /// Insert the job into the credential cache. The first sight of a job
    /// with a prolog opens its prolog gate; later launches pick up the gate
    /// that is still open. Both happen under the gate lock.
    fn admit(
        &self,
        config: &Config,
        job_id: JobId,
        expires_at: DateTime<Utc>,
    ) -> Result<Admission<'_>, ReturnCode> {
        if self.waiters().contains(&job_id) {
            return Err(ReturnCode::AlreadyInProgress);
        }
        let mut gates = self.prologs.lock().unwrap_or_else(PoisonError::into_inner);
        let was_cached = self.creds.is_cached(job_id);
        let first_sight = match self.creds.insert_jobid(job_id, expires_at) {
            Ok(inserted) => inserted.first_sight,
            Err(CredError::Revoked(_)) => {
                warn!(job_id, "launch for revoked job");
                return Err(ReturnCode::InvalidCredential);
            }
            Err(err) => {
                debug!(job_id, %err, "launch for expiring job");
                return Err(ReturnCode::AlreadyInProgress);
            }
        };
        let mut admission = Admission {
            was_cached,
            first_sight,
            gate: None,
            pending: None,
        };
        if first_sight && config.prolog.is_some() {
            let (tx, rx) = watch::channel(None);
            gates.insert(job_id, rx);
            admission.gate = Some(PrologGate {
                job_id,
                gates: &self.prologs,
                tx,
            });
        } else {
            admission.pending = gates.get(&job_id).cloned();
        }
        Ok(admission)
    }

    fn register_step(&self, record: StepRecord, was_cached: bool) -> Result<(), ReturnCode> {
        let key = record.key;
        match self.registry.insert(record) {
            Ok(()) => {
                self.registry.advance(key, StepState::Starting);
                Ok(())
            }
            Err(err) => {
                warn!(step = %key, %err, "step not registered");
                self.creds.rewind(key.job_id, was_cached);
                Err(match err {
                    RegistryError::Full(_) => ReturnCode::TooManySteps,
                    _ => ReturnCode::AlreadyInProgress,
                })
            }
        }
    }

    fn abort_launch(&self, key: StepKey, was_cached: bool) {
        self.registry.remove(key);
        self.creds.rewind(key.job_id, was_cached);
    }

    fn manager_settings(&self, config: &Config, first_sight: bool) -> ManagerSettings {
        let auth_key = String::from_utf8_lossy(self.signer().key()).into_owned();
        let mut settings = ManagerSettings::from_config(config, auth_key, &self.log_filter);
        if first_sight {
            settings.prolog = config.prolog.clone();
        }
        settings
    }

    fn manager_program(&self, config: &Config) -> PathBuf {
        config
            .manager_path
            .clone()
            .unwrap_or_else(|| self.self_exe.clone())
    }

    /// Run a step manager for a registered step and record its tasks. On
    /// failure the step is purged and the credential insertion rewound.
    async fn start_manager(
        &self,
        key: StepKey,
        settings: ManagerSettings,
        launch: StepLaunch,
        admission: Admission<'_>,
    ) -> Result<StartedStep, ReturnCode> {
        let Admission {
            was_cached,
            gate,
            pending,
            ..
        } = admission;
        let config = self.config();
        let wait = settings.script_timeout() + MANAGER_REPORT_SLACK;

        if let Some(pending) = pending {
            if let Err(code) = self.await_prolog(key, pending, wait).await {
                self.abort_launch(key, was_cached);
                return Err(code);
            }
        }
        if self.creds.is_revoked(key.job_id) {
            debug!(step = %key, "job killed before its manager started");
            self.registry.remove(key);
            return Err(ReturnCode::InvalidCredential);
        }

        let input = ManagerInput { settings, launch };
        let program = self.manager_program(&config);
        let spawned = launch::spawn_manager(&program, &input, wait).await;
        if let Some(gate) = gate {
            let prolog_failed = matches!(
                spawned,
                Err(_)
                    | Ok(ManagerReport::Failed {
                        rc: ReturnCode::PrologFailed,
                        ..
                    })
            );
            gate.resolve(!prolog_failed);
        }
        let report = match spawned {
            Ok(report) => report,
            Err(err) => {
                error!(step = %key, %err, "step manager failed");
                self.abort_launch(key, was_cached);
                return Err(ReturnCode::Transient);
            }
        };
        match report.into_started() {
            Ok(started) => {
                let recorded = self.registry.mark_started(key, started.clone()).is_ok();
                // Checked after recording: a kill that revoked earlier has
                // waited for this report and finds the tasks either here or
                // in the registry.
                if self.creds.is_revoked(key.job_id) {
                    warn!(step = %key, session = started.session_id, "job killed during launch");
                    started.kill();
                    return Err(ReturnCode::InvalidCredential);
                }
                if !recorded {
                    debug!(step = %key, "step completed before its report was recorded");
                }
                self.creds.mark_seen(key.job_id);
                info!(
                    step = %key,
                    manager_pid = started.manager_pid,
                    session = started.session_id,
                    tasks = started.tasks.len(),
                    "step started"
                );
                Ok(started)
            }
            Err((code, reason)) => {
                warn!(step = %key, rc = %code, reason, "step did not start");
                self.abort_launch(key, was_cached);
                if code == ReturnCode::PrologFailed {
                    self.send_registration(false, ReturnCode::PrologFailed, Some(key.job_id))
                        .await;
                }
                Err(code)
            }
        }
    }

    /// Wait for another launch's run of the job prolog.
    async fn await_prolog(
        &self,
        key: StepKey,
        mut pending: watch::Receiver<PrologState>,
        limit: Duration,
    ) -> Result<(), ReturnCode> {
        debug!(step = %key, "waiting for the job prolog");
        let outcome = tokio::time::timeout(limit, pending.wait_for(Option::is_some))
            .await
            .map(|resolved| resolved.map(|state| *state == Some(true)));
        match outcome {
            Ok(Ok(true)) => Ok(()),
            Ok(_) => {
                warn!(step = %key, "job prolog failed");
                Err(ReturnCode::PrologFailed)
            }
            Err(_) => {
                warn!(step = %key, ?limit, "job prolog did not finish");
                Err(ReturnCode::Transient)
            }
        }
    }

    fn kill_tasks(&self, request: KillTasksRequest, peer: Peer) -> Outcome {
        let key = StepKey::new(request.job_id, request.step_id);
        let Some(step) = self.registry.get(key) else {
            return rc(ReturnCode::InvalidJobId);
        };
        if !self.privileged(peer) && peer.uid != step.owner_uid {
            return rc(ReturnCode::UserIdMissing);
        }
        if request.signal == 0 {
            return if self.registry.still_running(key) {
                rc(ReturnCode::Ok)
            } else {
                rc(ReturnCode::JobNotRunning)
            };
        }
        let Ok(signal) = Signal::try_from(request.signal) else {
            return rc(ReturnCode::InvalidRequest);
        };
        if is_terminating(signal) {
            self.registry.advance(key, StepState::Ending);
        }
        match self.registry.signal_step(key, signal) {
            Ok(()) => {
                debug!(step = %key, ?signal, "signal delivered");
                rc(ReturnCode::Ok)
            }
            Err(RegistryError::NotFound(_)) => rc(ReturnCode::InvalidJobId),
            Err(RegistryError::NotRunning(_)) => rc(ReturnCode::JobNotRunning),
            Err(err) => {
                warn!(step = %key, %err, "signal delivery failed");
                rc(ReturnCode::Transient)
            }
        }
    }

    async fn kill_job(
        &self,
        job_id: JobId,
        timelimit: bool,
        peer: Peer,
        reply: &mut Reply,
    ) -> Outcome {
        if !self.privileged(peer) {
            return rc(ReturnCode::UserIdMissing);
        }
        if !self.waiters().insert(job_id) {
            debug!(job_id, "kill already in progress");
            return rc(ReturnCode::Ok);
        }
        let outcome = self.kill_job_claimed(job_id, timelimit, reply).await;
        self.waiters().remove(&job_id);
        outcome
    }

    async fn kill_job_claimed(
        &self,
        job_id: JobId,
        timelimit: bool,
        reply: &mut Reply,
    ) -> Outcome {
        let config = self.config();
        self.creds.revoke(job_id);
        let owner = self
            .registry
            .job_steps(job_id)
            .first()
            .map(|step| step.owner_uid);
        let launching = self.registry.job_launching(job_id);
        if !launching && !self.registry.job_running(job_id) && config.epilog.is_none() {
            for step in self.registry.job_steps(job_id) {
                self.registry.remove(step.key);
            }
            debug!(job_id, "kill for a job with nothing left to do");
            return rc(ReturnCode::KillJobAlreadyComplete);
        }

        if let Err(err) = reply.send(rc(ReturnCode::Ok)).await {
            debug!(job_id, %err, "kill reply not delivered");
        }
        if launching {
            // Revoked above: each pending launch either fails or records its
            // tasks before it stops counting as launching.
            self.wait_for_launches(job_id, config.script_timeout() + MANAGER_REPORT_SLACK)
                .await;
        }
        let steps = self.registry.job_steps(job_id);
        info!(job_id, steps = steps.len(), timelimit, "killing job");

        if timelimit {
            for step in &steps {
                let _ = self.registry.signal_step(step.key, Signal::SIGTERM);
            }
            tokio::time::sleep(config.kill_wait()).await;
        }
        self.terminate_job(job_id, config.kill_wait()).await;

        match self.creds.begin_expiration(job_id) {
            Ok(()) => {
                let owner = owner.or_else(|| steps.first().map(|s| s.owner_uid));
                self.run_epilog(&config, job_id, owner.unwrap_or(0)).await;
            }
            Err(err) => debug!(job_id, %err, "epilog skipped"),
        }
        rc(ReturnCode::Ok)
    }

    /// SIGCONT and SIGTERM every step of the job, SIGKILL whatever is left
    /// after `grace`.
    async fn terminate_job(&self, job_id: JobId, grace: Duration) {
        let steps = self.registry.job_steps(job_id);
        for step in &steps {
            self.registry.advance(step.key, StepState::Ending);
            let _ = self.registry.signal_step(step.key, Signal::SIGCONT);
            let _ = self.registry.signal_step(step.key, Signal::SIGTERM);
        }
        if self.wait_for_exit(job_id, grace).await {
            return;
        }
        warn!(job_id, "tasks survived SIGTERM; sending SIGKILL");
        for step in &steps {
            let _ = self.registry.signal_step(step.key, Signal::SIGKILL);
        }
        if !self.wait_for_exit(job_id, SIGKILL_WAIT).await {
            error!(job_id, "tasks survived SIGKILL");
        }
    }

    async fn wait_for_launches(&self, job_id: JobId, limit: Duration) {
        let deadline = Instant::now() + limit;
        while self.registry.job_launching(job_id) {
            if Instant::now() >= deadline {
                warn!(job_id, "launch still pending after kill");
                return;
            }
            tokio::time::sleep(KILL_POLL).await;
        }
    }

    async fn wait_for_exit(&self, job_id: JobId, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.registry.job_running(job_id) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(KILL_POLL).await;
        }
    }

    async fn run_epilog(&self, config: &Config, job_id: JobId, uid: u32) {
        let mut return_code = 0;
        if let Some(epilog) = config.epilog.as_deref() {
            let run = ScriptRun {
                kind: "epilog",
                path: epilog,
                job_id,
                uid,
                node_name: &config.node_name,
                timeout: config.script_timeout(),
            };
            if let Err(err) = run.run().await {
                warn!(job_id, %err, "epilog failed");
                return_code = err.code();
            }
        }
        let complete = Message::EpilogComplete(EpilogComplete {
            job_id,
            return_code,
            node_name: config.node_name.clone(),
        });
        match self.transport().send(&config.controller_addr, complete).await {
            Ok(()) => info!(job_id, return_code, "epilog complete"),
            Err(err) => warn!(job_id, %err, "cannot send epilog completion"),
        }
    }

    async fn reattach(&self, request: ReattachRequest, peer: Peer) -> Outcome {
        let key = StepKey::new(request.job_id, request.step_id);
        let Some(step) = self.registry.get(key) else {
            return rc(ReturnCode::InvalidJobId);
        };
        if !self.privileged(peer) && peer.uid != step.owner_uid {
            return rc(ReturnCode::UserIdMissing);
        }
        if key.is_batch() {
            return rc(ReturnCode::InvalidRequest);
        }
        if step.state != StepState::Started {
            return rc(ReturnCode::JobNotRunning);
        }

        let mut attempts = 0;
        let update = loop {
            match self.registry.update_endpoints(
                key,
                &request.reply_endpoint,
                &request.io_endpoint,
                &request.signature,
            ) {
                Ok(update) => break update,
                Err(RegistryError::Transient(_)) if attempts < ENDPOINT_RETRIES => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(RegistryError::Unauthorized(_)) => {
                    warn!(step = %key, uid = peer.uid, "reattach with wrong signature");
                    return rc(ReturnCode::InvalidCredential);
                }
                Err(RegistryError::NotFound(_)) => return rc(ReturnCode::InvalidJobId),
                Err(err) => {
                    debug!(step = %key, %err, "reattach gave up");
                    return rc(ReturnCode::Transient);
                }
            }
        };

        let socket = self.config().step_socket_path(key);
        let control = ControlRequest {
            io_endpoint: Some(request.io_endpoint.clone()),
            reply_endpoint: request.reply_endpoint.clone(),
        };
        let delivered = launch::deliver_endpoints(&socket, &control, CONTROL_TIMEOUT).await;
        drop(update);
        match delivered {
            Ok(ReturnCode::Ok) => {
                info!(step = %key, io = %request.io_endpoint, "client reattached");
                (
                    ReturnCode::Ok,
                    ResponseBody::Tasks(TaskInfo {
                        node_name: self.config().node_name.clone(),
                        session_id: step.session_id,
                        pids: step.tasks.iter().map(|t| t.pid).collect(),
                        global_task_ids: step.tasks.iter().map(|t| t.global_id).collect(),
                    }),
                )
            }
            Ok(code) => rc(code),
            Err(err) => {
                warn!(step = %key, %err, "step manager unreachable");
                rc(ReturnCode::JobNotRunning)
            }
        }
    }

    fn update_job_time(&self, request: UpdateJobTimeRequest, peer: Peer) -> Outcome {
        if !self.privileged(peer) {
            return rc(ReturnCode::UserIdMissing);
        }
        let limit = match time_limit(request.time_limit_secs) {
            Ok(limit) => limit,
            Err(code) => return rc(code),
        };
        let steps = self.registry.job_steps(request.job_id);
        if steps.is_empty() {
            return rc(ReturnCode::InvalidJobId);
        }
        for step in steps {
            match self.registry.update_time_limit(step.key, limit) {
                Ok(true) => debug!(step = %step.key, ?limit, "time limit updated"),
                Ok(false) | Err(_) => {}
            }
        }
        rc(ReturnCode::Ok)
    }

    fn step_complete(&self, request: StepCompleteRequest, peer: Peer) -> Outcome {
        if !self.trusted(peer) {
            return rc(ReturnCode::UserIdMissing);
        }
        let key = StepKey::new(request.job_id, request.step_id);
        self.registry.advance(key, StepState::Ending);
        self.registry.advance(key, StepState::Complete);
        if self.registry.remove(key).is_some() {
            info!(step = %key, "step complete");
        }
        if !request.want_epilog {
            return rc(ReturnCode::Ok);
        }
        match self.creds.begin_expiration(request.job_id) {
            Ok(()) => rc(ReturnCode::Ok),
            Err(_) => rc(ReturnCode::AlreadyExpiring),
        }
    }

    /// Report this node to the controller. Managers that died since the last
    /// report are purged first.
    async fn send_registration(&self, startup: bool, status: ReturnCode, job_id: Option<JobId>) {
        let purged = self.registry.purge_dead_managers();
        if !purged.is_empty() {
            warn!(?purged, "purged steps whose manager has gone");
        }
        self.creds.purge_expired(Utc::now());

        let config = self.config();
        let registration = NodeRegistration {
            node_name: config.node_name.clone(),
            cpus: config.cpus,
            real_memory_mb: config.real_memory_mb,
            tmp_disk_mb: config.tmp_disk_mb,
            steps: self
                .registry
                .snapshot_all()
                .into_iter()
                .map(|step| step.key)
                .collect(),
            startup,
            status,
            job_id,
        };
        let steps = registration.steps.len();
        match self
            .transport()
            .send(&config.controller_addr, Message::NodeRegistration(registration))
            .await
        {
            Ok(()) => debug!(steps, startup, %status, "registration sent"),
            Err(err) => warn!(controller = %config.controller_addr, %err, "registration failed"),
        }
    }

    /// Re-read the configuration file. On error the running configuration
    /// stays in place.
    fn reconfigure(&self) {
        let mut config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                error!(path = %self.config_path.display(), "reconfigure failed: {err:#}");
                return;
            }
        };
        if let Some(path) = self.overrides.log_file.clone() {
            config.log_file = Some(path);
        }
        match config.cred_key() {
            Ok(key) => self.creds.rotate_key(key.into_bytes()),
            Err(err) => warn!("keeping credential key: {err:#}"),
        }
        match config.auth_key() {
            Ok(key) => {
                let current = self.signer();
                let signer = Signer::new(
                    key.into_bytes(),
                    current.uid(),
                    nix::unistd::getegid().as_raw(),
                );
                *self.signer.write().unwrap_or_else(PoisonError::into_inner) = signer;
            }
            Err(err) => warn!("keeping authentication key: {err:#}"),
        }
        self.registry.set_capacity(config.max_steps);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        info!(path = %self.config_path.display(), "configuration reloaded");
    }
}

async fn accept_with_permit(
    listener: &TcpListener,
    permits: &Arc<Semaphore>,
) -> io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    let permit = permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "worker pool closed"))?;
    let (stream, addr) = listener.accept().await?;
    Ok((stream, addr, permit))
}

/// Absolute deadline for a limit given in seconds from now. A limit past
/// what a timestamp can hold is refused.
fn time_limit(secs: Option<u64>) -> Result<Option<DateTime<Utc>>, ReturnCode> {
    let Some(secs) = secs else {
        return Ok(None);
    };
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .map(Some)
        .ok_or(ReturnCode::InvalidRequest)
}

fn is_terminating(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGKILL | Signal::SIGTERM | Signal::SIGINT | Signal::SIGHUP | Signal::SIGQUIT
    )
}

/// Remove control sockets left behind by managers of a previous daemon.
pub fn remove_stale_sockets(spool_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(spool_dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with("step") && name.ends_with(".sock"))
        })
        .filter(|path| std::fs::remove_file(path).is_ok())
        .count()
}
