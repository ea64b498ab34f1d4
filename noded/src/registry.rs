//! In-memory registry of the steps live on this node.
//!
//! Only the daemon holds the registry. Step managers are separate processes
//! and report back over RPC; getters therefore hand out copies.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::debug;

use noded_common::{JobId, StepKey};

use crate::fabric::FabricHandle;
use crate::proc::{group_exists, process_exists, read_proc_stat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Allocated,
    Starting,
    Started,
    Ending,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Init,
    Running,
    Exited(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub local_id: u32,
    pub global_id: u32,
    pub pid: i32,
    pub state: TaskState,
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub key: StepKey,
    pub owner_uid: u32,
    pub owner_gid: u32,
    pub state: StepState,
    pub manager_pid: i32,
    /// Process group led by the first task; 0 until the tasks exist.
    pub session_id: i32,
    pub fabric_handle: Option<FabricHandle>,
    pub task_count: u32,
    pub node_count: u32,
    pub node_index: u32,
    pub tasks: Vec<TaskRecord>,
    pub reply_endpoint: Option<String>,
    pub stdio_endpoint: Option<String>,
    pub client_signature: String,
    /// `None` means unbounded.
    pub time_limit: Option<DateTime<Utc>>,
    pub exec_name: String,
}

impl StepRecord {
    pub fn new(key: StepKey, owner_uid: u32, owner_gid: u32) -> Self {
        Self {
            key,
            owner_uid,
            owner_gid,
            state: StepState::Allocated,
            manager_pid: 0,
            session_id: 0,
            fabric_handle: None,
            task_count: 0,
            node_count: 1,
            node_index: 0,
            tasks: Vec::new(),
            reply_endpoint: None,
            stdio_endpoint: None,
            client_signature: String::new(),
            time_limit: None,
            exec_name: String::new(),
        }
    }

    fn is_running(&self) -> bool {
        if self.session_id <= 0 {
            return false;
        }
        process_exists(self.session_id)
            || group_exists(self.session_id)
            || self
                .tasks
                .iter()
                .filter(|task| !matches!(task.state, TaskState::Exited(_)))
                .any(|task| process_exists(task.pid))
    }

    /// Registered, but its manager has not reported the tasks yet.
    fn is_launching(&self) -> bool {
        self.manager_pid <= 0 && self.state < StepState::Complete
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("step {0} already registered")]
    DuplicateKey(StepKey),
    #[error("step registry is full ({0} steps)")]
    Full(usize),
    #[error("step {0} not found")]
    NotFound(StepKey),
    #[error("step {0} has no running tasks")]
    NotRunning(StepKey),
    #[error("client signature does not match step {0}")]
    Unauthorized(StepKey),
    #[error("endpoint update already in flight for step {0}")]
    Transient(StepKey),
    #[error("signal delivery failed: {0}")]
    Signal(Errno),
}

/// Placement details reported by a manager once its tasks are running.
#[derive(Debug, Clone)]
pub struct StartedStep {
    pub manager_pid: i32,
    pub session_id: i32,
    pub tasks: Vec<TaskRecord>,
    pub fabric_handle: Option<FabricHandle>,
}

impl StartedStep {
    /// SIGKILL the task group and each task, for tasks nobody may keep.
    pub fn kill(&self) {
        if self.session_id > 0 {
            let _ = kill(Pid::from_raw(-self.session_id), Signal::SIGKILL);
        }
        for task in self.tasks.iter().filter(|task| task.pid > 0) {
            let _ = kill(Pid::from_raw(task.pid), Signal::SIGKILL);
        }
    }
}

struct Inner {
    steps: HashMap<StepKey, StepRecord>,
    capacity: usize,
    updating: HashSet<StepKey>,
}

#[derive(Clone)]
pub struct StepRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl StepRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                steps: HashMap::new(),
                capacity,
                updating: HashSet::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.lock().capacity = capacity;
    }

    pub fn len(&self) -> usize {
        self.lock().steps.len()
    }

    pub fn insert(&self, record: StepRecord) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        if inner.steps.contains_key(&record.key) {
            return Err(RegistryError::DuplicateKey(record.key));
        }
        if inner.steps.len() >= inner.capacity {
            return Err(RegistryError::Full(inner.capacity));
        }
        inner.steps.insert(record.key, record);
        Ok(())
    }

    /// Idempotent.
    pub fn remove(&self, key: StepKey) -> Option<StepRecord> {
        let mut inner = self.lock();
        inner.updating.remove(&key);
        inner.steps.remove(&key)
    }

    pub fn get(&self, key: StepKey) -> Option<StepRecord> {
        self.lock().steps.get(&key).cloned()
    }

    /// Run `f` on the step's state under the registry lock.
    pub fn with_state<R>(&self, key: StepKey, f: impl FnOnce(&mut StepState) -> R) -> Option<R> {
        self.lock().steps.get_mut(&key).map(|step| f(&mut step.state))
    }

    /// Advance to `next` unless the step is already there or beyond.
    pub fn advance(&self, key: StepKey, next: StepState) -> Option<StepState> {
        self.with_state(key, |state| {
            if *state < next {
                *state = next;
            }
            *state
        })
    }

    pub fn mark_started(&self, key: StepKey, started: StartedStep) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let step = inner
            .steps
            .get_mut(&key)
            .ok_or(RegistryError::NotFound(key))?;
        step.manager_pid = started.manager_pid;
        step.session_id = started.session_id;
        step.task_count = started.tasks.len() as u32;
        step.tasks = started.tasks;
        step.fabric_handle = started.fabric_handle;
        if step.state < StepState::Started {
            step.state = StepState::Started;
        }
        Ok(())
    }

    pub fn snapshot_all(&self) -> Vec<StepRecord> {
        let mut steps: Vec<StepRecord> = self.lock().steps.values().cloned().collect();
        steps.sort_by_key(|step| step.key);
        steps
    }

    pub fn job_steps(&self, job_id: JobId) -> Vec<StepRecord> {
        self.snapshot_all()
            .into_iter()
            .filter(|step| step.key.job_id == job_id)
            .collect()
    }

    /// True iff the step has a session and its leader, its group or one of
    /// its task pids is still alive.
    pub fn still_running(&self, key: StepKey) -> bool {
        self.get(key).map(|step| step.is_running()).unwrap_or(false)
    }

    pub fn job_running(&self, job_id: JobId) -> bool {
        self.job_steps(job_id).iter().any(StepRecord::is_running)
    }

    /// True while a launch of the job is between registration and its
    /// manager's readiness report.
    pub fn job_launching(&self, job_id: JobId) -> bool {
        self.lock()
            .steps
            .values()
            .any(|step| step.key.job_id == job_id && step.is_launching())
    }

    /// Install new client endpoints. The returned guard keeps the update
    /// marked in flight until it is dropped; a second caller meanwhile gets
    /// `Transient`.
    pub fn update_endpoints(
        &self,
        key: StepKey,
        reply_endpoint: &str,
        stdio_endpoint: &str,
        presented_signature: &str,
    ) -> Result<EndpointUpdate, RegistryError> {
        let mut inner = self.lock();
        if inner.updating.contains(&key) {
            return Err(RegistryError::Transient(key));
        }
        let step = inner
            .steps
            .get_mut(&key)
            .ok_or(RegistryError::NotFound(key))?;
        if step.client_signature.is_empty() || step.client_signature != presented_signature {
            return Err(RegistryError::Unauthorized(key));
        }
        step.reply_endpoint = Some(reply_endpoint.to_string());
        step.stdio_endpoint = Some(stdio_endpoint.to_string());
        inner.updating.insert(key);
        Ok(EndpointUpdate {
            registry: self.clone(),
            key,
        })
    }

    /// Ignored once the step is ending. Returns whether the limit was applied.
    pub fn update_time_limit(
        &self,
        key: StepKey,
        limit: Option<DateTime<Utc>>,
    ) -> Result<bool, RegistryError> {
        let mut inner = self.lock();
        let step = inner
            .steps
            .get_mut(&key)
            .ok_or(RegistryError::NotFound(key))?;
        if step.state >= StepState::Ending {
            debug!(step = %key, "ignoring time limit update for ending step");
            return Ok(false);
        }
        step.time_limit = limit;
        Ok(true)
    }

    /// Signal the task group and, best effort, each task pid.
    pub fn signal_step(&self, key: StepKey, signal: Signal) -> Result<(), RegistryError> {
        let step = self.get(key).ok_or(RegistryError::NotFound(key))?;
        if step.session_id <= 0 {
            return Err(RegistryError::NotRunning(key));
        }
        let group = kill(Pid::from_raw(-step.session_id), signal);
        let mut delivered = group.is_ok();
        for task in &step.tasks {
            if matches!(task.state, TaskState::Exited(_)) || task.pid <= 0 {
                continue;
            }
            if kill(Pid::from_raw(task.pid), signal).is_ok() {
                delivered = true;
            }
        }
        match group {
            _ if delivered => Ok(()),
            Err(Errno::ESRCH) => Err(RegistryError::NotRunning(key)),
            Err(errno) => Err(RegistryError::Signal(errno)),
            Ok(()) => Ok(()),
        }
    }

    /// Job whose task group contains `pid`, or whose manager is `pid`.
    pub fn pid_to_job(&self, pid: i32) -> Option<JobId> {
        let stat = read_proc_stat(pid).ok()?;
        self.lock()
            .steps
            .values()
            .find(|step| {
                (step.session_id > 0 && step.session_id == stat.pgrp)
                    || (step.manager_pid > 0 && step.manager_pid == pid)
            })
            .map(|step| step.key.job_id)
    }

    /// Remove steps whose manager process has disappeared.
    pub fn purge_dead_managers(&self) -> Vec<StepKey> {
        let mut inner = self.lock();
        let dead: Vec<StepKey> = inner
            .steps
            .values()
            .filter(|step| step.manager_pid > 0 && !process_exists(step.manager_pid))
            .map(|step| step.key)
            .collect();
        for key in &dead {
            inner.steps.remove(key);
            inner.updating.remove(key);
        }
        dead
    }
}

/// In-flight marker for an endpoint update.
pub struct EndpointUpdate {
    registry: StepRegistry,
    key: StepKey,
}

impl EndpointUpdate {
    pub fn key(&self) -> StepKey {
        self.key
    }
}

impl Drop for EndpointUpdate {
    fn drop(&mut self) {
        self.registry.lock().updating.remove(&self.key);
    }
}
