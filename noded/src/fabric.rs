//! Interconnect capability.
//!
//! Hooks are called at fixed points of a step's life: `node_init` once at
//! daemon start, `preinit` before the manager is spawned, `init` in the
//! manager before any task exists, `attach` once per task right before it is
//! forked, then `fini` and `postfini` after the last task has been reaped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use noded_common::StepKey;

use crate::config::FabricKind;

/// Opaque per-step value handed back to the fabric on later hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("fabric {hook} failed: {reason}")]
pub struct FabricError {
    pub hook: &'static str,
    pub reason: String,
}

/// What a fabric sees of a step.
#[derive(Debug, Clone)]
pub struct StepLayout {
    pub key: StepKey,
    pub task_count: u32,
    pub total_tasks: u32,
    pub node_count: u32,
    pub node_index: u32,
}

pub trait Fabric: Send + Sync {
    fn name(&self) -> &'static str;

    fn node_init(&self) -> Result<(), FabricError>;

    fn preinit(&self, step: &StepLayout) -> Result<(), FabricError>;

    fn init(&self, step: &StepLayout) -> Result<FabricHandle, FabricError>;

    /// Environment additions for the task with local index `task_index`.
    fn attach(
        &self,
        handle: &FabricHandle,
        task_index: u32,
    ) -> Result<Vec<(String, String)>, FabricError>;

    fn fini(&self, handle: &FabricHandle) -> Result<(), FabricError>;

    fn postfini(&self, handle: &FabricHandle) -> Result<(), FabricError>;
}

/// Plain TCP/IP nodes: nothing to set up.
#[derive(Debug, Default)]
pub struct NoopFabric;

impl Fabric for NoopFabric {
    fn name(&self) -> &'static str {
        "none"
    }

    fn node_init(&self) -> Result<(), FabricError> {
        Ok(())
    }

    fn preinit(&self, _step: &StepLayout) -> Result<(), FabricError> {
        Ok(())
    }

    fn init(&self, step: &StepLayout) -> Result<FabricHandle, FabricError> {
        Ok(FabricHandle(format!("none:{}", step.key)))
    }

    fn attach(
        &self,
        _handle: &FabricHandle,
        _task_index: u32,
    ) -> Result<Vec<(String, String)>, FabricError> {
        Ok(Vec::new())
    }

    fn fini(&self, _handle: &FabricHandle) -> Result<(), FabricError> {
        Ok(())
    }

    fn postfini(&self, _handle: &FabricHandle) -> Result<(), FabricError> {
        Ok(())
    }
}

pub fn from_kind(kind: FabricKind) -> Arc<dyn Fabric> {
    match kind {
        FabricKind::None => Arc::new(NoopFabric),
    }
}
