use std::fmt;

use serde::{Deserialize, Serialize};

pub type JobId = u32;
pub type StepId = u32;

/// Step id of a batch job: the job itself rather than one of its steps.
pub const WHOLE_JOB: StepId = 0xffff_fffe;

/// Registry key of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    pub job_id: JobId,
    pub step_id: StepId,
}

impl StepKey {
    pub fn new(job_id: JobId, step_id: StepId) -> Self {
        Self { job_id, step_id }
    }

    pub fn is_batch(&self) -> bool {
        self.step_id == WHOLE_JOB
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_batch() {
            write!(f, "{}.batch", self.job_id)
        } else {
            write!(f, "{}.{}", self.job_id, self.step_id)
        }
    }
}
