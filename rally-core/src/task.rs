//! Task identity
//!
//! A task is one process of a coordinated job, identified by the job name
//! and its index within the job.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a task in the cluster
///
/// Equality and hashing are structural on `(job, task)`. Ordering is
/// lexicographic on the same pair, which fixes the deterministic order used
/// by device aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Name of the job this task belongs to
    pub job: String,
    /// Index of the task within the job
    pub task: u32,
}

impl TaskId {
    pub fn new(job: impl Into<String>, task: u32) -> Self {
        Self {
            job: job.into(),
            task,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/job:{}/replica:0/task:{}", self.job, self.task)
    }
}
