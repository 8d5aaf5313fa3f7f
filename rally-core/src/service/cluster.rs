//! Per-task lifecycle state
//!
//! Each configured task has one record on the service side.
//!
//! State transition:
//!                Register           Heartbeat timeout
//!   DISCONNECTED -------> CONNECTED -----------------> ERROR
//!                              |      ReportTaskError
//!                              +----------------------> ERROR
//!
//! When a task enters ERROR the service propagates the status to the other
//! connected tasks in the cluster.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{CoordinationError, Result};
use crate::service::devices::DeviceInventory;
use crate::task::TaskId;

/// Lifecycle of a task as seen by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskLifecycle {
    /// Initial state, and the state after reset or shutdown
    Disconnected,
    /// Registered and heartbeating
    Connected,
    /// Failed; the stored status says why
    Error,
}

/// Snapshot of one task's state returned by `get_task_state`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStateInfo {
    pub task: TaskId,
    pub state: TaskLifecycle,
    pub error: Option<CoordinationError>,
}

/// Service-side record for one configured task
pub(crate) struct TaskState {
    lifecycle: TaskLifecycle,
    incarnation: u64,
    status: Option<CoordinationError>,
    // Tiny dedicated lock so the liveness scan can snapshot timestamps
    // without contending with read-only state checks.
    last_heartbeat: Mutex<Instant>,
    // Deadline after which heartbeats and error polls from a disconnected
    // task are rejected. Covers the lag between the service recording the
    // disconnect and the agent noticing it.
    disconnect_grace_deadline: Option<Instant>,
    devices: DeviceInventory,
    ongoing_barriers: HashSet<String>,
}

impl TaskState {
    pub(crate) fn new() -> Self {
        Self {
            lifecycle: TaskLifecycle::Disconnected,
            incarnation: 0,
            status: None,
            last_heartbeat: Mutex::new(Instant::now()),
            disconnect_grace_deadline: None,
            devices: DeviceInventory::default(),
            ongoing_barriers: HashSet::new(),
        }
    }

    pub(crate) fn lifecycle(&self) -> TaskLifecycle {
        self.lifecycle
    }

    pub(crate) fn status(&self) -> Option<&CoordinationError> {
        self.status.as_ref()
    }

    pub(crate) fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub(crate) fn set_connected(&mut self, incarnation: u64) {
        self.lifecycle = TaskLifecycle::Connected;
        self.status = None;
        self.incarnation = incarnation;
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub(crate) fn disconnect(&mut self, grace_period: Duration) {
        self.disconnect_grace_deadline = Some(Instant::now() + grace_period);
        self.lifecycle = TaskLifecycle::Disconnected;
        self.status = None;
    }

    pub(crate) fn set_error(&mut self, error: CoordinationError) {
        if self.lifecycle == TaskLifecycle::Error {
            return;
        }
        self.lifecycle = TaskLifecycle::Error;
        self.status = Some(error);
    }

    /// Refresh the heartbeat timestamp; the caller has already checked the
    /// task is not in error
    pub(crate) fn record_heartbeat(&self, incarnation: u64) -> Result<()> {
        if incarnation != self.incarnation {
            return Err(CoordinationError::aborted(format!(
                "incarnation mismatch: expected {} but got {incarnation}; the remote task has restarted",
                self.incarnation
            )));
        }
        *self.last_heartbeat.lock() = Instant::now();
        Ok(())
    }

    pub(crate) fn time_since_last_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    /// True once a disconnected task has used up its grace window.
    ///
    /// A task that never connected has no deadline and is treated as
    /// beyond the window.
    pub(crate) fn is_disconnected_beyond_grace(&self) -> bool {
        self.lifecycle == TaskLifecycle::Disconnected
            && self
                .disconnect_grace_deadline
                .map_or(true, |deadline| Instant::now() > deadline)
    }

    pub(crate) fn collect_devices(&mut self, devices: DeviceInventory) {
        self.devices = devices;
    }

    pub(crate) fn devices_collected(&self) -> bool {
        !self.devices.is_empty()
    }

    pub(crate) fn devices(&self) -> &DeviceInventory {
        &self.devices
    }

    pub(crate) fn join_barrier(&mut self, barrier_id: &str) {
        self.ongoing_barriers.insert(barrier_id.to_string());
    }

    pub(crate) fn exit_barrier(&mut self, barrier_id: &str) {
        self.ongoing_barriers.remove(barrier_id);
    }

    pub(crate) fn ongoing_barriers(&self) -> &HashSet<String> {
        &self.ongoing_barriers
    }
}
