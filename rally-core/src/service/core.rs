//! Serialized cluster state and the deferred-side-effect queue
//!
//! Everything the service mutates lives behind one lock. Handlers run
//! their transition logic under the lock while queueing waiter completions
//! and best-effort error pushes into a `SideEffects` value, which is fired
//! only after the guard drops. No user-visible completion happens inside
//! the critical section.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::error::{CoordinationError, Result};
use crate::metrics;
use crate::service::barrier::BarrierState;
use crate::service::cluster::{TaskLifecycle, TaskState};
use crate::service::devices::{DeviceAggregator, DeviceInventory};
use crate::service::propagation::{self, ErrorPollingState, TaskClientCache};
use crate::task::TaskId;
use crate::PENDING_STRAGGLER_LOG_LIMIT;

/// Outcome of submitting an operation that may have to wait
pub(crate) enum Submitted<T> {
    /// Completed while the lock was held
    Done(Result<T>),
    /// Queued; the receiver resolves when the operation completes
    Pending(oneshot::Receiver<Result<T>>),
}

impl<T> Submitted<T> {
    pub(crate) async fn resolve(self) -> Result<T> {
        match self {
            Submitted::Done(result) => result,
            Submitted::Pending(rx) => rx.await.unwrap_or_else(|_| {
                Err(CoordinationError::internal(
                    "coordination service dropped the request before responding",
                ))
            }),
        }
    }
}

/// Work queued under the lock and executed after it is released
#[derive(Default)]
pub(crate) struct SideEffects {
    /// Barrier and error-poll waiters to complete
    pub(crate) completions: Vec<(oneshot::Sender<Result<()>>, Result<()>)>,
    /// Best-effort service-originated error notifications to push
    pub(crate) service_errors: Vec<(TaskId, CoordinationError)>,
}

impl SideEffects {
    pub(crate) fn fire(self, cache: Option<&Arc<dyn TaskClientCache>>) {
        for (waiter, result) in self.completions {
            let _ = waiter.send(result);
        }
        for (task, error) in self.service_errors {
            propagation::report_service_error_to_task(cache, &task, error);
        }
    }
}

/// All state guarded by the cluster lock
pub(crate) struct CoreState {
    pub(crate) stopping: bool,
    pub(crate) tasks: HashMap<TaskId, TaskState>,
    pub(crate) barriers: HashMap<String, BarrierState>,
    pub(crate) ongoing_barriers: HashSet<String>,
    pub(crate) cluster_devices: DeviceInventory,
    pub(crate) post_aggregate: Option<DeviceAggregator>,
    pub(crate) error_polling: ErrorPollingState,
    pub(crate) client_polling_for_error: bool,
    pub(crate) device_barrier_id: String,
    pub(crate) shutdown_barrier_id: String,
    pub(crate) grace_period: Duration,
}

impl CoreState {
    /// Mark a task failed and cascade the failure to every barrier it is in
    pub(crate) fn set_task_error(
        &mut self,
        task: &TaskId,
        error: CoordinationError,
        effects: &mut SideEffects,
    ) {
        let barrier_ids: Vec<String> = match self.tasks.get_mut(task) {
            Some(state) => {
                state.set_error(error.clone());
                state.ongoing_barriers().iter().cloned().collect()
            }
            None => return,
        };
        for barrier_id in barrier_ids {
            let barrier_error = CoordinationError::internal(format!(
                "barrier {barrier_id} failed because task {task} is in error: {error}"
            ))
            .with_source_task(task.clone());
            self.pass_barrier(&barrier_id, Err(barrier_error), effects);
        }
        error!(task = %task, %error, "task has been set to ERROR");
        metrics::standard::CONNECTED_TASKS.set(self.connected_count() as i64);
    }

    /// Transition a task to DISCONNECTED and fail its ongoing barriers
    pub(crate) fn disconnect_task(
        &mut self,
        task: &TaskId,
        effects: &mut SideEffects,
    ) -> Result<()> {
        if self.stopping {
            return Err(CoordinationError::internal(format!(
                "coordination service has stopped; cannot disconnect {task}"
            )));
        }
        let grace_period = self.grace_period;
        let barrier_ids: Vec<String> = match self.tasks.get_mut(task) {
            None => {
                return Err(CoordinationError::invalid_argument(format!(
                    "unexpected disconnect request for task {task}"
                )))
            }
            Some(state) => {
                if state.lifecycle() == TaskLifecycle::Disconnected {
                    return Err(CoordinationError::failed_precondition(format!(
                        "task {task} is already disconnected"
                    )));
                }
                state.disconnect(grace_period);
                state.ongoing_barriers().iter().cloned().collect()
            }
        };
        for barrier_id in barrier_ids {
            let barrier_error = CoordinationError::internal(format!(
                "barrier {barrier_id} failed because task {task} has disconnected"
            ))
            .with_source_task(task.clone());
            self.pass_barrier(&barrier_id, Err(barrier_error), effects);
        }
        info!(task = %task, "task has disconnected from the coordination service");
        metrics::standard::CONNECTED_TASKS.set(self.connected_count() as i64);
        Ok(())
    }

    pub(crate) fn connected_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|state| state.lifecycle() == TaskLifecycle::Connected)
            .count()
    }

    /// Log progress towards having every task connected
    pub(crate) fn log_connect_status(&self) {
        let total = self.tasks.len();
        let mut pending = 0;
        let mut stragglers: Vec<String> = Vec::new();
        for (task, state) in &self.tasks {
            if state.lifecycle() != TaskLifecycle::Connected {
                pending += 1;
                if stragglers.len() < PENDING_STRAGGLER_LOG_LIMIT {
                    stragglers.push(task.to_string());
                }
            }
        }
        info!(pending, total, "waiting for tasks to connect");
        if !stragglers.is_empty() {
            info!(stragglers = ?stragglers, "example stragglers");
        }
    }

    /// Merge per-task inventories into the cluster-wide device list
    ///
    /// Runs at most once per service lifetime; order depends only on the
    /// `(job, task)` lexicographic order of the configured tasks.
    pub(crate) fn aggregate_cluster_devices(&mut self) {
        if !self.cluster_devices.is_empty() {
            warn!("cluster devices already aggregated; skipping");
            return;
        }
        let mut ordered: Vec<(&TaskId, &TaskState)> = self.tasks.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));

        let mut merged = DeviceInventory::default();
        for (_, state) in ordered {
            merged.merge_from(state.devices());
        }
        let merged = match &self.post_aggregate {
            Some(aggregate) => aggregate(merged),
            None => merged,
        };
        info!(devices = merged.len(), "aggregated cluster device inventory");
        self.cluster_devices = merged;
    }
}
