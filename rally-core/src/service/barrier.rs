//! Named barrier engine
//!
//! Barriers are created lazily by their first caller and complete when
//! every participant has arrived, or fail on timeout, cancellation,
//! participant mismatch, or a participating task entering ERROR. Waiters
//! receive the one final result; re-arrival is a no-op; a passed barrier
//! answers later callers with the stored result.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{CoordinationError, Result};
use crate::metrics;
use crate::service::cluster::TaskLifecycle;
use crate::service::core::{CoreState, SideEffects, Submitted};
use crate::service::CoordinationService;
use crate::task::TaskId;
use crate::{ONGOING_BARRIERS_SOFT_LIMIT, PENDING_TASK_LOG_LIMIT};

/// One barrier instance; transient, recreated if the id is reused
pub(crate) struct BarrierState {
    pub(crate) passed: bool,
    /// Final status; meaningful only once `passed` is set
    pub(crate) result: Result<()>,
    pub(crate) deadline: Instant,
    /// Participant -> has-arrived
    pub(crate) tasks_at_barrier: HashMap<TaskId, bool>,
    pub(crate) num_pending: usize,
    pub(crate) waiters: Vec<oneshot::Sender<Result<()>>>,
    /// First task to call this barrier id
    pub(crate) initiating_task: TaskId,
}

impl BarrierState {
    pub(crate) fn new(initiating_task: TaskId, deadline: Instant) -> Self {
        Self {
            passed: false,
            result: Err(CoordinationError::internal("barrier has not completed")),
            deadline,
            tasks_at_barrier: HashMap::new(),
            num_pending: 0,
            waiters: Vec::new(),
            initiating_task,
        }
    }
}

/// Participant-set consistency across calls to the same barrier id
///
/// Two calls agree when both pass an empty list and the barrier spans the
/// whole cluster, or both pass non-empty lists of equal size with every
/// caller-listed task present in the barrier.
pub(crate) fn participants_match(
    participants: &[TaskId],
    tasks_at_barrier: &HashMap<TaskId, bool>,
    cluster_size: usize,
) -> bool {
    if participants.is_empty() {
        tasks_at_barrier.len() == cluster_size
    } else if tasks_at_barrier.len() != participants.len() {
        false
    } else {
        participants
            .iter()
            .all(|task| tasks_at_barrier.contains_key(task))
    }
}

impl CoreState {
    /// Finish a barrier; called exactly once per barrier instance
    pub(crate) fn pass_barrier(
        &mut self,
        barrier_id: &str,
        result: Result<()>,
        effects: &mut SideEffects,
    ) {
        let Some(mut barrier) = self.barriers.remove(barrier_id) else {
            return;
        };
        barrier.passed = true;
        barrier.result = result.clone();
        match &result {
            Ok(()) => {
                debug!(barrier_id, "barrier has passed");
                metrics::standard::BARRIERS_PASSED.inc();
            }
            Err(err) => {
                debug!(barrier_id, error = %err, "barrier has failed");
                metrics::standard::BARRIERS_FAILED.inc();
            }
        }

        if barrier_id == self.device_barrier_id {
            self.aggregate_cluster_devices();
        }

        for task in barrier.tasks_at_barrier.keys() {
            if let Some(state) = self.tasks.get_mut(task) {
                state.exit_barrier(barrier_id);
            }
        }

        if barrier_id == self.shutdown_barrier_id {
            match &result {
                Ok(()) => info!("shutdown barrier has passed"),
                Err(err) => error!(
                    error = %err,
                    "shutdown barrier failed; the tasks are out of sync, with at least one \
                     crashing early or hanging"
                ),
            }
            let straggler_error = CoordinationError::internal(format!(
                "shutdown barrier failed before this task arrived: {}",
                match &result {
                    Ok(()) => "passed".to_string(),
                    Err(err) => err.to_string(),
                }
            ));
            for (task, arrived) in &barrier.tasks_at_barrier {
                if *arrived {
                    // Tasks that reached the barrier disconnect together.
                    if let Err(err) = self.disconnect_task(task, effects) {
                        error!(task = %task, error = %err, "failed to disconnect task at shutdown barrier");
                    }
                } else if result.is_err() {
                    effects
                        .service_errors
                        .push((task.clone(), straggler_error.clone()));
                }
            }
        }

        barrier.tasks_at_barrier.clear();
        self.ongoing_barriers.remove(barrier_id);
        for waiter in barrier.waiters.drain(..) {
            effects.completions.push((waiter, result.clone()));
        }
        self.barriers.insert(barrier_id.to_string(), barrier);
    }

    /// Human-oriented description of a barrier that hit its deadline
    pub(crate) fn barrier_timeout_message(&self, barrier_id: &str) -> String {
        let Some(barrier) = self.barriers.get(barrier_id) else {
            return format!("barrier {barrier_id} timed out");
        };
        let mut pending_names: Vec<String> = Vec::new();
        let mut pending = 0usize;
        for (task, arrived) in &barrier.tasks_at_barrier {
            if *arrived {
                continue;
            }
            pending += 1;
            if pending_names.len() < PENDING_TASK_LOG_LIMIT {
                pending_names.push(task.to_string());
            }
        }
        let arrived = barrier.tasks_at_barrier.len() - pending;
        format!(
            "barrier {barrier_id} timed out: {arrived}/{} tasks arrived; first task at the \
             barrier: {}; tasks that never arrived: {}",
            barrier.tasks_at_barrier.len(),
            barrier.initiating_task,
            pending_names.join(", ")
        )
    }
}

impl CoordinationService {
    /// Wait on a named barrier until every participant arrives
    ///
    /// An empty `participants` list means the whole cluster. The first
    /// caller creates the barrier and fixes its deadline to `now + timeout`.
    pub async fn barrier(
        &self,
        barrier_id: &str,
        timeout: Duration,
        task: &TaskId,
        participants: &[TaskId],
    ) -> Result<()> {
        let start = Instant::now();
        let (submitted, effects) = self.submit_barrier(barrier_id, timeout, task, participants);
        effects.fire(self.client_cache.as_ref());
        let result = submitted.resolve().await;
        metrics::standard::BARRIER_WAIT_DURATION.observe(start.elapsed().as_secs_f64());
        result
    }

    fn submit_barrier(
        &self,
        barrier_id: &str,
        timeout: Duration,
        task: &TaskId,
        participants: &[TaskId],
    ) -> (Submitted<()>, SideEffects) {
        debug!(task = %task, barrier_id, "barrier requested");
        let mut effects = SideEffects::default();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.stopping {
            return (
                Submitted::Done(Err(CoordinationError::internal(
                    "barrier requested after the coordination service has shut down",
                ))),
                effects,
            );
        }
        if !state.tasks.contains_key(task) {
            return (
                Submitted::Done(Err(CoordinationError::invalid_argument(format!(
                    "unknown task {task} called barrier {barrier_id}"
                )))),
                effects,
            );
        }

        // A non-participating caller poisons the barrier: every current and
        // future waiter of this instance receives the error.
        if !participants.is_empty() && !participants.contains(task) {
            let error = CoordinationError::invalid_argument(format!(
                "non-participating task {task} called barrier {barrier_id}"
            ));
            let needs_fail = state
                .barriers
                .get(barrier_id)
                .map_or(true, |barrier| !barrier.passed);
            if needs_fail {
                state
                    .barriers
                    .entry(barrier_id.to_string())
                    .or_insert_with(|| BarrierState::new(task.clone(), Instant::now() + timeout));
                state.pass_barrier(barrier_id, Err(error.clone()), &mut effects);
            }
            return (Submitted::Done(Err(error)), effects);
        }

        if !state.barriers.contains_key(barrier_id) {
            let mut barrier = BarrierState::new(task.clone(), Instant::now() + timeout);
            if participants.is_empty() {
                for member in state.tasks.keys() {
                    barrier.tasks_at_barrier.insert(member.clone(), false);
                }
            } else {
                for member in participants {
                    if !state.tasks.contains_key(member) {
                        let error = CoordinationError::invalid_argument(format!(
                            "task {member} named in barrier {barrier_id} is not part of the cluster"
                        ));
                        state.barriers.insert(barrier_id.to_string(), barrier);
                        state.pass_barrier(barrier_id, Err(error.clone()), &mut effects);
                        return (Submitted::Done(Err(error)), effects);
                    }
                    barrier.tasks_at_barrier.insert(member.clone(), false);
                }
            }
            barrier.num_pending = barrier.tasks_at_barrier.len();

            // A participant already in error fails the barrier immediately.
            let errored = barrier
                .tasks_at_barrier
                .keys()
                .find(|member| {
                    state
                        .tasks
                        .get(*member)
                        .map_or(false, |s| s.lifecycle() == TaskLifecycle::Error)
                })
                .cloned();
            if let Some(errored) = errored {
                let error = CoordinationError::internal(format!(
                    "task {errored} was already in error when barrier {barrier_id} was created"
                ))
                .with_source_task(errored.clone());
                state.barriers.insert(barrier_id.to_string(), barrier);
                state.pass_barrier(barrier_id, Err(error.clone()), &mut effects);
                return (Submitted::Done(Err(error)), effects);
            }

            for member in barrier.tasks_at_barrier.keys() {
                if let Some(member_state) = state.tasks.get_mut(member) {
                    member_state.join_barrier(barrier_id);
                }
            }
            state.ongoing_barriers.insert(barrier_id.to_string());
            if state.ongoing_barriers.len() > ONGOING_BARRIERS_SOFT_LIMIT {
                warn!(
                    count = state.ongoing_barriers.len(),
                    "high number of ongoing barriers"
                );
            }
            state.barriers.insert(barrier_id.to_string(), barrier);
        }

        let cluster_size = state.tasks.len();
        let (passed, stored_result, consistent) = match state.barriers.get(barrier_id) {
            Some(barrier) => (
                barrier.passed,
                barrier.result.clone(),
                participants_match(participants, &barrier.tasks_at_barrier, cluster_size),
            ),
            None => {
                return (
                    Submitted::Done(Err(CoordinationError::internal(format!(
                        "barrier {barrier_id} record disappeared"
                    )))),
                    effects,
                )
            }
        };

        // Already passed: answer with the stored result. The shutdown
        // barrier additionally disconnects the late caller, surfacing any
        // disconnect error instead.
        if passed {
            if barrier_id == state.shutdown_barrier_id {
                if let Err(error) = state.disconnect_task(task, &mut effects) {
                    return (Submitted::Done(Err(error)), effects);
                }
            }
            return (Submitted::Done(stored_result), effects);
        }

        let (tx, rx) = oneshot::channel();
        if let Some(barrier) = state.barriers.get_mut(barrier_id) {
            barrier.waiters.push(tx);
        }

        if !consistent {
            let error = CoordinationError::invalid_argument(format!(
                "conflicting participant sets specified for barrier {barrier_id}"
            ));
            state.pass_barrier(barrier_id, Err(error), &mut effects);
            return (Submitted::Pending(rx), effects);
        }

        let mut now_complete = false;
        if let Some(barrier) = state.barriers.get_mut(barrier_id) {
            if let Some(arrived) = barrier.tasks_at_barrier.get_mut(task) {
                // Re-arrival by the same task is a no-op.
                if !*arrived {
                    *arrived = true;
                    barrier.num_pending -= 1;
                    now_complete = barrier.num_pending == 0;
                }
            }
        }
        if now_complete {
            state.pass_barrier(barrier_id, Ok(()), &mut effects);
        }
        (Submitted::Pending(rx), effects)
    }

    /// Cancel an un-passed barrier; every waiter receives `Cancelled`
    ///
    /// Cancelling an id that was never used creates a pre-cancelled record
    /// so later `barrier` calls on it fail immediately.
    pub fn cancel_barrier(&self, barrier_id: &str, task: &TaskId) -> Result<()> {
        let mut effects = SideEffects::default();
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.stopping {
                Err(CoordinationError::internal(
                    "barrier cancellation requested after the coordination service has shut down",
                ))
            } else {
                if !state.barriers.contains_key(barrier_id) {
                    warn!(barrier_id, task = %task, "barrier cancelled before it was created");
                    state.barriers.insert(
                        barrier_id.to_string(),
                        BarrierState::new(task.clone(), Instant::now()),
                    );
                }
                let already_passed = state
                    .barriers
                    .get(barrier_id)
                    .filter(|barrier| barrier.passed)
                    .map(|barrier| match &barrier.result {
                        Ok(()) => "Ok".to_string(),
                        Err(err) => err.code.to_string(),
                    });
                match already_passed {
                    Some(code) => Err(CoordinationError::failed_precondition(format!(
                        "barrier {barrier_id} has already passed with status {code}"
                    ))),
                    None => {
                        let error = CoordinationError::cancelled(format!(
                            "barrier {barrier_id} cancelled by task {task}"
                        ));
                        state.pass_barrier(barrier_id, Err(error), &mut effects);
                        info!(barrier_id, task = %task, "barrier cancelled");
                        Ok(())
                    }
                }
            }
        };
        effects.fire(self.client_cache.as_ref());
        result
    }
}
