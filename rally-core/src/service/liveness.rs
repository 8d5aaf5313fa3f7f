//! Background liveness monitor
//!
//! One task wakes every second and runs two scans under the cluster lock:
//! heartbeat expiry for connected tasks and deadline expiry for ongoing
//! barriers. A single worker keeps thread usage bounded; both scans share
//! its tick.

use std::sync::Weak;

use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::CoordinationError;
use crate::service::core::SideEffects;
use crate::service::CoordinationService;
use crate::task::TaskId;
use crate::LIVENESS_SCAN_INTERVAL;

/// Monitor loop; exits on the shutdown signal or once the service is gone
pub(crate) async fn run(
    service: Weak<CoordinationService>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = interval(LIVENESS_SCAN_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.recv() => break,
        }
        let Some(service) = service.upgrade() else {
            break;
        };
        if service.has_stopped() {
            break;
        }
        service.check_heartbeat_timeouts().await;
        service.check_barrier_deadlines().await;
    }
    debug!("liveness monitor exiting");
}

impl CoordinationService {
    /// Fail connected tasks whose heartbeat is overdue and propagate
    pub(crate) async fn check_heartbeat_timeouts(&self) {
        let mut stale: Vec<TaskId> = Vec::new();
        let mut effects = SideEffects::default();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let overdue: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|(_, task_state)| {
                    task_state.lifecycle() == crate::service::cluster::TaskLifecycle::Connected
                        && task_state.time_since_last_heartbeat() > self.config.heartbeat_timeout
                })
                .map(|(task, _)| task.clone())
                .collect();
            for task in overdue {
                let error = CoordinationError::unavailable(format!(
                    "task {task} heartbeat timeout; the remote task may have failed, been \
                     preempted, or crashed; check its logs for an earlier error"
                ))
                .with_source_task(task.clone());
                state.set_task_error(&task, error, &mut effects);
                stale.push(task);
            }
        }
        effects.fire(self.client_cache.as_ref());

        if stale.is_empty() {
            return;
        }
        warn!(count = stale.len(), "tasks missed their heartbeat deadline");
        if self.client_cache.is_some() {
            for task in &stale {
                self.propagate_error(task, false).await;
            }
        } else {
            let names: Vec<String> = stale.iter().map(|task| task.to_string()).collect();
            let error = CoordinationError::unavailable(format!(
                "unhealthy tasks (stopped sending heartbeats): {}",
                names.join(", ")
            ));
            self.send_error_polling_response_or_stop(error);
        }
    }

    /// Fail every ongoing barrier whose deadline has passed
    pub(crate) async fn check_barrier_deadlines(&self) {
        let now = Instant::now();
        let mut shutdown_barrier_error: Option<String> = None;
        let mut effects = SideEffects::default();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let expired: Vec<String> = state
                .ongoing_barriers
                .iter()
                .filter(|barrier_id| {
                    state
                        .barriers
                        .get(*barrier_id)
                        .map_or(false, |barrier| now > barrier.deadline)
                })
                .cloned()
                .collect();
            for barrier_id in expired {
                let message = state.barrier_timeout_message(&barrier_id);
                if barrier_id == state.shutdown_barrier_id {
                    shutdown_barrier_error = Some(message.clone());
                }
                state.pass_barrier(
                    &barrier_id,
                    Err(CoordinationError::deadline_exceeded(message)),
                    &mut effects,
                );
            }
        }
        effects.fire(self.client_cache.as_ref());

        // The shutdown barrier expiring with no push channel still has to
        // reach the tasks somehow.
        if let Some(message) = shutdown_barrier_error {
            if self.client_cache.is_none() {
                self.send_error_polling_response_or_stop(CoordinationError::deadline_exceeded(
                    format!("shutdown barrier timed out: {message}"),
                ));
            }
        }
    }
}
