//! Failure propagation
//!
//! Errors reach the other tasks over one of two mutually exclusive
//! channels, fixed at construction: a push channel when a client cache was
//! injected (the service calls each connected task), or a pull channel
//! where tasks long-poll the service and every queued poll is completed
//! exactly once with the first error.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{CoordinationError, ErrorCode, ErrorPayload, Result};
use crate::metrics;
use crate::service::cluster::TaskLifecycle;
use crate::service::core::{SideEffects, Submitted};
use crate::service::CoordinationService;
use crate::task::TaskId;
use crate::SERVICE_TO_CLIENT_TIMEOUT;

/// Error notification pushed to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: ErrorCode,
    pub message: String,
    pub payload: ErrorPayload,
}

impl From<&CoordinationError> for ErrorNotice {
    fn from(error: &CoordinationError) -> Self {
        Self {
            code: error.code,
            message: error.message.clone(),
            payload: error.payload.clone(),
        }
    }
}

/// Service-to-task client; the transport behind it is not this crate's
/// concern
#[async_trait]
pub trait TaskClient: Send + Sync {
    async fn report_error_to_task(&self, notice: ErrorNotice) -> Result<()>;
}

/// Resolves the client for a destination task
///
/// Injecting a cache at construction selects push mode irrevocably.
pub trait TaskClientCache: Send + Sync {
    fn client(&self, task: &TaskId) -> Option<Arc<dyn TaskClient>>;
}

/// Pull-channel state: pending polls and the one-shot response latch
#[derive(Default)]
pub(crate) struct ErrorPollingState {
    responded: bool,
    error: Option<CoordinationError>,
    pollers: HashSet<TaskId>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl ErrorPollingState {
    pub(crate) fn responded(&self) -> bool {
        self.responded
    }

    pub(crate) fn latched_error(&self) -> Option<&CoordinationError> {
        self.error.as_ref()
    }

    pub(crate) fn is_task_polling(&self, task: &TaskId) -> bool {
        self.pollers.contains(task)
    }

    pub(crate) fn add_task(&mut self, task: TaskId, waiter: oneshot::Sender<Result<()>>) {
        if self.responded {
            return;
        }
        self.pollers.insert(task);
        self.waiters.push(waiter);
    }

    /// Latch the error and queue completion of every pending poll
    pub(crate) fn set_error(&mut self, error: CoordinationError, effects: &mut SideEffects) {
        if self.responded {
            return;
        }
        self.responded = true;
        self.error = Some(error.clone());
        for waiter in self.waiters.drain(..) {
            effects.completions.push((waiter, Err(error.clone())));
        }
    }
}

/// Best-effort service-originated error push; failures are logged only
pub(crate) fn report_service_error_to_task(
    cache: Option<&Arc<dyn TaskClientCache>>,
    task: &TaskId,
    error: CoordinationError,
) {
    let Some(cache) = cache else {
        error!(task = %task, %error, "no service-to-client connection to report error");
        return;
    };
    let Some(client) = cache.client(task) else {
        warn!(task = %task, "no client available for task");
        return;
    };
    let notice = ErrorNotice::from(&error);
    let task = task.clone();
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(task = %task, "no runtime available to deliver error notification");
        return;
    };
    handle.spawn(async move {
        match timeout(SERVICE_TO_CLIENT_TIMEOUT, client.report_error_to_task(notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(task = %task, error = %err, "error report to task failed"),
            Err(_) => error!(task = %task, "error report to task timed out"),
        }
    });
}

impl CoordinationService {
    /// Long-poll for the first error the service observes
    ///
    /// Resolves with an error once one is latched; rejected outright in
    /// push mode, after shutdown, or once the caller's disconnect grace
    /// window has elapsed.
    pub async fn poll_for_error(&self, task: &TaskId) -> Result<()> {
        self.submit_error_poll(task).resolve().await
    }

    fn submit_error_poll(&self, task: &TaskId) -> Submitted<()> {
        debug!(task = %task, "poll for error");
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.stopping {
            return Submitted::Done(Err(CoordinationError::internal(
                "error poll requested after the coordination service has shut down",
            )));
        }
        if self.client_cache.is_some() {
            return Submitted::Done(Err(CoordinationError::internal(
                "error polling is not available when the service pushes errors to tasks",
            )));
        }
        // First poll latches the service into pull mode for its lifetime.
        state.client_polling_for_error = true;

        let Some(task_state) = state.tasks.get(task) else {
            return Submitted::Done(Err(CoordinationError::invalid_argument(format!(
                "unknown task {task} polling for errors"
            ))));
        };
        if task_state.is_disconnected_beyond_grace() {
            return Submitted::Done(Err(CoordinationError::invalid_argument(format!(
                "task {task} is not registered or has disconnected, and cannot poll for errors"
            ))));
        }
        if let Some(status) = task_state.status() {
            return Submitted::Done(Err(status.clone()));
        }
        if state.error_polling.responded() {
            let error = state
                .error_polling
                .latched_error()
                .cloned()
                .unwrap_or_else(|| {
                    CoordinationError::internal("error response was already sent")
                });
            return Submitted::Done(Err(error));
        }
        let (tx, rx) = oneshot::channel();
        state.error_polling.add_task(task.clone(), tx);
        Submitted::Pending(rx)
    }

    /// Deliver a task's stored error to every connected peer
    ///
    /// Reads the error and recipient list under the lock, then notifies
    /// with the lock released. Recoverable jobs suppress propagation.
    pub(crate) async fn propagate_error(&self, source: &TaskId, is_reported_by_task: bool) {
        if self.config.recoverable_jobs.contains(&source.job) {
            info!(task = %source, "source task belongs to a recoverable job; not propagating");
            return;
        }
        let (error, connected) = {
            let state = self.state.lock();
            let Some(task_state) = state.tasks.get(source) else {
                return;
            };
            let Some(status) = task_state.status() else {
                return;
            };
            let mut error = status.clone();
            error.payload.source_task = Some(source.clone());
            error.payload.is_reported_error = is_reported_by_task;
            let connected: Vec<TaskId> = state
                .tasks
                .iter()
                .filter(|(_, s)| s.lifecycle() == TaskLifecycle::Connected)
                .map(|(t, _)| t.clone())
                .collect();
            (error, connected)
        };
        if connected.is_empty() {
            return;
        }

        let Some(cache) = &self.client_cache else {
            self.send_error_polling_response_or_stop(error);
            return;
        };

        let notice = ErrorNotice::from(&error);
        let mut notifications = JoinSet::new();
        for destination in connected {
            let Some(client) = cache.client(&destination) else {
                warn!(task = %destination, "no client available for task");
                continue;
            };
            let notice = notice.clone();
            notifications.spawn(async move {
                match timeout(SERVICE_TO_CLIENT_TIMEOUT, client.report_error_to_task(notice)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(task = %destination, error = %err, "error report to task failed")
                    }
                    Err(_) => error!(task = %destination, "error report to task timed out"),
                }
            });
        }
        while notifications.join_next().await.is_some() {}
        metrics::standard::ERRORS_PROPAGATED.inc();
    }

    /// Pull-channel delivery, or service self-termination when nothing has
    /// ever polled. Returns true if the service stopped.
    pub(crate) fn send_error_polling_response_or_stop(&self, error: CoordinationError) -> bool {
        let polling = self.state.lock().client_polling_for_error;
        if polling {
            self.send_error_polling_response(error);
            false
        } else {
            error!(
                %error,
                "no service-to-client connection and no polling task; stopping the service"
            );
            self.stop_sync();
            true
        }
    }

    /// Complete every queued poll exactly once with the error
    pub(crate) fn send_error_polling_response(&self, error: CoordinationError) {
        let mut effects = SideEffects::default();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.error_polling.responded() {
                return;
            }
            if error.code != ErrorCode::Cancelled {
                debug!(%error, "responding to all error polling requests");
            }
            let missing: Vec<String> = state
                .tasks
                .keys()
                .filter(|task| !state.error_polling.is_task_polling(task))
                .map(|task| task.to_string())
                .collect();
            state.error_polling.set_error(error, &mut effects);
            if !missing.is_empty() {
                error!(
                    count = missing.len(),
                    tasks = ?missing,
                    "tasks never polled for errors; the error will not reach them"
                );
            }
        }
        effects.fire(self.client_cache.as_ref());
    }
}
