//! Coordination service
//!
//! One long-lived service object tracks the lifecycle of a fixed set of
//! tasks, synchronizes them through named barriers, propagates failures,
//! aggregates device inventories, and fronts the shared key/value store.
//! RPC handlers call the public methods; each call runs its transition
//! logic under the single cluster lock and fires queued side effects after
//! releasing it.

mod barrier;
mod cluster;
mod core;
mod devices;
mod liveness;
mod propagation;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use cluster::{TaskLifecycle, TaskStateInfo};
pub use devices::{DeviceInventory, DeviceRecord};
pub use propagation::{ErrorNotice, TaskClient, TaskClientCache};

use crate::error::{CoordinationError, ErrorCode, Result};
use crate::kv::{KeyValueEntry, KvStore};
use crate::metrics;
use crate::service::cluster::TaskState;
use crate::service::core::{CoreState, SideEffects};
use crate::service::propagation::ErrorPollingState;
use crate::shutdown::ShutdownSignal;
use crate::task::TaskId;
use crate::{DEFAULT_HEARTBEAT_TIMEOUT, DEVICE_PROPAGATION_TIMEOUT};

/// One coordinated job: a name and how many tasks it runs
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub num_tasks: u32,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, num_tasks: u32) -> Self {
        Self {
            name: name.into(),
            num_tasks,
        }
    }
}

/// Configuration for the coordination service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long a connected task may go without heartbeating; zero selects
    /// the 10 s default
    pub heartbeat_timeout: Duration,
    /// Timeout of the distinguished shutdown barrier; zero disables it and
    /// tasks disconnect individually
    pub shutdown_barrier_timeout: Duration,
    /// Let a task that failed with `Unavailable` re-register under a new
    /// incarnation
    pub allow_new_incarnation_to_reconnect: bool,
    /// Jobs whose task failures are not propagated to peers
    pub recoverable_jobs: HashSet<String>,
    /// The fixed cluster membership
    pub jobs: Vec<JobSpec>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            shutdown_barrier_timeout: Duration::ZERO,
            allow_new_incarnation_to_reconnect: false,
            recoverable_jobs: HashSet::new(),
            jobs: Vec::new(),
        }
    }
}

/// The coordination service
///
/// Construct with [`CoordinationService::new`], then call
/// [`CoordinationService::start`] from within a Tokio runtime to spawn the
/// liveness monitor.
pub struct CoordinationService {
    config: ServiceConfig,
    client_cache: Option<Arc<dyn TaskClientCache>>,
    service_incarnation: u64,
    device_barrier_id: String,
    shutdown_barrier_id: String,
    state: Mutex<CoreState>,
    kv: KvStore,
    shutdown: ShutdownSignal,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationService {
    /// Build the service with its fixed task set
    ///
    /// Presence of `client_cache` selects push-mode error delivery for the
    /// lifetime of the service.
    pub fn new(mut config: ServiceConfig, client_cache: Option<Arc<dyn TaskClientCache>>) -> Self {
        if config.heartbeat_timeout.is_zero() {
            config.heartbeat_timeout = DEFAULT_HEARTBEAT_TIMEOUT;
        }
        let service_incarnation = rand::random::<u64>();
        let device_barrier_id = format!("WaitForAllTasks::{service_incarnation}");
        let shutdown_barrier_id = format!("Shutdown::{service_incarnation}");

        let mut tasks = HashMap::new();
        for job in &config.jobs {
            for index in 0..job.num_tasks {
                tasks.insert(TaskId::new(job.name.clone(), index), TaskState::new());
            }
        }
        info!(
            incarnation = service_incarnation,
            tasks = tasks.len(),
            push_mode = client_cache.is_some(),
            "initializing coordination service"
        );

        let state = CoreState {
            stopping: false,
            tasks,
            barriers: HashMap::new(),
            ongoing_barriers: HashSet::new(),
            cluster_devices: DeviceInventory::default(),
            post_aggregate: None,
            error_polling: ErrorPollingState::default(),
            client_polling_for_error: false,
            device_barrier_id: device_barrier_id.clone(),
            shutdown_barrier_id: shutdown_barrier_id.clone(),
            grace_period: config.heartbeat_timeout,
        };

        Self {
            config,
            client_cache,
            service_incarnation,
            device_barrier_id,
            shutdown_barrier_id,
            state: Mutex::new(state),
            kv: KvStore::new(),
            shutdown: ShutdownSignal::new(),
            monitor: Mutex::new(None),
        }
    }

    /// Spawn the background liveness monitor
    pub fn start(self: &Arc<Self>) {
        let service = Arc::downgrade(self);
        let shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(liveness::run(service, shutdown_rx));
        *self.monitor.lock() = Some(handle);
    }

    /// The random incarnation distinguishing this service instance
    pub fn service_incarnation(&self) -> u64 {
        self.service_incarnation
    }

    pub(crate) fn has_stopped(&self) -> bool {
        self.state.lock().stopping
    }

    /// Connect a task, or refresh an idempotent retry of a registration
    pub async fn register_task(&self, task: &TaskId, incarnation: u64) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Decision {
            Connected,
            Reconnected,
            Restarted,
            InError,
        }

        let mut effects = SideEffects::default();
        let mut needs_propagation = false;
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.stopping {
                Err(CoordinationError::internal(format!(
                    "coordination service has stopped; RegisterTask from {task} failed; this \
                     usually implies an earlier error shut the service down before the tasks \
                     disconnected gracefully"
                )))
            } else {
                let allow_reconnect = self.config.allow_new_incarnation_to_reconnect;
                let decision = match state.tasks.get_mut(task) {
                    None => None,
                    Some(task_state) => {
                        let reconnectable = allow_reconnect
                            && task_state
                                .status()
                                .map_or(false, |status| status.code == ErrorCode::Unavailable);
                        Some(match task_state.lifecycle() {
                            TaskLifecycle::Disconnected => {
                                task_state.set_connected(incarnation);
                                Decision::Connected
                            }
                            TaskLifecycle::Error if reconnectable => {
                                task_state.set_connected(incarnation);
                                Decision::Connected
                            }
                            TaskLifecycle::Connected
                                if task_state.incarnation() == incarnation =>
                            {
                                // Retry of a registration whose response was
                                // lost; refresh the heartbeat window.
                                task_state.set_connected(incarnation);
                                Decision::Reconnected
                            }
                            TaskLifecycle::Connected => Decision::Restarted,
                            TaskLifecycle::Error => Decision::InError,
                        })
                    }
                };
                match decision {
                    None => Err(CoordinationError::invalid_argument(format!(
                        "unexpected task {task} attempted to register"
                    ))),
                    Some(Decision::Connected) | Some(Decision::Reconnected) => {
                        if decision == Some(Decision::Connected) {
                            info!(task = %task, incarnation, "task connected to coordination service");
                        } else {
                            info!(task = %task, incarnation, "task re-registered with the same incarnation");
                        }
                        state.log_connect_status();
                        metrics::standard::CONNECTED_TASKS.set(state.connected_count() as i64);
                        Ok(())
                    }
                    Some(decision) => {
                        let message = if decision == Decision::Restarted {
                            format!(
                                "task {task} attempted to register with a different incarnation; \
                                 the remote task has likely restarted"
                            )
                        } else {
                            format!(
                                "task {task} attempted to register while already in error; reset \
                                 the task before reconnecting"
                            )
                        };
                        error!(task = %task, "{message}");
                        let error =
                            CoordinationError::aborted(message).with_source_task(task.clone());
                        state.set_task_error(task, error.clone(), &mut effects);
                        needs_propagation = true;
                        Err(error)
                    }
                }
            }
        };
        effects.fire(self.client_cache.as_ref());
        if needs_propagation {
            self.propagate_error(task, false).await;
        }
        result
    }

    /// Refresh a connected task's liveness window
    pub async fn record_heartbeat(&self, task: &TaskId, incarnation: u64) -> Result<()> {
        enum Outcome {
            Recorded,
            Fail(CoordinationError),
            FailAndPropagate(CoordinationError),
        }

        let mut effects = SideEffects::default();
        let mut needs_propagation = false;
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let outcome = if state.stopping {
                Outcome::Fail(CoordinationError::internal(format!(
                    "coordination service has stopped; RecordHeartbeat from {task} failed"
                )))
            } else {
                match state.tasks.get(task) {
                    None => Outcome::Fail(CoordinationError::invalid_argument(format!(
                        "heartbeat from unknown task {task}; this usually implies a \
                         configuration error"
                    ))),
                    Some(task_state) => {
                        if let Some(status) = task_state.status() {
                            Outcome::Fail(status.clone())
                        } else if task_state.is_disconnected_beyond_grace() {
                            Outcome::Fail(CoordinationError::invalid_argument(format!(
                                "task {task} must register before sending heartbeats"
                            )))
                        } else {
                            match task_state.record_heartbeat(incarnation) {
                                Ok(()) => Outcome::Recorded,
                                Err(error) => Outcome::FailAndPropagate(
                                    error.with_source_task(task.clone()),
                                ),
                            }
                        }
                    }
                }
            };
            match outcome {
                Outcome::Recorded => {
                    debug!(task = %task, incarnation, "heartbeat recorded");
                    metrics::standard::HEARTBEATS_RECORDED.inc();
                    Ok(())
                }
                Outcome::Fail(error) => Err(error),
                Outcome::FailAndPropagate(error) => {
                    state.set_task_error(task, error.clone(), &mut effects);
                    needs_propagation = true;
                    Err(error)
                }
            }
        };
        effects.fire(self.client_cache.as_ref());
        if needs_propagation {
            self.propagate_error(task, false).await;
        }
        result
    }

    /// Record an error reported by the task itself and propagate it
    pub async fn report_task_error(&self, task: &TaskId, error: CoordinationError) -> Result<()> {
        let mut effects = SideEffects::default();
        let mut needs_propagation = false;
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.stopping {
                Err(CoordinationError::internal(
                    "coordination service has stopped; ReportTaskError failed",
                ))
            } else {
                match state.tasks.get(task) {
                    None => Err(CoordinationError::invalid_argument(format!(
                        "unexpected error report from task {task}"
                    ))),
                    Some(task_state) if task_state.lifecycle() != TaskLifecycle::Connected => {
                        Err(CoordinationError::failed_precondition(format!(
                            "task {task} is not connected or already has an error"
                        )))
                    }
                    Some(_) => {
                        let error = error.with_source_task(task.clone()).reported_by_task();
                        state.set_task_error(task, error, &mut effects);
                        needs_propagation = true;
                        Ok(())
                    }
                }
            }
        };
        effects.fire(self.client_cache.as_ref());
        if needs_propagation {
            self.propagate_error(task, true).await;
        }
        result
    }

    /// Transition a task back to DISCONNECTED, failing its barriers
    pub fn reset_task(&self, task: &TaskId) -> Result<()> {
        let mut effects = SideEffects::default();
        let result = self.state.lock().disconnect_task(task, &mut effects);
        effects.fire(self.client_cache.as_ref());
        result
    }

    /// Snapshot the state of the given tasks; never fails
    pub fn get_task_state(&self, tasks: &[TaskId]) -> Vec<TaskStateInfo> {
        let state = self.state.lock();
        tasks
            .iter()
            .map(|task| match state.tasks.get(task) {
                Some(task_state) => {
                    let error = task_state.status().cloned().map(|mut error| {
                        error.payload.source_task = Some(task.clone());
                        error.payload.is_reported_error = false;
                        error
                    });
                    TaskStateInfo {
                        task: task.clone(),
                        state: task_state.lifecycle(),
                        error,
                    }
                }
                None => TaskStateInfo {
                    task: task.clone(),
                    state: TaskLifecycle::Disconnected,
                    error: None,
                },
            })
            .collect()
    }

    /// Block until every task in the cluster has called in, collecting the
    /// caller's device inventory on its first call
    pub async fn wait_for_all_tasks(&self, task: &TaskId, devices: DeviceInventory) -> Result<()> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.stopping {
                return Err(CoordinationError::internal(
                    "coordination service has stopped; WaitForAllTasks failed",
                ));
            }
            if let Some(task_state) = state.tasks.get_mut(task) {
                if !task_state.devices_collected() {
                    task_state.collect_devices(devices);
                }
            }
        }
        let barrier_id = self.device_barrier_id.clone();
        self.barrier(&barrier_id, DEVICE_PROPAGATION_TIMEOUT, task, &[])
            .await
    }

    /// Disconnect a task, rendezvousing on the shutdown barrier when one is
    /// configured so the whole cluster disconnects together
    pub async fn shutdown_task(&self, task: &TaskId) -> Result<()> {
        debug!(task = %task, "shutdown requested");
        if !self.config.shutdown_barrier_timeout.is_zero() {
            let barrier_id = self.shutdown_barrier_id.clone();
            return self
                .barrier(&barrier_id, self.config.shutdown_barrier_timeout, task, &[])
                .await;
        }
        let mut effects = SideEffects::default();
        let result = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.stopping {
                Err(CoordinationError::internal(
                    "coordination service has stopped; ShutdownTask failed",
                ))
            } else {
                state.disconnect_task(task, &mut effects)
            }
        };
        effects.fire(self.client_cache.as_ref());
        result
    }

    /// Write a config key, releasing any blocked gets for it
    pub fn insert_key_value(&self, key: &str, value: &str, allow_overwrite: bool) -> Result<()> {
        self.kv.insert(key, value, allow_overwrite)
    }

    /// Get a config value, waiting until some task inserts the key
    pub async fn get_key_value(&self, key: &str) -> Result<String> {
        self.kv.get(key).await
    }

    /// Non-blocking config get
    pub fn try_get_key_value(&self, key: &str) -> Result<String> {
        self.kv.try_get(key)
    }

    /// All config entries under `<key>/`, in lexicographic key order
    pub fn get_key_value_dir(&self, directory_key: &str) -> Vec<KeyValueEntry> {
        self.kv.get_dir(directory_key)
    }

    /// Erase a config key and the subtree under it
    pub fn delete_key_value(&self, key: &str) -> Result<()> {
        self.kv.delete(key)
    }

    /// Install the hook run on the merged cluster device inventory
    ///
    /// The hook runs under the cluster lock and must not call back into the
    /// service.
    pub fn set_device_aggregation_function(
        &self,
        aggregate: impl Fn(DeviceInventory) -> DeviceInventory + Send + Sync + 'static,
    ) {
        self.state.lock().post_aggregate = Some(Box::new(aggregate));
    }

    /// Snapshot of the aggregated cluster device inventory
    ///
    /// Empty until the device-propagation barrier has passed.
    pub fn cluster_devices(&self) -> DeviceInventory {
        self.state.lock().cluster_devices.clone()
    }

    /// Stop the service and wait for the liveness monitor to exit
    ///
    /// Cancels pending key/value gets, fails every un-passed barrier with
    /// `Aborted`, clears cluster state, and answers pending error polls
    /// with `Cancelled`. Idempotent.
    pub async fn stop(&self) {
        self.stop_sync();
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
    }

    /// Synchronous stop path; does not join the monitor so the monitor may
    /// call it without deadlocking on itself
    pub(crate) fn stop_sync(&self) {
        self.kv.cancel_all_pending();
        let mut effects = SideEffects::default();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.stopping {
                return;
            }
            state.stopping = true;
            self.shutdown.signal();
            loop {
                let Some(barrier_id) = state
                    .barriers
                    .iter()
                    .find(|(_, barrier)| !barrier.passed)
                    .map(|(barrier_id, _)| barrier_id.clone())
                else {
                    break;
                };
                let error = CoordinationError::aborted(format!(
                    "barrier {barrier_id} failed because the service is shutting down"
                ));
                state.pass_barrier(&barrier_id, Err(error), &mut effects);
            }
            state.barriers.clear();
            // Cluster state is used by the barrier clean-up above, so it is
            // cleared last.
            state.tasks.clear();
            if state.client_polling_for_error {
                state.error_polling.set_error(
                    CoordinationError::cancelled(
                        "coordination service is shutting down; cancelling error polling",
                    ),
                    &mut effects,
                );
            }
        }
        info!("coordination service stopped");
        effects.fire(self.client_cache.as_ref());
    }
}

impl Drop for CoordinationService {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

/// Constructor signature stored in the factory registry
pub type ServiceFactory =
    fn(ServiceConfig, Option<Arc<dyn TaskClientCache>>) -> Arc<CoordinationService>;

/// Registry name of the built-in standalone implementation
pub const STANDALONE_SERVICE: &str = "standalone";

static FACTORIES: LazyLock<RwLock<HashMap<&'static str, ServiceFactory>>> = LazyLock::new(|| {
    let mut factories: HashMap<&'static str, ServiceFactory> = HashMap::new();
    factories.insert(STANDALONE_SERVICE, standalone_factory);
    RwLock::new(factories)
});

fn standalone_factory(
    config: ServiceConfig,
    client_cache: Option<Arc<dyn TaskClientCache>>,
) -> Arc<CoordinationService> {
    let service = Arc::new(CoordinationService::new(config, client_cache));
    service.start();
    service
}

/// Register an additional service implementation under a name
pub fn register_service_factory(name: &'static str, factory: ServiceFactory) {
    FACTORIES.write().insert(name, factory);
}

/// Build and start the implementation registered under `name`
///
/// Must be called from within a Tokio runtime; the liveness monitor is
/// spawned before the service is returned.
pub fn new_coordination_service(
    name: &str,
    config: ServiceConfig,
    client_cache: Option<Arc<dyn TaskClientCache>>,
) -> Option<Arc<CoordinationService>> {
    let factory = FACTORIES.read().get(name).copied();
    factory.map(|factory| factory(config, client_cache))
}
