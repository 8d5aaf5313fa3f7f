//! Push and poll error delivery rules
//!
//! Push mode fans an error out to every connected task; poll mode answers
//! every queued long-poll exactly once with the first error, and stops the
//! service when nothing has ever polled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rally_core::service::{
    new_coordination_service, ErrorNotice, TaskClient, TaskClientCache, TaskLifecycle,
    STANDALONE_SERVICE,
};
use rally_core::{
    CoordinationError, CoordinationService, ErrorCode, JobSpec, Result, ServiceConfig, TaskId,
};

struct RecordingCache {
    notices: Arc<Mutex<Vec<(TaskId, ErrorNotice)>>>,
}

struct RecordingClient {
    destination: TaskId,
    notices: Arc<Mutex<Vec<(TaskId, ErrorNotice)>>>,
}

#[async_trait]
impl TaskClient for RecordingClient {
    async fn report_error_to_task(&self, notice: ErrorNotice) -> Result<()> {
        self.notices
            .lock()
            .unwrap()
            .push((self.destination.clone(), notice));
        Ok(())
    }
}

impl TaskClientCache for RecordingCache {
    fn client(&self, task: &TaskId) -> Option<Arc<dyn TaskClient>> {
        Some(Arc::new(RecordingClient {
            destination: task.clone(),
            notices: self.notices.clone(),
        }))
    }
}

fn two_tasks() -> ServiceConfig {
    ServiceConfig {
        jobs: vec![JobSpec::new("a", 2)],
        ..ServiceConfig::default()
    }
}

fn poll_mode(config: ServiceConfig) -> Arc<CoordinationService> {
    new_coordination_service(STANDALONE_SERVICE, config, None)
        .expect("standalone factory is registered")
}

#[tokio::test]
async fn test_poll_receives_reported_error() {
    let service = poll_mode(two_tasks());
    let a0 = TaskId::new("a", 0);
    let a1 = TaskId::new("a", 1);
    service.register_task(&a0, 1).await.unwrap();
    service.register_task(&a1, 2).await.unwrap();

    let poll = {
        let service = service.clone();
        let a1 = a1.clone();
        tokio::spawn(async move { service.poll_for_error(&a1).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    service
        .report_task_error(&a0, CoordinationError::internal("boom"))
        .await
        .unwrap();

    let delivered = poll.await.unwrap().unwrap_err();
    assert_eq!(delivered.code, ErrorCode::Internal);
    assert_eq!(delivered.payload.source_task, Some(a0.clone()));
    assert!(delivered.payload.is_reported_error);

    // A poll arriving after the response was latched resolves immediately.
    let late = service.poll_for_error(&a1).await.unwrap_err();
    assert_eq!(late, delivered);

    // The failed task polling sees its own stored status.
    let own = service.poll_for_error(&a0).await.unwrap_err();
    assert_eq!(own.code, ErrorCode::Internal);

    service.stop().await;
}

#[tokio::test]
async fn test_push_mode_rejects_polling() {
    let notices = Arc::new(Mutex::new(Vec::new()));
    let cache: Arc<dyn TaskClientCache> = Arc::new(RecordingCache { notices });
    let service = new_coordination_service(STANDALONE_SERVICE, two_tasks(), Some(cache))
        .expect("standalone factory is registered");
    let a0 = TaskId::new("a", 0);
    service.register_task(&a0, 1).await.unwrap();

    let err = service.poll_for_error(&a0).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Internal);

    service.stop().await;
}

#[tokio::test]
async fn test_poll_from_unknown_task_is_rejected() {
    let service = poll_mode(two_tasks());
    let err = service
        .poll_for_error(&TaskId::new("ghost", 0))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    service.stop().await;
}

#[tokio::test]
async fn test_poll_from_unregistered_task_is_rejected() {
    let service = poll_mode(two_tasks());
    // Known task, but it never registered: its grace window never opened.
    let err = service.poll_for_error(&TaskId::new("a", 0)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
    service.stop().await;
}

#[tokio::test]
async fn test_error_without_pollers_stops_the_service() {
    let service = poll_mode(two_tasks());
    let a0 = TaskId::new("a", 0);
    let a1 = TaskId::new("a", 1);
    service.register_task(&a0, 1).await.unwrap();
    service.register_task(&a1, 2).await.unwrap();

    // No task ever polled, so the error cannot be delivered anywhere.
    service
        .report_task_error(&a0, CoordinationError::internal("boom"))
        .await
        .unwrap();

    let err = service.record_heartbeat(&a1, 2).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Internal);
    assert!(err.message.contains("stopped"));
}

#[tokio::test]
async fn test_recoverable_job_errors_are_not_propagated() {
    let notices = Arc::new(Mutex::new(Vec::new()));
    let cache: Arc<dyn TaskClientCache> = Arc::new(RecordingCache {
        notices: notices.clone(),
    });
    let config = ServiceConfig {
        recoverable_jobs: ["a".to_string()].into_iter().collect(),
        jobs: vec![JobSpec::new("a", 2)],
        ..ServiceConfig::default()
    };
    let service = new_coordination_service(STANDALONE_SERVICE, config, Some(cache))
        .expect("standalone factory is registered");
    let a0 = TaskId::new("a", 0);
    let a1 = TaskId::new("a", 1);
    service.register_task(&a0, 1).await.unwrap();
    service.register_task(&a1, 2).await.unwrap();

    service
        .report_task_error(&a0, CoordinationError::internal("boom"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The failure is recorded but nobody is notified.
    let states = service.get_task_state(&[a0.clone()]);
    assert_eq!(states[0].state, TaskLifecycle::Error);
    assert!(notices.lock().unwrap().is_empty());

    service.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_pending_polls() {
    let service = poll_mode(two_tasks());
    let a0 = TaskId::new("a", 0);
    service.register_task(&a0, 1).await.unwrap();

    let poll = {
        let service = service.clone();
        let a0 = a0.clone();
        tokio::spawn(async move { service.poll_for_error(&a0).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    service.stop().await;
    let err = poll.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Cancelled);
}
