//! Barrier engine laws
//!
//! Every waiter of a barrier instance is completed exactly once with the
//! one final result; cancellation supersedes arrival; participant sets
//! must be consistent across callers.

use std::sync::Arc;
use std::time::Duration;

use rally_core::service::{new_coordination_service, STANDALONE_SERVICE};
use rally_core::{CoordinationService, ErrorCode, JobSpec, ServiceConfig, TaskId};

const MINUTE: Duration = Duration::from_secs(60);

fn cluster(num_tasks: u32) -> Arc<CoordinationService> {
    let config = ServiceConfig {
        jobs: vec![JobSpec::new("w", num_tasks)],
        ..ServiceConfig::default()
    };
    new_coordination_service(STANDALONE_SERVICE, config, None)
        .expect("standalone factory is registered")
}

fn w(index: u32) -> TaskId {
    TaskId::new("w", index)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test]
async fn test_every_waiter_gets_the_same_result() {
    let service = cluster(3);

    let mut waiters = Vec::new();
    for index in 0..2 {
        let service = service.clone();
        waiters.push(tokio::spawn(async move {
            service.barrier("sync", MINUTE, &w(index), &[]).await
        }));
    }
    settle().await;

    service.barrier("sync", MINUTE, &w(2), &[]).await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    service.stop().await;
}

#[tokio::test]
async fn test_cancel_supersedes_arrival() {
    let service = cluster(2);

    assert!(service.cancel_barrier("b", &w(0)).is_ok());

    let err = service.barrier("b", MINUTE, &w(0), &[]).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Cancelled);

    service.stop().await;
}

#[tokio::test]
async fn test_cancel_releases_pending_waiters() {
    let service = cluster(2);

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.barrier("b", MINUTE, &w(0), &[]).await })
    };
    settle().await;

    service.cancel_barrier("b", &w(1)).unwrap();
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Cancelled);

    service.stop().await;
}

#[tokio::test]
async fn test_cancel_after_pass_is_rejected() {
    let service = cluster(1);

    service.barrier("b", MINUTE, &w(0), &[]).await.unwrap();

    let err = service.cancel_barrier("b", &w(0)).unwrap_err();
    assert_eq!(err.code, ErrorCode::FailedPrecondition);
    assert!(err.message.contains("Ok"));

    service.stop().await;
}

#[tokio::test]
async fn test_conflicting_participant_sets_poison_the_barrier() {
    let service = cluster(3);

    let pending = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .barrier("b", MINUTE, &w(0), &[w(0), w(1)])
                .await
        })
    };
    settle().await;

    let err = service
        .barrier("b", MINUTE, &w(1), &[w(1), w(2)])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    // The first caller receives the same failure.
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    service.stop().await;
}

#[tokio::test]
async fn test_non_participant_caller_poisons_the_barrier() {
    let service = cluster(3);

    let pending = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .barrier("b", MINUTE, &w(0), &[w(0), w(1)])
                .await
        })
    };
    settle().await;

    let err = service
        .barrier("b", MINUTE, &w(2), &[w(0), w(1)])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    service.stop().await;
}

#[tokio::test]
async fn test_repeated_arrival_is_a_noop() {
    let service = cluster(2);

    let first = {
        let service = service.clone();
        tokio::spawn(async move { service.barrier("b", MINUTE, &w(0), &[]).await })
    };
    settle().await;
    let second = {
        let service = service.clone();
        tokio::spawn(async move { service.barrier("b", MINUTE, &w(0), &[]).await })
    };
    settle().await;

    // The second arrival of w0 must not have completed the barrier.
    assert!(!first.is_finished());

    service.barrier("b", MINUTE, &w(1), &[]).await.unwrap();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    service.stop().await;
}

#[tokio::test]
async fn test_unknown_participant_fails_barrier() {
    let service = cluster(2);

    let err = service
        .barrier("b", MINUTE, &w(0), &[w(0), TaskId::new("ghost", 0)])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    service.stop().await;
}

#[tokio::test]
async fn test_unknown_caller_is_rejected() {
    let service = cluster(2);

    let err = service
        .barrier("b", MINUTE, &TaskId::new("ghost", 0), &[])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    service.stop().await;
}

#[tokio::test]
async fn test_participant_already_in_error_fails_barrier() {
    let service = cluster(2);
    service.register_task(&w(0), 1).await.unwrap();
    // Incarnation mismatch drives w0 into ERROR.
    let err = service.record_heartbeat(&w(0), 99).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Aborted);

    let err = service.barrier("b", MINUTE, &w(1), &[]).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::Internal);

    service.stop().await;
}

#[tokio::test]
async fn test_reset_task_fails_its_barriers() {
    let service = cluster(2);
    service.register_task(&w(0), 1).await.unwrap();

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.barrier("b", MINUTE, &w(0), &[]).await })
    };
    settle().await;

    service.reset_task(&w(0)).unwrap();
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Internal);

    service.stop().await;
}

#[tokio::test]
async fn test_stop_aborts_pending_barriers() {
    let service = cluster(2);

    let pending = {
        let service = service.clone();
        tokio::spawn(async move { service.barrier("b", MINUTE, &w(0), &[]).await })
    };
    settle().await;

    service.stop().await;
    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Aborted);
}
