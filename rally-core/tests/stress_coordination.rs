//! Stress tests for the coordination service under load
//!
//! Run with: cargo test --release --test stress_coordination -- --nocapture

use std::sync::Arc;
use std::time::{Duration, Instant};

use rally_core::service::{new_coordination_service, STANDALONE_SERVICE};
use rally_core::{CoordinationService, JobSpec, ServiceConfig, TaskId};
use tokio::sync::mpsc;

fn worker_cluster(num_tasks: u32) -> Arc<CoordinationService> {
    rally_core::logging::init();
    let config = ServiceConfig {
        heartbeat_timeout: Duration::from_secs(60),
        jobs: vec![JobSpec::new("worker", num_tasks)],
        ..ServiceConfig::default()
    };
    new_coordination_service(STANDALONE_SERVICE, config, None)
        .expect("standalone factory is registered")
}

/// Test registration scalability
#[tokio::test(flavor = "multi_thread")]
async fn stress_task_registration() {
    let num_tasks: u32 = 500;
    let service = worker_cluster(num_tasks);

    let (tx, mut rx) = mpsc::channel::<(u32, Duration)>(num_tasks as usize);
    let start = Instant::now();

    for index in 0..num_tasks {
        let tx = tx.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let task = TaskId::new("worker", index);
            let call_start = Instant::now();
            service
                .register_task(&task, u64::from(index) + 1)
                .await
                .unwrap();
            let _ = tx.send((index, call_start.elapsed())).await;
        });
    }
    drop(tx);

    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result);
    }

    let total_elapsed = start.elapsed();
    let avg_time: Duration =
        results.iter().map(|(_, d)| *d).sum::<Duration>() / results.len() as u32;

    println!("Task registration stress test:");
    println!("  Tasks: {num_tasks}");
    println!("  Total elapsed: {total_elapsed:?}");
    println!("  Avg registration time: {avg_time:?}");
    println!(
        "  Registrations/sec: {:.2}",
        f64::from(num_tasks) / total_elapsed.as_secs_f64()
    );

    assert_eq!(results.len(), num_tasks as usize, "Not all tasks registered");
    service.stop().await;
}

/// Test heartbeat throughput
#[tokio::test(flavor = "multi_thread")]
async fn stress_heartbeat_throughput() {
    let num_tasks: u32 = 100;
    let heartbeats_per_task: u64 = 50;
    let service = worker_cluster(num_tasks);

    for index in 0..num_tasks {
        let task = TaskId::new("worker", index);
        service
            .register_task(&task, u64::from(index) + 1)
            .await
            .unwrap();
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for index in 0..num_tasks {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let task = TaskId::new("worker", index);
            for _ in 0..heartbeats_per_task {
                service
                    .record_heartbeat(&task, u64::from(index) + 1)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let total_elapsed = start.elapsed();
    let total_heartbeats = u64::from(num_tasks) * heartbeats_per_task;

    println!("Heartbeat throughput stress test:");
    println!("  Tasks: {num_tasks}");
    println!("  Total heartbeats: {total_heartbeats}");
    println!("  Total elapsed: {total_elapsed:?}");
    println!(
        "  Heartbeats/sec: {:.2}",
        total_heartbeats as f64 / total_elapsed.as_secs_f64()
    );

    service.stop().await;
}

/// Test barrier fan-in with the whole cluster arriving concurrently
#[tokio::test(flavor = "multi_thread")]
async fn stress_barrier_fan_in() {
    let num_tasks: u32 = 200;
    let num_rounds: u32 = 5;
    let service = worker_cluster(num_tasks);

    let start = Instant::now();
    for round in 0..num_rounds {
        let barrier_id = format!("round-{round}");
        let mut handles = Vec::new();
        for index in 0..num_tasks {
            let service = service.clone();
            let barrier_id = barrier_id.clone();
            handles.push(tokio::spawn(async move {
                let task = TaskId::new("worker", index);
                service
                    .barrier(&barrier_id, Duration::from_secs(60), &task, &[])
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }

    let total_elapsed = start.elapsed();

    println!("Barrier fan-in stress test:");
    println!("  Tasks: {num_tasks}");
    println!("  Rounds: {num_rounds}");
    println!("  Total elapsed: {total_elapsed:?}");
    println!("  Avg round time: {:?}", total_elapsed / num_rounds);

    service.stop().await;
}
