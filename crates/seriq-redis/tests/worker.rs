//! End-to-end worker tests against a live Redis.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use seriq_core::{
    JobData, JobResult, TokioSpawner, WorkerBuilder, WorkerContext, WorkerEvent,
};
use seriq_redis::{BackEnd, Client, EnqueueJob, GroupJob, Queue};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct Payload {
    n: u32,
}

type Seen = Arc<Mutex<Vec<(String, u32)>>>;

async fn test_queue(ns: &str) -> Queue {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = redis::Client::open(url).expect("redis url");
    let queue = Queue::new(&client, ns).await.expect("connect");
    queue.purge().await.expect("purge");
    queue
}

async fn record(
    JobData(job): JobData<GroupJob<Payload>>,
    WorkerContext(seen): WorkerContext<Seen>,
) -> JobResult {
    if let Some(payload) = job.payload {
        seen.lock().unwrap().push((job.group_id.clone(), payload.n));
    }
    JobResult::Complete
}

#[tokio::test]
async fn worker_preserves_group_order_across_parallel_groups() {
    let queue = test_queue("t-e2e-order").await;
    let client = Client::<Payload>::new(queue.clone());

    for (group, n, order) in [
        ("a", 1u32, 1_000u64),
        ("a", 2, 2_000),
        ("a", 3, 3_000),
        ("b", 1, 1_500),
        ("b", 2, 2_500),
    ] {
        client
            .enqueue(&EnqueueJob::new(group, Payload { n }).order_ms(order))
            .await
            .unwrap();
    }

    let seen: Seen = Arc::default();
    let backend =
        BackEnd::<Payload>::new(queue).blocking_timeout(Duration::from_millis(200));

    let done = Arc::clone(&seen);
    let worker = WorkerBuilder::new(Duration::from_millis(50))
        .concurrent(2)
        .handler(record)
        .context(Arc::clone(&seen))
        .job_spawner(TokioSpawner)
        .build(backend)
        .with_graceful_shutdown(async move {
            loop {
                if done.lock().unwrap().len() >= 5 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

    tokio::time::timeout(Duration::from_secs(30), worker.run())
        .await
        .expect("worker drained");

    let seen = seen.lock().unwrap();
    let group_a: Vec<u32> = seen.iter().filter(|(g, _)| g == "a").map(|(_, n)| *n).collect();
    let group_b: Vec<u32> = seen.iter().filter(|(g, _)| g == "b").map(|(_, n)| *n).collect();
    assert_eq!(group_a, vec![1, 2, 3]);
    assert_eq!(group_b, vec![1, 2]);
}

#[tokio::test]
async fn worker_retries_failures_then_completes() {
    let queue = test_queue("t-e2e-retry").await;
    let client = Client::<Payload>::new(queue.clone());
    client
        .enqueue(&EnqueueJob::new("g1", Payload { n: 1 }))
        .await
        .unwrap();

    let attempts_seen: Arc<Mutex<Vec<u32>>> = Arc::default();
    let events: Arc<Mutex<Vec<WorkerEvent>>> = Arc::default();
    let sink = Arc::clone(&events);

    let backend =
        BackEnd::<Payload>::new(queue).blocking_timeout(Duration::from_millis(200));

    let handler = {
        let attempts_seen = Arc::clone(&attempts_seen);
        move |JobData(job): JobData<GroupJob<Payload>>| {
            let attempts_seen = Arc::clone(&attempts_seen);
            async move {
                attempts_seen.lock().unwrap().push(job.attempts);
                if job.attempts == 0 {
                    JobResult::Retry(Some(Duration::from_millis(50)))
                } else {
                    JobResult::Complete
                }
            }
        }
    };

    let done = Arc::clone(&events);
    let worker = WorkerBuilder::new(Duration::from_millis(50))
        .on_event(move |event| sink.lock().unwrap().push(event))
        .handler(handler)
        .job_spawner(TokioSpawner)
        .build(backend)
        .with_graceful_shutdown(async move {
            loop {
                let completed = done
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|event| matches!(event, WorkerEvent::Completed { .. }));
                if completed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

    tokio::time::timeout(Duration::from_secs(30), worker.run())
        .await
        .expect("worker drained");

    assert_eq!(*attempts_seen.lock().unwrap(), vec![0, 1]);

    let events = events.lock().unwrap();
    assert!(matches!(events[0], WorkerEvent::Failed { retry_in, .. } if retry_in == Duration::from_millis(50)));
    assert!(matches!(events[1], WorkerEvent::Completed { ref job, .. } if job.attempts == 1));
}
