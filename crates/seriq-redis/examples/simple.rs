use seriq_core::{JobData, JobResult, TokioSpawner, WorkerBuilder, WorkerContext};
use seriq_redis::{BackEnd, Client, EnqueueJob, GroupJob, Queue};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let redis = redis::Client::open("redis://127.0.0.1:6379").unwrap();
    let queue = Queue::new(&redis, "demo")
        .await
        .unwrap()
        .ordering_delay(std::time::Duration::from_millis(200));

    let backend = BackEnd::<u64>::new(queue.clone());
    let worker = WorkerBuilder::new(std::time::Duration::from_millis(500))
        .concurrent(4)
        .handler(job_handler)
        .job_spawner(TokioSpawner)
        .build(backend)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .drain_timeout(std::time::Duration::from_secs(10));

    let client = Client::<u64>::new(queue);
    let client_handle = async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
        let mut n = 0u64;
        loop {
            interval.tick().await;
            let group = format!("session-{}", n % 3);
            let job = EnqueueJob::new(group, n);
            match client.enqueue(&job).await {
                Ok(job_id) => {
                    tracing::info!(job_id, "Enqueue job {}", n);
                    n += 1
                }
                Err(error) => {
                    tracing::error!(error = %error, "Failed to enqueue job")
                }
            };
        }
    };

    tokio::select! {
        _ = client_handle => {}
        _ = worker.run() => {}
    }
}

async fn job_handler(
    JobData(job): JobData<GroupJob<u64>>,
    WorkerContext(_): WorkerContext<()>,
) -> JobResult {
    let Some(n) = job.payload else {
        tracing::warn!(job_id = %job.id, "payload missing, dropping");
        return JobResult::Complete;
    };

    tracing::info!("-start: job {} in {}", n, job.group_id);
    tokio::time::sleep(std::time::Duration::from_millis(n % 5 * 300)).await;
    tracing::info!("--end: job {}", n);
    JobResult::Complete
}
