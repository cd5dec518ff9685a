//! Worker-facing backend over the queue scripts.
use serde::de::DeserializeOwned;
use seriq_core::{
    BackEndContext, BackEndDriver, BackEndPoller, Heartbeat, Job, JobMeta, RetryOutcome,
};

use crate::queue::{Error, Queue, ReservedJob, RetryStatus};

pub struct RedisDriver;
impl BackEndDriver for RedisDriver {
    type Error = Error;
}

/// A reserved job as delivered to handlers.
///
/// `payload` is `None` when the stored payload could not be decoded as `T`;
/// the handler decides whether that is a terminal failure.
#[derive(Debug, Clone)]
pub struct GroupJob<T> {
    pub id: String,
    pub group_id: String,
    pub payload: Option<T>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub order_ms: u64,
    pub enqueued_at: u64,
}

/// Lease handle for one reserved job.
pub struct LeaseContext {
    queue: Queue,
    meta: JobMeta,
    heartbeat_interval: std::time::Duration,
}

impl BackEndContext for LeaseContext {
    type Driver = RedisDriver;

    fn meta(&self) -> &JobMeta {
        &self.meta
    }

    fn heartbeat_interval(&self) -> std::time::Duration {
        self.heartbeat_interval
    }

    async fn heartbeat(&mut self) -> Result<Heartbeat, Error> {
        let alive = self
            .queue
            .heartbeat(&self.meta.id, &self.meta.group_id, None)
            .await?;
        Ok(if alive {
            Heartbeat::Alive
        } else {
            Heartbeat::Lost
        })
    }

    async fn complete(self) -> Result<(), Error> {
        // A false return means the lock was reclaimed meanwhile; that race
        // is benign and already logged by the worker as lease loss.
        self.queue
            .complete(&self.meta.id, &self.meta.group_id)
            .await?;
        Ok(())
    }

    async fn retry(
        self,
        retry_after: Option<std::time::Duration>,
    ) -> Result<RetryOutcome, Error> {
        let backoff = retry_after.unwrap_or_default();
        match self.queue.retry(&self.meta.id, backoff).await? {
            RetryStatus::Scheduled(attempts) => Ok(RetryOutcome::Scheduled(attempts)),
            RetryStatus::Dropped => Ok(RetryOutcome::Dropped),
        }
    }
}

/// Backend for fetching and updating jobs from Redis.
pub struct BackEnd<T> {
    queue: Queue,
    blocking_timeout: std::time::Duration,
    cleanup_interval: Option<std::time::Duration>,
    heartbeat_interval: Option<std::time::Duration>,
    last_cleanup: std::time::Instant,
    marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Clone for BackEnd<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            blocking_timeout: self.blocking_timeout,
            cleanup_interval: self.cleanup_interval,
            heartbeat_interval: self.heartbeat_interval,
            last_cleanup: self.last_cleanup,
            marker: std::marker::PhantomData,
        }
    }
}

impl<T> BackEnd<T> {
    pub fn new(queue: Queue) -> Self {
        Self {
            queue,
            blocking_timeout: std::time::Duration::from_secs(5),
            cleanup_interval: Some(std::time::Duration::from_secs(60)),
            heartbeat_interval: None,
            last_cleanup: std::time::Instant::now(),
            marker: std::marker::PhantomData,
        }
    }

    /// Bound for the server-side blocking wait when polling finds nothing.
    pub fn blocking_timeout(self, blocking_timeout: std::time::Duration) -> Self {
        Self {
            blocking_timeout,
            ..self
        }
    }

    /// How often the poll path reclaims expired leases.
    pub fn cleanup_interval(self, cleanup_interval: std::time::Duration) -> Self {
        Self {
            cleanup_interval: Some(cleanup_interval),
            ..self
        }
    }

    /// Disable the opportunistic lease reclamation from the poll path.
    pub fn disable_cleanup(self) -> Self {
        Self {
            cleanup_interval: None,
            ..self
        }
    }

    /// Lease-extension cadence handed to the worker. Defaults to a third of
    /// the queue's visibility timeout, never below one second.
    pub fn heartbeat_interval(self, heartbeat_interval: std::time::Duration) -> Self {
        Self {
            heartbeat_interval: Some(heartbeat_interval),
            ..self
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}

impl<T> BackEnd<T>
where
    T: DeserializeOwned,
{
    fn build_job(&self, reserved: ReservedJob) -> Job<GroupJob<T>, LeaseContext> {
        let payload = match serde_json::from_str::<T>(&reserved.payload) {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::warn!(error = %error, job_id = %reserved.id, "Failed to decode job payload");
                None
            }
        };

        let meta = JobMeta {
            id: reserved.id,
            group_id: reserved.group_id,
            attempts: reserved.attempts,
            max_attempts: reserved.max_attempts,
        };
        let data = GroupJob {
            id: meta.id.clone(),
            group_id: meta.group_id.clone(),
            payload,
            attempts: reserved.attempts,
            max_attempts: reserved.max_attempts,
            order_ms: reserved.order_ms,
            enqueued_at: reserved.enqueued_at,
        };
        let heartbeat_interval = self.heartbeat_interval.unwrap_or_else(|| {
            (self.queue.configured_job_timeout() / 3).max(std::time::Duration::from_secs(1))
        });

        Job::from_parts(
            data,
            LeaseContext {
                queue: self.queue.clone(),
                meta,
                heartbeat_interval,
            },
        )
    }
}

impl<T> BackEndPoller for BackEnd<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Driver = RedisDriver;
    type Data = GroupJob<T>;
    type Context = LeaseContext;

    async fn poll_job(
        &mut self,
        batch_size: usize,
    ) -> Vec<Result<Job<Self::Data, Self::Context>, Error>> {
        if let Some(interval) = self.cleanup_interval {
            if self.last_cleanup.elapsed() >= interval {
                self.last_cleanup = std::time::Instant::now();
                if let Err(error) = self.queue.cleanup().await {
                    tracing::error!(error = %error, "Failed to reclaim expired leases");
                }
            }
        }

        let mut out = Vec::new();
        for _ in 0..batch_size {
            match self.queue.reserve().await {
                Ok(Some(job)) => out.push(Ok(self.build_job(job))),
                Ok(None) => break,
                Err(error) => {
                    out.push(Err(error));
                    return out;
                }
            }
        }
        if !out.is_empty() {
            return out;
        }

        // Nothing immediately available: wait server-side for a ready group.
        match self.queue.reserve_blocking(self.blocking_timeout).await {
            Ok(Some(job)) => {
                out.push(Ok(self.build_job(job)));
                return out;
            }
            Ok(None) => {}
            Err(error) => {
                out.push(Err(error));
                return out;
            }
        }

        // Delayed groups are parked off the ready index; re-admit any whose
        // hold has elapsed and try once more.
        match self.queue.recover_delayed_groups().await {
            Ok(0) => {}
            Ok(_) => match self.queue.reserve().await {
                Ok(Some(job)) => out.push(Ok(self.build_job(job))),
                Ok(None) => {}
                Err(error) => out.push(Err(error)),
            },
            Err(error) => {
                tracing::error!(error = %error, "Failed to recover delayed groups");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        n: u32,
    }

    async fn test_queue(ns: &str) -> Queue {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let client = redis::Client::open(url).expect("redis url");
        let queue = Queue::new(&client, ns).await.expect("connect");
        queue.purge().await.expect("purge");
        queue
    }

    #[tokio::test]
    async fn poll_decodes_payload_and_exposes_meta() {
        let queue = test_queue("t-backend-poll").await;
        queue
            .enqueue("g1", r#"{"n":7}"#, Some(1_000), None)
            .await
            .unwrap();

        let mut backend = BackEnd::<Payload>::new(queue).blocking_timeout(Duration::from_millis(100));
        let mut polled = backend.poll_job(4).await;
        assert_eq!(polled.len(), 1);

        let (data, context) = polled.remove(0).unwrap().split_parts();
        assert_eq!(data.payload, Some(Payload { n: 7 }));
        assert_eq!(data.group_id, "g1");
        assert_eq!(context.meta().attempts, 0);
        assert_eq!(context.meta().max_attempts, 3);

        context.complete().await.unwrap();
    }

    #[tokio::test]
    async fn undecodable_payload_surfaces_as_none() {
        let queue = test_queue("t-backend-decode").await;
        queue
            .enqueue("g1", "not json at all", None, None)
            .await
            .unwrap();

        let mut backend = BackEnd::<Payload>::new(queue).blocking_timeout(Duration::from_millis(100));
        let mut polled = backend.poll_job(1).await;
        assert_eq!(polled.len(), 1);

        let (data, context) = polled.remove(0).unwrap().split_parts();
        assert!(data.payload.is_none());
        context.complete().await.unwrap();
    }

    #[tokio::test]
    async fn lost_lease_heartbeat_reports_lost() {
        let queue = test_queue("t-backend-lease")
            .await
            .job_timeout(Duration::from_millis(50));
        queue.enqueue("g1", r#"{"n":1}"#, None, None).await.unwrap();

        let mut backend = BackEnd::<Payload>::new(queue.clone());
        let mut polled = backend.poll_job(1).await;
        let (_, mut context) = polled.remove(0).unwrap().split_parts();

        assert_eq!(context.heartbeat().await.unwrap(), Heartbeat::Alive);

        tokio::time::sleep(Duration::from_millis(80)).await;
        queue.cleanup().await.unwrap();
        assert_eq!(context.heartbeat().await.unwrap(), Heartbeat::Lost);
    }

    #[tokio::test]
    async fn heartbeat_interval_is_configurable() {
        let queue = test_queue("t-backend-hb")
            .await
            .job_timeout(Duration::from_secs(30));
        queue.enqueue("g1", r#"{"n":1}"#, None, None).await.unwrap();
        queue.enqueue("g2", r#"{"n":2}"#, None, None).await.unwrap();

        // Default derives from the visibility timeout.
        let mut backend = BackEnd::<Payload>::new(queue.clone());
        let mut polled = backend.poll_job(1).await;
        let (_, context) = polled.remove(0).unwrap().split_parts();
        assert_eq!(context.heartbeat_interval(), Duration::from_secs(10));
        context.complete().await.unwrap();

        let mut backend = BackEnd::<Payload>::new(queue)
            .heartbeat_interval(Duration::from_millis(250));
        let mut polled = backend.poll_job(1).await;
        let (_, context) = polled.remove(0).unwrap().split_parts();
        assert_eq!(context.heartbeat_interval(), Duration::from_millis(250));
        context.complete().await.unwrap();
    }

    #[tokio::test]
    async fn poll_recovers_groups_parked_by_ordering_delay() {
        let queue = test_queue("t-backend-delay")
            .await
            .ordering_delay(Duration::from_millis(150));
        queue.enqueue("g1", r#"{"n":9}"#, None, None).await.unwrap();

        let mut backend = BackEnd::<Payload>::new(queue)
            .blocking_timeout(Duration::from_millis(100));

        // Inside the grace window the group is parked and nothing is handed out.
        assert!(backend.poll_job(1).await.is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;

        // The group is off the ready index, so delivery depends on the poll
        // path re-admitting it after the blocking wait comes back empty.
        let mut polled = backend.poll_job(1).await;
        assert_eq!(polled.len(), 1);
        let (data, context) = polled.remove(0).unwrap().split_parts();
        assert_eq!(data.payload, Some(Payload { n: 9 }));
        context.complete().await.unwrap();
    }
}
