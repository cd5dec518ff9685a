//! Group-ordered queue over Redis.
//!
//! Every state transition runs as one server-side Lua script, so concurrent
//! workers never observe a partial transition. The key space under the
//! namespace:
//!
//! - `:seq` job id counter
//! - `:ready` ZSET of groups with a dispatchable head, scored by that head
//! - `:g:{group}` ZSET of pending job ids per group
//! - `:job:{id}` HASH with the job record
//! - `:lock:{group}` TTL string enforcing single-flight per group
//! - `:processing` ZSET of leased jobs by deadline
//! - `:processing:{id}` HASH with the lease record
use redis::AsyncCommands as _;

const NAMESPACE_PREFIX: &str = "seriq";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categorization of failures raised by queue operations.
pub enum ErrorKind {
    /// Errors originating from Redis interactions.
    Store,
    /// Replies that could not be parsed into the expected shape.
    Decode,
}

#[derive(Debug)]
/// Error type returned by [`Queue`] operations.
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl Error {
    fn new_decode(error: Box<dyn std::error::Error + Send + 'static>) -> Self {
        Error {
            kind: ErrorKind::Decode,
            inner: error,
        }
    }

    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<redis::RedisError> for Error {
    fn from(value: redis::RedisError) -> Self {
        Self {
            kind: ErrorKind::Store,
            inner: Box::new(value),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

#[derive(Debug)]
struct MalformedReplyError(&'static str);

impl std::fmt::Display for MalformedReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed script reply: {}", self.0)
    }
}

impl std::error::Error for MalformedReplyError {}

/// A job handed out by [`Queue::reserve`], valid while its lease holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservedJob {
    pub id: String,
    pub group_id: String,
    /// Raw payload exactly as enqueued; typed decoding happens at the
    /// client/backend boundary.
    pub payload: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub seq: u64,
    pub enqueued_at: u64,
    pub order_ms: u64,
    pub score: f64,
    pub deadline_at: u64,
}

/// Outcome of [`Queue::retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    /// Job was requeued; carries the attempt count consumed so far.
    Scheduled(u32),
    /// Attempt budget exhausted (or the job record vanished); the job is gone.
    Dropped,
}

/// Job counts by state.
///
/// `waiting` counts every pending job, including those parked behind a
/// group lock, so `total` can count a job twice; this mirrors how the
/// states overlap rather than pretending they partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    pub active: u64,
    pub waiting: u64,
    pub delayed: u64,
    pub total: u64,
    pub unique_groups: u64,
}

struct Scripts {
    enqueue: redis::Script,
    reserve: redis::Script,
    complete: redis::Script,
    retry: redis::Script,
    heartbeat: redis::Script,
    cleanup: redis::Script,
    recover_delayed: redis::Script,
    waiting: redis::Script,
    delayed: redis::Script,
    unique_groups: redis::Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: redis::Script::new(include_str!("scripts/enqueue.lua")),
            reserve: redis::Script::new(include_str!("scripts/reserve.lua")),
            complete: redis::Script::new(include_str!("scripts/complete.lua")),
            retry: redis::Script::new(include_str!("scripts/retry.lua")),
            heartbeat: redis::Script::new(include_str!("scripts/heartbeat.lua")),
            cleanup: redis::Script::new(include_str!("scripts/cleanup.lua")),
            recover_delayed: redis::Script::new(include_str!("scripts/recover_delayed.lua")),
            waiting: redis::Script::new(include_str!("scripts/waiting.lua")),
            delayed: redis::Script::new(include_str!("scripts/delayed.lua")),
            unique_groups: redis::Script::new(include_str!("scripts/unique_groups.lua")),
        }
    }
}

/// One queue within a shared Redis, isolated by namespace.
///
/// Payload-agnostic: payloads pass through as strings. Construct one per
/// namespace and clone it freely; clones share the underlying connections.
#[derive(Clone)]
pub struct Queue {
    conn: redis::aio::MultiplexedConnection,
    /// Dedicated connection for BZPOPMIN so blocking waits never stall the
    /// multiplexed command pipeline.
    blocking_conn: redis::aio::MultiplexedConnection,
    ns: String,
    job_timeout: std::time::Duration,
    default_max_attempts: u32,
    scan_limit: usize,
    ordering_delay: std::time::Duration,
    scripts: std::sync::Arc<Scripts>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn parse_num<N>(value: &str, field: &'static str) -> Result<N, Error>
where
    N: std::str::FromStr,
    N::Err: std::error::Error + Send + 'static,
{
    value.parse::<N>().map_err(|error| {
        tracing::warn!(field, value, "unparsable job field");
        Error::new_decode(Box::new(error))
    })
}

impl Queue {
    /// Connect both queue connections and bind the namespace.
    pub async fn new(client: &redis::Client, namespace: &str) -> Result<Self, Error> {
        let conn = client.get_multiplexed_async_connection().await?;
        let blocking_conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            blocking_conn,
            ns: format!("{NAMESPACE_PREFIX}:{namespace}"),
            job_timeout: std::time::Duration::from_secs(30),
            default_max_attempts: 3,
            scan_limit: 20,
            ordering_delay: std::time::Duration::ZERO,
            scripts: std::sync::Arc::new(Scripts::new()),
        })
    }

    /// Visibility timeout for reserved jobs. Clamped to at least 1ms.
    pub fn job_timeout(self, job_timeout: std::time::Duration) -> Self {
        Self {
            job_timeout: job_timeout.max(std::time::Duration::from_millis(1)),
            ..self
        }
    }

    /// Default attempt budget for jobs enqueued without an override.
    pub fn max_attempts(self, max_attempts: u32) -> Self {
        Self {
            default_max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// How many ready groups a reservation scans past locked ones.
    pub fn scan_limit(self, scan_limit: usize) -> Self {
        Self {
            scan_limit: scan_limit.max(1),
            ..self
        }
    }

    /// Grace window before dispatching already-due jobs, letting slightly
    /// out-of-order concurrent enqueues land first.
    pub fn ordering_delay(self, ordering_delay: std::time::Duration) -> Self {
        Self {
            ordering_delay,
            ..self
        }
    }

    /// The fully-prefixed namespace this queue operates under.
    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// Currently configured visibility timeout.
    pub fn configured_job_timeout(&self) -> std::time::Duration {
        self.job_timeout
    }

    /// Currently configured ordering delay.
    pub fn configured_ordering_delay(&self) -> std::time::Duration {
        self.ordering_delay
    }

    /// Enqueue a raw payload and return the assigned job id.
    ///
    /// `order_ms` defaults to the current wall clock; `max_attempts` to the
    /// queue default.
    pub async fn enqueue(
        &self,
        group_id: &str,
        payload: &str,
        order_ms: Option<u64>,
        max_attempts: Option<u32>,
    ) -> Result<String, Error> {
        let mut conn = self.conn.clone();
        let job_id: String = self
            .scripts
            .enqueue
            .arg(&self.ns)
            .arg(group_id)
            .arg(payload)
            .arg(max_attempts.unwrap_or(self.default_max_attempts))
            .arg(order_ms.unwrap_or_else(now_ms))
            .invoke_async(&mut conn)
            .await?;
        Ok(job_id)
    }

    /// Reserve the next dispatchable job, or `None` if no group is ready.
    ///
    /// Runs the expiry sweep, the bounded candidate scan, and the
    /// ordering-delay check as one atomic unit.
    pub async fn reserve(&self) -> Result<Option<ReservedJob>, Error> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<String>> = self
            .scripts
            .reserve
            .arg(&self.ns)
            .arg(now_ms())
            .arg(self.job_timeout.as_millis() as u64)
            .arg(self.scan_limit)
            .arg(self.ordering_delay.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        raw.map(parse_reserved).transpose()
    }

    /// Reserve with a bounded server-side wait for a group to become ready.
    ///
    /// Fast path first; on miss, BZPOPMIN on the ready index, re-add the
    /// popped group, and reserve through the usual atomic path.
    pub async fn reserve_blocking(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Option<ReservedJob>, Error> {
        if let Some(job) = self.reserve().await? {
            return Ok(Some(job));
        }

        let ready_key = format!("{}:ready", self.ns);
        let mut blocking = self.blocking_conn.clone();
        let popped: Option<(String, String, f64)> = redis::cmd("BZPOPMIN")
            .arg(&ready_key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut blocking)
            .await?;

        let Some((_, group_id, score)) = popped else {
            return Ok(None);
        };

        // BZPOPMIN removed the group; restore it so the reservation script
        // sees the same ready index it would have scanned.
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(&ready_key, &group_id, score).await?;

        self.reserve().await
    }

    /// Finalize a job. Returns `false` when the lock was no longer held,
    /// which is a benign race with expiry reclamation, not an error.
    pub async fn complete(&self, job_id: &str, group_id: &str) -> Result<bool, Error> {
        let mut conn = self.conn.clone();
        let done: i64 = self
            .scripts
            .complete
            .arg(&self.ns)
            .arg(job_id)
            .arg(group_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(done == 1)
    }

    /// Requeue a failed job, holding its group closed for `backoff`.
    pub async fn retry(
        &self,
        job_id: &str,
        backoff: std::time::Duration,
    ) -> Result<RetryStatus, Error> {
        let mut conn = self.conn.clone();
        let status: i64 = self
            .scripts
            .retry
            .arg(&self.ns)
            .arg(job_id)
            .arg(backoff.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        match status {
            attempts if attempts > 0 => Ok(RetryStatus::Scheduled(attempts as u32)),
            _ => Ok(RetryStatus::Dropped),
        }
    }

    /// Extend the lease. Returns `false` once the lock is no longer held
    /// for this job id.
    pub async fn heartbeat(
        &self,
        job_id: &str,
        group_id: &str,
        extend: Option<std::time::Duration>,
    ) -> Result<bool, Error> {
        let extend = extend.unwrap_or(self.job_timeout);
        let mut conn = self.conn.clone();
        let alive: i64 = self
            .scripts
            .heartbeat
            .arg(&self.ns)
            .arg(job_id)
            .arg(group_id)
            .arg(extend.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(alive == 1)
    }

    /// Reclaim expired leases; returns how many jobs were restored.
    pub async fn cleanup(&self) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let cleaned: u64 = self
            .scripts
            .cleanup
            .arg(&self.ns)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(cleaned)
    }

    /// Re-admit groups whose ordering-delay hold has elapsed.
    ///
    /// O(groups) key scan; a no-op when no ordering delay is configured.
    pub async fn recover_delayed_groups(&self) -> Result<u64, Error> {
        if self.ordering_delay.is_zero() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let recovered: u64 = self
            .scripts
            .recover_delayed
            .arg(&self.ns)
            .arg(now_ms())
            .arg(self.ordering_delay.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(recovered)
    }

    /// Number of jobs currently leased.
    pub async fn active_count(&self) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcard(format!("{}:processing", self.ns)).await?;
        Ok(count)
    }

    /// Number of pending jobs across all groups.
    pub async fn waiting_count(&self) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .scripts
            .waiting
            .arg(&self.ns)
            .arg("count")
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    /// Number of pending jobs parked behind a group lock.
    pub async fn delayed_count(&self) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .scripts
            .delayed
            .arg(&self.ns)
            .arg("count")
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    /// Job counts across states, plus the number of populated groups.
    pub async fn counts(&self) -> Result<QueueCounts, Error> {
        let active = self.active_count().await?;
        let waiting = self.waiting_count().await?;
        let delayed = self.delayed_count().await?;
        let unique_groups = self.unique_groups().await?.len() as u64;
        Ok(QueueCounts {
            active,
            waiting,
            delayed,
            total: active + waiting + delayed,
            unique_groups,
        })
    }

    /// Ids of currently leased jobs.
    pub async fn active_jobs(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let jobs: Vec<String> = conn
            .zrange(format!("{}:processing", self.ns), 0, -1)
            .await?;
        Ok(jobs)
    }

    /// Ids of pending jobs across all groups.
    pub async fn waiting_jobs(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let jobs: Vec<String> = self
            .scripts
            .waiting
            .arg(&self.ns)
            .arg("ids")
            .invoke_async(&mut conn)
            .await?;
        Ok(jobs)
    }

    /// Ids of pending jobs parked behind a group lock.
    pub async fn delayed_jobs(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let jobs: Vec<String> = self
            .scripts
            .delayed
            .arg(&self.ns)
            .arg("ids")
            .invoke_async(&mut conn)
            .await?;
        Ok(jobs)
    }

    /// Ids of groups that currently have pending jobs.
    pub async fn unique_groups(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.conn.clone();
        let groups: Vec<String> = self
            .scripts
            .unique_groups
            .arg(&self.ns)
            .invoke_async(&mut conn)
            .await?;
        Ok(groups)
    }

    /// Poll until no jobs are leased, or `timeout` elapses.
    pub async fn wait_for_empty(&self, timeout: std::time::Duration) -> Result<bool, Error> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.active_count().await? == 0 {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            futures_timer::Delay::new(std::time::Duration::from_millis(100)).await;
        }
    }

    /// Delete every key under this queue's namespace. Test and ops helper.
    pub async fn purge(&self) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.ns);
        let mut keys = Vec::new();
        {
            let mut iter = conn.scan_match::<_, String>(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = conn.del(&keys).await?;
        Ok(removed)
    }
}

fn parse_reserved(fields: Vec<String>) -> Result<ReservedJob, Error> {
    let [id, group_id, payload, attempts, max_attempts, seq, enqueued_at, order_ms, score, deadline_at]: [String; 10] = fields
        .try_into()
        .map_err(|_| Error::new_decode(Box::new(MalformedReplyError("reserve field count"))))?;

    Ok(ReservedJob {
        id,
        group_id,
        payload,
        attempts: parse_num(&attempts, "attempts")?,
        max_attempts: parse_num(&max_attempts, "maxAttempts")?,
        seq: parse_num(&seq, "seq")?,
        enqueued_at: parse_num(&enqueued_at, "enqueuedAt")?,
        order_ms: parse_num(&order_ms, "orderMs")?,
        score: parse_num(&score, "score")?,
        deadline_at: parse_num(&deadline_at, "deadlineAt")?,
    })
}
