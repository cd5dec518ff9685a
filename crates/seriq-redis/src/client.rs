//! Producer-side handle for enqueuing typed payloads.

use serde::Serialize;

use crate::queue::Queue;

/// Description of a job to enqueue.
///
/// The generic `T` is the payload serialized into the job record. Ordering
/// and the attempt budget can be customised per job.
pub struct EnqueueJob<T> {
    data: T,
    group_id: String,
    /// Primary ordering field (e.g., an event timestamp in epoch ms).
    ///
    /// Defaults to the enqueue wall clock.
    order_ms: Option<u64>,
    max_attempts: Option<u32>,
}

impl<T> EnqueueJob<T> {
    /// Create a new `EnqueueJob` for `group_id` wrapping the payload.
    pub fn new(group_id: impl Into<String>, data: T) -> Self {
        Self {
            data,
            group_id: group_id.into(),
            order_ms: None,
            max_attempts: None,
        }
    }

    /// Order the job by this timestamp instead of the enqueue time.
    pub fn order_ms(self, order_ms: u64) -> Self {
        Self {
            order_ms: Some(order_ms),
            ..self
        }
    }

    /// Override the queue-level attempt budget for this job.
    pub fn max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    /// Extract the wrapped job payload.
    pub fn into_inner(self) -> T {
        self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categories of errors that can occur when enqueuing a job.
pub enum ErrorKind {
    /// An error was returned by the store layer.
    Store,
    /// Serialization of the job data failed.
    Encode,
}

#[derive(Debug)]
/// Error type returned by [`Client`] operations.
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl Error {
    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<crate::queue::Error> for Error {
    fn from(value: crate::queue::Error) -> Self {
        Self {
            kind: ErrorKind::Store,
            inner: Box::new(value),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Encode,
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

/// A handle used to enqueue typed jobs into a [`Queue`].
pub struct Client<T> {
    queue: Queue,
    data_type: std::marker::PhantomData<T>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            data_type: std::marker::PhantomData,
        }
    }
}

impl<T> Client<T> {
    /// Create a new client bound to the given queue.
    pub fn new(queue: Queue) -> Self {
        Self {
            queue,
            data_type: std::marker::PhantomData,
        }
    }

    /// The queue this client enqueues into.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}

impl<T> Client<T>
where
    T: Serialize + Sync,
{
    /// Serialize the payload and enqueue it, returning the assigned job id.
    pub async fn enqueue(&self, job: &EnqueueJob<T>) -> Result<String, Error> {
        let payload = serde_json::to_string(&job.data)?;
        let job_id = self
            .queue
            .enqueue(&job.group_id, &payload, job.order_ms, job.max_attempts)
            .await?;
        Ok(job_id)
    }
}
