//! Backend-facing traits: lease jobs, heartbeat, and persist outcomes.
//!
//! The worker drives; the backend stores. The backend owns lease semantics
//! and heartbeat cadence, finalization methods consume `self` so an outcome
//! cannot be committed twice, and polling yields per-job results so one bad
//! row does not block the rest of a batch.
mod tmp {
    /// Backend marker carrying the backend-specific error type.
    pub trait BackEndDriver: Send {
        type Error: std::error::Error + Send;
    }

    /// Identity of a leased job, independent of its payload.
    ///
    /// The worker uses this for events and backoff accounting; the backend
    /// fills it at reservation time.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct JobMeta {
        pub id: String,
        pub group_id: String,
        /// Attempts consumed so far (0 on first delivery).
        pub attempts: u32,
        pub max_attempts: u32,
    }

    /// Result of a lease extension.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Heartbeat {
        /// Lease extended; keep running the handler.
        Alive,
        /// The group lock is no longer ours. Another worker may already be
        /// re-executing the job; stop without finalizing.
        Lost,
    }

    /// Result of scheduling a retry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RetryOutcome {
        /// Job was requeued; carries the attempt count consumed so far.
        Scheduled(u32),
        /// Attempts exceeded the job's budget; the store dropped the job.
        Dropped,
    }

    /// Per-job context scoping the authority to update one leased job.
    #[trait_variant::make(BackEndContext: Send)]
    pub trait LocalBackEndContext {
        type Driver: BackEndDriver;

        #[allow(unused)]
        fn meta(&self) -> &JobMeta;
        #[allow(unused)]
        fn heartbeat_interval(&self) -> std::time::Duration;
        #[allow(unused)]
        async fn heartbeat(
            &mut self,
        ) -> Result<Heartbeat, <Self::Driver as BackEndDriver>::Error>;
        #[allow(unused)]
        async fn complete(self) -> Result<(), <Self::Driver as BackEndDriver>::Error>;
        #[allow(unused)]
        async fn retry(
            self,
            retry_after: Option<std::time::Duration>,
        ) -> Result<RetryOutcome, <Self::Driver as BackEndDriver>::Error>;
    }

    /// Pair of job payload and backend context.
    pub struct Job<Data, Context> {
        data: Data,
        context: Context,
    }

    impl<Data, Context> Job<Data, Context> {
        /// Separate payload and context for handler and bookkeeping.
        pub fn split_parts(self) -> (Data, Context) {
            (self.data, self.context)
        }

        /// Build a job from payload and context.
        pub fn from_parts(data: Data, context: Context) -> Self {
            Self { data, context }
        }
    }

    #[trait_variant::make(BackEndPoller: Send)]
    pub trait LocalBackEndPoller {
        type Driver: BackEndDriver;
        type Data: Send + 'static;
        type Context: BackEndContext + Send + 'static;

        #[allow(unused)]
        async fn poll_job(
            &mut self,
            batch_size: usize,
        ) -> Vec<Result<Job<Self::Data, Self::Context>, <Self::Driver as BackEndDriver>::Error>>;
    }
}

pub use tmp::{BackEndContext, BackEndDriver, BackEndPoller, Heartbeat, Job, JobMeta, RetryOutcome};
