pub use seriq_core::{
    BackoffStrategy, JobData, JobResult, Worker, WorkerBuilder, WorkerContext, WorkerEvent,
    WorkerWithGracefulShutdown, default_backoff,
};
pub use seriq_core::{backend, worker};

#[cfg(feature = "rt-tokio")]
pub use seriq_core::TokioSpawner;

#[cfg(feature = "redis")]
pub use seriq_redis::{BackEnd, Client, EnqueueJob, GroupJob, Queue, ReservedJob};
