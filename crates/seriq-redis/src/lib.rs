//! Redis store for the seriq group-ordered job queue.
//!
//! [`Queue`] owns the key space and the atomic Lua procedures; [`Client`]
//! serializes typed payloads in; [`BackEnd`] hands leased jobs out to the
//! worker engine in `seriq-core`.
pub use seriq_core;

pub mod backend;
pub mod client;
pub mod queue;

pub use backend::{BackEnd, GroupJob, LeaseContext, RedisDriver};
pub use client::{Client, EnqueueJob};
pub use queue::{Queue, QueueCounts, ReservedJob, RetryStatus};
