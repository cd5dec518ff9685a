//! Worker engine and builder.
//!
//! Periodic polling, bounded concurrency, heartbeats while running, explicit
//! completion. Spawning is pluggable.
use crate::{
    JobHandler, JobResult,
    backend::{BackEndContext, BackEndPoller, Heartbeat, Job, JobMeta, RetryOutcome},
    utils::Ticker,
};
use futures::{FutureExt as _, Stream, StreamExt as _};
use rand::Rng as _;

/// How job futures are executed (inline, Tokio, etc.).
pub trait JobSpawner {
    type JobHandle<Fut>: Future<Output = ()> + Send + 'static
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static;
}

/// Minimal spawner that runs jobs inline (deterministic tests, no runtime).
pub struct InlineSpawner;

impl JobSpawner for InlineSpawner {
    type JobHandle<Fut>
        = Fut
    where
        Fut: Future<Output = ()> + Send + 'static;
    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        fut
    }
}

/// Stream that wakes the worker to poll the backend.
pub trait TickStream: Stream<Item = ()> + Send {}

impl<St> TickStream for St where St: Stream<Item = ()> + Send {}

/// Maps the attempt number about to run (1-based) to a retry delay.
pub type BackoffStrategy = std::sync::Arc<dyn Fn(u32) -> std::time::Duration + Send + Sync>;

/// Exponential backoff with jitter: 500ms doubling per attempt, capped at
/// 30s, plus up to 25% random spread to avoid retry stampedes.
pub fn default_backoff(attempt: u32) -> std::time::Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base_ms = (500u64 << exp).min(30_000);
    let jitter = (base_ms as f64 * rand::thread_rng().gen_range(0.0..0.25)) as u64;
    std::time::Duration::from_millis(base_ms + jitter)
}

/// Lifecycle notifications emitted as jobs finish.
///
/// Delivered to the sink installed via [`WorkerBuilder::on_event`], in
/// addition to tracing output.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Handler succeeded and the completion was persisted.
    Completed {
        job: JobMeta,
        elapsed: std::time::Duration,
    },
    /// Handler asked for a retry and the job was requeued.
    Failed {
        job: JobMeta,
        elapsed: std::time::Duration,
        retry_in: std::time::Duration,
    },
    /// Handler asked for a retry but the attempt budget was exhausted.
    Dropped {
        job: JobMeta,
        elapsed: std::time::Duration,
    },
    /// A heartbeat found the lease gone; the outcome was not persisted.
    LeaseLost { job: JobMeta },
}

type EventSink = std::sync::Arc<dyn Fn(WorkerEvent) + Send + Sync>;

/// Worker + tick stream + backend + handler + concurrency.
pub struct Worker<Tick, Poller, F, M, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    Poller: BackEndPoller<Data = F::Data>,
    Sp: JobSpawner,
{
    tick: Tick,
    poller: Poller,
    handler: F,
    context: F::Context,
    concurrent: usize,
    backoff: BackoffStrategy,
    events: Option<EventSink>,
    marker: std::marker::PhantomData<fn() -> Sp>,
}

impl<Tick, Poller, F, M, Sp> Worker<Tick, Poller, F, M, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    F::Context: Clone,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data> + 'static,
    Sp: JobSpawner,
{
    pub fn backend_ref(&self) -> &Poller {
        &self.poller
    }

    /// Replace the tick stream (compose with external wake-ups, etc.).
    pub fn modify_stream<ModFn, Tick2>(self, func: ModFn) -> Worker<Tick2, Poller, F, M, Sp>
    where
        ModFn: FnOnce(Tick) -> Tick2,
        Tick2: TickStream,
    {
        let Self {
            tick,
            poller,
            handler,
            context,
            concurrent,
            backoff,
            events,
            marker,
        } = self;

        let tick2 = func(tick);

        Worker {
            tick: tick2,
            poller,
            handler,
            context,
            concurrent,
            backoff,
            events,
            marker,
        }
    }

    /// Add a shutdown signal and drain in-flight jobs.
    pub fn with_graceful_shutdown<Signal>(
        self,
        signal: Signal,
    ) -> WorkerWithGracefulShutdown<Tick, Poller, F, M, Signal, Sp>
    where
        Signal: Future<Output = ()> + Send,
    {
        let Self {
            tick,
            poller,
            handler,
            context,
            concurrent,
            backoff,
            events,
            marker: _,
        } = self;
        WorkerWithGracefulShutdown {
            tick,
            poller,
            handler,
            context,
            concurrent,
            backoff,
            events,
            signal,
            drain_timeout: None,
            marker: std::marker::PhantomData,
        }
    }

    /// Run until the tick stream ends (or forever). No prefetch.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        run_worker::<_, _, _, _, _, Sp>(
            self.tick,
            self.handler,
            self.context,
            self.poller,
            self.concurrent,
            self.backoff,
            self.events,
            std::future::pending::<()>(),
            None,
        )
    }
}

/// Worker variant that reacts to a shutdown signal and drains tasks.
pub struct WorkerWithGracefulShutdown<Tick, Poller, F, M, Signal, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    Poller: BackEndPoller<Data = F::Data>,
    Signal: Future<Output = ()> + Send,
    Sp: JobSpawner,
{
    tick: Tick,
    poller: Poller,
    handler: F,
    context: F::Context,
    concurrent: usize,
    backoff: BackoffStrategy,
    events: Option<EventSink>,
    signal: Signal,
    drain_timeout: Option<std::time::Duration>,
    marker: std::marker::PhantomData<fn() -> Sp>,
}

impl<Tick, Poller, F, M, Signal, Sp> WorkerWithGracefulShutdown<Tick, Poller, F, M, Signal, Sp>
where
    Tick: TickStream,
    F: JobHandler<M>,
    F::Context: Clone,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data> + 'static,
    Signal: Future<Output = ()> + Send,
    Sp: JobSpawner,
{
    /// Cap how long the drain phase may run after the shutdown signal.
    ///
    /// Jobs still running at the deadline are abandoned; their leases expire
    /// on the backend and another worker picks them up.
    pub fn drain_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Run until shutdown, then drain tasks.
    pub fn run(self) -> impl Future<Output = ()> + Send {
        run_worker::<_, _, _, _, _, Sp>(
            self.tick,
            self.handler,
            self.context,
            self.poller,
            self.concurrent,
            self.backoff,
            self.events,
            self.signal,
            self.drain_timeout,
        )
    }
}

/// Core loop: fetch when capacity, spawn, heartbeat, finalize.
#[allow(clippy::too_many_arguments)]
async fn run_worker<Tick, Poller, F, M, Signal, Sp>(
    tick: Tick,
    handler: F,
    worker_context: F::Context,
    mut poller: Poller,
    concurrent: usize,
    backoff: BackoffStrategy,
    events: Option<EventSink>,
    signal: Signal,
    drain_timeout: Option<std::time::Duration>,
) where
    Tick: TickStream,
    F: JobHandler<M>,
    F::Context: Clone,
    M: 'static,
    Poller: BackEndPoller<Data = F::Data> + 'static,
    Signal: Future + Send,
    Sp: JobSpawner,
{
    futures::pin_mut!(tick);
    futures::pin_mut!(signal);
    let mut tick = tick.fuse();
    // Track in-flight jobs; FuturesUnordered for fair progress across tasks.
    let mut tasks = futures::stream::FuturesUnordered::new();
    let mut signal = signal.fuse();
    loop {
        futures::select! {
            tick_val = tick.next() => {
                // If tick stream ended (e.g., graceful shutdown), stop fetching
                if tick_val.is_none() { break; }

                // Backpressure: fetch only when capacity is free.
                let free = concurrent.saturating_sub(tasks.len());
                if free == 0 {
                    continue;
                }

                let polled_jobs = poller.poll_job(free).await;
                for job in polled_jobs {
                    match job {
                        Ok(job) => {
                            let fut = handle_one_job::<F,M,Poller>(
                                job,
                                handler.clone(),
                                worker_context.clone(),
                                backoff.clone(),
                                events.clone(),
                            );
                            tasks.push(<Sp as JobSpawner>::spawn(fut));
                        },
                        Err(error) => {
                            tracing::error!(error = %error, "Failed to fetch job");
                        },
                    }
                }

            },
            _ = tasks.next() => { },
            _ = signal => {
                // Predictable shutdown: stop fetching, drain in-flight tasks.
                tracing::trace!("received graceful shutdown signal. waiting for {} job(s) to finish", tasks.len());
                break;
            }
        }
    }

    // Drain remaining tasks, optionally bounded by the drain timeout.
    match drain_timeout {
        Some(limit) => {
            let deadline = futures_timer::Delay::new(limit);
            futures::pin_mut!(deadline);
            let mut deadline = deadline.fuse();
            loop {
                futures::select! {
                    task = tasks.next() => {
                        if task.is_none() { break; }
                    },
                    _ = deadline => {
                        tracing::warn!("drain timeout elapsed with {} job(s) still running", tasks.len());
                        break;
                    }
                }
            }
        }
        None => while tasks.next().await.is_some() {},
    }
}

/// Run one job, extending its lease on a timer, then persist the outcome.
async fn handle_one_job<F, M, Poller>(
    job: Job<F::Data, <Poller as BackEndPoller>::Context>,
    handler: F,
    worker_context: F::Context,
    backoff: BackoffStrategy,
    events: Option<EventSink>,
) where
    F: JobHandler<M>,
    Poller: BackEndPoller<Data = F::Data>,
{
    let (data, mut context) = job.split_parts();
    let meta = context.meta().clone();
    let started = std::time::Instant::now();
    let emit = |event: WorkerEvent| {
        if let Some(sink) = &events {
            sink(event);
        }
    };

    tracing::trace!(job_id = %meta.id, group_id = %meta.group_id, "Start handler");
    let job_result = {
        let heartbeat_tick = Ticker::new(context.heartbeat_interval());
        futures::pin_mut!(heartbeat_tick);
        let mut heartbeat_tick = heartbeat_tick.fuse();
        let handler_fut = handler.call(data, worker_context);
        futures::pin_mut!(handler_fut);
        let mut handler_fut = handler_fut.fuse();

        loop {
            futures::select! {
                res = handler_fut => break res,
                _ = heartbeat_tick.next() => {
                    match context.heartbeat().await {
                        Ok(Heartbeat::Alive) => continue,
                        Ok(Heartbeat::Lost) => {
                            // Another worker may already hold the group; do
                            // not persist any outcome for this execution.
                            tracing::warn!(job_id = %meta.id, group_id = %meta.group_id, "lease lost, abandoning job");
                            emit(WorkerEvent::LeaseLost { job: meta });
                            return;
                        },
                        Err(error) => {
                            // Transient store error; the lease may still be
                            // valid, so keep running and try again next tick.
                            tracing::error!(error = %error, job_id = %meta.id, "Failed to extend lease");
                        },
                    }
                }
            }
        }
    };
    tracing::trace!(job_id = %meta.id, "Finish handler");

    let elapsed = started.elapsed();
    match job_result {
        JobResult::Complete => match BackEndContext::complete(context).await {
            Ok(()) => emit(WorkerEvent::Completed { job: meta, elapsed }),
            Err(error) => {
                tracing::error!(error = %error, job_id = %meta.id, "Failed to complete job");
            }
        },
        JobResult::Retry(delay) => {
            // Attempt numbering is 1-based for backoff: the delivery that just
            // failed was attempt `attempts + 1`.
            let delay = delay.unwrap_or_else(|| backoff(meta.attempts + 1));
            match BackEndContext::retry(context, Some(delay)).await {
                Ok(RetryOutcome::Scheduled(attempts)) => {
                    tracing::debug!(job_id = %meta.id, attempts, retry_in_ms = delay.as_millis() as u64, "job requeued for retry");
                    emit(WorkerEvent::Failed {
                        job: meta,
                        elapsed,
                        retry_in: delay,
                    });
                }
                Ok(RetryOutcome::Dropped) => {
                    tracing::warn!(job_id = %meta.id, group_id = %meta.group_id, "job exhausted attempts and was dropped");
                    emit(WorkerEvent::Dropped { job: meta, elapsed });
                }
                Err(error) => {
                    tracing::error!(error = %error, job_id = %meta.id, "Failed to retry job");
                }
            }
        }
    }
}

/// Builder for `Worker`. Prefer explicit configuration over defaults.
pub struct WorkerBuilder<Tick = (), Handler = (), M = (), Ctx = (), Sp = InlineSpawner> {
    tick: Tick,
    concurrent: usize,
    handler: Handler,
    context: Ctx,
    backoff: BackoffStrategy,
    events: Option<EventSink>,
    marker: std::marker::PhantomData<fn() -> (M, Sp)>,
}

impl WorkerBuilder {
    /// Poll every `interval`.
    pub fn new(interval: std::time::Duration) -> WorkerBuilder<Ticker, (), (), (), InlineSpawner> {
        Self::new_with_tick(Ticker::new(interval))
    }

    /// Use a custom tick stream.
    pub fn new_with_tick<Tick>(tick: Tick) -> WorkerBuilder<Tick, (), (), (), InlineSpawner> {
        WorkerBuilder {
            tick,
            concurrent: 4,
            handler: (),
            context: (),
            backoff: std::sync::Arc::new(default_backoff),
            events: None,
            marker: std::marker::PhantomData,
        }
    }
}

impl<Tick, Handler, M, Ctx, Sp> WorkerBuilder<Tick, Handler, M, Ctx, Sp> {
    /// Set concurrency (max in-flight jobs).
    pub fn concurrent(mut self, concurrent: usize) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Replace the retry delay strategy used for `JobResult::Retry(None)`.
    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Install a sink receiving a [`WorkerEvent`] per finished job.
    pub fn on_event<Sink>(mut self, sink: Sink) -> Self
    where
        Sink: Fn(WorkerEvent) + Send + Sync + 'static,
    {
        self.events = Some(std::sync::Arc::new(sink));
        self
    }
}

impl<Tick, Ctx, Sp> WorkerBuilder<Tick, (), (), Ctx, Sp> {
    /// Provide the job handler.
    pub fn handler<F, M>(self, handler: F) -> WorkerBuilder<Tick, F, M, Ctx, Sp>
    where
        F: JobHandler<M>,
    {
        let Self {
            tick,
            concurrent,
            handler: _,
            context,
            backoff,
            events,
            marker: _,
        } = self;
        WorkerBuilder {
            tick,
            concurrent,
            handler,
            context,
            backoff,
            events,
            marker: std::marker::PhantomData,
        }
    }
}

impl<Tick, Handler, M, Sp> WorkerBuilder<Tick, Handler, M, (), Sp> {
    /// Attach shared context cloned for each job.
    pub fn context<Ctx>(self, context: Ctx) -> WorkerBuilder<Tick, Handler, M, Ctx, Sp>
    where
        Ctx: Clone + Send,
    {
        let Self {
            tick,
            concurrent,
            handler,
            context: _,
            backoff,
            events,
            marker,
        } = self;
        WorkerBuilder {
            tick,
            concurrent,
            handler,
            context,
            backoff,
            events,
            marker,
        }
    }
}
impl<Tick, Handler, M, Ctx, Sp> WorkerBuilder<Tick, Handler, M, Ctx, Sp> {
    /// Choose how to spawn jobs (inline, Tokio, ...).
    pub fn job_spawner<Sp2>(self, _spawner: Sp2) -> WorkerBuilder<Tick, Handler, M, Ctx, Sp2>
    where
        Sp2: JobSpawner,
    {
        let Self {
            tick,
            concurrent,
            handler,
            context,
            backoff,
            events,
            marker: _,
        } = self;
        WorkerBuilder {
            tick,
            concurrent,
            handler,
            context,
            backoff,
            events,
            marker: std::marker::PhantomData,
        }
    }
}

impl<Tick, Handler, M, Sp> WorkerBuilder<Tick, Handler, M, Handler::Context, Sp>
where
    Tick: TickStream,
    Handler: JobHandler<M>,
    Sp: JobSpawner,
{
    /// Finalize the worker with a backend that can poll the handler's data type.
    pub fn build<BackEnd>(self, backend: BackEnd) -> Worker<Tick, BackEnd, Handler, M, Sp>
    where
        BackEnd: BackEndPoller<Data = Handler::Data>,
    {
        let Self {
            tick,
            concurrent,
            handler,
            context,
            backoff,
            events,
            marker: _,
        } = self;
        Worker {
            tick,
            poller: backend,
            handler,
            context,
            concurrent,
            backoff,
            events,
            marker: std::marker::PhantomData,
        }
    }
}
