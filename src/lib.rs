//! Redis-backed distributed job queue: producers enqueue opaque payloads
//! with scheduling options, workers execute them with at-least-once
//! semantics, retries with backoff, stalled-job reclamation and a per-queue
//! event stream.

pub use conveyor_database as database;
pub use conveyor_graceful_shutdown as graceful_shutdown;
pub use conveyor_lock as lock;
pub use conveyor_queues as queues;

mod registry;

pub use registry::QueueRegistry;

pub use conveyor_database::RedisPool;
pub use conveyor_graceful_shutdown::{Shutdown, ShutdownListener, TaskGuard};
pub use conveyor_lock::{LockManager, LockOptions};
pub use conveyor_queues::{
    ActiveJob, BackoffPlan, Clock, Error, EventKind, FailedJobSink, Job, JobCounts, JobHandler,
    JobOpts, JobRecord, JobState, Queue, QueueSettings, RateLimit, RemovalPolicy, Worker,
    WorkerLimits, WorkerOptions,
};
