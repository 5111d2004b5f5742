use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::backoff::Backoff;
use conveyor_graceful_shutdown::ShutdownListener;
use futures::{
    future::ready,
    stream::{FuturesUnordered, StreamExt},
};
use serde::de::DeserializeOwned;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{event, Level};

use crate::{
    dead_letter::FailedJobSink, error::Error, fail::FailOutcome, work_item::ActiveJob, Queue,
    ReserveOutcome,
};

/// Executes reserved jobs. The returned value becomes the job's
/// `returnvalue`; an error becomes a failed attempt, retried per the job's
/// backoff plan.
#[async_trait]
pub trait JobHandler: Clone + Sync + Send + 'static {
    type Payload: DeserializeOwned + Send + Sync;
    type Error: 'static + Send + Sync + std::error::Error;

    async fn handle(
        &self,
        job: &ActiveJob<Self::Payload>,
    ) -> Result<serde_json::Value, Self::Error>;
}

/// Self-imposed bounds checked between reservations. Exceeding any of them
/// stops the worker cleanly; in-flight handlers finish first.
#[derive(Debug, Clone, Default)]
pub struct WorkerLimits {
    pub max_jobs: Option<u64>,
    pub max_time: Option<Duration>,
    pub max_memory_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Concurrent in-flight handlers.
    pub concurrency: usize,
    /// TTL on each reservation's lock; the heartbeat refreshes at half
    /// this interval.
    pub lock_ttl: Duration,
    /// Sleep when the queue is drained or paused.
    pub drain_delay: Duration,
    pub limits: WorkerLimits,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        WorkerOptions {
            concurrency: num_cpus::get() * 2,
            lock_ttl: Duration::from_secs(30),
            drain_delay: Duration::from_secs(1),
            limits: WorkerLimits::default(),
        }
    }
}

enum StopMode {
    Wait,
    Detach,
}

/// A reservation loop over one queue. Runs until stopped, shut down, or a
/// self-imposed limit trips.
pub struct Worker {
    id: String,
    closer: Mutex<Option<oneshot::Sender<StopMode>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn start<H>(
        queue: Queue,
        handler: H,
        options: WorkerOptions,
        shutdown: ShutdownListener,
        sink: Option<Arc<dyn FailedJobSink>>,
    ) -> Worker
    where
        H: JobHandler,
    {
        let worker_id = uuid::Uuid::new_v4().to_string();
        event!(Level::INFO, queue=%queue.name(), worker=%worker_id, "Starting worker");

        let (closer_tx, closer_rx) = oneshot::channel::<StopMode>();
        let task = worker_loop(
            queue,
            handler,
            options,
            shutdown,
            sink,
            worker_id.clone(),
            closer_rx,
        );

        Worker {
            id: worker_id,
            closer: Mutex::new(Some(closer_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    /// Stop accepting reservations. With `wait`, block until in-flight
    /// handlers finish; otherwise detach them and let their locks expire
    /// so the stalled checker reclaims the jobs.
    pub async fn stop(&self, wait: bool) {
        let mode = if wait { StopMode::Wait } else { StopMode::Detach };
        if let Some(closer) = self.closer.lock().unwrap().take() {
            closer.send(mode).ok();
        }

        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                event!(Level::ERROR, worker=%self.id, error=%e, "Worker task panicked");
            }
        }
    }
}

fn default_poll_backoff() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoff {
        current_interval: Duration::from_millis(50),
        initial_interval: Duration::from_millis(50),
        max_interval: Duration::from_millis(5000),
        max_elapsed_time: None,
        ..Default::default()
    }
}

#[cfg(target_os = "linux")]
fn current_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn current_rss_bytes() -> Option<u64> {
    None
}

fn limits_exceeded(limits: &WorkerLimits, jobs_started: u64, started: Instant) -> Option<&'static str> {
    if let Some(max_jobs) = limits.max_jobs {
        if jobs_started >= max_jobs {
            return Some("max_jobs");
        }
    }
    if let Some(max_time) = limits.max_time {
        if started.elapsed() >= max_time {
            return Some("max_time");
        }
    }
    if let Some(max_memory) = limits.max_memory_bytes {
        if let Some(rss) = current_rss_bytes() {
            if rss >= max_memory {
                return Some("memory");
            }
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn worker_loop<H>(
    queue: Queue,
    handler: H,
    options: WorkerOptions,
    mut shutdown: ShutdownListener,
    sink: Option<Arc<dyn FailedJobSink>>,
    worker_id: String,
    closer_rx: oneshot::Receiver<StopMode>,
) -> JoinHandle<()>
where
    H: JobHandler,
{
    tokio::spawn(async move {
        // Held for the whole loop, including the in-flight drain, so
        // `Shutdown::trigger_and_wait` covers this worker.
        let _task_guard = shutdown.task_guard();
        let shutdown_fut = shutdown.wait_for_shutdown();
        tokio::pin!(shutdown_fut);
        tokio::pin!(closer_rx);

        let mut active_tasks = FuturesUnordered::<JoinHandle<()>>::new();
        let mut sleep_time = Duration::default();
        let mut poll_backoff = default_poll_backoff();
        let started = Instant::now();
        let mut jobs_started: u64 = 0;
        let mut was_busy = false;
        let mut wait_for_inflight = true;

        loop {
            let task_slots_full = active_tasks.len() >= options.concurrency;
            let do_sleep = sleep_time > Duration::default();
            if task_slots_full || do_sleep {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_fut => break,
                    mode = &mut closer_rx => {
                        if let Ok(StopMode::Detach) = mode {
                            wait_for_inflight = false;
                        }
                        break;
                    },
                    res = active_tasks.select_next_some(), if task_slots_full => {
                        if let Err(e) = res {
                            event!(Level::ERROR, error=%e, "Job task panicked");
                        }
                    },
                    _ = tokio::time::sleep(sleep_time), if do_sleep => {
                        sleep_time = Duration::default();
                    },
                };
                continue;
            }

            if let Some(limit) = limits_exceeded(&options.limits, jobs_started, started) {
                event!(Level::INFO, queue=%queue.name(), worker=%worker_id, limit=%limit, "Worker limit reached, stopping");
                break;
            }

            let token = uuid::Uuid::new_v4().to_string();
            match queue.reserve(&token, options.lock_ttl).await {
                Ok(ReserveOutcome::Reserved(record)) => {
                    poll_backoff.reset();
                    was_busy = true;
                    jobs_started += 1;

                    let task = run_job(
                        queue.clone(),
                        handler.clone(),
                        *record,
                        token,
                        options.lock_ttl,
                        sink.clone(),
                    );
                    active_tasks.push(task);
                }
                Ok(ReserveOutcome::Empty) => {
                    if was_busy && active_tasks.is_empty() {
                        was_busy = false;
                        if let Err(e) = queue.emit_drained().await {
                            event!(Level::ERROR, queue=%queue.name(), error=%e, "Error emitting drained event");
                        }
                    }
                    sleep_time = options.drain_delay;
                }
                Ok(ReserveOutcome::Paused) => {
                    sleep_time = options.drain_delay;
                }
                Err(e) => {
                    event!(Level::ERROR, queue=%queue.name(), worker=%worker_id, error=%e, "Error reserving job");
                    sleep_time = poll_backoff
                        .next_backoff()
                        .unwrap_or(options.drain_delay);
                }
            }

            // Give finished handler tasks a chance to be collected even
            // while the loop stays busy.
            tokio::select! {
                biased;
                r = active_tasks.next() => {
                    if let Some(Err(e)) = r {
                        event!(Level::ERROR, error=%e, "Job task panicked");
                    }
                },
                _ = ready(()) => {}
            };
        }

        if wait_for_inflight {
            while let Some(res) = active_tasks.next().await {
                if let Err(e) = res {
                    event!(Level::ERROR, error=%e, "Job task panicked");
                }
            }
        }
        event!(Level::INFO, queue=%queue.name(), worker=%worker_id, "Worker stopped");
    })
}

enum HandlerOutcome {
    Ok(serde_json::Value),
    Failed(String),
    TimedOut,
    LockLost,
}

fn run_job<H>(
    queue: Queue,
    handler: H,
    record: crate::JobRecord,
    token: String,
    lock_ttl: Duration,
    sink: Option<Arc<dyn FailedJobSink>>,
) -> JoinHandle<()>
where
    H: JobHandler,
{
    tokio::spawn(async move {
        let job_id = record.id.clone();
        let queue_name = queue.name().to_string();

        let active = match ActiveJob::<H::Payload>::new(queue.clone(), &record, &token) {
            Ok(active) => active,
            Err(e) => {
                // The payload cannot be handed to this handler at all, so
                // burn an attempt instead of looping on a reserve/requeue
                // cycle.
                let reason = format!("unreadable payload: {}", e);
                finish_failed(&queue, &record, &token, &reason, &reason, sink.as_deref()).await;
                return;
            }
        };

        // Heartbeat at half the TTL. A refresh that finds the token gone
        // means the stalled checker owns recovery; the handler result must
        // not be published.
        let (lost_tx, mut lost_rx) = oneshot::channel::<()>();
        let heartbeat = {
            let queue = queue.clone();
            let job_id = job_id.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(lock_ttl / 2).await;
                    match queue.extend_lock(&job_id, &token, lock_ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            lost_tx.send(()).ok();
                            break;
                        }
                        Err(e) => {
                            event!(Level::ERROR, job=%job_id, error=%e, "Error extending job lock");
                        }
                    }
                }
            })
        };

        let work = handler.handle(&active);
        let outcome = {
            tokio::pin!(work);
            match record.opts.timeout {
                Some(timeout) => {
                    tokio::select! {
                        biased;
                        _ = &mut lost_rx => HandlerOutcome::LockLost,
                        r = tokio::time::timeout(timeout, &mut work) => match r {
                            Ok(Ok(value)) => HandlerOutcome::Ok(value),
                            Ok(Err(e)) => HandlerOutcome::Failed(e.to_string()),
                            Err(_) => HandlerOutcome::TimedOut,
                        },
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = &mut lost_rx => HandlerOutcome::LockLost,
                        r = &mut work => match r {
                            Ok(value) => HandlerOutcome::Ok(value),
                            Err(e) => HandlerOutcome::Failed(e.to_string()),
                        },
                    }
                }
            }
        };
        heartbeat.abort();

        match outcome {
            HandlerOutcome::Ok(value) => {
                match queue.complete_job(&job_id, &token, &value).await {
                    Ok(()) => {}
                    Err(Error::LockLost { .. }) => {
                        event!(Level::WARN, queue=%queue_name, job=%job_id, "Lock lost at completion; result discarded");
                    }
                    Err(e) => {
                        event!(Level::ERROR, queue=%queue_name, job=%job_id, error=%e, "Error completing job");
                    }
                }
            }
            HandlerOutcome::Failed(reason) => {
                finish_failed(&queue, &record, &token, &reason, &reason, sink.as_deref()).await;
            }
            HandlerOutcome::TimedOut => {
                let timeout = record.opts.timeout.unwrap_or_default();
                let trace = format!("handler timed out after {}ms", timeout.as_millis());
                finish_failed(&queue, &record, &token, "timeout", &trace, sink.as_deref()).await;
            }
            HandlerOutcome::LockLost => {
                event!(Level::WARN, queue=%queue_name, job=%job_id, "Lock lost mid-handler; result discarded");
            }
        }
    })
}

async fn finish_failed(
    queue: &Queue,
    record: &crate::JobRecord,
    token: &str,
    reason: &str,
    trace: &str,
    sink: Option<&dyn FailedJobSink>,
) {
    match queue.fail_job(&record.id, token, reason, trace).await {
        Ok(FailOutcome::Failed) => {
            if let Some(sink) = sink {
                if let Err(e) = sink.log(queue.name(), record, reason).await {
                    event!(Level::ERROR, queue=%queue.name(), job=%record.id, error=%e, "Error archiving failed job");
                }
            }
        }
        Ok(_) => {}
        Err(Error::LockLost { .. }) => {
            event!(Level::WARN, queue=%queue.name(), job=%record.id, "Lock lost at failure; result discarded");
        }
        Err(e) => {
            event!(Level::ERROR, queue=%queue.name(), job=%record.id, error=%e, "Error failing job");
        }
    }
}
