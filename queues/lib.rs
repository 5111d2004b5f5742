pub mod dead_letter;
pub mod job;
pub mod worker;

mod backoff_plan;
mod clock;
mod complete;
mod enqueue;
mod error;
mod events;
mod extend_lock;
mod fail;
mod job_record;
mod keys;
mod promote;
mod rate_limit;
mod reclaim;
mod remove_job;
mod reserve;
mod update_progress;
mod work_item;

pub use self::{
    backoff_plan::{BackoffKind, BackoffPlan},
    clock::Clock,
    dead_letter::{FailedJobEntry, FailedJobSink, MemorySink, NullSink},
    error::Error,
    events::{EventKind, EventStream, QueueEvent},
    fail::FailOutcome,
    job::{Job, JobOpts, RemovalPolicy},
    job_record::{JobRecord, JobState},
    rate_limit::{RateLimit, RateLimitStatus},
    work_item::ActiveJob,
    worker::{JobHandler, Worker, WorkerLimits, WorkerOptions},
};

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use conveyor_database::RedisPool;
use conveyor_graceful_shutdown::ShutdownListener;
use itertools::Itertools;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{event, Level};

use crate::keys::QueueKeys;

/// Where the enqueue script routed a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Straight onto a waiting list.
    Added,
    /// Parked in the delayed set until its process-at time.
    Delayed,
    /// Parked in dependency-wait until its parents finish.
    WaitingChildren,
    /// A hash with this id already existed; nothing was written.
    Duplicated,
    /// A parent had already failed terminally; the job was born failed
    /// with reason `dependency_failed`.
    DependencyFailed,
}

impl EnqueueOutcome {
    pub(crate) fn from_tag(tag: &str, job_id: &str) -> Result<EnqueueOutcome, Error> {
        Ok(match tag {
            "added" => EnqueueOutcome::Added,
            "delayed" => EnqueueOutcome::Delayed,
            "waiting-children" => EnqueueOutcome::WaitingChildren,
            "duplicated" => EnqueueOutcome::Duplicated,
            "dependency_failed" => EnqueueOutcome::DependencyFailed,
            other => {
                return Err(Error::JobError(anyhow::anyhow!(
                    "unexpected enqueue result {} for job {}",
                    other,
                    job_id
                )))
            }
        })
    }
}

/// Result of [Queue::add].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedJob {
    pub id: String,
    pub outcome: EnqueueOutcome,
}

impl AddedJob {
    /// For callers that treat resubmission of an idempotency key as a
    /// failure rather than an outcome.
    pub fn ensure_new(self) -> Result<AddedJob, Error> {
        if self.outcome == EnqueueOutcome::Duplicated {
            return Err(Error::Duplicate { job_id: self.id });
        }
        Ok(self)
    }
}

/// Result of [Queue::reserve].
#[derive(Debug)]
pub enum ReserveOutcome {
    Reserved(Box<JobRecord>),
    Empty,
    Paused,
}

/// Point-in-time population of each status container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub dependency_wait: u64,
    /// 0 or 1; whether the pause marker is set.
    pub paused: u64,
}

/// Monotonic counters maintained by the transition scripts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub stalled: u64,
    pub promoted: u64,
    pub rate_limited: u64,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Key prefix; combined with the pool's prefix when one is set.
    pub prefix: String,
    /// Number of priority levels. Level 0 is the default; higher levels
    /// are reserved first.
    pub priority_levels: u32,
    pub rate_limit: Option<RateLimit>,
    /// Approximate cap on the events stream (`XADD MAXLEN ~`). 0 leaves
    /// it uncapped.
    pub events_maxlen: usize,
    pub promote_interval: Duration,
    pub promote_batch: usize,
    pub stalled_check_interval: Duration,
    pub max_stalled_retries: u32,
    pub clock: Clock,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            prefix: "cvq".to_string(),
            priority_levels: 1,
            rate_limit: None,
            events_maxlen: 10_000,
            promote_interval: Duration::from_secs(1),
            promote_batch: 100,
            stalled_check_interval: Duration::from_secs(30),
            max_stalled_retries: 3,
            clock: Clock::Wall,
        }
    }
}

pub struct Queue(std::sync::Arc<QueueInner>);

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.0.name)
            .field("prefix", &self.0.keys.root)
            .field("priority_levels", &self.0.settings.priority_levels)
            .finish()
    }
}

impl Clone for Queue {
    fn clone(&self) -> Queue {
        Queue(self.0.clone())
    }
}

struct QueueInner {
    pool: RedisPool,
    name: String,
    keys: QueueKeys,
    settings: QueueSettings,

    enqueue_script: enqueue::EnqueueScript,
    reserve_script: reserve::ReserveScript,
    extend_lock_script: extend_lock::ExtendLockScript,
    complete_script: complete::CompleteScript,
    fail_script: fail::FailScript,
    promote_script: promote::PromoteScript,
    reclaim_script: reclaim::ReclaimScript,
    remove_script: remove_job::RemoveJobScript,
    progress_script: update_progress::UpdateProgressScript,
    rate_limit_script: rate_limit::RateLimitScript,

    promoter_task: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
    stalled_task: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl Queue {
    pub fn new(pool: RedisPool, queue_name: String, settings: QueueSettings) -> Result<Queue, Error> {
        job::validate_queue_name(queue_name.as_str())?;

        let prefix = pool.queue_prefix(settings.prefix.as_str());
        let keys = QueueKeys::new(prefix.as_str(), queue_name.as_str(), settings.priority_levels);

        Ok(Queue(std::sync::Arc::new(QueueInner {
            pool,
            keys,
            settings,
            enqueue_script: enqueue::EnqueueScript::new(),
            reserve_script: reserve::ReserveScript::new(),
            extend_lock_script: extend_lock::ExtendLockScript::new(),
            complete_script: complete::CompleteScript::new(),
            fail_script: fail::FailScript::new(),
            promote_script: promote::PromoteScript::new(),
            reclaim_script: reclaim::ReclaimScript::new(),
            remove_script: remove_job::RemoveJobScript::new(),
            progress_script: update_progress::UpdateProgressScript::new(),
            rate_limit_script: rate_limit::RateLimitScript::new(),
            promoter_task: Mutex::new(None),
            stalled_task: Mutex::new(None),
            name: queue_name,
        })))
    }

    pub fn name(&self) -> &str {
        self.0.name.as_str()
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.0.settings
    }

    pub fn clock(&self) -> &Clock {
        &self.0.settings.clock
    }

    /// Enqueue one job. Returns after the enqueue script committed the job
    /// to its first container.
    ///
    /// With a rate limit configured this consults the window first; a full
    /// window either defers the job into `delayed` (the default) or
    /// surfaces [Error::RateLimited].
    pub async fn add(&self, job: &Job<'_>) -> Result<AddedJob, Error> {
        self.add_inner(job, None).await
    }

    /// Like [Queue::add], but counts the job against the rate-limit window
    /// named by `discriminator` instead of the queue-wide one.
    pub async fn add_with_rate_key(
        &self,
        job: &Job<'_>,
        discriminator: &str,
    ) -> Result<AddedJob, Error> {
        self.add_inner(job, Some(discriminator)).await
    }

    pub async fn add_multiple(&self, jobs: &[Job<'_>]) -> Result<Vec<AddedJob>, Error> {
        let mut added = Vec::with_capacity(jobs.len());
        for job in jobs {
            added.push(self.add_inner(job, None).await?);
        }
        Ok(added)
    }

    async fn add_inner(
        &self,
        job: &Job<'_>,
        discriminator: Option<&str>,
    ) -> Result<AddedJob, Error> {
        if let Some(id) = job.id {
            job::validate_job_id(id)?;
        }
        if job.opts.priority >= self.0.settings.priority_levels {
            return Err(Error::BadOptions(format!(
                "priority {} exceeds configured levels {}",
                job.opts.priority, self.0.settings.priority_levels
            )));
        }

        let mut conn = self.0.pool.get().await?;
        let mut delay_ms = job.opts.delay.as_millis() as u64;

        if let Some(limit) = &self.0.settings.rate_limit {
            let status = self.run_rate_limit(&mut conn, limit, discriminator).await?;
            if status.limited {
                if !limit.auto_defer {
                    return Err(Error::RateLimited {
                        retry_after: status.reset_in,
                    });
                }
                let defer_ms = (status.reset_in.as_millis() as u64).max(1);
                delay_ms = delay_ms.max(defer_ms);
            }
        }

        let id = match job.id {
            Some(id) => id.to_string(),
            None => self.next_id(&mut conn).await?,
        };

        let outcome = self
            .0
            .enqueue_script
            .run(
                &self.0.keys,
                &mut conn,
                self.0.name.as_str(),
                id.as_str(),
                job.payload.as_ref(),
                &job.opts,
                delay_ms,
                self.0.settings.clock.now_ms(),
                self.0.settings.events_maxlen,
            )
            .await?;

        Ok(AddedJob { id, outcome })
    }

    /// Strictly increasing decimal ids from the queue's counter.
    async fn next_id(&self, conn: &mut deadpool_redis::Connection) -> Result<String, Error> {
        let id: i64 = redis::cmd("INCR")
            .arg(&self.0.keys.id_counter)
            .query_async(&mut **conn)
            .await?;
        Ok(id.to_string())
    }

    async fn run_rate_limit(
        &self,
        conn: &mut deadpool_redis::Connection,
        limit: &RateLimit,
        discriminator: Option<&str>,
    ) -> Result<RateLimitStatus, Error> {
        let window_key = self.0.keys.limit_for(discriminator);
        self.0
            .rate_limit_script
            .run(
                conn,
                window_key.as_str(),
                self.0.keys.metrics.as_str(),
                self.0.settings.clock.now_ms(),
                limit,
            )
            .await
    }

    /// Consult (and, when allowed, consume a slot of) the rate-limit
    /// window without enqueueing anything.
    pub async fn check_rate_limit(
        &self,
        discriminator: Option<&str>,
    ) -> Result<Option<RateLimitStatus>, Error> {
        let limit = match &self.0.settings.rate_limit {
            Some(limit) => limit,
            None => return Ok(None),
        };
        let mut conn = self.0.pool.get().await?;
        self.run_rate_limit(&mut conn, limit, discriminator)
            .await
            .map(Some)
    }

    /// Atomically pop the next waiting job (highest priority level first),
    /// move it to `active` and take its lock with `token`.
    pub async fn reserve(&self, token: &str, lock_ttl: Duration) -> Result<ReserveOutcome, Error> {
        let mut conn = self.0.pool.get().await?;
        let raw = self
            .0
            .reserve_script
            .run(
                &self.0.keys,
                &mut conn,
                token,
                self.0.settings.clock.now_ms(),
                lock_ttl.as_millis() as u64,
                self.0.settings.events_maxlen,
            )
            .await?;

        let id = match raw {
            reserve::RawReserve::Reserved(id) => id,
            reserve::RawReserve::Empty => return Ok(ReserveOutcome::Empty),
            reserve::RawReserve::Paused => return Ok(ReserveOutcome::Paused),
        };

        match self.fetch_record(&mut conn, id.as_str()).await? {
            Some(record) => Ok(ReserveOutcome::Reserved(Box::new(record))),
            None => {
                // Removed between the pop and the read. The reservation
                // left nothing behind worth keeping.
                event!(Level::WARN, queue=%self.0.name, job=%id, "Reserved job hash disappeared");
                Ok(ReserveOutcome::Empty)
            }
        }
    }

    /// Refresh a reservation's lock. Returns false once the lock belongs
    /// to someone else (or expired), in which case the holder must discard
    /// its result.
    pub async fn extend_lock(
        &self,
        job_id: &str,
        token: &str,
        lock_ttl: Duration,
    ) -> Result<bool, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .extend_lock_script
            .run(
                &self.0.keys,
                &mut conn,
                job_id,
                token,
                lock_ttl.as_millis() as u64,
            )
            .await
    }

    /// Terminal success. Fails with [Error::LockLost] when `token` no
    /// longer owns the job, [Error::NotFound] when the job is gone.
    pub async fn complete_job(
        &self,
        job_id: &str,
        token: &str,
        returnvalue: &serde_json::Value,
    ) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .complete_script
            .run(
                &self.0.keys,
                &mut conn,
                job_id,
                token,
                returnvalue,
                self.0.settings.clock.now_ms(),
                self.0.settings.events_maxlen,
            )
            .await
    }

    /// Record a failed attempt: either schedules a retry per the job's
    /// backoff plan or moves it to `failed` and cancels dependents.
    pub async fn fail_job(
        &self,
        job_id: &str,
        token: &str,
        reason: &str,
        trace: &str,
    ) -> Result<FailOutcome, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .fail_script
            .run(
                &self.0.keys,
                &mut conn,
                job_id,
                token,
                reason,
                trace,
                self.0.settings.clock.now_ms(),
                self.0.settings.events_maxlen,
            )
            .await
    }

    /// Move ready delayed jobs to waiting. Returns how many moved.
    pub async fn promote_delayed(&self) -> Result<usize, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .promote_script
            .run(
                &self.0.keys,
                &mut conn,
                self.0.settings.clock.now_ms(),
                self.0.settings.promote_batch,
                self.0.settings.events_maxlen,
            )
            .await
    }

    /// Return active jobs whose lock expired to waiting, or fail the ones
    /// out of stall budget. Returns `(reclaimed, failed)`.
    pub async fn reclaim_stalled(&self) -> Result<(usize, usize), Error> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .reclaim_script
            .run(
                &self.0.keys,
                &mut conn,
                self.0.settings.clock.now_ms(),
                self.0.settings.max_stalled_retries,
                self.0.settings.events_maxlen,
            )
            .await
    }

    pub async fn update_progress(&self, job_id: &str, progress: u8) -> Result<bool, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .progress_script
            .run(
                &self.0.keys,
                &mut conn,
                job_id,
                progress,
                self.0.settings.clock.now_ms(),
                self.0.settings.events_maxlen,
            )
            .await
    }

    async fn fetch_record(
        &self,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
    ) -> Result<Option<JobRecord>, Error> {
        let fields: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(self.0.keys.job(job_id))
            .query_async(&mut **conn)
            .await?;
        JobRecord::from_hash(fields)
    }

    /// Read a job hash. Absent jobs read as `None`, not an error.
    pub async fn job_record(&self, job_id: &str) -> Result<Option<JobRecord>, Error> {
        let mut conn = self.0.pool.get().await?;
        self.fetch_record(&mut conn, job_id).await
    }

    pub(crate) async fn lock_token(&self, job_id: &str) -> Result<Option<String>, Error> {
        let mut conn = self.0.pool.get().await?;
        let token: Option<String> = redis::cmd("GET")
            .arg(self.0.keys.lock(job_id))
            .query_async(&mut *conn)
            .await?;
        Ok(token)
    }

    /// Range over one status container, inclusive bounds, `-1` meaning the
    /// end. `delayed` ranges by rank over the sorted set; the rest range
    /// over lists.
    pub async fn get_jobs(
        &self,
        state: JobState,
        start: i64,
        end: i64,
    ) -> Result<Vec<JobRecord>, Error> {
        let mut conn = self.0.pool.get().await?;

        let ids: Vec<String> = match state {
            JobState::Waiting => {
                if self.0.keys.waiting.len() == 1 {
                    conn.lrange(&self.0.keys.waiting[0], start as isize, end as isize)
                        .await?
                } else {
                    let mut all = Vec::new();
                    for list in self.0.keys.waiting_desc() {
                        let chunk: Vec<String> = conn.lrange(list, 0, -1).await?;
                        all.extend(chunk);
                    }
                    slice_range(all, start, end)
                }
            }
            JobState::Active => conn.lrange(&self.0.keys.active, start as isize, end as isize).await?,
            JobState::Completed => {
                conn.lrange(&self.0.keys.completed, start as isize, end as isize)
                    .await?
            }
            JobState::Failed => conn.lrange(&self.0.keys.failed, start as isize, end as isize).await?,
            JobState::DependencyWait => {
                conn.lrange(&self.0.keys.dependency_wait, start as isize, end as isize)
                    .await?
            }
            JobState::Delayed => {
                conn.zrange(&self.0.keys.delayed, start as isize, end as isize)
                    .await?
            }
        };

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::Pipeline::with_capacity(ids.len());
        for id in &ids {
            pipe.cmd("HGETALL").arg(self.0.keys.job(id));
        }
        let hashes: Vec<HashMap<String, Vec<u8>>> = pipe.query_async(&mut conn).await?;

        let mut records = Vec::with_capacity(hashes.len());
        for fields in hashes {
            if let Some(record) = JobRecord::from_hash(fields)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Delayed job ids with their process-at times, soonest first.
    pub async fn list_delayed(&self) -> Result<Vec<(String, DateTime<Utc>)>, Error> {
        let list: Vec<String> = self
            .0
            .pool
            .get()
            .await?
            .zrange_withscores(&self.0.keys.delayed, 0, -1)
            .await?;

        list.into_iter()
            .tuples::<(_, _)>()
            .map(|chunk| Ok((chunk.0, Utc.timestamp_millis(chunk.1.parse::<i64>()?))))
            .collect::<Result<Vec<_>, Error>>()
    }

    pub async fn get_job_counts(&self) -> Result<JobCounts, Error> {
        let mut conn = self.0.pool.get().await?;

        let mut pipe = redis::Pipeline::with_capacity(self.0.keys.waiting.len() + 6);
        for list in self.0.keys.waiting.iter() {
            pipe.cmd("LLEN").arg(list);
        }
        pipe.cmd("LLEN").arg(&self.0.keys.active);
        pipe.cmd("ZCARD").arg(&self.0.keys.delayed);
        pipe.cmd("LLEN").arg(&self.0.keys.completed);
        pipe.cmd("LLEN").arg(&self.0.keys.failed);
        pipe.cmd("LLEN").arg(&self.0.keys.dependency_wait);
        pipe.cmd("EXISTS").arg(&self.0.keys.paused);

        let counts: Vec<u64> = pipe.query_async(&mut conn).await?;
        let levels = self.0.keys.waiting.len();
        let waiting = counts[..levels].iter().sum();

        Ok(JobCounts {
            waiting,
            active: counts[levels],
            delayed: counts[levels + 1],
            completed: counts[levels + 2],
            failed: counts[levels + 3],
            dependency_wait: counts[levels + 4],
            paused: counts[levels + 5],
        })
    }

    pub async fn get_metrics(&self) -> Result<QueueMetrics, Error> {
        let mut conn = self.0.pool.get().await?;
        let raw: HashMap<String, u64> = redis::cmd("HGETALL")
            .arg(&self.0.keys.metrics)
            .query_async(&mut conn)
            .await?;

        let read = |name: &str| raw.get(name).copied().unwrap_or(0);
        Ok(QueueMetrics {
            enqueued: read("enqueued"),
            completed: read("completed"),
            failed: read("failed"),
            retried: read("retried"),
            stalled: read("stalled"),
            promoted: read("promoted"),
            rate_limited: read("rate_limited"),
        })
    }

    /// Set the pause marker. Workers stop reserving; enqueue is not
    /// affected. Idempotent.
    pub async fn pause(&self) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        let newly_set: Option<String> = redis::cmd("SET")
            .arg(&self.0.keys.paused)
            .arg(1)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if newly_set.is_some() {
            self.emit_event(EventKind::Paused, None).await?;
            event!(Level::INFO, queue=%self.0.name, "Paused queue");
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(&self.0.keys.paused)
            .query_async(&mut conn)
            .await?;
        if removed > 0 {
            self.emit_event(EventKind::Resumed, None).await?;
            event!(Level::INFO, queue=%self.0.name, "Resumed queue");
        }
        Ok(())
    }

    /// Remove a job from every container and delete its hash. Dependents
    /// waiting only on it are unblocked as if it had completed with a null
    /// result. A no-op for unknown ids.
    pub async fn remove_job(&self, job_id: &str) -> Result<bool, Error> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .remove_script
            .run(
                &self.0.keys,
                &mut conn,
                job_id,
                self.0.settings.clock.now_ms(),
                self.0.settings.events_maxlen,
            )
            .await
    }

    /// Delete every key under the queue prefix. Stop workers first; active
    /// reservations are not drained.
    pub async fn empty(&self) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;

        let key_pattern = format!("{}:*", self.0.keys.root);
        let mut cmd = redis::cmd("SCAN");
        let mut iter: redis::AsyncIter<String> = cmd
            .cursor_arg(0)
            .arg("MATCH")
            .arg(&key_pattern)
            .arg("COUNT")
            .arg(100)
            .clone()
            .iter_async(&mut *conn)
            .await?;

        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        drop(iter);

        if !keys.is_empty() {
            let mut del_cmd = redis::cmd("DEL");
            for key in &keys {
                del_cmd.arg(key);
            }
            del_cmd.query_async::<_, ()>(&mut conn).await?;
        }
        event!(Level::INFO, queue=%self.0.name, keys=%keys.len(), "Emptied queue");
        Ok(())
    }

    /// Events after `after` (exclusive), oldest first.
    pub async fn read_events(
        &self,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<QueueEvent>, Error> {
        let mut conn = self.0.pool.get().await?;
        let reply: redis::Value = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(&self.0.keys.events)
            .arg(after.unwrap_or("0"))
            .query_async(&mut conn)
            .await?;
        events::parse_xread(reply)
    }

    pub(crate) async fn last_event_id(&self) -> Result<Option<String>, Error> {
        let mut conn = self.0.pool.get().await?;
        let reply: redis::Value = redis::cmd("XREVRANGE")
            .arg(&self.0.keys.events)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;
        let parsed = events::parse_xrange(reply)?;
        Ok(parsed.into_iter().next().map(|e| e.stream_id))
    }

    /// Tail the event stream as typed events. With `from_start` the whole
    /// retained history replays first.
    pub fn subscribe_events(&self, shutdown: ShutdownListener, from_start: bool) -> EventStream {
        events::start_event_stream(
            self.clone(),
            shutdown,
            Duration::from_millis(250),
            from_start,
        )
    }

    pub(crate) async fn emit_event(
        &self,
        kind: EventKind,
        job_id: Option<&str>,
    ) -> Result<(), Error> {
        let mut conn = self.0.pool.get().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.0.keys.events);
        if self.0.settings.events_maxlen > 0 {
            cmd.arg("MAXLEN").arg("~").arg(self.0.settings.events_maxlen);
        }
        cmd.arg("*").arg("event").arg(kind.as_str());
        if let Some(id) = job_id {
            cmd.arg("jobId").arg(id);
        }
        cmd.arg("ts").arg(self.0.settings.clock.now_ms());
        cmd.query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    pub(crate) async fn emit_drained(&self) -> Result<(), Error> {
        self.emit_event(EventKind::Drained, None).await
    }

    /// Start the delayed-job promoter loop. Stopped automatically when the
    /// last queue handle drops, or explicitly via
    /// [Queue::stop_delayed_promoter].
    pub fn start_delayed_promoter(&self, mut close: ShutdownListener) {
        if self.0.promoter_task.lock().unwrap().is_some() {
            return;
        }

        event!(Level::INFO, queue=%self.0.name, "Starting delayed job promoter");

        let queue = self.clone();
        let (closer_tx, closer_rx) = oneshot::channel::<()>();
        let interval_period = self.0.settings.promote_interval;
        let task = tokio::spawn(async move {
            let _task_guard = close.task_guard();
            let shutdown_fut = close.wait_for_shutdown();
            tokio::pin!(shutdown_fut);
            tokio::pin!(closer_rx);

            let mut interval = tokio::time::interval(interval_period);

            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_fut => break,
                    _ = &mut closer_rx => break,
                    _ = interval.tick() => {},
                };

                match queue.promote_delayed().await {
                    Ok(count) => {
                        if count > 0 {
                            event!(Level::INFO, queue=%queue.0.name, count=%count, "Promoted delayed jobs");
                        }
                    }
                    Err(e) => {
                        event!(Level::ERROR, queue=%queue.0.name, error=%e, "Error promoting delayed jobs");
                    }
                };
            }
        });

        *self.0.promoter_task.lock().unwrap() = Some((closer_tx, task));
    }

    pub fn stop_delayed_promoter(&self) -> Option<JoinHandle<()>> {
        let (_, task_handle) = self.0.promoter_task.lock().unwrap().take()?;
        Some(task_handle)
    }

    /// Start the stalled-job checker loop.
    pub fn start_stalled_checker(&self, mut close: ShutdownListener) {
        if self.0.stalled_task.lock().unwrap().is_some() {
            return;
        }

        event!(Level::INFO, queue=%self.0.name, "Starting stalled job checker");

        let queue = self.clone();
        let (closer_tx, closer_rx) = oneshot::channel::<()>();
        let interval_period = self.0.settings.stalled_check_interval;
        let task = tokio::spawn(async move {
            let _task_guard = close.task_guard();
            let shutdown_fut = close.wait_for_shutdown();
            tokio::pin!(shutdown_fut);
            tokio::pin!(closer_rx);

            let mut interval = tokio::time::interval(interval_period);

            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_fut => break,
                    _ = &mut closer_rx => break,
                    _ = interval.tick() => {},
                };

                match queue.reclaim_stalled().await {
                    Ok((reclaimed, failed)) => {
                        if reclaimed > 0 || failed > 0 {
                            event!(Level::WARN, queue=%queue.0.name, reclaimed=%reclaimed, failed=%failed, "Reclaimed stalled jobs");
                        }
                    }
                    Err(e) => {
                        event!(Level::ERROR, queue=%queue.0.name, error=%e, "Error reclaiming stalled jobs");
                    }
                };
            }
        });

        *self.0.stalled_task.lock().unwrap() = Some((closer_tx, task));
    }

    pub fn stop_stalled_checker(&self) -> Option<JoinHandle<()>> {
        let (_, task_handle) = self.0.stalled_task.lock().unwrap().take()?;
        Some(task_handle)
    }

    /// Stop the background loops. In-flight promotions and reclaims
    /// complete; Redis state is untouched.
    pub fn close(&self) {
        self.stop_delayed_promoter();
        self.stop_stalled_checker();
    }
}

/// Resolve an inclusive `[start, end]` range with Redis semantics (`-1`
/// meaning the last element) against an in-memory list.
fn slice_range(items: Vec<String>, start: i64, end: i64) -> Vec<String> {
    let len = items.len() as i64;
    if len == 0 {
        return Vec::new();
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if start > end || start >= len {
        return Vec::new();
    }
    items
        .into_iter()
        .skip(start as usize)
        .take((end - start + 1) as usize)
        .collect()
}

#[cfg(test)]
mod range_tests {
    use super::slice_range;

    fn items() -> Vec<String> {
        vec!["a", "b", "c", "d"].into_iter().map(String::from).collect()
    }

    #[test]
    fn full_range() {
        assert_eq!(slice_range(items(), 0, -1), items());
    }

    #[test]
    fn sub_range() {
        assert_eq!(slice_range(items(), 1, 2), vec!["b", "c"]);
    }

    #[test]
    fn negative_start() {
        assert_eq!(slice_range(items(), -2, -1), vec!["c", "d"]);
    }

    #[test]
    fn out_of_bounds() {
        assert_eq!(slice_range(items(), 10, 20), Vec::<String>::new());
        assert_eq!(slice_range(Vec::new(), 0, -1), Vec::<String>::new());
    }
}
