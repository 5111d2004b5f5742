#![cfg(feature = "test_redis")]

//! End-to-end scenarios driving the real worker loop against Redis.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conveyor::{
    queues::{EnqueueOutcome, MemorySink, QueueEvent, ReserveOutcome},
    ActiveJob, BackoffPlan, EventKind, FailedJobSink, Job, JobCounts, JobHandler, JobOpts, Queue,
    QueueSettings, RateLimit, RedisPool, Shutdown, Worker, WorkerOptions,
};
use futures::FutureExt;

#[derive(Clone)]
struct OkHandler;

#[async_trait]
impl JobHandler for OkHandler {
    type Payload = serde_json::Value;
    type Error = std::io::Error;

    async fn handle(
        &self,
        _job: &ActiveJob<Self::Payload>,
    ) -> Result<serde_json::Value, Self::Error> {
        Ok(serde_json::json!({"ok": true}))
    }
}

#[derive(Clone)]
struct BoomHandler;

#[async_trait]
impl JobHandler for BoomHandler {
    type Payload = serde_json::Value;
    type Error = std::io::Error;

    async fn handle(
        &self,
        _job: &ActiveJob<Self::Payload>,
    ) -> Result<serde_json::Value, Self::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    }
}

#[derive(Clone)]
struct SlowHandler(Duration);

#[async_trait]
impl JobHandler for SlowHandler {
    type Payload = serde_json::Value;
    type Error = std::io::Error;

    async fn handle(
        &self,
        _job: &ActiveJob<Self::Payload>,
    ) -> Result<serde_json::Value, Self::Error> {
        tokio::time::sleep(self.0).await;
        Ok(serde_json::Value::Null)
    }
}

fn fast_worker_options() -> WorkerOptions {
    WorkerOptions {
        concurrency: 1,
        drain_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn with_queue<T, Fut>(settings: QueueSettings, test: T)
where
    T: Send + Sync + FnOnce(Queue) -> Fut,
    Fut: std::future::Future<Output = Result<(), conveyor::Error>>,
{
    dotenv::dotenv().ok();
    let queue_name = format!("e2e-{}", uuid::Uuid::new_v4());
    let pool = RedisPool::from_env(None).expect("Creating connection pool");
    let queue = Queue::new(pool, queue_name, settings).expect("Creating queue");

    let result = std::panic::AssertUnwindSafe(test(queue.clone()))
        .catch_unwind()
        .await;

    queue.close();
    queue.empty().await.expect("Cleanup: emptying queue");

    result.expect("Panicked").expect("Error");
}

async fn wait_for_counts<F>(queue: &Queue, timeout: Duration, pred: F) -> JobCounts
where
    F: Fn(&JobCounts) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let counts = queue.get_job_counts().await.expect("Reading job counts");
        if pred(&counts) {
            return counts;
        }
        if Instant::now() > deadline {
            panic!("Timed out waiting for queue state, last counts {:?}", counts);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn kinds_for(events: &[QueueEvent], job_id: &str) -> Vec<EventKind> {
    events
        .iter()
        .filter(|e| e.job_id.as_deref() == Some(job_id))
        .map(|e| e.kind)
        .collect()
}

#[tokio::test]
async fn process_single_job() {
    with_queue(QueueSettings::default(), |queue| async move {
        let added = queue
            .add(&Job::from_json_payload(None, &serde_json::json!({"x": 1}))?)
            .await?;

        let shutdown = Shutdown::new();
        let worker = Worker::start(
            queue.clone(),
            OkHandler,
            fast_worker_options(),
            shutdown.listener(),
            None,
        );

        let counts = wait_for_counts(&queue, Duration::from_secs(5), |c| c.completed == 1).await;
        worker.stop(true).await;
        shutdown.trigger();

        assert_eq!(
            counts,
            JobCounts {
                completed: 1,
                ..Default::default()
            }
        );

        let record = queue.job_record(&added.id).await?.expect("job hash");
        assert_eq!(record.returnvalue, Some(serde_json::json!({"ok": true})));
        assert!(record.finished_on.is_some());

        let events = queue.read_events(None, 100).await?;
        assert_eq!(
            kinds_for(&events, &added.id),
            vec![EventKind::Added, EventKind::Active, EventKind::Completed]
        );

        Ok(())
    })
    .await;
}

#[tokio::test]
async fn delayed_job_runs_after_its_delay() {
    let settings = QueueSettings {
        promote_interval: Duration::from_millis(100),
        ..Default::default()
    };
    with_queue(settings, |queue| async move {
        let added = queue
            .add(
                &Job::from_json_payload(None, &serde_json::json!({"x": 2}))?.with_opts(JobOpts {
                    delay: Duration::from_millis(500),
                    ..Default::default()
                }),
            )
            .await?;
        assert_eq!(added.outcome, EnqueueOutcome::Delayed);

        let shutdown = Shutdown::new();
        queue.start_delayed_promoter(shutdown.listener());
        let worker = Worker::start(
            queue.clone(),
            OkHandler,
            fast_worker_options(),
            shutdown.listener(),
            None,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let counts = queue.get_job_counts().await?;
        assert_eq!(counts.delayed, 1, "still parked before its delay");
        assert_eq!(counts.completed, 0);

        wait_for_counts(&queue, Duration::from_secs(5), |c| c.completed == 1).await;

        worker.stop(true).await;
        // The promoter holds a task guard, so this returns only after its
        // loop has wound down.
        shutdown.trigger_and_wait().await;
        assert_eq!(shutdown.active_tasks(), 0);
        Ok(())
    })
    .await;
}

#[tokio::test]
async fn failing_handler_exhausts_attempts() {
    let settings = QueueSettings {
        promote_interval: Duration::from_millis(50),
        ..Default::default()
    };
    with_queue(settings, |queue| async move {
        let sink = Arc::new(MemorySink::new());
        let added = queue
            .add(
                &Job::from_json_payload(None, &serde_json::json!({}))?.with_opts(JobOpts {
                    attempts: 3,
                    backoff: Some(BackoffPlan::fixed(Duration::from_millis(100))),
                    ..Default::default()
                }),
            )
            .await?;

        let shutdown = Shutdown::new();
        queue.start_delayed_promoter(shutdown.listener());
        let worker = Worker::start(
            queue.clone(),
            BoomHandler,
            fast_worker_options(),
            shutdown.listener(),
            Some(sink.clone()),
        );

        let counts = wait_for_counts(&queue, Duration::from_secs(10), |c| c.failed == 1).await;
        worker.stop(true).await;
        shutdown.trigger_and_wait().await;

        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.delayed, 0);

        let record = queue.job_record(&added.id).await?.expect("job hash");
        assert_eq!(record.attempts_made, 3);
        assert_eq!(record.failed_reason.as_deref(), Some("boom"));
        assert_eq!(record.stacktrace.len(), 3);

        let archived = sink.all().await.expect("sink entries");
        assert_eq!(archived.len(), 1, "terminal failure archived once");
        assert_eq!(archived[0].job_id, added.id);
        assert_eq!(archived[0].error, "boom");

        Ok(())
    })
    .await;
}

#[tokio::test]
async fn handler_timeout_fails_the_attempt() {
    with_queue(QueueSettings::default(), |queue| async move {
        let added = queue
            .add(
                &Job::from_json_payload(None, &serde_json::json!({}))?.with_opts(JobOpts {
                    attempts: 1,
                    timeout: Some(Duration::from_millis(100)),
                    ..Default::default()
                }),
            )
            .await?;

        let shutdown = Shutdown::new();
        let worker = Worker::start(
            queue.clone(),
            SlowHandler(Duration::from_secs(2)),
            fast_worker_options(),
            shutdown.listener(),
            None,
        );

        wait_for_counts(&queue, Duration::from_secs(5), |c| c.failed == 1).await;
        worker.stop(true).await;
        shutdown.trigger();

        let record = queue.job_record(&added.id).await?.expect("job hash");
        assert_eq!(record.failed_reason.as_deref(), Some("timeout"));
        assert_eq!(record.attempts_made, 1);

        Ok(())
    })
    .await;
}

#[tokio::test]
async fn stalled_job_is_recovered_by_a_fresh_worker() {
    let settings = QueueSettings {
        stalled_check_interval: Duration::from_millis(200),
        max_stalled_retries: 3,
        ..Default::default()
    };
    with_queue(settings, |queue| async move {
        let added = queue
            .add(&Job::from_json_payload(None, &serde_json::json!({"x": 5}))?)
            .await?;

        // A worker that reserves and then dies: take the lock with a short
        // TTL and never heartbeat.
        let token = uuid::Uuid::new_v4().to_string();
        match queue.reserve(&token, Duration::from_millis(300)).await? {
            ReserveOutcome::Reserved(record) => assert_eq!(record.id, added.id),
            other => panic!("Expected a reservation, got {:?}", other),
        }

        let shutdown = Shutdown::new();
        queue.start_stalled_checker(shutdown.listener());
        let worker = Worker::start(
            queue.clone(),
            OkHandler,
            fast_worker_options(),
            shutdown.listener(),
            None,
        );

        let counts = wait_for_counts(&queue, Duration::from_secs(5), |c| c.completed == 1).await;
        worker.stop(true).await;
        shutdown.trigger_and_wait().await;

        assert_eq!(counts.active, 0);
        let record = queue.job_record(&added.id).await?.expect("job hash");
        assert_eq!(record.stalled_count, 1);
        assert!(record.finished_on.is_some());

        Ok(())
    })
    .await;
}

#[tokio::test]
async fn rate_limited_jobs_defer_and_complete() {
    let settings = QueueSettings {
        rate_limit: Some(RateLimit::new(2, Duration::from_millis(1000))),
        promote_interval: Duration::from_millis(100),
        ..Default::default()
    };
    with_queue(settings, |queue| async move {
        for i in 0..5 {
            queue
                .add(&Job::from_json_payload(None, &serde_json::json!({ "i": i }))?)
                .await?;
        }

        let counts = queue.get_job_counts().await?;
        assert_eq!(counts.waiting, 2, "window admits two immediately");
        assert_eq!(counts.delayed, 3, "the rest are deferred");

        let shutdown = Shutdown::new();
        queue.start_delayed_promoter(shutdown.listener());
        let worker = Worker::start(
            queue.clone(),
            OkHandler,
            WorkerOptions {
                concurrency: 2,
                drain_delay: Duration::from_millis(50),
                ..Default::default()
            },
            shutdown.listener(),
            None,
        );

        wait_for_counts(&queue, Duration::from_secs(10), |c| c.completed == 5).await;
        worker.stop(true).await;
        shutdown.trigger_and_wait().await;

        Ok(())
    })
    .await;
}

#[tokio::test]
async fn paused_queue_holds_jobs_until_resume() {
    with_queue(QueueSettings::default(), |queue| async move {
        queue.pause().await?;
        queue
            .add(&Job::from_json_payload(None, &serde_json::json!({}))?)
            .await?;

        let shutdown = Shutdown::new();
        let worker = Worker::start(
            queue.clone(),
            OkHandler,
            fast_worker_options(),
            shutdown.listener(),
            None,
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        let counts = queue.get_job_counts().await?;
        assert_eq!(counts.completed, 0, "paused queue reserves nothing");
        assert_eq!(counts.waiting, 1);

        queue.resume().await?;
        wait_for_counts(&queue, Duration::from_secs(5), |c| c.completed == 1).await;

        worker.stop(true).await;
        shutdown.trigger();
        Ok(())
    })
    .await;
}

#[tokio::test]
async fn concurrency_processes_all_jobs() {
    with_queue(QueueSettings::default(), |queue| async move {
        for i in 0..10 {
            queue
                .add(&Job::from_json_payload(None, &serde_json::json!({ "i": i }))?)
                .await?;
        }

        let shutdown = Shutdown::new();
        let worker = Worker::start(
            queue.clone(),
            SlowHandler(Duration::from_millis(100)),
            WorkerOptions {
                concurrency: 4,
                drain_delay: Duration::from_millis(50),
                ..Default::default()
            },
            shutdown.listener(),
            None,
        );

        wait_for_counts(&queue, Duration::from_secs(10), |c| c.completed == 10).await;
        worker.stop(true).await;
        shutdown.trigger();
        Ok(())
    })
    .await;
}

#[tokio::test]
async fn max_jobs_limit_stops_the_worker() {
    with_queue(QueueSettings::default(), |queue| async move {
        for i in 0..4 {
            queue
                .add(&Job::from_json_payload(None, &serde_json::json!({ "i": i }))?)
                .await?;
        }

        let shutdown = Shutdown::new();
        let worker = Worker::start(
            queue.clone(),
            OkHandler,
            WorkerOptions {
                concurrency: 1,
                drain_delay: Duration::from_millis(50),
                limits: conveyor::WorkerLimits {
                    max_jobs: Some(2),
                    ..Default::default()
                },
                ..Default::default()
            },
            shutdown.listener(),
            None,
        );

        wait_for_counts(&queue, Duration::from_secs(5), |c| c.completed == 2).await;
        // The worker stops itself; stopping again is harmless.
        worker.stop(true).await;
        shutdown.trigger();

        let counts = queue.get_job_counts().await?;
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.waiting, 2, "remaining jobs stay queued");

        Ok(())
    })
    .await;
}
