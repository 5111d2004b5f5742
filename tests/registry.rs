#![cfg(feature = "test_redis")]

use conveyor::{Job, QueueRegistry, QueueSettings, RedisPool, Shutdown};

#[tokio::test]
async fn registry_reuses_handles() {
    dotenv::dotenv().ok();
    let pool = RedisPool::from_env(None).expect("Creating connection pool");
    let shutdown = Shutdown::new();
    let registry = QueueRegistry::new(
        pool,
        QueueSettings::default(),
        shutdown.listener(),
        false,
    );

    let name = format!("reg-{}", uuid::Uuid::new_v4());
    let queue = registry.get(&name).expect("Creating queue");
    let same = registry.get(&name).expect("Fetching queue");
    assert_eq!(queue.name(), same.name());
    assert_eq!(registry.names(), vec![name.clone()]);

    queue
        .add(&Job::from_json_payload(None, &serde_json::json!({"x": 1})).expect("building job"))
        .await
        .expect("enqueueing");
    let counts = same.get_job_counts().await.expect("counts");
    assert_eq!(counts.waiting, 1, "handles share queue state");

    queue.empty().await.expect("cleanup");
    registry.close_all();
    assert!(registry.names().is_empty());
    shutdown.trigger();
}

#[tokio::test]
async fn registry_rejects_bad_names() {
    dotenv::dotenv().ok();
    let pool = RedisPool::from_env(None).expect("Creating connection pool");
    let shutdown = Shutdown::new();
    let registry = QueueRegistry::new(
        pool,
        QueueSettings::default(),
        shutdown.listener(),
        false,
    );

    assert!(registry.get("bad:name").is_err());
    assert!(registry.get("").is_err());
    shutdown.trigger();
}
