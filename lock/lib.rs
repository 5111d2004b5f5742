mod error;
mod scripts;

pub use error::Error;

use std::{future::Future, time::Duration};

use conveyor_database::RedisPool;
use lazy_static::lazy_static;
use tokio::sync::oneshot;
use tracing::{event, Level};

lazy_static! {
    static ref ACQUIRE: redis::Script = redis::Script::new(scripts::ACQUIRE_SCRIPT);
    static ref EXTEND: redis::Script = redis::Script::new(scripts::EXTEND_SCRIPT);
    static ref RELEASE: redis::Script = redis::Script::new(scripts::RELEASE_SCRIPT);
}

/// Options for [LockManager::with_lock].
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// TTL of the lock key. The holder refreshes it at `duration / 3`
    /// intervals while the critical section runs.
    pub duration: Duration,
    /// How many times to retry acquisition before giving up.
    pub retries: u32,
    /// Sleep between acquisition attempts.
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            duration: Duration::from_secs(30),
            retries: 10,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Per-resource mutual exclusion on top of Redis `SET NX PX`, with a random
/// fencing token proving ownership on extend and release.
///
/// This holds on a single Redis instance. Under replicated failover the
/// usual asynchronous-replication caveats apply; callers that cannot
/// tolerate a rare double-acquire should not use a Redis lock.
#[derive(Clone)]
pub struct LockManager {
    pool: RedisPool,
    prefix: String,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl LockManager {
    pub fn new(pool: RedisPool, namespace: &str) -> LockManager {
        let prefix = pool.queue_prefix(namespace);
        LockManager { pool, prefix }
    }

    fn lock_key(&self, resource: &str) -> String {
        format!("{}:lock:{}", self.prefix, resource)
    }

    /// Try to acquire the lock once. Returns `None` when someone else
    /// holds it.
    pub async fn try_acquire(
        &self,
        resource: &str,
        duration: Duration,
    ) -> Result<Option<LockGuard>, Error> {
        let key = self.lock_key(resource);
        let token = uuid::Uuid::new_v4().to_string();

        let mut conn = self.pool.get().await?;
        let acquired: i64 = ACQUIRE
            .key(&key)
            .arg(&token)
            .arg(duration.as_millis() as u64)
            .invoke_async(&mut *conn)
            .await?;

        if acquired == 1 {
            Ok(Some(LockGuard {
                pool: self.pool.clone(),
                resource: resource.to_string(),
                key,
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Acquire the lock, retrying up to `opts.retries` times spaced
    /// `opts.retry_delay` apart.
    pub async fn acquire(&self, resource: &str, opts: &LockOptions) -> Result<LockGuard, Error> {
        let mut attempts = 0;
        loop {
            if let Some(guard) = self.try_acquire(resource, opts.duration).await? {
                return Ok(guard);
            }

            if attempts >= opts.retries {
                return Err(Error::LockUnavailable {
                    resource: resource.to_string(),
                });
            }

            attempts += 1;
            tokio::time::sleep(opts.retry_delay).await;
        }
    }

    /// Run `f` while holding the lock on `resource`.
    ///
    /// The TTL is refreshed at `duration / 3` intervals. If a refresh ever
    /// finds the token gone the future is dropped and `Error::LockLost` is
    /// returned; the caller must not publish any partial result.
    pub async fn with_lock<F, Fut, R, E>(
        &self,
        resource: &str,
        opts: &LockOptions,
        f: F,
    ) -> Result<R, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: 'static + std::error::Error + Send + Sync,
    {
        let guard = self.acquire(resource, opts).await?;

        let (lost_tx, mut lost_rx) = oneshot::channel::<()>();
        let extender = {
            let guard = guard.handle();
            let interval = opts.duration / 3;
            let duration = opts.duration;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match guard.extend(duration).await {
                        Ok(true) => {}
                        Ok(false) => {
                            event!(Level::WARN, resource=%guard.resource, "Lost lock while held");
                            lost_tx.send(()).ok();
                            break;
                        }
                        Err(e) => {
                            // Transient failure to talk to Redis. The key may
                            // still be alive, so keep trying until the TTL
                            // actually runs out.
                            event!(Level::ERROR, resource=%guard.resource, error=%e, "Error extending lock");
                        }
                    }
                }
            })
        };

        let result = tokio::select! {
            r = f() => match r {
                Ok(val) => Ok(val),
                Err(e) => Err(Error::TaskError(anyhow::anyhow!(e))),
            },
            _ = &mut lost_rx => Err(Error::LockLost {
                resource: resource.to_string(),
            }),
        };

        extender.abort();

        // Release only applies when we still own the key, so a lost lock
        // is a no-op here.
        if let Err(e) = guard.release().await {
            event!(Level::WARN, resource=%resource, error=%e, "Error releasing lock");
        }

        result
    }
}

/// A held lock. Dropping the guard without releasing is safe; the key
/// expires after its TTL.
#[derive(Debug)]
pub struct LockGuard {
    pool: RedisPool,
    resource: String,
    key: String,
    token: String,
}

/// Shared view of a guard used by the background extender.
struct GuardHandle {
    pool: RedisPool,
    resource: String,
    key: String,
    token: String,
}

impl LockGuard {
    fn handle(&self) -> GuardHandle {
        GuardHandle {
            pool: self.pool.clone(),
            resource: self.resource.clone(),
            key: self.key.clone(),
            token: self.token.clone(),
        }
    }

    pub fn token(&self) -> &str {
        self.token.as_str()
    }

    /// Refresh the TTL. Returns false when the lock is no longer ours.
    pub async fn extend(&self, duration: Duration) -> Result<bool, Error> {
        extend_inner(&self.pool, &self.key, &self.token, duration).await
    }

    /// Compare-and-delete release. Returns false when the lock had already
    /// expired or been taken over.
    pub async fn release(self) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        let released: i64 = RELEASE
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(released == 1)
    }

    /// Check whether the stored token is still ours.
    pub async fn is_held(&self) -> Result<bool, Error> {
        let mut conn = self.pool.get().await?;
        let current: Option<String> = redis::cmd("GET")
            .arg(&self.key)
            .query_async(&mut *conn)
            .await?;
        Ok(current.as_deref() == Some(self.token.as_str()))
    }
}

impl GuardHandle {
    async fn extend(&self, duration: Duration) -> Result<bool, Error> {
        extend_inner(&self.pool, &self.key, &self.token, duration).await
    }
}

async fn extend_inner(
    pool: &RedisPool,
    key: &str,
    token: &str,
    duration: Duration,
) -> Result<bool, Error> {
    let mut conn = pool.get().await?;
    let extended: i64 = EXTEND
        .key(key)
        .arg(token)
        .arg(duration.as_millis() as u64)
        .invoke_async(&mut *conn)
        .await?;
    Ok(extended == 1)
}

#[cfg(all(test, feature = "test_redis"))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn test_manager() -> LockManager {
        dotenv::dotenv().ok();
        let prefix = format!("lock-test-{}", uuid::Uuid::new_v4());
        let pool = RedisPool::from_env(Some(prefix)).expect("Creating connection pool");
        LockManager::new(pool, "cvq")
    }

    #[tokio::test]
    async fn mutual_exclusion() {
        let manager = test_manager();
        let opts = LockOptions {
            retries: 1,
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        };

        let guard = manager
            .acquire("a-resource", &opts)
            .await
            .expect("first acquire");

        let second = manager
            .acquire("a-resource", &opts)
            .await;
        assert_matches!(second, Err(Error::LockUnavailable { .. }));

        assert!(guard.is_held().await.expect("is_held"));
        assert!(guard.release().await.expect("release"));

        let third = manager
            .acquire("a-resource", &opts)
            .await
            .expect("acquire after release");
        third.release().await.expect("release");
    }

    #[tokio::test]
    async fn with_lock_runs_task() {
        let manager = test_manager();

        let result = manager
            .with_lock("with-lock", &LockOptions::default(), || async {
                Ok::<i32, std::io::Error>(42)
            })
            .await
            .expect("with_lock");
        assert_eq!(result, 42);

        // The lock must be free again afterwards.
        let guard = manager
            .try_acquire("with-lock", Duration::from_secs(5))
            .await
            .expect("try_acquire")
            .expect("lock should be free");
        guard.release().await.expect("release");
    }

    #[tokio::test]
    async fn task_error_still_releases() {
        let manager = test_manager();

        let result = manager
            .with_lock("err-lock", &LockOptions::default(), || async {
                Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            })
            .await;
        assert_matches!(result, Err(Error::TaskError(_)));

        let guard = manager
            .try_acquire("err-lock", Duration::from_secs(5))
            .await
            .expect("try_acquire")
            .expect("lock should be free after task error");
        guard.release().await.expect("release");
    }
}
