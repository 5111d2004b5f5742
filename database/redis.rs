use std::env;

use crate::error::{Error, Result};

/// Connection pool for a queue system, carrying the key prefix its queues
/// live under. deadpool's pool is already reference-counted, so this is
/// cheap to clone and hand to every queue, worker and lock manager.
#[derive(Clone)]
pub struct RedisPool {
    pool: deadpool_redis::Pool,
    key_prefix: Option<String>,
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

/// Prefixes become key segments, so the separator is reserved.
fn validate_key_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        return Err(Error::ConfigError(
            "key prefix must not be empty".to_string(),
        ));
    }
    if prefix.contains(':') {
        return Err(Error::ConfigError(format!(
            "key prefix {} must not contain ':'",
            prefix
        )));
    }
    Ok(())
}

impl RedisPool {
    pub fn new(url: &str, key_prefix: Option<String>) -> Result<RedisPool> {
        if let Some(prefix) = key_prefix.as_deref() {
            validate_key_prefix(prefix)?;
        }

        let pool = deadpool_redis::Config {
            url: Some(url.to_string()),
            connection: None,
            pool: None,
        }
        .create_pool()?;

        Ok(RedisPool { pool, key_prefix })
    }

    /// Connection string from the `REDIS_URL` environment variable.
    pub fn from_env(key_prefix: Option<String>) -> Result<RedisPool> {
        let url = env::var("REDIS_URL")
            .map_err(|_| Error::ConfigError("REDIS_URL is required".to_string()))?;
        RedisPool::new(url.as_str(), key_prefix)
    }

    pub async fn get(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(Error::from)
    }

    pub fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }

    /// The root every queue system on this pool should build its keys
    /// under: the pool's prefix joined onto the engine's base prefix, so
    /// two deployments sharing one Redis stay disjoint.
    pub fn queue_prefix(&self, base: &str) -> String {
        match self.key_prefix.as_deref() {
            Some(prefix) => format!("{}-{}", prefix, base),
            None => base.to_string(),
        }
    }

    /// Round-trip health check, for readiness probes and dashboards.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn key_prefix_validation() {
        assert_matches!(validate_key_prefix("staging"), Ok(()));
        assert_matches!(validate_key_prefix(""), Err(Error::ConfigError(_)));
        assert_matches!(validate_key_prefix("a:b"), Err(Error::ConfigError(_)));
    }

    #[test]
    fn queue_prefix_joins_pool_and_engine_prefixes() {
        let plain = RedisPool::new("redis://127.0.0.1:6379", None).expect("pool");
        assert_eq!(plain.queue_prefix("cvq"), "cvq");

        let prefixed = RedisPool::new("redis://127.0.0.1:6379", Some("staging".to_string()))
            .expect("pool");
        assert_eq!(prefixed.key_prefix(), Some("staging"));
        assert_eq!(prefixed.queue_prefix("cvq"), "staging-cvq");
    }

    #[test]
    fn rejects_bad_prefixes() {
        let bad = RedisPool::new("redis://127.0.0.1:6379", Some("a:b".to_string()));
        assert_matches!(bad, Err(Error::ConfigError(_)));
    }
}
