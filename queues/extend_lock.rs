use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, keys::QueueKeys};

// Refresh a job lock's TTL if the stored token is still ours.
// KEYS:
//  1. lock key
// ARGS:
//  1. lock token
//  2. new TTL (ms)
const EXTEND_LOCK_SCRIPT: &str = r##"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("PEXPIRE", KEYS[1], tonumber(ARGV[2]))
        return 1
    end
    return 0
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(EXTEND_LOCK_SCRIPT);
}

pub(crate) struct ExtendLockScript(&'static redis::Script);

impl ExtendLockScript {
    pub fn new() -> Self {
        ExtendLockScript(&SCRIPT)
    }

    /// Returns false when the lock is no longer held by `token`.
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        job_id: &str,
        token: &str,
        lock_ttl_ms: u64,
    ) -> Result<bool, Error> {
        let extended: i64 = self
            .0
            .key(keys.lock(job_id))
            .arg(token)
            .arg(lock_ttl_ms)
            .invoke_async(&mut **conn)
            .await?;
        Ok(extended == 1)
    }
}
