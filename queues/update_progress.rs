use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, keys::QueueKeys};

// Record handler progress on a live job.
// KEYS:
//  1. job data key
//  2. events stream
// ARGS:
//  1. job id
//  2. progress (0-100)
//  3. current time (ms)
//  4. events stream cap (0 = uncapped)
const UPDATE_PROGRESS_SCRIPT: &str = r##"
    if redis.call("EXISTS", KEYS[1]) == 0 then
        return 0
    end
    redis.call("HSET", KEYS[1], "progress", ARGV[2])
    local maxlen = tonumber(ARGV[4])
    if maxlen > 0 then
        redis.call("XADD", KEYS[2], "MAXLEN", "~", maxlen, "*",
            "event", "progress", "jobId", ARGV[1], "ts", ARGV[3], "progress", ARGV[2])
    else
        redis.call("XADD", KEYS[2], "*",
            "event", "progress", "jobId", ARGV[1], "ts", ARGV[3], "progress", ARGV[2])
    end
    return 1
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(UPDATE_PROGRESS_SCRIPT);
}

pub(crate) struct UpdateProgressScript(&'static redis::Script);

impl UpdateProgressScript {
    pub fn new() -> Self {
        UpdateProgressScript(&SCRIPT)
    }

    /// Returns false when the job no longer exists.
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        job_id: &str,
        progress: u8,
        now: i64,
        events_maxlen: usize,
    ) -> Result<bool, Error> {
        let updated: i64 = self
            .0
            .key(keys.job(job_id))
            .key(&keys.events)
            .arg(job_id)
            .arg(progress.min(100))
            .arg(now)
            .arg(events_maxlen)
            .invoke_async(&mut **conn)
            .await?;
        Ok(updated == 1)
    }
}
