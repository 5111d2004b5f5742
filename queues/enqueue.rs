use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, job::JobOpts, keys::QueueKeys, EnqueueOutcome};

// Write a job hash and route the id into its first container. Idempotent
// by job id: an existing hash is left untouched.
// KEYS:
//  1. job data key
//  2. waiting list for the job's priority level
//  3. delayed sorted set
//  4. dependency-wait list
//  5. failed list
//  6. events stream
//  7. queue metrics hash
//  8..7+N    parent job data keys
//  8+N..7+2N parent dependents sets
// ARGS:
//  1. job id
//  2. queue name
//  3. payload
//  4. options (JSON)
//  5. current time (ms)
//  6. delay (ms)
//  7. process-at time (ms)
//  8. priority level
//  9. lifo ("1" to push at the tail)
//  10. events stream cap (0 = uncapped)
//  11. parent ids (JSON array)
//  12. parent count
const ENQUEUE_SCRIPT: &str = r##"
    local maxlen = tonumber(ARGV[10])
    local function emit(...)
        if maxlen > 0 then
            redis.call("XADD", KEYS[6], "MAXLEN", "~", maxlen, "*", ...)
        else
            redis.call("XADD", KEYS[6], "*", ...)
        end
    end

    if redis.call("EXISTS", KEYS[1]) == 1 then
        emit("event", "duplicated", "jobId", ARGV[1], "ts", ARGV[5])
        return "duplicated"
    end

    local nparents = tonumber(ARGV[12])
    local unmet = 0
    local parent_failed = false
    for i = 1, nparents do
        local pkey = KEYS[7 + i]
        if redis.call("EXISTS", pkey) == 1 then
            local finished = redis.call("HGET", pkey, "finishedOn")
            if not finished then
                unmet = unmet + 1
                redis.call("SADD", KEYS[7 + nparents + i], ARGV[1])
            elseif redis.call("HGET", pkey, "failedReason") then
                parent_failed = true
            end
        end
    end

    redis.call("HSET", KEYS[1],
        "id", ARGV[1], "name", ARGV[2], "data", ARGV[3], "opts", ARGV[4],
        "timestamp", ARGV[5], "delay", ARGV[6], "priority", ARGV[8],
        "attemptsMade", 0, "stalledCount", 0, "progress", 0,
        "stacktrace", "[]", "dependencies", ARGV[11])

    emit("event", "added", "jobId", ARGV[1], "ts", ARGV[5])
    redis.call("HINCRBY", KEYS[7], "enqueued", 1)

    if parent_failed then
        redis.call("HSET", KEYS[1], "finishedOn", ARGV[5], "failedReason", "dependency_failed")
        redis.call("LPUSH", KEYS[5], ARGV[1])
        emit("event", "failed", "jobId", ARGV[1], "ts", ARGV[5], "failedReason", "dependency_failed")
        redis.call("HINCRBY", KEYS[7], "failed", 1)
        return "dependency_failed"
    end

    if tonumber(ARGV[6]) > 0 then
        redis.call("ZADD", KEYS[3], tonumber(ARGV[7]), ARGV[1])
        emit("event", "delayed", "jobId", ARGV[1], "ts", ARGV[5])
        return "delayed"
    end

    if unmet > 0 then
        redis.call("RPUSH", KEYS[4], ARGV[1])
        emit("event", "waiting-children", "jobId", ARGV[1], "ts", ARGV[5])
        return "waiting-children"
    end

    if ARGV[9] == "1" then
        redis.call("RPUSH", KEYS[2], ARGV[1])
    else
        redis.call("LPUSH", KEYS[2], ARGV[1])
    end
    return "added"
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(ENQUEUE_SCRIPT);
}

pub(crate) struct EnqueueScript(&'static redis::Script);

impl EnqueueScript {
    pub fn new() -> Self {
        EnqueueScript(&SCRIPT)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        queue_name: &str,
        job_id: &str,
        payload: &[u8],
        opts: &JobOpts,
        delay_ms: u64,
        now: i64,
        events_maxlen: usize,
    ) -> Result<EnqueueOutcome, Error> {
        let opts_json = serde_json::to_string(opts)?;
        let deps_json = serde_json::to_string(&opts.depends_on)?;
        let level = opts.priority.min(keys.waiting.len() as u32 - 1) as usize;

        let mut invocation = self.0.prepare_invoke();
        invocation
            .key(keys.job(job_id))
            .key(&keys.waiting[level])
            .key(&keys.delayed)
            .key(&keys.dependency_wait)
            .key(&keys.failed)
            .key(&keys.events)
            .key(&keys.metrics);
        for parent in &opts.depends_on {
            invocation.key(keys.job(parent));
        }
        for parent in &opts.depends_on {
            invocation.key(keys.dependents(parent));
        }

        let tag: String = invocation
            .arg(job_id)
            .arg(queue_name)
            .arg(payload)
            .arg(opts_json)
            .arg(now)
            .arg(delay_ms)
            .arg(now + delay_ms as i64)
            .arg(opts.priority)
            .arg(if opts.lifo { "1" } else { "0" })
            .arg(events_maxlen)
            .arg(deps_json)
            .arg(opts.depends_on.len())
            .invoke_async(&mut **conn)
            .await?;

        EnqueueOutcome::from_tag(tag.as_str(), job_id)
    }
}
