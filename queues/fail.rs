use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, keys::QueueKeys};

/// Where a failed attempt left the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Retry budget remains; the job went straight back to waiting.
    RetriedWaiting,
    /// Retry budget remains; the job is parked in delayed per its backoff
    /// plan.
    RetriedDelayed,
    /// The attempt was terminal; the job is in failed and its dependents
    /// were cancelled.
    Failed,
}

// Terminal or retriable failure. Verifies the fencing token, appends the
// trace (bounded to the last 10), bumps `attemptsMade`, then either
// reschedules per the backoff plan in the options snapshot or moves the
// job to failed and cancels its dependents transitively.
// KEYS:
//  1. job data key
//  2. active list
//  3. failed list
//  4. lock key
//  5. events stream
//  6. queue metrics hash
//  7. delayed sorted set
//  8. dependency-wait list
// ARGS:
//  1. job id
//  2. lock token
//  3. failure reason
//  4. trace entry
//  5. current time (ms)
//  6. job data key prefix
//  7. waiting list base name
//  8. events stream cap (0 = uncapped)
const FAIL_SCRIPT: &str = r##"
    local maxlen = tonumber(ARGV[8])
    local function emit(...)
        if maxlen > 0 then
            redis.call("XADD", KEYS[5], "MAXLEN", "~", maxlen, "*", ...)
        else
            redis.call("XADD", KEYS[5], "*", ...)
        end
    end

    local function route_waiting(jkey, id)
        local level = tonumber(redis.call("HGET", jkey, "priority") or "0") or 0
        local wkey = ARGV[7]
        if level > 0 then wkey = wkey .. ":" .. level end
        local jopts = cjson.decode(redis.call("HGET", jkey, "opts") or "{}")
        if jopts["lifo"] then
            redis.call("RPUSH", wkey, id)
        else
            redis.call("LPUSH", wkey, id)
        end
    end

    local held = redis.call("GET", KEYS[4])
    if not held then
        if redis.call("EXISTS", KEYS[1]) == 0 then return "missing" end
        return "lost"
    end
    if held ~= ARGV[2] then return "lost" end

    redis.call("LREM", KEYS[2], 1, ARGV[1])
    redis.call("DEL", KEYS[4])

    local attempts = redis.call("HINCRBY", KEYS[1], "attemptsMade", 1)

    local trace = cjson.decode(redis.call("HGET", KEYS[1], "stacktrace") or "[]")
    trace[#trace + 1] = ARGV[4]
    while #trace > 10 do table.remove(trace, 1) end
    redis.call("HSET", KEYS[1], "stacktrace", cjson.encode(trace))

    local opts = cjson.decode(redis.call("HGET", KEYS[1], "opts") or "{}")
    local max_attempts = tonumber(opts["attempts"]) or 1

    if attempts < max_attempts then
        redis.call("HINCRBY", KEYS[6], "retried", 1)
        local delay = 0
        local plan = opts["backoff"]
        if type(plan) == "table" then
            if plan[1] ~= nil then
                local idx = attempts
                if idx > #plan then idx = #plan end
                delay = tonumber(plan[idx]) or 0
            else
                local base = tonumber(plan["delay"]) or 0
                if plan["type"] == "exponential" then
                    delay = base * 2 ^ (attempts - 1)
                else
                    delay = base
                end
            end
        end
        if delay > 0 then
            redis.call("ZADD", KEYS[7], tonumber(ARGV[5]) + delay, ARGV[1])
            emit("event", "delayed", "jobId", ARGV[1], "ts", ARGV[5], "prev", "active")
            return "retried_delayed"
        end
        route_waiting(KEYS[1], ARGV[1])
        emit("event", "waiting", "jobId", ARGV[1], "ts", ARGV[5], "prev", "active")
        return "retried_waiting"
    end

    redis.call("HSET", KEYS[1], "finishedOn", ARGV[5], "failedReason", ARGV[3])
    emit("event", "failed", "jobId", ARGV[1], "ts", ARGV[5], "prev", "active", "failedReason", ARGV[3])
    redis.call("HINCRBY", KEYS[6], "failed", 1)

    local work = { ARGV[1] }
    while #work > 0 do
        local cur = table.remove(work)
        local depset = ARGV[6] .. cur .. ":dependents"
        for _, d in ipairs(redis.call("SMEMBERS", depset)) do
            if redis.call("LREM", KEYS[8], 1, d) == 1 then
                local dkey = ARGV[6] .. d
                redis.call("HSET", dkey, "finishedOn", ARGV[5], "failedReason", "dependency_failed")
                redis.call("LPUSH", KEYS[3], d)
                emit("event", "failed", "jobId", d, "ts", ARGV[5], "failedReason", "dependency_failed")
                redis.call("HINCRBY", KEYS[6], "failed", 1)
                work[#work + 1] = d
            end
        end
        redis.call("DEL", depset)
    end

    local policy = opts["removeOnFail"]
    if opts["keepJobs"] then policy = false end
    if policy == true then
        redis.call("DEL", KEYS[1])
    else
        redis.call("LPUSH", KEYS[3], ARGV[1])
        if type(policy) == "number" then
            while redis.call("LLEN", KEYS[3]) > policy do
                local evicted = redis.call("RPOP", KEYS[3])
                if not evicted then break end
                redis.call("DEL", ARGV[6] .. evicted)
            end
        end
    end
    return "failed"
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(FAIL_SCRIPT);
}

pub(crate) struct FailScript(&'static redis::Script);

impl FailScript {
    pub fn new() -> Self {
        FailScript(&SCRIPT)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        job_id: &str,
        token: &str,
        reason: &str,
        trace: &str,
        now: i64,
        events_maxlen: usize,
    ) -> Result<FailOutcome, Error> {
        let tag: String = self
            .0
            .key(keys.job(job_id))
            .key(&keys.active)
            .key(&keys.failed)
            .key(keys.lock(job_id))
            .key(&keys.events)
            .key(&keys.metrics)
            .key(&keys.delayed)
            .key(&keys.dependency_wait)
            .arg(job_id)
            .arg(token)
            .arg(reason)
            .arg(trace)
            .arg(now)
            .arg(&keys.job_prefix)
            .arg(keys.waiting_base())
            .arg(events_maxlen)
            .invoke_async(&mut **conn)
            .await?;

        match tag.as_str() {
            "retried_waiting" => Ok(FailOutcome::RetriedWaiting),
            "retried_delayed" => Ok(FailOutcome::RetriedDelayed),
            "failed" => Ok(FailOutcome::Failed),
            "missing" => Err(Error::NotFound {
                job_id: job_id.to_string(),
            }),
            _ => Err(Error::LockLost {
                job_id: job_id.to_string(),
            }),
        }
    }
}
