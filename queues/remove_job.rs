use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, keys::QueueKeys};

// Remove a job from every container, detach it from the dependency graph,
// and delete its hash. Dependents that were only waiting on this job are
// unblocked as if it had completed with a null result. Silently a no-op
// when the job does not exist.
// KEYS:
//  1. job data key
//  2. active list
//  3. delayed sorted set
//  4. completed list
//  5. failed list
//  6. dependency-wait list
//  7. events stream
//  8..7+N waiting lists
// ARGS:
//  1. job id
//  2. current time (ms)
//  3. job data key prefix
//  4. lock key prefix
//  5. waiting list base name
//  6. events stream cap (0 = uncapped)
//  7. waiting list count
const REMOVE_SCRIPT: &str = r##"
    local maxlen = tonumber(ARGV[6])
    local function emit(...)
        if maxlen > 0 then
            redis.call("XADD", KEYS[7], "MAXLEN", "~", maxlen, "*", ...)
        else
            redis.call("XADD", KEYS[7], "*", ...)
        end
    end

    local function route_waiting(jkey, id)
        local level = tonumber(redis.call("HGET", jkey, "priority") or "0") or 0
        local wkey = ARGV[5]
        if level > 0 then wkey = wkey .. ":" .. level end
        local jopts = cjson.decode(redis.call("HGET", jkey, "opts") or "{}")
        if jopts["lifo"] then
            redis.call("RPUSH", wkey, id)
        else
            redis.call("LPUSH", wkey, id)
        end
    end

    local existed = redis.call("EXISTS", KEYS[1]) == 1

    local nlists = tonumber(ARGV[7])
    for i = 1, nlists do
        redis.call("LREM", KEYS[7 + i], 1, ARGV[1])
    end
    redis.call("LREM", KEYS[2], 1, ARGV[1])
    redis.call("ZREM", KEYS[3], ARGV[1])
    redis.call("LREM", KEYS[4], 1, ARGV[1])
    redis.call("LREM", KEYS[5], 1, ARGV[1])
    redis.call("LREM", KEYS[6], 1, ARGV[1])
    redis.call("DEL", ARGV[4] .. ARGV[1])

    if existed then
        local parents = cjson.decode(redis.call("HGET", KEYS[1], "dependencies") or "[]")
        for _, p in ipairs(parents) do
            redis.call("SREM", ARGV[3] .. p .. ":dependents", ARGV[1])
        end
    end

    local depset = KEYS[1] .. ":dependents"
    for _, d in ipairs(redis.call("SMEMBERS", depset)) do
        local dkey = ARGV[3] .. d
        local parents = cjson.decode(redis.call("HGET", dkey, "dependencies") or "[]")
        local ready = true
        for _, p in ipairs(parents) do
            if p ~= ARGV[1] then
                local pkey = ARGV[3] .. p
                if redis.call("EXISTS", pkey) == 1 and not redis.call("HGET", pkey, "finishedOn") then
                    ready = false
                end
            end
        end
        if ready and redis.call("LREM", KEYS[6], 1, d) == 1 then
            route_waiting(dkey, d)
            emit("event", "waiting", "jobId", d, "ts", ARGV[2], "prev", "waiting-children")
        end
    end
    redis.call("DEL", depset)
    redis.call("DEL", KEYS[1])

    if existed then
        emit("event", "removed", "jobId", ARGV[1], "ts", ARGV[2])
        return 1
    end
    return 0
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(REMOVE_SCRIPT);
}

pub(crate) struct RemoveJobScript(&'static redis::Script);

impl RemoveJobScript {
    pub fn new() -> Self {
        RemoveJobScript(&SCRIPT)
    }

    /// Returns whether a job hash was actually removed.
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        job_id: &str,
        now: i64,
        events_maxlen: usize,
    ) -> Result<bool, Error> {
        let mut invocation = self.0.prepare_invoke();
        invocation
            .key(keys.job(job_id))
            .key(&keys.active)
            .key(&keys.delayed)
            .key(&keys.completed)
            .key(&keys.failed)
            .key(&keys.dependency_wait)
            .key(&keys.events);
        for list in keys.waiting.iter() {
            invocation.key(list);
        }

        let removed: i64 = invocation
            .arg(job_id)
            .arg(now)
            .arg(&keys.job_prefix)
            .arg(&keys.lock_prefix)
            .arg(keys.waiting_base())
            .arg(events_maxlen)
            .arg(keys.waiting.len())
            .invoke_async(&mut **conn)
            .await?;
        Ok(removed == 1)
    }
}
