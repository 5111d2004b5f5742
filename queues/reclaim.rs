use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, keys::QueueKeys};

// Return active jobs whose lock key has expired to the waiting pool, or
// fail them once their stall budget is spent. This is the only recovery
// path for jobs whose worker died without a terminal transition.
// KEYS:
//  1. active list
//  2. failed list
//  3. events stream
//  4. queue metrics hash
//  5. dependency-wait list
// ARGS:
//  1. current time (ms)
//  2. max stalled re-entries
//  3. job data key prefix
//  4. lock key prefix
//  5. waiting list base name
//  6. events stream cap (0 = uncapped)
const RECLAIM_SCRIPT: &str = r##"
    local maxlen = tonumber(ARGV[6])
    local function emit(...)
        if maxlen > 0 then
            redis.call("XADD", KEYS[3], "MAXLEN", "~", maxlen, "*", ...)
        else
            redis.call("XADD", KEYS[3], "*", ...)
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

    local ids = redis.call("LRANGE", KEYS[1], 0, -1)
    local reclaimed = 0
    local failed = 0
    for _, id in ipairs(ids) do
        if redis.call("EXISTS", ARGV[4] .. id) == 0 then
            redis.call("LREM", KEYS[1], 1, id)
            local jkey = ARGV[3] .. id
            if redis.call("EXISTS", jkey) == 1 then
                local stalls = redis.call("HINCRBY", jkey, "stalledCount", 1)
                if stalls > tonumber(ARGV[2]) then
                    redis.call("HSET", jkey, "finishedOn", ARGV[1], "failedReason", "stalled")
                    redis.call("LPUSH", KEYS[2], id)
                    emit("event", "failed", "jobId", id, "ts", ARGV[1], "prev", "active", "failedReason", "stalled")
                    redis.call("HINCRBY", KEYS[4], "failed", 1)
                    local work = { id }
                    while #work > 0 do
                        local cur = table.remove(work)
                        local depset = ARGV[3] .. cur .. ":dependents"
                        for _, d in ipairs(redis.call("SMEMBERS", depset)) do
                            if redis.call("LREM", KEYS[5], 1, d) == 1 then
                                local dkey = ARGV[3] .. d
                                redis.call("HSET", dkey, "finishedOn", ARGV[1], "failedReason", "dependency_failed")
                                redis.call("LPUSH", KEYS[2], d)
                                emit("event", "failed", "jobId", d, "ts", ARGV[1], "failedReason", "dependency_failed")
                                redis.call("HINCRBY", KEYS[4], "failed", 1)
                                work[#work + 1] = d
                            end
                        end
                        redis.call("DEL", depset)
                    end
                    failed = failed + 1
                else
                    route_waiting(jkey, id)
                    emit("event", "stalled", "jobId", id, "ts", ARGV[1], "prev", "active")
                    redis.call("HINCRBY", KEYS[4], "stalled", 1)
                    reclaimed = reclaimed + 1
                end
            end
        end
    end
    return {reclaimed, failed}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(RECLAIM_SCRIPT);
}

pub(crate) struct ReclaimScript(&'static redis::Script);

impl ReclaimScript {
    pub fn new() -> Self {
        ReclaimScript(&SCRIPT)
    }

    /// Returns `(reclaimed, failed)` counts.
    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        now: i64,
        max_stalled_retries: u32,
        events_maxlen: usize,
    ) -> Result<(usize, usize), Error> {
        let (reclaimed, failed): (usize, usize) = self
            .0
            .key(&keys.active)
            .key(&keys.failed)
            .key(&keys.events)
            .key(&keys.metrics)
            .key(&keys.dependency_wait)
            .arg(now)
            .arg(max_stalled_retries)
            .arg(&keys.job_prefix)
            .arg(&keys.lock_prefix)
            .arg(keys.waiting_base())
            .arg(events_maxlen)
            .invoke_async(&mut **conn)
            .await?;
        Ok((reclaimed, failed))
    }
}
