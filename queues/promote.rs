use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, keys::QueueKeys};

// Move ready delayed jobs into waiting. Dependencies are re-evaluated at
// promotion time: a job whose parents are still running parks in
// dependency-wait, and one whose parent failed terminally is cancelled.
// KEYS:
//  1. delayed sorted set
//  2. dependency-wait list
//  3. failed list
//  4. events stream
//  5. queue metrics hash
// ARGS:
//  1. current time (ms)
//  2. batch size
//  3. job data key prefix
//  4. waiting list base name
//  5. events stream cap (0 = uncapped)
const PROMOTE_SCRIPT: &str = r##"
    local maxlen = tonumber(ARGV[5])
    local function emit(...)
        if maxlen > 0 then
            redis.call("XADD", KEYS[4], "MAXLEN", "~", maxlen, "*", ...)
        else
            redis.call("XADD", KEYS[4], "*", ...)
        end
    end

    local function route_waiting(jkey, id)
        local level = tonumber(redis.call("HGET", jkey, "priority") or "0") or 0
        local wkey = ARGV[4]
        if level > 0 then wkey = wkey .. ":" .. level end
        local jopts = cjson.decode(redis.call("HGET", jkey, "opts") or "{}")
        if jopts["lifo"] then
            redis.call("RPUSH", wkey, id)
        else
            redis.call("LPUSH", wkey, id)
        end
    end

    local ready = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", tonumber(ARGV[1]), "LIMIT", 0, tonumber(ARGV[2]))
    for _, id in ipairs(ready) do
        redis.call("ZREM", KEYS[1], id)
        local jkey = ARGV[3] .. id
        if redis.call("EXISTS", jkey) == 1 then
            local parents = cjson.decode(redis.call("HGET", jkey, "dependencies") or "[]")
            local unmet = 0
            local parent_failed = false
            for _, p in ipairs(parents) do
                local pkey = ARGV[3] .. p
                if redis.call("EXISTS", pkey) == 1 then
                    if not redis.call("HGET", pkey, "finishedOn") then
                        unmet = unmet + 1
                    elseif redis.call("HGET", pkey, "failedReason") then
                        parent_failed = true
                    end
                end
            end
            if parent_failed then
                redis.call("HSET", jkey, "finishedOn", ARGV[1], "failedReason", "dependency_failed")
                redis.call("LPUSH", KEYS[3], id)
                emit("event", "failed", "jobId", id, "ts", ARGV[1], "failedReason", "dependency_failed")
                redis.call("HINCRBY", KEYS[5], "failed", 1)
            elseif unmet > 0 then
                redis.call("RPUSH", KEYS[2], id)
                emit("event", "waiting-children", "jobId", id, "ts", ARGV[1])
            else
                route_waiting(jkey, id)
                emit("event", "waiting", "jobId", id, "ts", ARGV[1], "prev", "delayed")
                redis.call("HINCRBY", KEYS[5], "promoted", 1)
            end
        end
    end
    return #ready
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(PROMOTE_SCRIPT);
}

pub(crate) struct PromoteScript(&'static redis::Script);

impl PromoteScript {
    pub fn new() -> Self {
        PromoteScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        now: i64,
        batch: usize,
        events_maxlen: usize,
    ) -> Result<usize, Error> {
        let promoted: usize = self
            .0
            .key(&keys.delayed)
            .key(&keys.dependency_wait)
            .key(&keys.failed)
            .key(&keys.events)
            .key(&keys.metrics)
            .arg(now)
            .arg(batch)
            .arg(&keys.job_prefix)
            .arg(keys.waiting_base())
            .arg(events_maxlen)
            .invoke_async(&mut **conn)
            .await?;
        Ok(promoted)
    }
}
