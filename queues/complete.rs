use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, keys::QueueKeys};

// Terminal success. Verifies the fencing token, records the result, wakes
// any dependents whose parents are now all finished, and applies the
// removal policy from the job's options snapshot.
// KEYS:
//  1. job data key
//  2. active list
//  3. completed list
//  4. lock key
//  5. events stream
//  6. queue metrics hash
//  7. dependency-wait list
// ARGS:
//  1. job id
//  2. lock token
//  3. current time (ms)
//  4. return value (JSON)
//  5. job data key prefix
//  6. waiting list base name
//  7. events stream cap (0 = uncapped)
const COMPLETE_SCRIPT: &str = r##"
    local maxlen = tonumber(ARGV[7])
    local function emit(...)
        if maxlen > 0 then
            redis.call("XADD", KEYS[5], "MAXLEN", "~", maxlen, "*", ...)
        else
            redis.call("XADD", KEYS[5], "*", ...)
        end
    end

    local function route_waiting(jkey, id)
        local level = tonumber(redis.call("HGET", jkey, "priority") or "0") or 0
        local wkey = ARGV[6]
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
    redis.call("HSET", KEYS[1], "finishedOn", ARGV[3], "returnvalue", ARGV[4])
    emit("event", "completed", "jobId", ARGV[1], "ts", ARGV[3], "prev", "active", "returnvalue", ARGV[4])
    redis.call("HINCRBY", KEYS[6], "completed", 1)

    local depset = KEYS[1] .. ":dependents"
    for _, d in ipairs(redis.call("SMEMBERS", depset)) do
        local dkey = ARGV[5] .. d
        local parents = cjson.decode(redis.call("HGET", dkey, "dependencies") or "[]")
        local ready = true
        for _, p in ipairs(parents) do
            if p ~= ARGV[1] then
                local pkey = ARGV[5] .. p
                if redis.call("EXISTS", pkey) == 1 and not redis.call("HGET", pkey, "finishedOn") then
                    ready = false
                end
            end
        end
        if ready and redis.call("LREM", KEYS[7], 1, d) == 1 then
            route_waiting(dkey, d)
            emit("event", "waiting", "jobId", d, "ts", ARGV[3], "prev", "waiting-children")
        end
    end
    redis.call("DEL", depset)

    local opts = cjson.decode(redis.call("HGET", KEYS[1], "opts") or "{}")
    local policy = opts["removeOnComplete"]
    if opts["keepJobs"] then policy = false end
    if policy == true then
        redis.call("DEL", KEYS[1])
    else
        redis.call("LPUSH", KEYS[3], ARGV[1])
        if type(policy) == "number" then
            while redis.call("LLEN", KEYS[3]) > policy do
                local evicted = redis.call("RPOP", KEYS[3])
                if not evicted then break end
                redis.call("DEL", ARGV[5] .. evicted)
            end
        end
    end
    return "ok"
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(COMPLETE_SCRIPT);
}

pub(crate) struct CompleteScript(&'static redis::Script);

impl CompleteScript {
    pub fn new() -> Self {
        CompleteScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        job_id: &str,
        token: &str,
        returnvalue: &serde_json::Value,
        now: i64,
        events_maxlen: usize,
    ) -> Result<(), Error> {
        let tag: String = self
            .0
            .key(keys.job(job_id))
            .key(&keys.active)
            .key(&keys.completed)
            .key(keys.lock(job_id))
            .key(&keys.events)
            .key(&keys.metrics)
            .key(&keys.dependency_wait)
            .arg(job_id)
            .arg(token)
            .arg(now)
            .arg(serde_json::to_string(returnvalue)?)
            .arg(&keys.job_prefix)
            .arg(keys.waiting_base())
            .arg(events_maxlen)
            .invoke_async(&mut **conn)
            .await?;

        match tag.as_str() {
            "ok" => Ok(()),
            "missing" => Err(Error::NotFound {
                job_id: job_id.to_string(),
            }),
            _ => Err(Error::LockLost {
                job_id: job_id.to_string(),
            }),
        }
    }
}
