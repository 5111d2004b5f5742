use deadpool_redis::Connection;
use lazy_static::lazy_static;

use crate::{error::Error, keys::QueueKeys};

// Pop the next waiting job, move it to the active list and take its lock.
// Waiting lists are probed highest priority first. `attemptsMade` is not
// touched here; it only moves on failure.
// KEYS:
//  1. active list
//  2. paused marker
//  3. events stream
//  4..3+N waiting lists, highest priority level first
// ARGS:
//  1. lock token
//  2. current time (ms)
//  3. lock TTL (ms)
//  4. job data key prefix
//  5. lock key prefix
//  6. events stream cap (0 = uncapped)
//  7. waiting list count
const RESERVE_SCRIPT: &str = r##"
    local maxlen = tonumber(ARGV[6])
    local function emit(...)
        if maxlen > 0 then
            redis.call("XADD", KEYS[3], "MAXLEN", "~", maxlen, "*", ...)
        else
            redis.call("XADD", KEYS[3], "*", ...)
        end
    end

    if redis.call("EXISTS", KEYS[2]) == 1 then
        return {"paused"}
    end

    local nlists = tonumber(ARGV[7])
    for i = 1, nlists do
        local id = redis.call("RPOP", KEYS[3 + i])
        if id then
            redis.call("LPUSH", KEYS[1], id)
            redis.call("HSET", ARGV[4] .. id, "processedOn", ARGV[2])
            redis.call("SET", ARGV[5] .. id, ARGV[1], "PX", tonumber(ARGV[3]))
            emit("event", "active", "jobId", id, "ts", ARGV[2], "prev", "waiting")
            return {"reserved", id}
        end
    end
    return {"none"}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(RESERVE_SCRIPT);
}

pub(crate) enum RawReserve {
    Reserved(String),
    Empty,
    Paused,
}

pub(crate) struct ReserveScript(&'static redis::Script);

impl ReserveScript {
    pub fn new() -> Self {
        ReserveScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        keys: &QueueKeys,
        conn: &mut Connection,
        token: &str,
        now: i64,
        lock_ttl_ms: u64,
        events_maxlen: usize,
    ) -> Result<RawReserve, Error> {
        let mut invocation = self.0.prepare_invoke();
        invocation
            .key(&keys.active)
            .key(&keys.paused)
            .key(&keys.events);
        for list in keys.waiting_desc() {
            invocation.key(list);
        }

        let reply: Vec<String> = invocation
            .arg(token)
            .arg(now)
            .arg(lock_ttl_ms)
            .arg(&keys.job_prefix)
            .arg(&keys.lock_prefix)
            .arg(events_maxlen)
            .arg(keys.waiting.len())
            .invoke_async(&mut **conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("reserved") => match reply.get(1) {
                Some(id) => Ok(RawReserve::Reserved(id.clone())),
                None => Ok(RawReserve::Empty),
            },
            Some("paused") => Ok(RawReserve::Paused),
            _ => Ok(RawReserve::Empty),
        }
    }
}
