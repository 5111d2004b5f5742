use std::time::Duration;

use lazy_static::lazy_static;
use serde::Serialize;

use crate::error::Error;

/// Enqueue-side rate limit for a queue: at most `max` admissions per
/// sliding `duration` window.
#[derive(Debug, Clone)]
pub struct RateLimit {
    pub max: u32,
    pub duration: Duration,
    /// When the window is full, enqueue as delayed by the window reset
    /// instead of surfacing `Error::RateLimited`.
    pub auto_defer: bool,
}

impl RateLimit {
    pub fn new(max: u32, duration: Duration) -> RateLimit {
        RateLimit {
            max,
            duration,
            auto_defer: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitStatus {
    pub limited: bool,
    /// Admissions left in the current window.
    pub remaining: u32,
    /// Time until the oldest admission falls out of the window. Zero when
    /// not limited.
    #[serde(with = "serde_millis")]
    pub reset_in: Duration,
}

// Sliding-window admission check. Admits and records the caller when the
// window has room.
// KEYS:
//  1. window sorted set
//  2. queue metrics hash
// ARGS:
//  1. current time (ms)
//  2. max admissions per window
//  3. window duration (ms)
//  4. uniquifier for the window member
const RATE_LIMIT_SCRIPT: &str = r##"
    local now = tonumber(ARGV[1])
    local max = tonumber(ARGV[2])
    local dur = tonumber(ARGV[3])

    redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", now - dur)
    local count = redis.call("ZCARD", KEYS[1])
    if count < max then
        redis.call("ZADD", KEYS[1], now, now .. "-" .. ARGV[4])
        redis.call("PEXPIRE", KEYS[1], dur)
        return {0, max - count - 1, 0}
    end

    local oldest = redis.call("ZRANGE", KEYS[1], 0, 0, "WITHSCORES")
    local reset = 0
    if oldest[2] then
        reset = tonumber(oldest[2]) + dur - now
        if reset < 0 then reset = 0 end
    end
    redis.call("HINCRBY", KEYS[2], "rate_limited", 1)
    return {1, 0, reset}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(RATE_LIMIT_SCRIPT);
}

pub(crate) struct RateLimitScript(&'static redis::Script);

impl RateLimitScript {
    pub fn new() -> Self {
        RateLimitScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        conn: &mut deadpool_redis::Connection,
        window_key: &str,
        metrics_key: &str,
        now: i64,
        limit: &RateLimit,
    ) -> Result<RateLimitStatus, Error> {
        let (limited, remaining, reset_ms): (i64, i64, i64) = self
            .0
            .key(window_key)
            .key(metrics_key)
            .arg(now)
            .arg(limit.max)
            .arg(limit.duration.as_millis() as u64)
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut **conn)
            .await?;

        Ok(RateLimitStatus {
            limited: limited == 1,
            remaining: remaining.max(0) as u32,
            reset_in: Duration::from_millis(reset_ms.max(0) as u64),
        })
    }
}
