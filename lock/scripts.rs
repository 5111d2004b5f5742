// Acquire a lock.
// KEYS:
//  1. lock key
// ARGS:
//  1. owner token
//  2. TTL in milliseconds
pub(crate) const ACQUIRE_SCRIPT: &str = r##"
    if redis.call("SET", KEYS[1], ARGV[1], "NX", "PX", ARGV[2]) then
        return 1
    end
    return 0
"##;

// Extend a held lock. Fails if the stored token is not ours, so a lock
// that expired and was grabbed by someone else is never refreshed.
// KEYS:
//  1. lock key
// ARGS:
//  1. owner token
//  2. new TTL in milliseconds
pub(crate) const EXTEND_SCRIPT: &str = r##"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        redis.call("PEXPIRE", KEYS[1], ARGV[2])
        return 1
    end
    return 0
"##;

// Release a held lock. Compare-and-delete, never an unconditional DEL.
// KEYS:
//  1. lock key
// ARGS:
//  1. owner token
pub(crate) const RELEASE_SCRIPT: &str = r##"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    end
    return 0
"##;
