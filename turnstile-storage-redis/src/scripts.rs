//! Server-side scripts.
//!
//! Scripts are pure functions of KEYS and ARGV; the current instant is always
//! passed in so comparisons never read the server clock. Stored lockouts are
//! RFC 3339 strings and are compared as epoch milliseconds, so values written
//! with an offset or without fractional seconds order correctly.

use redis::Script;

/// KEYS: attempts. ARGV: max, window seconds.
///
/// Returns `{1, count}` when admitted, `{0, pttl}` when the window is
/// exhausted.
const ALLOW: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    redis.call('SET', KEYS[1], 1, 'EX', ARGV[2])
    return {1, 1}
end
if tonumber(current) >= tonumber(ARGV[1]) then
    return {0, redis.call('PTTL', KEYS[1])}
end
return {1, redis.call('INCR', KEYS[1])}
"#;

/// Lua helper: RFC 3339 string to epoch milliseconds, `nil` if unreadable.
const EPOCH_MILLIS: &str = r#"
local function epoch_millis(value)
    local y, mo, d, h, mi, s, frac, zone = string.match(value,
        '^(%d%d%d%d)%-(%d%d)%-(%d%d)[Tt ](%d%d):(%d%d):(%d%d)(%.?%d*)(.*)$')
    if not y then
        return nil
    end
    y, mo = tonumber(y), tonumber(mo)
    if mo <= 2 then
        y = y - 1
        mo = mo + 12
    end
    local days = 365 * y + math.floor(y / 4) - math.floor(y / 100) + math.floor(y / 400)
        + math.floor((153 * (mo - 3) + 2) / 5) + tonumber(d) - 719469
    local secs = ((days * 24 + tonumber(h)) * 60 + tonumber(mi)) * 60 + tonumber(s)
    if zone ~= 'Z' and zone ~= 'z' then
        local sign, oh, om = string.match(zone, '^([+-])(%d%d):?(%d%d)$')
        if not sign then
            return nil
        end
        local offset = (tonumber(oh) * 60 + tonumber(om)) * 60
        if sign == '+' then
            secs = secs - offset
        else
            secs = secs + offset
        end
    end
    local millis = tonumber(string.sub(string.sub(frac, 2) .. '000', 1, 3))
    return secs * 1000 + millis
end
"#;

/// KEYS: failure counter, lockout, attempts, failures.
/// ARGV: max, window seconds, lockout seconds, unlock_at, now as epoch millis.
///
/// Returns `{count, created, replaced_expired}`. An unreadable lockout value is
/// replaced.
const FAILURE: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
end
if count < tonumber(ARGV[1]) then
    return {count, 0, 0}
end
local replaced = 0
local existing = redis.call('GET', KEYS[2])
if existing then
    local unlock_at = epoch_millis(existing)
    if unlock_at and unlock_at > tonumber(ARGV[5]) then
        return {count, 0, 0}
    end
    replaced = 1
end
redis.call('SET', KEYS[2], ARGV[4], 'EX', ARGV[3])
redis.call('DEL', KEYS[3], KEYS[4])
return {count, 1, replaced}
"#;

/// KEYS: lockout, attempts, failures. ARGV: the lockout value previously read.
///
/// Deletes all three keys only if the lockout still holds that exact value.
const EXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
    return 1
end
return 0
"#;

#[derive(Debug, Clone)]
pub(crate) struct Scripts {
    pub(crate) allow: Script,
    pub(crate) failure: Script,
    pub(crate) expire: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Self {
            allow: Script::new(ALLOW),
            failure: Script::new(&format!("{EPOCH_MILLIS}{FAILURE}")),
            expire: Script::new(EXPIRE),
        }
    }
}
