//! Lua scripts for atomic coordination store operations.
//!
//! Each script runs atomically inside Redis, so read-check-write sequences
//! cannot interleave with other nodes' writes.

/// Set-if-absent plus a floored counter update, in one step.
///
/// Arguments:
/// - KEYS[1]: Key to claim (e.g., `room:{id}:placement`)
/// - KEYS[2]: Counter key (e.g., `node:{id}:contexts`)
/// - ARGV[1]: Value to store
/// - ARGV[2]: Signed counter delta
///
/// Returns:
/// - 1: Key written and counter updated
/// - 0: Key already present (nothing changed)
/// - -1: Error (delta or stored counter not a number, nothing changed)
pub const SET_NX_AND_COUNT: &str = r#"
local delta = tonumber(ARGV[2])
if delta == nil then
    return -1
end

local current = redis.call('GET', KEYS[2])
local value = 0
if current ~= false then
    value = tonumber(current)
    if value == nil then
        return -1
    end
end

if redis.call('SET', KEYS[1], ARGV[1], 'NX') == false then
    return 0
end

local next_value = value + delta
if next_value < 0 then
    next_value = 0
end

redis.call('SET', KEYS[2], next_value)
return 1
"#;

/// Compare-and-delete plus a floored counter update, in one step.
///
/// Arguments:
/// - KEYS[1]: Key to delete (e.g., `room:{id}:placement`)
/// - KEYS[2]: Counter key (e.g., `node:{id}:contexts`)
/// - ARGV[1]: Value the key must currently hold
/// - ARGV[2]: Signed counter delta
///
/// Returns:
/// - 1: Deleted and counter updated
/// - 0: Key missing or holds a different value (nothing changed)
/// - -1: Error (delta or stored counter not a number, nothing changed)
pub const COMPARE_DELETE_AND_COUNT: &str = r#"
local delta = tonumber(ARGV[2])
if delta == nil then
    return -1
end

local current = redis.call('GET', KEYS[1])
if current == false or current ~= ARGV[1] then
    return 0
end

local count = redis.call('GET', KEYS[2])
local value = 0
if count ~= false then
    value = tonumber(count)
    if value == nil then
        return -1
    end
end

local next_value = value + delta
if next_value < 0 then
    next_value = 0
end

redis.call('DEL', KEYS[1])
redis.call('SET', KEYS[2], next_value)
return 1
"#;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_touch_both_keys() {
        assert!(SET_NX_AND_COUNT.contains("redis.call('SET', KEYS[1], ARGV[1], 'NX')"));
        assert!(SET_NX_AND_COUNT.contains("redis.call('SET', KEYS[2], next_value)"));
        assert!(COMPARE_DELETE_AND_COUNT.contains("redis.call('DEL', KEYS[1])"));
        assert!(COMPARE_DELETE_AND_COUNT.contains("redis.call('SET', KEYS[2], next_value)"));
    }

    #[test]
    fn test_counter_validated_before_any_write() {
        for script in [SET_NX_AND_COUNT, COMPARE_DELETE_AND_COUNT] {
            let validated = script.rfind("return -1").unwrap();
            let first_write = script.find("redis.call('SET'").unwrap();
            let delete = script.find("redis.call('DEL'").unwrap_or(first_write);
            assert!(validated < first_write.min(delete));
            assert!(script.contains("if delta == nil then"));
            assert!(script.contains("if value == nil then"));
        }
    }

    #[test]
    fn test_compare_delete_only_on_match() {
        // GET on a missing key returns false in Redis Lua
        assert!(COMPARE_DELETE_AND_COUNT.contains("if current == false or current ~= ARGV[1] then"));
        assert!(COMPARE_DELETE_AND_COUNT.contains("return 0"));
    }

    #[test]
    fn test_counter_never_negative() {
        for script in [SET_NX_AND_COUNT, COMPARE_DELETE_AND_COUNT] {
            assert!(script.contains("if next_value < 0 then"));
            assert!(script.contains("next_value = 0"));
        }
    }
}
