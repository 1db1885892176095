//! Server-side Lua scripts.
//!
//! The stats hash of a job and the in-progress tracking hash are only ever mutated
//! through these scripts, so each transition is a single atomic round-trip.
//! Status codes used by the ordering: Pending=0, Scheduled=1, Running=2 and
//! Success/Stopped/Error=3. Tuples compare revision first, then status code, then
//! check-in time.

use redis::Script;
use std::sync::OnceLock;

/// Returned by a script when the write was applied.
pub const REPLY_OK: &str = "ok";
/// Returned by a script when the stats hash does not exist.
pub const REPLY_NOT_FOUND: &str = "not_found";
/// Returned by [`check_status_match`] when the event is behind the persisted state.
pub const REPLY_OUTDATED: &str = "outdated";
/// Returned by [`hook_ack`] when a newer ACK is already recorded.
pub const REPLY_MISMATCH: &str = "mismatch";
/// Returned by the unique enqueue scripts on a dedup-key collision.
pub const REPLY_DUPLICATE: &str = "dup";

/// Track slots held by a job in flight: one for the stats, one for the hook ACK.
pub const TRACK_SLOTS: i64 = 2;

/// TTL applied to the stats hash when a job ends in Success or Stopped.
pub const FINAL_STATS_TTL_SECS: i64 = 86_400;

/// TTL of a unique-job dedup key.
pub const UNIQUE_KEY_TTL_SECS: i64 = 86_400;

const STATUS_FUNCS: &str = r#"
local function stCode(s)
  if s == 'Pending' then return 0 end
  if s == 'Scheduled' then return 1 end
  if s == 'Running' then return 2 end
  if s == 'Success' or s == 'Stopped' or s == 'Error' then return 3 end
  return -1
end

local function compare(r1, c1, t1, r2, c2, t2)
  if r1 ~= r2 then
    if r1 > r2 then return 1 end
    return -1
  end
  if c1 ~= c2 then
    if c1 > c2 then return 1 end
    return -1
  end
  if t1 ~= t2 then
    if t1 > t2 then return 1 end
    return -1
  end
  return 0
end

local function releaseTrack(trackKey, jobID)
  local left = redis.call('HINCRBY', trackKey, jobID, -1)
  if left <= 0 then
    redis.call('HDEL', trackKey, jobID)
  end
end
"#;

// KEYS[1] stats, KEYS[2] track
// ARGV[1] target status, ARGV[2] revision, ARGV[3] now, ARGV[4] job id
const SET_STATUS_BODY: &str = r#"
local res = redis.call('HMGET', KEYS[1], 'status', 'revision', 'web_hook_url')
if not res[1] then
  return 'not_found'
end

local current = res[1]
local target = ARGV[1]
if current == target then
  return 'ok'
end

local curCode = stCode(current)
local code = stCode(target)
if code < 0 then
  return 'invalid'
end

local curRev = tonumber(res[2]) or 0
local rev = tonumber(ARGV[2]) or 0

if rev > curRev or (rev == curRev and code >= curCode) then
  redis.call('HSET', KEYS[1], 'status', target, 'update_time', ARGV[3])
  if code == 2 then
    redis.call('HSET', KEYS[2], ARGV[4], 2)
  end
  if code == 3 then
    if curCode ~= 3 then
      if res[3] and res[3] ~= '' then
        releaseTrack(KEYS[2], ARGV[4])
      else
        -- jobs without a web hook hold no ACK slot
        redis.call('HDEL', KEYS[2], ARGV[4])
      end
    end
    if target == 'Success' or target == 'Stopped' then
      redis.call('EXPIRE', KEYS[1], 86400)
    end
  end
  return 'ok'
end

return current
"#;

// KEYS[1] stats
// ARGV[1] status, ARGV[2] revision, ARGV[3] check_in_at
const CHECK_STATUS_MATCH_BODY: &str = r#"
local res = redis.call('HMGET', KEYS[1], 'status', 'revision', 'check_in_at', 'ack')
if not res[1] then
  return 'not_found'
end

local code = stCode(ARGV[1])
local rev = tonumber(ARGV[2]) or 0
local cia = tonumber(ARGV[3]) or 0

if compare(rev, code, cia, tonumber(res[2]) or 0, stCode(res[1]), tonumber(res[3]) or 0) < 0 then
  return 'outdated'
end

if res[4] then
  local ack = cjson.decode(res[4])
  local ackRev = tonumber(ack['revision']) or 0
  local ackCia = tonumber(ack['check_in_at']) or 0
  if compare(rev, code, cia, ackRev, stCode(ack['status']), ackCia) < 0 then
    return 'outdated'
  end
end

return 'ok'
"#;

// KEYS[1] stats, KEYS[2] track
// ARGV[1] status, ARGV[2] revision, ARGV[3] check_in_at, ARGV[4] job id
const HOOK_ACK_BODY: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 'not_found'
end

local code = stCode(ARGV[1])
local rev = tonumber(ARGV[2]) or 0
local cia = tonumber(ARGV[3]) or 0
local released = false

local raw = redis.call('HGET', KEYS[1], 'ack')
if raw then
  local ack = cjson.decode(raw)
  local prevRev = tonumber(ack['revision']) or 0
  local prevCode = stCode(ack['status'])
  local c = compare(rev, code, cia, prevRev, prevCode, tonumber(ack['check_in_at']) or 0)
  if c < 0 then
    return 'mismatch'
  end
  if c == 0 then
    return 'ok'
  end
  released = (prevCode == 3 and prevRev == rev)
end

local encoded = cjson.encode({status = ARGV[1], revision = rev, check_in_at = cia})
redis.call('HSET', KEYS[1], 'ack', encoded)
if code == 3 and not released then
  releaseTrack(KEYS[2], ARGV[4])
end

return 'ok'
"#;

// KEYS[1] stats, KEYS[2] track
// ARGV[1] job id, ARGV[2] start status, ARGV[3] now
// Returns the new revision, or -1 when the stats hash is gone.
const STATUS_RESET_BODY: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end

local cur = tonumber(redis.call('HGET', KEYS[1], 'revision')) or 0
local rev = tonumber(ARGV[3])
if rev <= cur then
  rev = cur + 1
end

redis.call('HSET', KEYS[1], 'status', ARGV[2], 'revision', rev, 'update_time', ARGV[3])
redis.call('HDEL', KEYS[1], 'ack', 'check_in', 'check_in_at')
redis.call('HSET', KEYS[2], ARGV[1], 2)

return rev
"#;

// KEYS in groups of 4: in-progress list, job queue, lock, lock info
// ARGV[1] worker pool id
// Moves one job per call; returns {job, from, to} or nil when every list is empty.
const REENQUEUE_IN_PROGRESS: &str = r#"
for i = 1, #KEYS, 4 do
  local res = redis.call('RPOPLPUSH', KEYS[i], KEYS[i + 1])
  if res then
    if redis.call('DECR', KEYS[i + 2]) < 0 then
      redis.call('SET', KEYS[i + 2], 0)
    end
    if redis.call('HINCRBY', KEYS[i + 3], ARGV[1], -1) <= 0 then
      redis.call('HDEL', KEYS[i + 3], ARGV[1])
    end
    return {res, KEYS[i], KEYS[i + 1]}
  end
end
return nil
"#;

// KEYS in groups of 6: job queue, in-progress list, paused, lock, lock info, max concurrency
// ARGV[1] worker pool id
const FETCH_JOB: &str = r#"
local function canRun(lockKey, maxKey)
  local maxc = tonumber(redis.call('GET', maxKey))
  if not maxc or maxc <= 0 then
    return true
  end
  local active = tonumber(redis.call('GET', lockKey)) or 0
  return active < maxc
end

for i = 1, #KEYS, 6 do
  local ready = redis.call('LLEN', KEYS[i]) > 0 and redis.call('EXISTS', KEYS[i + 2]) == 0
  if ready and canRun(KEYS[i + 3], KEYS[i + 5]) then
    local res = redis.call('RPOPLPUSH', KEYS[i], KEYS[i + 1])
    if res then
      redis.call('INCR', KEYS[i + 3])
      redis.call('HINCRBY', KEYS[i + 4], ARGV[1], 1)
      return {res, KEYS[i], KEYS[i + 1]}
    end
  end
end
return nil
"#;

// KEYS[1] job queue, KEYS[2] dedup key
// ARGV[1] job json
const ENQUEUE_UNIQUE: &str = r#"
if redis.call('SET', KEYS[2], '1', 'NX', 'EX', 86400) then
  redis.call('LPUSH', KEYS[1], ARGV[1])
  return 'ok'
end
return 'dup'
"#;

// KEYS[1] scheduled set, KEYS[2] dedup key
// ARGV[1] job json, ARGV[2] run at
const ENQUEUE_UNIQUE_IN: &str = r#"
if redis.call('SET', KEYS[2], '1', 'NX', 'EX', 86400) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
  return 'ok'
end
return 'dup'
"#;

// KEYS[1] scheduled or retry set
// ARGV[1] jobs key prefix, ARGV[2] now
// Returns the job name moved, 'invalid' for an undecodable entry, nil when nothing is due.
const REQUEUE_DUE: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2], 'LIMIT', 0, 1)
if #due == 0 then
  return nil
end

local raw = due[1]
redis.call('ZREM', KEYS[1], raw)

local ok, job = pcall(cjson.decode, raw)
if not ok or type(job) ~= 'table' or type(job['name']) ~= 'string' then
  return 'invalid'
end

redis.call('LPUSH', ARGV[1] .. job['name'], raw)
return job['name']
"#;

// KEYS[1] scheduled, retry or dead set
// ARGV[1] score, ARGV[2] job id
// Removes the member with that score and job id; returns its raw JSON or nil.
const DELETE_ZSET_JOB: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[1])
for _, raw in ipairs(members) do
  local ok, job = pcall(cjson.decode, raw)
  if ok and type(job) == 'table' and job['id'] == ARGV[2] then
    redis.call('ZREM', KEYS[1], raw)
    return raw
  end
end
return nil
"#;

// KEYS[1] lock key, ARGV[1] owner token
const RELEASE_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

// KEYS[1] schema version key
// ARGV[1] expected value ('' when absent), ARGV[2] new value
// Returns 1 when swapped, 0 when the stored value changed meanwhile.
const SWAP_VERSION: &str = r#"
local cur = redis.call('GET', KEYS[1])
if (cur or '') ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

fn with_status_funcs(body: &str) -> String {
    format!("{}\n{}", STATUS_FUNCS, body)
}

/// Monotone status write; see the module docs for the ordering.
pub fn set_status() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(&with_status_funcs(SET_STATUS_BODY)))
}

/// Checks that an event tuple is not behind the persisted status nor the ACK.
pub fn check_status_match() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(&with_status_funcs(CHECK_STATUS_MATCH_BODY)))
}

/// Records a delivered hook event, refusing to move the ACK backwards.
pub fn hook_ack() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(&with_status_funcs(HOOK_ACK_BODY)))
}

/// Restarts the status stream of a job under a new revision.
pub fn status_reset() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(STATUS_RESET_BODY))
}

pub fn reenqueue_in_progress() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(REENQUEUE_IN_PROGRESS))
}

pub fn fetch_job() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(FETCH_JOB))
}

pub fn enqueue_unique() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(ENQUEUE_UNIQUE))
}

pub fn enqueue_unique_in() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(ENQUEUE_UNIQUE_IN))
}

pub fn requeue_due() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(REQUEUE_DUE))
}

pub fn delete_zset_job() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(DELETE_ZSET_JOB))
}

pub fn release_lock() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(RELEASE_LOCK))
}

/// Compare-and-swap of the schema version string.
pub fn swap_version() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| Script::new(SWAP_VERSION))
}
