//! Redis-backed job store.
//!
//! Layout, per queue, under `{prefix}:{queue}`:
//!
//! - `:id` counter for job ids
//! - `:job:{id}` hash with the job record
//! - `:wait` zset scored by `priority * 2^32 + id`
//! - `:active` zset scored by `processed_on`
//! - `:delayed` zset scored by the time the job becomes eligible
//! - `:completed` and `:failed` zsets scored by `finished_on`
//! - `:paused` flag and `:stats` hash
//!
//! Every transition runs as a Lua script so it is atomic on the server. Scripts
//! address job hashes by prefix, so the store targets a single Redis node.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventmail_common::{AppError, AppResult};
use fred::clients::Client;
use fred::interfaces::{HashesInterface, KeysInterface, LuaInterface};
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::warn;
use validator::Validate;

use super::{FailDisposition, JobStore};
use crate::broker::BrokerConnection;
use crate::job::{Job, JobCounts, JobOptions, JobState};

/// Helpers shared by every script.
///
/// KEYS: wait, active, delayed, completed, failed, paused, stats, id.
/// ARGV[1]: job hash key prefix.
const PRELUDE: &str = r"
local PRIORITY_SHIFT = 4294967296

local function state_key(state)
  if state == 'waiting' then return KEYS[1] end
  if state == 'active' then return KEYS[2] end
  if state == 'delayed' then return KEYS[3] end
  if state == 'completed' then return KEYS[4] end
  if state == 'failed' then return KEYS[5] end
  return nil
end

local function wait_score(job_key, id)
  local priority = tonumber(redis.call('HGET', job_key, 'priority') or '0') or 0
  return priority * PRIORITY_SHIFT + tonumber(id)
end

local function detach(id)
  for i = 1, 5 do
    redis.call('ZREM', KEYS[i], id)
  end
end

local function promote(now)
  local due = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
  for _, id in ipairs(due) do
    local job_key = ARGV[1] .. id
    redis.call('ZREM', KEYS[3], id)
    redis.call('HSET', job_key, 'state', 'waiting')
    redis.call('HDEL', job_key, 'delay_until')
    redis.call('ZADD', KEYS[1], wait_score(job_key, id), id)
  end
end
";

/// ARGV: prefix, data, opts, now, priority, delay, queue.
const ADD: &str = r"
local id = redis.call('INCR', KEYS[8])
local job_key = ARGV[1] .. id
local now = tonumber(ARGV[4])
local delay = tonumber(ARGV[6])
redis.call('HSET', job_key,
  'id', id, 'queue', ARGV[7], 'data', ARGV[2], 'opts', ARGV[3],
  'attempts_made', 0, 'created_at', ARGV[4], 'priority', ARGV[5])
if delay > 0 then
  redis.call('HSET', job_key, 'state', 'delayed', 'delay_until', now + delay)
  redis.call('ZADD', KEYS[3], now + delay, id)
else
  redis.call('HSET', job_key, 'state', 'waiting')
  redis.call('ZADD', KEYS[1], wait_score(job_key, id), id)
end
return tostring(id)
";

/// ARGV: prefix, now, token.
const FETCH_NEXT: &str = r"
promote(ARGV[2])
if redis.call('EXISTS', KEYS[6]) == 1 then
  return false
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
local id = popped[1]
local job_key = ARGV[1] .. id
redis.call('ZADD', KEYS[2], ARGV[2], id)
redis.call('HSET', job_key, 'state', 'active', 'processed_on', ARGV[2],
  'progress_at', ARGV[2], 'token', ARGV[3])
redis.call('HINCRBY', job_key, 'attempts_made', 1)
return id
";

/// ARGV: prefix, id, token, now.
const HEARTBEAT: &str = r"
local job_key = ARGV[1] .. ARGV[2]
if redis.call('HGET', job_key, 'state') ~= 'active' then return 0 end
if redis.call('HGET', job_key, 'token') ~= ARGV[3] then return 0 end
redis.call('HSET', job_key, 'progress_at', ARGV[4])
return 1
";

/// ARGV: prefix, id, token ('' for none), now, return value, remove ('1'/'0').
const COMPLETE: &str = r"
local id = ARGV[2]
local job_key = ARGV[1] .. id
local state = redis.call('HGET', job_key, 'state')
if not state then return 0 end
if ARGV[3] ~= '' then
  if state ~= 'active' or redis.call('HGET', job_key, 'token') ~= ARGV[3] then return 0 end
elseif state == 'completed' then
  return 0
end
detach(id)
redis.call('HINCRBY', KEYS[7], 'completed', 1)
if ARGV[6] == '1' then
  redis.call('DEL', job_key)
  return 1
end
redis.call('HSET', job_key, 'state', 'completed', 'finished_on', ARGV[4], 'returnvalue', ARGV[5])
redis.call('HDEL', job_key, 'token', 'failed_reason', 'delay_until')
redis.call('ZADD', KEYS[4], ARGV[4], id)
return 1
";

/// ARGV: prefix, id, token ('' for none), now, reason, mode ('retry'/'terminal'), delay.
const FAIL: &str = r"
local id = ARGV[2]
local job_key = ARGV[1] .. id
if redis.call('HGET', job_key, 'state') ~= 'active' then return false end
if ARGV[3] ~= '' and redis.call('HGET', job_key, 'token') ~= ARGV[3] then return false end
redis.call('ZREM', KEYS[2], id)
redis.call('HDEL', job_key, 'token')
redis.call('HINCRBY', KEYS[7], 'failed', 1)
if ARGV[6] == 'retry' then
  local delay = tonumber(ARGV[7])
  if delay > 0 then
    local at = tonumber(ARGV[4]) + delay
    redis.call('HSET', job_key, 'state', 'delayed', 'delay_until', at)
    redis.call('ZADD', KEYS[3], at, id)
    return 'delayed'
  end
  redis.call('HSET', job_key, 'state', 'waiting')
  redis.call('ZADD', KEYS[1], wait_score(job_key, id), id)
  return 'waiting'
end
local opts = cjson.decode(redis.call('HGET', job_key, 'opts') or '{}')
if opts['removeOnFail'] == true then
  redis.call('DEL', job_key)
  return 'failed'
end
redis.call('HSET', job_key, 'state', 'failed', 'failed_reason', ARGV[5], 'finished_on', ARGV[4])
redis.call('ZADD', KEYS[5], ARGV[4], id)
return 'failed'
";

/// ARGV: prefix, state, start, stop, now.
const LIST: &str = r"
promote(ARGV[5])
local key = state_key(ARGV[2])
if ARGV[2] == 'completed' or ARGV[2] == 'failed' then
  return redis.call('ZREVRANGE', key, ARGV[3], ARGV[4])
end
return redis.call('ZRANGE', key, ARGV[3], ARGV[4])
";

/// ARGV: prefix, now.
const COUNTS: &str = r"
promote(ARGV[2])
local counts = {}
for i = 1, 5 do
  counts[i] = redis.call('ZCARD', KEYS[i])
end
return counts
";

/// ARGV: prefix, state, cutoff.
const CLEAN: &str = r"
local state = ARGV[2]
local key = state_key(state)
local field = 'created_at'
if state == 'active' then field = 'processed_on' end
if state == 'completed' or state == 'failed' then field = 'finished_on' end
local cutoff = tonumber(ARGV[3])
local removed = {}
for _, id in ipairs(redis.call('ZRANGE', key, 0, -1)) do
  local job_key = ARGV[1] .. id
  local ts = tonumber(redis.call('HGET', job_key, field) or redis.call('HGET', job_key, 'created_at') or '0')
  if ts <= cutoff then
    redis.call('ZREM', key, id)
    redis.call('DEL', job_key)
    removed[#removed + 1] = id
  end
end
return removed
";

/// ARGV: prefix, id.
const REMOVE: &str = r"
detach(ARGV[2])
return redis.call('DEL', ARGV[1] .. ARGV[2])
";

/// ARGV: prefix, id.
const RETRY: &str = r"
local id = ARGV[2]
local job_key = ARGV[1] .. id
if redis.call('HGET', job_key, 'state') ~= 'failed' then return 0 end
redis.call('ZREM', KEYS[5], id)
redis.call('HSET', job_key, 'state', 'waiting', 'attempts_made', 0)
redis.call('HDEL', job_key, 'failed_reason', 'finished_on', 'delay_until')
redis.call('ZADD', KEYS[1], wait_score(job_key, id), id)
return 1
";

/// ARGV: prefix, id.
const MOVE_ACTIVE_TO_WAITING: &str = r"
local id = ARGV[2]
local job_key = ARGV[1] .. id
if redis.call('HGET', job_key, 'state') ~= 'active' then return 0 end
redis.call('ZREM', KEYS[2], id)
redis.call('HSET', job_key, 'state', 'waiting')
redis.call('HDEL', job_key, 'token')
redis.call('ZADD', KEYS[1], wait_score(job_key, id), id)
return 1
";

fn with_prelude(body: &str) -> String {
    format!("{PRELUDE}\n{body}")
}

static ADD_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(ADD));
static FETCH_NEXT_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(FETCH_NEXT));
static HEARTBEAT_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(HEARTBEAT));
static COMPLETE_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(COMPLETE));
static FAIL_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(FAIL));
static LIST_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(LIST));
static COUNTS_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(COUNTS));
static CLEAN_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(CLEAN));
static REMOVE_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(REMOVE));
static RETRY_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(RETRY));
static MOVE_ACTIVE_SCRIPT: Lazy<String> = Lazy::new(|| with_prelude(MOVE_ACTIVE_TO_WAITING));

fn broker_error(context: &str) -> impl FnOnce(fred::error::Error) -> AppError + '_ {
    move |e| AppError::Broker(format!("{context}: {e}"))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_ts(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

/// Job store on top of the shared broker connection.
#[derive(Clone)]
pub struct RedisJobStore {
    client: Arc<Client>,
    prefix: String,
}

impl RedisJobStore {
    #[must_use]
    pub fn new(broker: &BrokerConnection) -> Self {
        Self {
            client: broker.client(),
            prefix: broker.prefix().to_string(),
        }
    }

    fn base(&self, queue: &str) -> String {
        format!("{}:{queue}", self.prefix)
    }

    fn job_key(&self, queue: &str, id: &str) -> String {
        format!("{}:job:{id}", self.base(queue))
    }

    fn keys(&self, queue: &str) -> Vec<String> {
        let base = self.base(queue);
        ["wait", "active", "delayed", "completed", "failed", "paused", "stats", "id"]
            .iter()
            .map(|suffix| format!("{base}:{suffix}"))
            .collect()
    }

    fn args(&self, queue: &str, rest: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut args = vec![format!("{}:job:", self.base(queue))];
        args.extend(rest);
        args
    }

    fn decode(queue: &str, fields: &HashMap<String, String>) -> AppResult<Job> {
        let field = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| AppError::Queue(format!("job record is missing `{name}`")))
        };

        let id = field("id")?.clone();
        let data: Value = serde_json::from_str(field("data")?)?;
        let options: JobOptions = serde_json::from_str(field("opts")?)?;
        let state: JobState = field("state")?.parse()?;
        let created_at = parse_ts(fields, "created_at")
            .ok_or_else(|| AppError::Queue(format!("job {id} has no creation time")))?;

        Ok(Job {
            queue: fields
                .get("queue")
                .cloned()
                .unwrap_or_else(|| queue.to_string()),
            data,
            options,
            state,
            attempts_made: fields
                .get("attempts_made")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            created_at,
            processed_on: parse_ts(fields, "processed_on"),
            finished_on: parse_ts(fields, "finished_on"),
            progress_at: parse_ts(fields, "progress_at"),
            delay_until: parse_ts(fields, "delay_until"),
            failed_reason: fields.get("failed_reason").cloned(),
            return_value: fields
                .get("returnvalue")
                .and_then(|v| serde_json::from_str(v).ok()),
            token: fields.get("token").cloned(),
            id,
        })
    }

    async fn load(&self, queue: &str, id: &str) -> AppResult<Option<Job>> {
        let fields: HashMap<String, String> = self
            .client
            .hgetall(self.job_key(queue, id))
            .await
            .map_err(broker_error("failed to read job"))?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::decode(queue, &fields).map(Some)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn add(&self, queue: &str, data: Value, options: &JobOptions) -> AppResult<String> {
        options.validate()?;

        let args = self.args(
            queue,
            [
                serde_json::to_string(&data)?,
                serde_json::to_string(options)?,
                now_ms().to_string(),
                options.priority.to_string(),
                options.delay.to_string(),
                queue.to_string(),
            ],
        );
        self.client
            .eval(ADD_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to add job"))
    }

    async fn fetch_next(&self, queue: &str, token: &str) -> AppResult<Option<Job>> {
        let args = self.args(queue, [now_ms().to_string(), token.to_string()]);
        let id: Option<String> = self
            .client
            .eval(FETCH_NEXT_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to fetch next job"))?;

        match id {
            Some(id) => self.load(queue, &id).await,
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, queue: &str, id: &str, token: &str) -> AppResult<bool> {
        let args = self.args(
            queue,
            [id.to_string(), token.to_string(), now_ms().to_string()],
        );
        let touched: i64 = self
            .client
            .eval(HEARTBEAT_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to record heartbeat"))?;
        Ok(touched == 1)
    }

    async fn complete(
        &self,
        queue: &str,
        id: &str,
        token: Option<&str>,
        return_value: Value,
        remove: bool,
    ) -> AppResult<bool> {
        let args = self.args(
            queue,
            [
                id.to_string(),
                token.unwrap_or_default().to_string(),
                now_ms().to_string(),
                serde_json::to_string(&return_value)?,
                if remove { "1" } else { "0" }.to_string(),
            ],
        );
        let applied: i64 = self
            .client
            .eval(COMPLETE_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to complete job"))?;
        Ok(applied == 1)
    }

    async fn fail(
        &self,
        queue: &str,
        id: &str,
        token: Option<&str>,
        reason: &str,
        disposition: FailDisposition,
    ) -> AppResult<Option<JobState>> {
        let (mode, delay_ms) = match disposition {
            FailDisposition::Retry { delay_ms } => ("retry", delay_ms),
            FailDisposition::Terminal => ("terminal", 0),
        };
        let args = self.args(
            queue,
            [
                id.to_string(),
                token.unwrap_or_default().to_string(),
                now_ms().to_string(),
                reason.to_string(),
                mode.to_string(),
                delay_ms.to_string(),
            ],
        );
        let state: Option<String> = self
            .client
            .eval(FAIL_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to record job failure"))?;

        state.map(|s| s.parse()).transpose()
    }

    async fn get(&self, queue: &str, id: &str) -> AppResult<Option<Job>> {
        self.load(queue, id).await
    }

    async fn list(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> AppResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // -1 reads to the end of the set.
        let stop = i64::try_from(offset.saturating_add(limit)).map_or(-1, |end| end - 1);
        let args = self.args(
            queue,
            [
                state.as_str().to_string(),
                offset.to_string(),
                stop.to_string(),
                now_ms().to_string(),
            ],
        );
        let ids: Vec<String> = self
            .client
            .eval(LIST_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to list jobs"))?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(queue, &id).await {
                Ok(Some(job)) => jobs.push(job),
                // Removed between the listing and the read.
                Ok(None) => {}
                Err(e) => warn!(queue, job_id = %id, error = %e, "Skipping unreadable job"),
            }
        }
        Ok(jobs)
    }

    async fn counts(&self, queue: &str) -> AppResult<JobCounts> {
        let args = self.args(queue, [now_ms().to_string()]);
        let counts: Vec<u64> = self
            .client
            .eval(COUNTS_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to count jobs"))?;

        let at = |i: usize| counts.get(i).copied().unwrap_or(0);
        Ok(JobCounts {
            waiting: at(0),
            active: at(1),
            delayed: at(2),
            completed: at(3),
            failed: at(4),
        })
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        older_than_ms: u64,
    ) -> AppResult<Vec<String>> {
        let cutoff = now_ms() - older_than_ms as i64;
        let args = self.args(queue, [state.as_str().to_string(), cutoff.to_string()]);
        self.client
            .eval(CLEAN_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to clean jobs"))
    }

    async fn remove(&self, queue: &str, id: &str) -> AppResult<bool> {
        let args = self.args(queue, [id.to_string()]);
        let removed: i64 = self
            .client
            .eval(REMOVE_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to remove job"))?;
        Ok(removed > 0)
    }

    async fn retry(&self, queue: &str, id: &str) -> AppResult<bool> {
        let args = self.args(queue, [id.to_string()]);
        let moved: i64 = self
            .client
            .eval(RETRY_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to retry job"))?;
        Ok(moved == 1)
    }

    async fn move_active_to_waiting(&self, queue: &str, id: &str) -> AppResult<bool> {
        let args = self.args(queue, [id.to_string()]);
        let moved: i64 = self
            .client
            .eval(MOVE_ACTIVE_SCRIPT.as_str(), self.keys(queue), args)
            .await
            .map_err(broker_error("failed to move job to waiting"))?;
        Ok(moved == 1)
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> AppResult<()> {
        let key = format!("{}:paused", self.base(queue));
        if paused {
            self.client
                .set::<(), _, _>(key, "1", None, None, false)
                .await
                .map_err(broker_error("failed to pause queue"))?;
        } else {
            self.client
                .del::<i64, _>(key)
                .await
                .map_err(broker_error("failed to resume queue"))?;
        }
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> AppResult<bool> {
        let key = format!("{}:paused", self.base(queue));
        let exists: i64 = self
            .client
            .exists(key)
            .await
            .map_err(broker_error("failed to read pause flag"))?;
        Ok(exists > 0)
    }

    async fn clear_stats(&self, queue: &str) -> AppResult<u64> {
        let key = format!("{}:stats", self.base(queue));
        let removed: i64 = self
            .client
            .del(key)
            .await
            .map_err(broker_error("failed to clear stats"))?;
        Ok(removed.max(0) as u64)
    }

    async fn ping(&self) -> bool {
        self.client
            .exists::<i64, _>(format!("{}:health", self.prefix))
            .await
            .is_ok()
    }
}
