//! Shared sliding-window store over Redis sorted sets.

use async_trait::async_trait;
use uuid::Uuid;

use super::{StoreError, WindowDecision, WindowStore};

/// Atomic drop→count→append→expire over one sorted set. Scores are
/// absolute milliseconds from the limiter's clock; members carry a unique
/// suffix so same-millisecond events never collide. Returns
/// `{allowed, used, oldest_ms}`.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)
local used = redis.call('ZCARD', key)
if used >= limit then
  local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
  return {0, used, tonumber(oldest[2]) or now}
end
redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, window * 2)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {1, used, tonumber(oldest[2]) or now}
"#;

/// Rate-limit store shared across worker processes.
pub struct RedisWindowStore {
    client: redis::Client,
    script: redis::Script,
}

impl RedisWindowStore {
    pub fn new(url: &str) -> std::result::Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError(format!("redis client: {e}")))?;
        Ok(RedisWindowStore {
            client,
            script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn check_and_append(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
        now_ms: u64,
    ) -> std::result::Result<WindowDecision, StoreError> {
        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError(format!("redis connect: {e}")))?;

        let member = format!("{now_ms}-{}", Uuid::new_v4());
        let (allowed, used, oldest_ms): (i64, i64, i64) = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| StoreError(format!("redis script: {e}")))?;

        Ok(WindowDecision {
            allowed: allowed == 1,
            used: used.max(0) as u32,
            oldest_ms: Some(oldest_ms.max(0) as u64),
        })
    }
}
