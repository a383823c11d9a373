//! Redis-backed store.
//!
//! Commands run over one multiplexed connection. Conditional writes use Lua
//! scripts so they stay atomic across nodes; [`Store::atomic`] uses a
//! `MULTI/EXEC` pipeline. Each subscription owns a dedicated pub/sub
//! connection whose messages are forwarded by a background task.

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, Script};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ScoreRange, ScoredMember, Store, StoreOp, Subscription};
use crate::core::error::{JobServiceError, Result};

const HSET_IF_SCRIPT: &str = r"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
  redis.call('HSET', KEYS[1], unpack(ARGV, 3))
  return 1
end
return 0
";

const DEL_IF_EQ_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

const ZMOVE_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
  return 1
end
return 0
";

/// Redis keeps sorted set scores as doubles and replies with them in
/// exponent form once they grow large, so they cannot be read as integers.
#[allow(clippy::cast_possible_truncation)]
fn score_from_reply(raw: f64) -> i64 {
    if raw.is_nan() {
        return 0;
    }
    // `as` saturates at the i64 bounds.
    raw.round() as i64
}

fn bound(score: i64) -> String {
    match score {
        i64::MIN => "-inf".to_string(),
        i64::MAX => "+inf".to_string(),
        other => other.to_string(),
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// [`Store`] implementation over a Redis server.
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    hset_if: Script,
    del_if_eq: Script,
    zmove: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` (for example `redis://localhost:6379/0`).
    ///
    /// # Errors
    ///
    /// Returns `Backend` when the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(JobServiceError::backend)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(JobServiceError::backend)?;
        debug!(url = %url, "Connected to redis");
        Ok(Self {
            client,
            conn,
            hset_if: Script::new(HSET_IF_SCRIPT),
            del_if_eq: Script::new(DEL_IF_EQ_SCRIPT),
            zmove: Script::new(ZMOVE_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<()> {
        let _: String = ::redis::cmd("PING")
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = ::redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(removed > 0)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let removed: i64 = self
            .del_if_eq
            .key(key)
            .arg(expected)
            .invoke_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let applied: i64 = ::redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(applied == 1)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = ::redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: i64 = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let value: Option<String> = ::redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let value: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(value)
    }

    async fn hset_if(
        &self,
        key: &str,
        guard_field: &str,
        expected: &str,
        fields: &[(String, String)],
    ) -> Result<bool> {
        if fields.is_empty() {
            return Ok(false);
        }
        let mut invocation = self.hset_if.key(key);
        invocation.arg(guard_field).arg(expected);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let applied: i64 = invocation
            .invoke_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(applied == 1)
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let _: i64 = ::redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = ::redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        let score: Option<f64> = ::redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(score.map(score_from_reply))
    }

    async fn zrange_by_score(&self, key: &str, range: ScoreRange) -> Result<Vec<ScoredMember>> {
        let mut cmd = if range.rev {
            let mut cmd = ::redis::cmd("ZREVRANGEBYSCORE");
            cmd.arg(key).arg(bound(range.max)).arg(bound(range.min));
            cmd
        } else {
            let mut cmd = ::redis::cmd("ZRANGEBYSCORE");
            cmd.arg(key).arg(bound(range.min)).arg(bound(range.max));
            cmd
        };
        cmd.arg("WITHSCORES");
        if range.offset > 0 || range.limit.is_some() {
            let count = range.limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
            cmd.arg("LIMIT").arg(range.offset).arg(count);
        }
        let pairs: Vec<(String, f64)> = cmd
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(pairs
            .into_iter()
            .map(|(member, score)| ScoredMember {
                member,
                score: score_from_reply(score),
            })
            .collect())
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<usize> {
        let count: usize = ::redis::cmd("ZCOUNT")
            .arg(key)
            .arg(bound(min))
            .arg(bound(max))
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(count)
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize> {
        let removed: usize = ::redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(bound(min))
            .arg(bound(max))
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(removed)
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<ScoredMember>> {
        let popped: Vec<(String, f64)> = ::redis::cmd("ZPOPMIN")
            .arg(key)
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(popped.into_iter().next().map(|(member, score)| ScoredMember {
            member,
            score: score_from_reply(score),
        }))
    }

    async fn zmove(&self, src: &str, dst: &str, member: &str, score: i64) -> Result<bool> {
        let moved: i64 = self
            .zmove
            .key(src)
            .key(dst)
            .arg(member)
            .arg(score)
            .invoke_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(moved == 1)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let _: i64 = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(JobServiceError::backend)?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(JobServiceError::backend)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Dropping undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).is_err() {
                    break;
                }
            }
            debug!(channel = %channel_name, "Redis subscription closed");
        });
        Ok(Subscription::with_forwarder(rx, forwarder.abort_handle()))
    }

    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                StoreOp::ZAdd { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
                }
                StoreOp::ZAddNx { key, score, member } => {
                    pipe.cmd("ZADD").arg(key).arg("NX").arg(score).arg(member).ignore();
                }
                StoreOp::ZRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member).ignore();
                }
                StoreOp::ZRemRangeByScore { key, min, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE")
                        .arg(key)
                        .arg(bound(min))
                        .arg(bound(max))
                        .ignore();
                }
                StoreOp::Publish { channel, message } => {
                    pipe.cmd("PUBLISH").arg(channel).arg(message).ignore();
                }
                StoreOp::HSet { key, fields } => {
                    if fields.is_empty() {
                        continue;
                    }
                    let cmd = pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
                StoreOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                StoreOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
                }
            }
        }
        let _: () = pipe
            .query_async(&mut self.conn())
            .await
            .map_err(JobServiceError::backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::redis::FromRedisValue;

    fn decode(reply: &str) -> i64 {
        let value = ::redis::Value::Data(reply.as_bytes().to_vec());
        score_from_reply(f64::from_redis_value(&value).unwrap())
    }

    #[test]
    fn test_score_reply_in_exponent_form() {
        assert_eq!(decode("1704067200123"), 1_704_067_200_123);
        assert_eq!(decode("1.7040672001234568e+18"), 1_704_067_200_123_456_768);
        assert_eq!(decode("-1"), -1);
        assert_eq!(decode("inf"), i64::MAX);
        assert_eq!(decode("-inf"), i64::MIN);
    }

    #[tokio::test]
    async fn test_large_scores_round_trip() {
        // Needs a live server.
        let Ok(url) = std::env::var("REDIS_URL") else {
            return;
        };
        let store = RedisStore::connect(&url).await.unwrap();
        let key = format!("redis-store-test:{}", uuid::Uuid::new_v4());
        let score = 1_704_067_200_123_i64;
        store.zadd(&key, score, "a").await.unwrap();
        store.zadd(&key, -1, "b").await.unwrap();

        assert_eq!(store.zscore(&key, "a").await.unwrap(), Some(score));
        let all = store.zrange_by_score(&key, ScoreRange::all()).await.unwrap();
        assert_eq!(all[1].score, score);
        assert_eq!(store.zpop_min(&key).await.unwrap().unwrap().score, -1);
        assert_eq!(store.zpop_min(&key).await.unwrap().unwrap().score, score);
        store.del(&key).await.unwrap();
    }
}
