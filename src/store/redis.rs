//! Redis-backed [`Store`] implementation.
//!
//! Each trait method maps onto one Redis command, except
//! `sorted_set_pop_before`, which runs a short Lua script so that the
//! range read and the removal happen as one atomic step on the server.

use super::Store;
use crate::{Result, WorkhorseError};
use async_trait::async_trait;
use redis::{Client, Script, aio::ConnectionManager};
use std::time::Duration;
use tracing::debug;

const POP_BEFORE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES')
for i = 1, #due, 2 do
    redis.call('ZREM', KEYS[1], due[i])
end
return due
"#;

/// Store backed by a Redis server.
///
/// Regular commands share one auto-reconnecting [`ConnectionManager`].
/// Blocking pops get a dedicated connection per call so a worker waiting on
/// `BLPOP` never stalls commands issued by other tasks.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    pop_before: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisStore {
    /// Connects to the server at `url` (for example `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| WorkhorseError::Config(format!(
            "Invalid Redis URL {}: {}",
            url, e
        )))?;
        let manager = ConnectionManager::new(client.clone()).await?;
        debug!(url = %url, "Connected to Redis");
        Ok(Self {
            client,
            manager,
            pop_before: Script::new(POP_BEFORE_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn pop_first(&self, keys: &[String]) -> Result<Option<(String, String)>> {
        let mut conn = self.conn();
        for key in keys {
            let value = redis::cmd("LPOP")
                .arg(key)
                .query_async::<_, Option<String>>(&mut conn)
                .await?;
            if let Some(value) = value {
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn();
        let reply = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .query_async::<_, Option<String>>(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        Ok(redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async::<_, i64>(&mut conn)
            .await?)
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, u64>(&mut conn)
            .await?)
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, u64>(&mut conn)
            .await?)
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("LPOP")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await?)
    }

    async fn list_pop_front_blocking(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        // BLPOP treats 0 as "wait forever", so a zero timeout is a plain poll.
        if timeout.is_zero() || keys.is_empty() {
            return self.pop_first(keys).await;
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply = redis::cmd("BLPOP")
            .arg(keys)
            .arg(timeout.as_secs_f64())
            .query_async::<_, Option<(String, String)>>(&mut conn)
            .await?;
        Ok(reply)
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("LREM")
            .arg(key)
            .arg(0)
            .arg(value)
            .query_async::<_, u64>(&mut conn)
            .await?)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("LLEN")
            .arg(key)
            .query_async::<_, u64>(&mut conn)
            .await?)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async::<_, Vec<String>>(&mut conn)
            .await?)
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn();
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn sorted_set_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZCARD")
            .arg(key)
            .query_async::<_, u64>(&mut conn)
            .await?)
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max_score)
            .arg("WITHSCORES")
            .query_async::<_, Vec<(String, f64)>>(&mut conn)
            .await?)
    }

    async fn sorted_set_pop_before(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn();
        Ok(self
            .pop_before
            .key(key)
            .arg(max_score)
            .invoke_async::<_, Vec<(String, f64)>>(&mut conn)
            .await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let added = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut members = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async::<_, Vec<String>>(&mut conn)
            .await?;
        members.sort();
        Ok(members)
    }

    async fn set_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        Ok(redis::cmd("SCARD")
            .arg(key)
            .query_async::<_, u64>(&mut conn)
            .await?)
    }
}
