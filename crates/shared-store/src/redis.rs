use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::warn;

use crate::{MessageStream, Store, StoreError, StoreMessage, StoreResult};

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Operation(err.to_string())
    }
}

/// Redis-backed store. Commands go through a [`ConnectionManager`], which
/// multiplexes one connection and reconnects on its own; subscriptions each
/// get a dedicated pub/sub connection off the underlying client.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client =
            Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let is_member: bool = conn.sismember(key, member).await?;
        Ok(is_member)
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.manager.clone();
        let entries: Vec<(String, f64)> = conn.zrangebyscore_withscores(key, min, max).await?;
        Ok(entries)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        let removed: u64 = conn.zrembyscore(key, min, max).await?;
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(StoreMessage { channel, payload }),
                Err(err) => {
                    warn!("dropping non-utf8 pub/sub payload on {}: {}", channel, err);
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
