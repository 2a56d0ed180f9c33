//! Shared key-value store client used for cluster state and pub/sub fan-out.
//!
//! The [`Store`] trait covers the handful of primitives the room/broadcast
//! layer needs: plain strings, sets, score-ordered sets and pattern
//! subscriptions. [`RedisStore`] is the production implementation;
//! [`MemoryStore`] backs tests and single-node development.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store operation failed: {0}")]
    Operation(String),
}

/// A message observed on a pub/sub channel.
#[derive(Debug, Clone)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Stream of messages produced by a pattern subscription.
pub type MessageStream = BoxStream<'static, StoreMessage>;

/// Async client over the shared key-value store.
///
/// Scores are epoch milliseconds stored as `f64` (exact for any realistic
/// timestamp). `psubscribe` patterns follow Redis glob rules; the in-memory
/// implementation supports the exact-name and trailing-`*` forms, which is
/// all this workspace uses.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()>;
    async fn del(&self, key: &str) -> StoreResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn srem(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;
    /// Members with `min <= score <= max`, ascending by score, paired with
    /// their scores. Tie order among equal scores is implementation-defined;
    /// callers needing a total order impose their own secondary key.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64)
        -> StoreResult<Vec<(String, f64)>>;
    /// Removes members with `min <= score <= max`, returning how many.
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;
    async fn psubscribe(&self, pattern: &str) -> StoreResult<MessageStream>;
}
