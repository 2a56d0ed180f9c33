use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::{MessageStream, Store, StoreMessage, StoreResult};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct ZEntry {
    member: String,
    score: f64,
}

/// In-memory store for tests and single-node development.
///
/// Sorted-set tie order among equal scores is insertion order rather than
/// Redis' lexicographic order; callers needing a total order impose their
/// own secondary key, as the [`Store`] contract states.
pub struct MemoryStore {
    strings: RwLock<HashMap<String, StringEntry>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
    zsets: RwLock<HashMap<String, Vec<ZEntry>>>,
    events: broadcast::Sender<StoreMessage>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            strings: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            zsets: RwLock::new(HashMap::new()),
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        {
            let guard = self.strings.read();
            match guard.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        // Lazy eviction of the expired entry.
        self.strings.write().remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.strings.write().insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()> {
        self.strings.write().insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.strings.write().remove(key);
        self.sets.write().remove(key);
        self.zsets.write().remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        self.sets
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut guard = self.sets.write();
        if let Some(set) = guard.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                guard.remove(key);
            }
        }
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        Ok(self
            .sets
            .read()
            .get(key)
            .map_or(false, |set| set.contains(member)))
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .sets
            .read()
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut guard = self.zsets.write();
        let entries = guard.entry(key.to_string()).or_default();
        if let Some(entry) = entries.iter_mut().find(|e| e.member == member) {
            entry.score = score;
        } else {
            entries.push(ZEntry {
                member: member.to_string(),
                score,
            });
        }
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        let guard = self.zsets.read();
        let mut matched: Vec<(String, f64)> = guard
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.score >= min && e.score <= max)
                    .map(|e| (e.member.clone(), e.score))
                    .collect()
            })
            .unwrap_or_default();
        // Stable sort keeps insertion order among equal scores.
        matched.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(matched)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut guard = self.zsets.write();
        let Some(entries) = guard.get_mut(key) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|e| e.score < min || e.score > max);
        let removed = before - entries.len();
        if entries.is_empty() {
            guard.remove(key);
        }
        Ok(removed as u64)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        // No subscribers is not an error, same as Redis PUBLISH.
        let _ = self.events.send(StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> StoreResult<MessageStream> {
        let rx = self.events.subscribe();
        let pattern = pattern.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let pattern = pattern.clone();
            async move {
                match item {
                    Ok(msg) if pattern_matches(&pattern, &msg.channel) => Some(msg),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!("memory store subscriber lagged, dropped {missed} messages");
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
