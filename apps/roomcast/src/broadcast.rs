use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use shared_store::{MessageStream, Store, StoreMessage};

use crate::auth::ConnectionIdentity;
use crate::errors::WsError;
use crate::protocol::{EventEnvelope, RoomEvent, ServerMessage};
use crate::resolver::RoomResolver;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Frames queued for one connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    Close,
}

/// Node-local handle to one live WebSocket connection.
pub struct ConnectionHandle {
    id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    identity: ConnectionIdentity,
    user_id: RwLock<Option<String>>,
    last_heartbeat: RwLock<Instant>,
}

impl ConnectionHandle {
    pub fn new(
        id: String,
        tx: mpsc::UnboundedSender<Outbound>,
        identity: ConnectionIdentity,
    ) -> Self {
        Self {
            id,
            tx,
            identity,
            user_id: RwLock::new(None),
            last_heartbeat: RwLock::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Queues a frame; false when the connection's writer is gone.
    pub fn send(&self, message: &ServerMessage) -> bool {
        self.tx.send(Outbound::Frame(message.clone())).is_ok()
    }

    /// Asks the writer task to close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub async fn cached_user_id(&self) -> Option<String> {
        self.user_id.read().await.clone()
    }

    pub async fn cache_user_id(&self, user_id: String) {
        *self.user_id.write().await = Some(user_id);
    }

    pub async fn touch(&self) {
        *self.last_heartbeat.write().await = Instant::now();
    }

    pub async fn heartbeat_elapsed(&self) -> Duration {
        self.last_heartbeat.read().await.elapsed()
    }
}

enum ControlKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Cluster fan-out engine: publishes room events onto the shared channel
/// namespace, keeps the time-windowed replay log, and delivers messages
/// observed on the namespace to connections attached to this node.
///
/// Constructed explicitly by startup wiring and shared behind an `Arc`;
/// there is no module-level instance.
pub struct BroadcastBus {
    store: Arc<dyn Store>,
    resolver: Arc<RoomResolver>,
    channel_prefix: String,
    retention: Duration,
    connections: DashMap<String, Arc<ConnectionHandle>>,
    rooms: DashMap<String, DashSet<String>>,
    seq: AtomicU64,
}

impl BroadcastBus {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<RoomResolver>,
        channel_prefix: impl Into<String>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            resolver,
            channel_prefix: channel_prefix.into(),
            retention,
            connections: DashMap::new(),
            rooms: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Subscribes to the cluster channel namespace and spawns the pump task
    /// that applies observed messages to this node. The subscription is
    /// active by the time this returns.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, WsError> {
        let pattern = format!("{}:*", self.channel_prefix);
        let stream = self.store.psubscribe(&pattern).await?;
        info!("listening for cluster broadcasts on {pattern}");
        let bus = self.clone();
        Ok(tokio::spawn(async move { bus.pump(stream).await }))
    }

    async fn pump(self: Arc<Self>, mut stream: MessageStream) {
        let pattern = format!("{}:*", self.channel_prefix);
        loop {
            while let Some(message) = stream.next().await {
                self.handle_store_message(message);
            }
            warn!("cluster subscription ended, resubscribing");
            loop {
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                match self.store.psubscribe(&pattern).await {
                    Ok(next) => {
                        stream = next;
                        break;
                    }
                    Err(err) => error!("cluster resubscribe failed: {err}"),
                }
            }
        }
    }

    /// Publishes a room event cluster-wide. Unless `skip_cache`, the
    /// envelope is first appended to the room's replay log and entries older
    /// than the retention window are pruned afterwards.
    pub async fn publish(
        &self,
        instance: &str,
        event: &str,
        data: Value,
        skip_cache: bool,
    ) -> Result<(), WsError> {
        if self.resolver.resolve(instance).is_none() {
            warn!("publishing to {instance} which no registered pattern resolves");
        }
        let envelope = EventEnvelope {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            event: event.to_string(),
            data,
        };
        let payload = serde_json::to_string(&envelope)?;
        if !skip_cache {
            let key = emit_key(instance);
            let now = now_millis();
            self.store.zadd(&key, &payload, now as f64).await?;
            // Entries exactly at the horizon stay; replay at the boundary
            // is inclusive.
            let horizon = now - self.retention_millis();
            self.store
                .zremrangebyscore(&key, f64::NEG_INFINITY, (horizon - 1) as f64)
                .await?;
        }
        self.store
            .publish(&self.pub_channel(instance), &payload)
            .await?;
        Ok(())
    }

    /// Replay-log entries for the room at or after `since_millis`, ascending
    /// by timestamp with the envelope seq breaking same-millisecond ties.
    /// Fails with RangeOutOfBounds when `since_millis` predates the
    /// retention horizon.
    pub async fn get_missed_messages(
        &self,
        instance: &str,
        since_millis: i64,
    ) -> Result<Vec<RoomEvent>, WsError> {
        check_replay_window(since_millis, now_millis(), self.retention_millis())?;
        let entries = self
            .store
            .zrangebyscore(&emit_key(instance), since_millis as f64, f64::INFINITY)
            .await?;
        let mut events: Vec<(f64, EventEnvelope)> = Vec::with_capacity(entries.len());
        for (raw, score) in entries {
            match serde_json::from_str::<EventEnvelope>(&raw) {
                Ok(envelope) => events.push((score, envelope)),
                Err(err) => warn!("skipping malformed replay entry in {instance}: {err}"),
            }
        }
        events.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.seq.cmp(&b.1.seq))
        });
        Ok(events
            .into_iter()
            .map(|(_, envelope)| RoomEvent {
                event: envelope.event,
                data: envelope.data,
            })
            .collect())
    }

    /// Adds the connection to this node's subscriber index and announces the
    /// subscription to the cluster. Every node mutates only its own index:
    /// the control message is a no-op on nodes that do not own the
    /// connection, and the echo of our own message is idempotent.
    pub async fn subscribe(&self, instance: &str, connection_id: &str) -> Result<(), WsError> {
        self.join_local(instance, connection_id);
        self.store
            .publish(&self.sub_channel(instance), connection_id)
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, instance: &str, connection_id: &str) -> Result<(), WsError> {
        self.leave_local(instance, connection_id);
        self.store
            .publish(&self.uns_channel(instance), connection_id)
            .await?;
        Ok(())
    }

    pub fn register_connection(&self, handle: Arc<ConnectionHandle>) {
        self.connections.insert(handle.id().to_string(), handle);
    }

    pub fn remove_connection(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .remove(connection_id)
            .map(|(_, handle)| handle)
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_subscriber_count(&self, instance: &str) -> usize {
        self.rooms
            .get(instance)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    fn handle_store_message(&self, message: StoreMessage) {
        let Some((kind, instance)) = self.parse_channel(&message.channel) else {
            debug!("ignoring message on unrecognized channel {}", message.channel);
            return;
        };
        match kind {
            ControlKind::Publish => self.deliver_local(instance, &message.payload),
            ControlKind::Subscribe => {
                // Only the node owning the connection applies the join.
                if self.connections.contains_key(&message.payload) {
                    self.join_local(instance, &message.payload);
                }
            }
            ControlKind::Unsubscribe => self.leave_local(instance, &message.payload),
        }
    }

    fn deliver_local(&self, instance: &str, payload: &str) {
        let Some(subscribers) = self.rooms.get(instance) else {
            return;
        };
        let ids: Vec<String> = subscribers.iter().map(|id| id.key().clone()).collect();
        drop(subscribers);
        if ids.is_empty() {
            return;
        }
        let envelope: EventEnvelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping malformed cluster message for {instance}: {err}");
                return;
            }
        };
        let frame = ServerMessage::Event {
            room: instance.to_string(),
            event: envelope.event,
            data: envelope.data,
        };
        let mut dead = Vec::new();
        for id in ids {
            let delivered = self
                .connections
                .get(&id)
                .map(|handle| handle.send(&frame))
                .unwrap_or(false);
            if !delivered {
                dead.push(id);
            }
        }
        // Deferred cleanup: a closed connection never fails the delivery
        // loop, it just drops out of the index afterwards.
        for id in dead {
            self.leave_local(instance, &id);
        }
    }

    fn join_local(&self, instance: &str, connection_id: &str) {
        self.rooms
            .entry(instance.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    fn leave_local(&self, instance: &str, connection_id: &str) {
        let emptied = match self.rooms.get(instance) {
            Some(subscribers) => {
                subscribers.remove(connection_id);
                subscribers.is_empty()
            }
            None => false,
        };
        if emptied {
            // A concurrent join may land between the read and the removal;
            // remove_if re-checks emptiness under the write lock.
            self.rooms
                .remove_if(instance, |_, subscribers| subscribers.is_empty());
        }
    }

    fn parse_channel<'a>(&self, channel: &'a str) -> Option<(ControlKind, &'a str)> {
        let rest = channel
            .strip_prefix(self.channel_prefix.as_str())?
            .strip_prefix(':')?;
        if let Some(instance) = rest.strip_prefix("pub:") {
            Some((ControlKind::Publish, instance))
        } else if let Some(instance) = rest.strip_prefix("sub:") {
            Some((ControlKind::Subscribe, instance))
        } else if let Some(instance) = rest.strip_prefix("uns:") {
            Some((ControlKind::Unsubscribe, instance))
        } else {
            None
        }
    }

    fn pub_channel(&self, instance: &str) -> String {
        format!("{}:pub:{}", self.channel_prefix, instance)
    }

    fn sub_channel(&self, instance: &str) -> String {
        format!("{}:sub:{}", self.channel_prefix, instance)
    }

    fn uns_channel(&self, instance: &str) -> String {
        format!("{}:uns:{}", self.channel_prefix, instance)
    }

    fn retention_millis(&self) -> i64 {
        self.retention.as_millis() as i64
    }
}

pub(crate) fn emit_key(instance: &str) -> String {
    format!("ravel_broadcast_emit:{instance}")
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// RangeOutOfBounds when `since` strictly predates the retention horizon; a
/// request exactly at the horizon is satisfiable.
pub(crate) fn check_replay_window(
    since: i64,
    now: i64,
    retention_millis: i64,
) -> Result<(), WsError> {
    let horizon = now - retention_millis;
    if since < horizon {
        return Err(WsError::RangeOutOfBounds(format!(
            "replay from {since} predates retention horizon {horizon}"
        )));
    }
    Ok(())
}
