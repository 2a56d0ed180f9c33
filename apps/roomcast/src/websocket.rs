use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{ConnectionAuthorizer, ConnectionIdentity};
use crate::broadcast::{BroadcastBus, ConnectionHandle, Outbound};
use crate::errors::WsError;
use crate::membership::Membership;
use crate::protocol::{
    generate_connection_id, require_event, require_room, ClientMessage, ServerMessage,
    USER_CONNECTED_EVENT, USER_DISCONNECTED_EVENT,
};
use crate::resolver::{ResolvedRoom, RoomResolver};

/// Shared state for the WebSocket layer and the health endpoint.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<BroadcastBus>,
    pub resolver: Arc<RoomResolver>,
    pub authorizer: Arc<ConnectionAuthorizer>,
    pub membership: Membership,
}

impl AppState {
    pub fn new(
        bus: Arc<BroadcastBus>,
        resolver: Arc<RoomResolver>,
        authorizer: Arc<ConnectionAuthorizer>,
        membership: Membership,
    ) -> Self {
        Self {
            bus,
            resolver,
            authorizer,
            membership,
        }
    }

    /// Spawns the monitor that evicts connections whose heartbeat went
    /// stale, running the same cleanup as a transport close.
    pub fn spawn_heartbeat_monitor(
        &self,
        check_interval: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move { state.monitor_heartbeats(check_interval, timeout).await })
    }

    async fn monitor_heartbeats(&self, check_interval: Duration, timeout: Duration) {
        let mut interval = tokio::time::interval(check_interval);
        loop {
            interval.tick().await;

            // Collect handles first; reading a heartbeat awaits its lock and
            // must not happen under a DashMap guard.
            let mut stale = Vec::new();
            for handle in self.bus.all_connections() {
                if handle.heartbeat_elapsed().await > timeout {
                    stale.push(handle);
                }
            }

            for handle in stale {
                info!("evicting connection {} (heartbeat timeout)", handle.id());
                handle.close();
                cleanup_connection(self, handle.id()).await;
            }
        }
    }
}

/// WebSocket upgrade endpoint. Credentials are captured from the upgrade
/// request's headers; authorization itself runs lazily on the first room
/// operation.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let identity = ConnectionIdentity::from_headers(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: ConnectionIdentity) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = Arc::new(ConnectionHandle::new(
        generate_connection_id(),
        tx,
        identity,
    ));
    state.bus.register_connection(conn.clone());

    // Forward queued frames to the socket until the connection closes.
    let writer_conn = conn.id().to_string();
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(message) => {
                    let Ok(frame) = serde_json::to_string(&message) else {
                        continue;
                    };
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!("writer task ended for connection {writer_conn}");
    });

    info!("connection {} established", conn.id());

    // Inbound requests on one connection are handled sequentially, so two
    // handlers never race this connection's state.
    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!("socket error on connection {}: {err}", conn.id());
                break;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    let request_id = message.request_id().map(str::to_string);
                    if let Err(err) = handle_client_message(&state, &conn, message).await {
                        debug!("request on connection {} failed: {err}", conn.id());
                        conn.send(&error_frame(&err, request_id));
                    }
                }
                Err(err) => {
                    conn.send(&error_frame(
                        &WsError::IllegalValue(format!("malformed frame: {err}")),
                        None,
                    ));
                }
            },
            Message::Close(_) => break,
            // The heartbeat rides the JSON ping event; transport-level
            // ping/pong and binary frames are ignored.
            _ => {}
        }
    }

    cleanup_connection(&state, conn.id()).await;
    info!("connection {} closed", conn.id());
}

fn error_frame(err: &WsError, id: Option<String>) -> ServerMessage {
    ServerMessage::Error {
        code: err.code().to_string(),
        message: err.to_string(),
        id,
    }
}

/// Common preamble for room operations: the room path resolves against a
/// registered pattern and the caller has a user id, in that order.
async fn resolve_and_authenticate(
    state: &AppState,
    conn: &Arc<ConnectionHandle>,
    path: &str,
) -> Result<(Arc<ResolvedRoom>, String), WsError> {
    let resolved = state
        .resolver
        .resolve(path)
        .ok_or_else(|| WsError::NotFound(format!("no registered room matches {path}")))?;
    let user_id = state.authorizer.user_id(conn).await?;
    Ok((resolved, user_id))
}

/// Membership gate for operations requiring the caller to already be in the
/// room.
async fn require_member(state: &AppState, instance: &str, user_id: &str) -> Result<(), WsError> {
    if state.membership.is_member(instance, user_id).await? {
        return Ok(());
    }
    Err(WsError::Access(format!(
        "{user_id} is not a member of {instance}"
    )))
}

/// Presence broadcasts run after the caller got its reply and never reach
/// the replay cache. The primary request already succeeded, so failures here
/// are logged and swallowed rather than surfaced.
async fn presence(state: &AppState, instance: &str, event: &str, user_id: &str) {
    if let Err(err) = state.bus.publish(instance, event, json!(user_id), true).await {
        warn!("presence broadcast {event} for {instance} failed: {err}");
    }
}

/// Applies one inbound request. Success replies are sent from in here,
/// before any follow-up presence broadcast; an `Err` means no success frame
/// was sent and the receive loop answers with the error frame instead.
async fn handle_client_message(
    state: &AppState,
    conn: &Arc<ConnectionHandle>,
    message: ClientMessage,
) -> Result<(), WsError> {
    match message {
        ClientMessage::Subscribe {
            room,
            last_disconnect_time,
            id,
        } => {
            let path = require_room(&room)?;
            let (resolved, user_id) = resolve_and_authenticate(state, conn, path).await?;
            let allowed = resolved
                .pattern
                .authorize(&user_id, &resolved.params)
                .await
                .map_err(|err| WsError::Access(err.to_string()))?;
            if !allowed {
                return Err(WsError::Access(format!(
                    "{user_id} may not join {}",
                    resolved.instance
                )));
            }

            state.bus.subscribe(&resolved.instance, conn.id()).await?;
            state.membership.add(&resolved.instance, &user_id).await?;

            // A replay request that cannot be satisfied answers with the
            // error; the subscription itself stands, the client falls back
            // to a full refresh, and peers still see the join below.
            let missed = match last_disconnect_time {
                Some(since) => match state
                    .bus
                    .get_missed_messages(&resolved.instance, since)
                    .await
                {
                    Ok(missed) => Some(missed),
                    Err(err) => {
                        conn.send(&error_frame(&err, id));
                        presence(state, &resolved.instance, USER_CONNECTED_EVENT, &user_id)
                            .await;
                        return Ok(());
                    }
                },
                None => None,
            };
            conn.send(&ServerMessage::Subscribed {
                room: resolved.instance.clone(),
                missed,
                id,
            });

            presence(state, &resolved.instance, USER_CONNECTED_EVENT, &user_id).await;
        }

        ClientMessage::Unsubscribe { room, id } => {
            let path = require_room(&room)?;
            let (resolved, user_id) = resolve_and_authenticate(state, conn, path).await?;

            state.bus.unsubscribe(&resolved.instance, conn.id()).await?;
            state.membership.remove(&resolved.instance, &user_id).await?;

            conn.send(&ServerMessage::Unsubscribed {
                room: resolved.instance.clone(),
                id,
            });

            presence(state, &resolved.instance, USER_DISCONNECTED_EVENT, &user_id).await;
        }

        ClientMessage::GetConnectedUsers { room, id } => {
            let path = require_room(&room)?;
            let (resolved, user_id) = resolve_and_authenticate(state, conn, path).await?;
            require_member(state, &resolved.instance, &user_id).await?;

            let users = state.membership.members(&resolved.instance).await?;
            conn.send(&ServerMessage::ConnectedUsers {
                room: resolved.instance.clone(),
                users,
                id,
            });
        }

        ClientMessage::Emit {
            room,
            event,
            message,
            id: _,
        } => {
            let path = require_room(&room)?;
            let event = require_event(&event)?.to_string();
            let (resolved, user_id) = resolve_and_authenticate(state, conn, path).await?;
            require_member(state, &resolved.instance, &user_id).await?;

            // Fire-and-forget: only failures produce a reply.
            state
                .bus
                .publish(
                    &resolved.instance,
                    &event,
                    message.unwrap_or(Value::Null),
                    false,
                )
                .await?;
        }

        ClientMessage::Ping => {
            conn.touch().await;
            conn.send(&ServerMessage::Pong);
        }
    }
    Ok(())
}

/// Transport-close cleanup, run exactly once per connection: the heartbeat
/// monitor and the socket loop can both arrive here.
async fn cleanup_connection(state: &AppState, connection_id: &str) {
    let Some(handle) = state.bus.remove_connection(connection_id) else {
        return;
    };
    disconnect(state, &handle).await;
}

/// Clears every room the disconnected user belongs to. A connection that
/// never authorized has nothing to clear and is a silent no-op. There is no
/// caller left to answer, so store failures are logged and the sweep
/// continues.
async fn disconnect(state: &AppState, handle: &ConnectionHandle) {
    let Some(user_id) = handle.cached_user_id().await else {
        debug!("connection {} closed before authorizing", handle.id());
        return;
    };
    let rooms = match state.membership.rooms_of(&user_id).await {
        Ok(rooms) => rooms,
        Err(err) => {
            warn!("disconnect room lookup for {user_id} failed: {err}");
            return;
        }
    };
    for instance in &rooms {
        if let Err(err) = state.bus.unsubscribe(instance, handle.id()).await {
            warn!("disconnect unsubscribe from {instance} failed: {err}");
        }
        if let Err(err) = state.membership.remove(instance, &user_id).await {
            warn!("disconnect membership removal from {instance} failed: {err}");
        }
        presence(state, instance, USER_DISCONNECTED_EVENT, &user_id).await;
    }
    if let Err(err) = state.membership.clear_user(&user_id).await {
        warn!("clearing room index for {user_id} failed: {err}");
    }
    debug!(
        "connection {} for {user_id} left {} room(s)",
        handle.id(),
        rooms.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{compute_mac, AuthError, Session, SessionStore};
    use crate::broadcast::emit_key;
    use crate::protocol::RoomEvent;
    use crate::resolver::{AllowAuthenticated, RoomAuthorizer, RoomPattern};
    use async_trait::async_trait;
    use shared_store::{MemoryStore, Store};
    use std::collections::HashMap;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::{sleep, timeout};

    const COOKIE_NAME: &str = "roomcast.sid";
    const COOKIE_SECRET: &str = "test-secret";

    /// Treats the session id itself as the authenticated user id.
    struct EchoSessions;

    #[async_trait]
    impl SessionStore for EchoSessions {
        async fn get(&self, session_id: &str) -> Result<Option<Session>, AuthError> {
            Ok(Some(Session {
                user_id: Some(session_id.to_string()),
            }))
        }
    }

    struct OnlyAlice;

    #[async_trait]
    impl RoomAuthorizer for OnlyAlice {
        async fn authorize(
            &self,
            user_id: &str,
            _params: &HashMap<String, String>,
        ) -> anyhow::Result<bool> {
            Ok(user_id == "alice")
        }
    }

    fn test_state(store: Arc<dyn Store>) -> AppState {
        let patterns = vec![
            RoomPattern::new("/test/:id", Arc::new(AllowAuthenticated)).unwrap(),
            RoomPattern::new("/private/:id", Arc::new(OnlyAlice)).unwrap(),
        ];
        let resolver = Arc::new(RoomResolver::new(patterns));
        let bus = Arc::new(BroadcastBus::new(
            store.clone(),
            resolver.clone(),
            "rc",
            Duration::from_secs(60),
        ));
        let authorizer = Arc::new(ConnectionAuthorizer::new(
            Arc::new(EchoSessions),
            COOKIE_NAME,
            COOKIE_SECRET,
        ));
        AppState::new(bus, resolver, authorizer, Membership::new(store))
    }

    fn identity_for(user: &str) -> ConnectionIdentity {
        let sig = compute_mac(COOKIE_SECRET.as_bytes(), COOKIE_NAME, user);
        ConnectionIdentity {
            cookie_header: Some(format!("{COOKIE_NAME}={user}; {COOKIE_NAME}.sig={sig}")),
            ..Default::default()
        }
    }

    fn attach(
        state: &AppState,
        identity: ConnectionIdentity,
    ) -> (Arc<ConnectionHandle>, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ConnectionHandle::new(
            generate_connection_id(),
            tx,
            identity,
        ));
        state.bus.register_connection(conn.clone());
        (conn, rx)
    }

    fn connect_as(
        state: &AppState,
        user: &str,
    ) -> (Arc<ConnectionHandle>, UnboundedReceiver<Outbound>) {
        attach(state, identity_for(user))
    }

    fn subscribe_msg(room: &str) -> ClientMessage {
        ClientMessage::Subscribe {
            room: Some(json!(room)),
            last_disconnect_time: None,
            id: None,
        }
    }

    async fn next_frame(rx: &mut UnboundedReceiver<Outbound>) -> ServerMessage {
        match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(Outbound::Frame(message))) => message,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    async fn next_event_named(rx: &mut UnboundedReceiver<Outbound>, name: &str) -> Value {
        loop {
            if let ServerMessage::Event { event, data, .. } = next_frame(rx).await {
                if event == name {
                    return data;
                }
            }
        }
    }

    #[tokio::test]
    async fn subscribe_joins_room_and_replies() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (conn, mut rx) = connect_as(&state, "alice");

        handle_client_message(&state, &conn, subscribe_msg("/test/1"))
            .await
            .unwrap();

        match next_frame(&mut rx).await {
            ServerMessage::Subscribed { room, missed, id } => {
                assert_eq!(room, "/test/1");
                assert!(missed.is_none());
                assert!(id.is_none());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(
            state.membership.members("/test/1").await.unwrap(),
            vec!["alice"]
        );
        assert_eq!(state.bus.room_subscriber_count("/test/1"), 1);
    }

    #[tokio::test]
    async fn subscribe_reply_precedes_presence_broadcast() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let _pump = state.bus.start().await.unwrap();
        let (conn, mut rx) = connect_as(&state, "alice");

        handle_client_message(&state, &conn, subscribe_msg("/test/1"))
            .await
            .unwrap();

        assert!(matches!(
            next_frame(&mut rx).await,
            ServerMessage::Subscribed { .. }
        ));
        let data = next_event_named(&mut rx, USER_CONNECTED_EVENT).await;
        assert_eq!(data, json!("alice"));
    }

    #[tokio::test]
    async fn resubscribing_does_not_grow_the_member_set() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (conn, _rx) = connect_as(&state, "alice");

        handle_client_message(&state, &conn, subscribe_msg("/test/1"))
            .await
            .unwrap();
        handle_client_message(&state, &conn, subscribe_msg("/test/1"))
            .await
            .unwrap();

        assert_eq!(state.membership.members("/test/1").await.unwrap().len(), 1);
        assert_eq!(state.bus.room_subscriber_count("/test/1"), 1);
    }

    #[tokio::test]
    async fn subscribe_without_room_is_illegal_value_without_mutation() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());
        let (conn, mut rx) = connect_as(&state, "alice");

        let err = handle_client_message(
            &state,
            &conn,
            ClientMessage::Subscribe {
                room: None,
                last_disconnect_time: None,
                id: None,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WsError::IllegalValue(_)));
        assert_eq!(state.bus.room_count(), 0);
        assert!(store.smembers("ws_user:alice").await.unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_room_is_not_found() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (conn, _rx) = connect_as(&state, "alice");

        let err = handle_client_message(&state, &conn, subscribe_msg("/nope/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::NotFound(_)));
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn unauthenticated_caller_gets_authentication_error() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (conn, _rx) = attach(&state, ConnectionIdentity::default());

        let err = handle_client_message(&state, &conn, subscribe_msg("/test/1"))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Authentication(_)));
        assert_eq!(err.code(), "authentication");
        assert!(state.membership.members("/test/1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_denied_by_room_authorizer() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);

        let (bob, _rx) = connect_as(&state, "bob");
        let err = handle_client_message(&state, &bob, subscribe_msg("/private/7"))
            .await
            .unwrap_err();
        assert!(matches!(err, WsError::Access(_)));
        assert!(state
            .membership
            .members("/private/7")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(state.bus.room_subscriber_count("/private/7"), 0);

        let (alice, _rx) = connect_as(&state, "alice");
        handle_client_message(&state, &alice, subscribe_msg("/private/7"))
            .await
            .unwrap();
        assert_eq!(
            state.membership.members("/private/7").await.unwrap(),
            vec!["alice"]
        );
    }

    #[tokio::test]
    async fn resubscribe_with_last_disconnect_time_replays_missed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let before = chrono::Utc::now().timestamp_millis();
        state
            .bus
            .publish("/test/1", "ping", json!("hello"), false)
            .await
            .unwrap();

        let (conn, mut rx) = connect_as(&state, "alice");
        handle_client_message(
            &state,
            &conn,
            ClientMessage::Subscribe {
                room: Some(json!("/test/1")),
                last_disconnect_time: Some(before),
                id: None,
            },
        )
        .await
        .unwrap();

        match next_frame(&mut rx).await {
            ServerMessage::Subscribed {
                missed: Some(missed),
                ..
            } => {
                assert_eq!(
                    missed,
                    vec![RoomEvent {
                        event: "ping".to_string(),
                        data: json!("hello"),
                    }]
                );
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_replay_request_errors_but_keeps_subscription_and_presence() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let _pump = state.bus.start().await.unwrap();
        let (conn, mut rx) = connect_as(&state, "alice");

        handle_client_message(
            &state,
            &conn,
            ClientMessage::Subscribe {
                room: Some(json!("/test/1")),
                last_disconnect_time: Some(chrono::Utc::now().timestamp_millis() - 120_000),
                id: Some("req-7".to_string()),
            },
        )
        .await
        .unwrap();

        // The unsatisfiable replay answers with the error, but the caller
        // stays subscribed and peers still see the join.
        match next_frame(&mut rx).await {
            ServerMessage::Error { code, id, .. } => {
                assert_eq!(code, "range_out_of_bounds");
                assert_eq!(id.as_deref(), Some("req-7"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(state.membership.is_member("/test/1", "alice").await.unwrap());
        assert_eq!(state.bus.room_subscriber_count("/test/1"), 1);
        let data = next_event_named(&mut rx, USER_CONNECTED_EVENT).await;
        assert_eq!(data, json!("alice"));
    }

    #[tokio::test]
    async fn replies_echo_the_request_id() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (conn, mut rx) = connect_as(&state, "alice");

        handle_client_message(
            &state,
            &conn,
            ClientMessage::Subscribe {
                room: Some(json!("/test/1")),
                last_disconnect_time: None,
                id: Some("req-1".to_string()),
            },
        )
        .await
        .unwrap();
        handle_client_message(
            &state,
            &conn,
            ClientMessage::Unsubscribe {
                room: Some(json!("/test/1")),
                id: Some("req-2".to_string()),
            },
        )
        .await
        .unwrap();

        match next_frame(&mut rx).await {
            ServerMessage::Subscribed { id, .. } => assert_eq!(id.as_deref(), Some("req-1")),
            other => panic!("unexpected reply: {other:?}"),
        }
        match next_frame(&mut rx).await {
            ServerMessage::Unsubscribed { id, .. } => assert_eq!(id.as_deref(), Some("req-2")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_removes_membership_and_replies() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());
        let (conn, mut rx) = connect_as(&state, "alice");

        handle_client_message(&state, &conn, subscribe_msg("/test/1"))
            .await
            .unwrap();
        handle_client_message(
            &state,
            &conn,
            ClientMessage::Unsubscribe {
                room: Some(json!("/test/1")),
                id: None,
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            next_frame(&mut rx).await,
            ServerMessage::Subscribed { .. }
        ));
        assert!(matches!(
            next_frame(&mut rx).await,
            ServerMessage::Unsubscribed { .. }
        ));
        assert!(state.membership.members("/test/1").await.unwrap().is_empty());
        assert!(store.smembers("ws_user:alice").await.unwrap().is_empty());
        assert_eq!(state.bus.room_subscriber_count("/test/1"), 0);
    }

    #[tokio::test]
    async fn get_connected_users_requires_membership() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (alice, _arx) = connect_as(&state, "alice");
        handle_client_message(&state, &alice, subscribe_msg("/test/1"))
            .await
            .unwrap();

        let (bob, _brx) = connect_as(&state, "bob");
        let err = handle_client_message(
            &state,
            &bob,
            ClientMessage::GetConnectedUsers {
                room: Some(json!("/test/1")),
                id: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WsError::Access(_)));
    }

    #[tokio::test]
    async fn get_connected_users_lists_the_member_set() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (alice, _arx) = connect_as(&state, "alice");
        let (bob, mut brx) = connect_as(&state, "bob");
        handle_client_message(&state, &alice, subscribe_msg("/test/1"))
            .await
            .unwrap();
        handle_client_message(&state, &bob, subscribe_msg("/test/1"))
            .await
            .unwrap();

        handle_client_message(
            &state,
            &bob,
            ClientMessage::GetConnectedUsers {
                room: Some(json!("/test/1")),
                id: None,
            },
        )
        .await
        .unwrap();

        assert!(matches!(
            next_frame(&mut brx).await,
            ServerMessage::Subscribed { .. }
        ));
        match next_frame(&mut brx).await {
            ServerMessage::ConnectedUsers {
                room, mut users, ..
            } => {
                users.sort();
                assert_eq!(room, "/test/1");
                assert_eq!(users, vec!["alice", "bob"]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_reaches_every_local_subscriber() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let _pump = state.bus.start().await.unwrap();

        let (alice, mut arx) = connect_as(&state, "alice");
        let (bob, mut brx) = connect_as(&state, "bob");
        handle_client_message(&state, &alice, subscribe_msg("/test/1"))
            .await
            .unwrap();
        handle_client_message(&state, &bob, subscribe_msg("/test/1"))
            .await
            .unwrap();

        handle_client_message(
            &state,
            &alice,
            ClientMessage::Emit {
                room: Some(json!("/test/1")),
                event: Some(json!("ping")),
                message: Some(json!("hello")),
                id: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(next_event_named(&mut arx, "ping").await, json!("hello"));
        assert_eq!(next_event_named(&mut brx, "ping").await, json!("hello"));
    }

    #[tokio::test]
    async fn emit_requires_membership_and_a_string_event() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());
        let (alice, _arx) = connect_as(&state, "alice");
        handle_client_message(&state, &alice, subscribe_msg("/test/1"))
            .await
            .unwrap();

        let err = handle_client_message(
            &state,
            &alice,
            ClientMessage::Emit {
                room: Some(json!("/test/1")),
                event: None,
                message: None,
                id: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WsError::IllegalValue(_)));

        let (bob, _brx) = connect_as(&state, "bob");
        let err = handle_client_message(
            &state,
            &bob,
            ClientMessage::Emit {
                room: Some(json!("/test/1")),
                event: Some(json!("ping")),
                message: Some(json!("hi")),
                id: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WsError::Access(_)));
        // The denied emit never reached the replay log.
        assert!(store
            .zrangebyscore(&emit_key("/test/1"), f64::NEG_INFINITY, f64::INFINITY)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn disconnect_clears_every_room_of_the_user() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());
        let (conn, _rx) = connect_as(&state, "alice");
        handle_client_message(&state, &conn, subscribe_msg("/test/1"))
            .await
            .unwrap();
        handle_client_message(&state, &conn, subscribe_msg("/test/2"))
            .await
            .unwrap();

        cleanup_connection(&state, conn.id()).await;

        assert!(state.membership.members("/test/1").await.unwrap().is_empty());
        assert!(state.membership.members("/test/2").await.unwrap().is_empty());
        assert!(store.smembers("ws_user:alice").await.unwrap().is_empty());
        assert_eq!(state.bus.room_subscriber_count("/test/1"), 0);
        assert_eq!(state.bus.connection_count(), 0);
        // Presence events skip the replay cache.
        assert!(store
            .zrangebyscore(&emit_key("/test/1"), f64::NEG_INFINITY, f64::INFINITY)
            .await
            .unwrap()
            .is_empty());

        // A second cleanup for the same connection is a no-op.
        cleanup_connection(&state, conn.id()).await;
    }

    #[tokio::test]
    async fn disconnect_before_authorizing_is_a_silent_noop() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (conn, _rx) = attach(&state, ConnectionIdentity::default());

        cleanup_connection(&state, conn.id()).await;
        assert_eq!(state.bus.connection_count(), 0);
    }

    #[tokio::test]
    async fn ping_refreshes_the_heartbeat_and_pongs() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (conn, mut rx) = connect_as(&state, "alice");

        sleep(Duration::from_millis(30)).await;
        handle_client_message(&state, &conn, ClientMessage::Ping)
            .await
            .unwrap();

        assert!(conn.heartbeat_elapsed().await < Duration::from_millis(25));
        assert!(matches!(next_frame(&mut rx).await, ServerMessage::Pong));
    }

    #[tokio::test]
    async fn heartbeat_monitor_evicts_stale_connections() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let state = test_state(store);
        let (conn, mut rx) = connect_as(&state, "alice");
        handle_client_message(&state, &conn, subscribe_msg("/test/1"))
            .await
            .unwrap();

        let _monitor = state
            .spawn_heartbeat_monitor(Duration::from_millis(10), Duration::from_millis(50));
        sleep(Duration::from_millis(200)).await;

        assert_eq!(state.bus.connection_count(), 0);
        assert!(state.membership.members("/test/1").await.unwrap().is_empty());

        let mut saw_close = false;
        while let Ok(outbound) = rx.try_recv() {
            if matches!(outbound, Outbound::Close) {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }
}
