use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::auth::{compute_mac, CLIENT_HEADER, TOKEN_HEADER};
use crate::protocol::ServerMessage;

#[derive(Parser, Debug)]
#[command(name = "roomcast")]
#[command(about = "Clustered WebSocket room server and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as server (default behavior if no command specified)
    #[arg(long)]
    pub server: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a running node, subscribe to a room and tail its events
    Probe {
        /// Node URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Room path to subscribe to
        #[arg(short, long)]
        room: String,

        /// Replay messages emitted since this epoch-millis timestamp
        #[arg(long)]
        since: Option<i64>,

        /// Emit an event after subscribing: EVENT MESSAGE
        #[arg(long, num_args = 2, value_names = ["EVENT", "MESSAGE"])]
        emit: Option<Vec<String>>,

        /// Session id; signed into a cookie with --secret
        #[arg(long)]
        session: Option<String>,

        /// Cookie name the node expects
        #[arg(long, default_value = "roomcast.sid")]
        cookie_name: String,

        /// Cookie secret the node signs sessions with
        #[arg(long, default_value = crate::config::DEV_COOKIE_SECRET)]
        secret: String,

        /// Bearer token (requires --client)
        #[arg(long)]
        token: Option<String>,

        /// Client type selecting the token's identity provider
        #[arg(long)]
        client: Option<String>,
    },
}

#[allow(clippy::too_many_arguments)]
pub async fn run_probe(
    url: String,
    room: String,
    since: Option<i64>,
    emit: Option<Vec<String>>,
    session: Option<String>,
    cookie_name: String,
    secret: String,
    token: Option<String>,
    client: Option<String>,
) -> Result<()> {
    let ws_url = format!("{url}/ws");
    debug!("Connecting to {} for room {}", ws_url, room);

    let mut request = ws_url.as_str().into_client_request()?;
    if let Some(session) = &session {
        let sig = compute_mac(secret.as_bytes(), &cookie_name, session);
        let cookie = format!("{cookie_name}={session}; {cookie_name}.sig={sig}");
        request
            .headers_mut()
            .insert("cookie", HeaderValue::from_str(&cookie)?);
    }
    if let Some(token) = &token {
        request
            .headers_mut()
            .insert(TOKEN_HEADER, HeaderValue::from_str(token)?);
        let client = client
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--token requires --client"))?;
        request
            .headers_mut()
            .insert(CLIENT_HEADER, HeaderValue::from_str(client)?);
    }

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(request)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!("Connection timeout - is the node running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let mut subscribe = json!({ "type": "subscribe", "room": room });
    if let Some(since) = since {
        subscribe["lastDisconnectTime"] = json!(since);
    }
    write
        .send(Message::Text(subscribe.to_string().into()))
        .await?;

    // Wait for the subscribe reply before emitting or tailing.
    let reply = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                let frame: ServerMessage = serde_json::from_str(&text)?;
                match frame {
                    ServerMessage::Subscribed { room, missed, .. } => {
                        return Ok::<_, anyhow::Error>((room, missed));
                    }
                    ServerMessage::Error { code, message, .. } => {
                        return Err(anyhow::anyhow!("Subscribe failed: {code}: {message}"));
                    }
                    _ => {}
                }
            }
        }
        Err(anyhow::anyhow!("Connection closed unexpectedly"))
    })
    .await;

    let (joined, missed) = match reply {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            error!("Timeout waiting for subscribe reply");
            return Err(anyhow::anyhow!("Node did not answer the subscribe"));
        }
    };
    println!("subscribed to {joined}");
    for event in missed.into_iter().flatten() {
        println!("missed {} {}", event.event, event.data);
    }

    if let Some(emit) = emit {
        let frame = json!({
            "type": "emit",
            "room": joined,
            "event": emit[0],
            "message": emit[1],
        });
        write.send(Message::Text(frame.to_string().into())).await?;
        debug!("emitted {} to {}", emit[0], joined);
    }

    // Tail events until the node closes the socket or the user interrupts.
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::Event { room, event, data }) => {
                    println!("{room} {event} {data}");
                }
                Ok(ServerMessage::Error { code, message, .. }) => {
                    error!("node error {code}: {message}");
                }
                Ok(_) => {}
                Err(err) => debug!("skipping unparseable frame: {err}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
