mod auth;
mod broadcast;
mod cli;
mod config;
mod errors;
mod handlers;
mod membership;
mod protocol;
mod resolver;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use shared_store::{MemoryStore, RedisStore, Store};

use crate::{
    auth::{ConnectionAuthorizer, HttpIdentityProvider, HttpProfileRegistry, KvSessionStore},
    broadcast::BroadcastBus,
    cli::{Cli, Commands},
    config::Config,
    handlers::health_check,
    membership::Membership,
    resolver::{AllowAuthenticated, RoomPattern, RoomResolver},
    websocket::{websocket_handler, AppState},
};

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let args = Cli::parse();

    if let Some(Commands::Probe {
        url,
        room,
        since,
        emit,
        session,
        cookie_name,
        secret,
        token,
        client,
    }) = args.command
    {
        if let Err(e) = cli::run_probe(
            url,
            room,
            since,
            emit,
            session,
            cookie_name,
            secret,
            token,
            client,
        )
        .await
        {
            error!("Probe error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    // Otherwise, run as server
    let config = Config::from_env();
    info!("Starting roomcast node on port {}", config.port);
    info!(
        "Replay retention: {} seconds, channel prefix: {}",
        config.replay_retention_seconds, config.channel_prefix
    );
    if config.cookie_secret == config::DEV_COOKIE_SECRET {
        warn!("ROOMCAST_COOKIE_SECRET not set, using the development secret");
    }

    let store: Arc<dyn Store> = match &config.redis_url {
        Some(url) => {
            info!("Redis URL: {}", url);
            match RedisStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Failed to connect to Redis: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            warn!("REDIS_URL not set, running single-node with the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    // The binary registers configured templates with the authenticated-users
    // predicate; applications embedding this crate supply their own
    // per-pattern authorizers.
    if config.room_templates.is_empty() {
        warn!("ROOMCAST_ROOMS is empty, every room operation will answer not_found");
    }
    let mut patterns = Vec::new();
    for template in &config.room_templates {
        match RoomPattern::new(template, Arc::new(AllowAuthenticated)) {
            Ok(pattern) => patterns.push(pattern),
            Err(e) => {
                error!("Invalid room template {}: {}", template, e);
                std::process::exit(1);
            }
        }
    }
    info!("Registered {} room pattern(s)", patterns.len());
    let resolver = Arc::new(RoomResolver::with_cache_capacity(
        patterns,
        config.resolver_cache_capacity,
    ));

    let bus = Arc::new(BroadcastBus::new(
        store.clone(),
        resolver.clone(),
        config.channel_prefix.clone(),
        Duration::from_secs(config.replay_retention_seconds),
    ));
    if let Err(e) = bus.start().await {
        error!("Failed to subscribe to the cluster namespace: {}", e);
        std::process::exit(1);
    }

    let mut authorizer = ConnectionAuthorizer::new(
        Arc::new(KvSessionStore::new(store.clone())),
        config.cookie_name.clone(),
        config.cookie_secret.clone(),
    );
    for (client_type, url) in &config.provider_urls {
        info!("Token provider for {}: {}", client_type, url);
        authorizer = authorizer.with_provider(
            client_type.clone(),
            Arc::new(HttpIdentityProvider::new(url.as_str())),
        );
    }
    if let Some(url) = &config.profile_registry_url {
        info!("Profile registry: {}", url);
        authorizer =
            authorizer.with_profile_registry(Arc::new(HttpProfileRegistry::new(url.as_str())));
    }

    let state = AppState::new(
        bus,
        resolver,
        Arc::new(authorizer),
        Membership::new(store),
    );
    state.spawn_heartbeat_monitor(
        Duration::from_secs(config.heartbeat_check_seconds),
        Duration::from_secs(config.heartbeat_timeout_seconds),
    );

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!("roomcast listening on {}", addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
