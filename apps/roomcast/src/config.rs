use std::env;

pub const DEV_COOKIE_SECRET: &str = "roomcast-dev-secret";

/// Runtime configuration, read from the environment with per-field
/// fallbacks.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Redis connection string; unset runs the node against the in-memory
    /// store (single-node development only).
    pub redis_url: Option<String>,
    pub channel_prefix: String,
    pub replay_retention_seconds: u64,
    pub resolver_cache_capacity: usize,
    /// Comma-separated room templates, e.g.
    /// `/workspaces/:workspaceId,/test/:id`.
    pub room_templates: Vec<String>,
    pub cookie_name: String,
    pub cookie_secret: String,
    /// Comma-separated `client_type=url` pairs for token exchange endpoints.
    pub provider_urls: Vec<(String, String)>,
    pub profile_registry_url: Option<String>,
    pub heartbeat_check_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let room_templates = env::var("ROOMCAST_ROOMS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();
        let provider_urls = env::var("ROOMCAST_PROVIDERS")
            .map(|raw| {
                split_list(&raw)
                    .iter()
                    .filter_map(|pair| {
                        pair.split_once('=')
                            .map(|(client, url)| (client.to_string(), url.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            port: env::var("ROOMCAST_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL").ok(),
            channel_prefix: env::var("ROOMCAST_CHANNEL_PREFIX")
                .unwrap_or_else(|_| "roomcast".to_string()),
            replay_retention_seconds: env::var("ROOMCAST_REPLAY_RETENTION")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(300), // 5 minutes
            resolver_cache_capacity: env::var("ROOMCAST_RESOLVER_CACHE_CAPACITY")
                .ok()
                .and_then(|c| c.parse().ok())
                .unwrap_or(crate::resolver::DEFAULT_CACHE_CAPACITY),
            room_templates,
            cookie_name: env::var("ROOMCAST_COOKIE_NAME")
                .unwrap_or_else(|_| "roomcast.sid".to_string()),
            cookie_secret: env::var("ROOMCAST_COOKIE_SECRET")
                .unwrap_or_else(|_| DEV_COOKIE_SECRET.to_string()),
            provider_urls,
            profile_registry_url: env::var("ROOMCAST_REGISTRY_URL").ok(),
            heartbeat_check_seconds: env::var("ROOMCAST_HEARTBEAT_CHECK")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(10),
            heartbeat_timeout_seconds: env::var("ROOMCAST_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            channel_prefix: "roomcast".to_string(),
            replay_retention_seconds: 300,
            resolver_cache_capacity: crate::resolver::DEFAULT_CACHE_CAPACITY,
            room_templates: Vec::new(),
            cookie_name: "roomcast.sid".to_string(),
            cookie_secret: DEV_COOKIE_SECRET.to_string(),
            provider_urls: Vec::new(),
            profile_registry_url: None,
            heartbeat_check_seconds: 10,
            heartbeat_timeout_seconds: 60,
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
