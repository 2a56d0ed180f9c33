use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use shared_store::{Store, StoreError};

use crate::broadcast::ConnectionHandle;
use crate::errors::WsError;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_HEADER: &str = "x-auth-token";
pub const CLIENT_HEADER: &str = "x-auth-client";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials presented")]
    MissingCredentials,
    #[error("unknown client type {0}")]
    UnknownClientType(String),
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error("profile lookup failed: {0}")]
    Lookup(String),
    #[error("no user registered for profile")]
    UnknownProfile,
    #[error("profile registry not configured")]
    RegistryUnavailable,
    #[error("invalid session cookie")]
    InvalidCookie,
    #[error("session not found")]
    SessionNotFound,
    #[error("session has no authenticated user")]
    AnonymousSession,
    #[error("session store error: {0}")]
    Store(String),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::Store(err.to_string())
    }
}

// Every authorizer rejection reaches socket callers under the single
// authentication code, wrapping the source message.
impl From<AuthError> for WsError {
    fn from(err: AuthError) -> Self {
        WsError::Authentication(err.to_string())
    }
}

/// Credentials captured from the upgrade request. Authorization itself runs
/// lazily, on the first room operation.
#[derive(Debug, Clone, Default)]
pub struct ConnectionIdentity {
    pub cookie_header: Option<String>,
    pub token: Option<String>,
    pub client_type: Option<String>,
}

impl ConnectionIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            cookie_header: value(header::COOKIE.as_str()),
            token: value(TOKEN_HEADER),
            client_type: value(CLIENT_HEADER),
        }
    }
}

/// A session record as the session layer persists it.
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub user_id: Option<String>,
}

/// The profile an identity provider vouches for.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub provider: String,
    pub subject: String,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, AuthError>;
}

/// Exchanges a bearer token for a profile. One provider per client type.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn exchange(&self, token: &str) -> Result<Profile, AuthError>;
}

/// Maps an exchanged profile to the stable user id the rest of the system
/// keys on.
#[async_trait]
pub trait ProfileRegistry: Send + Sync {
    async fn user_id_for(&self, profile: &Profile) -> Result<String, AuthError>;
}

/// Resolves connections to stable user ids.
pub struct ConnectionAuthorizer {
    sessions: Arc<dyn SessionStore>,
    providers: HashMap<String, Arc<dyn IdentityProvider>>,
    registry: Option<Arc<dyn ProfileRegistry>>,
    cookie_name: String,
    cookie_secret: String,
}

impl ConnectionAuthorizer {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        cookie_name: impl Into<String>,
        cookie_secret: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            providers: HashMap::new(),
            registry: None,
            cookie_name: cookie_name.into(),
            cookie_secret: cookie_secret.into(),
        }
    }

    pub fn with_provider(
        mut self,
        client_type: impl Into<String>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        self.providers.insert(client_type.into(), provider);
        self
    }

    pub fn with_profile_registry(mut self, registry: Arc<dyn ProfileRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Resolves credentials to a user id. A complete bearer header pair
    /// takes the provider-exchange path; anything else takes the signed
    /// session cookie path. Performs no membership or cache writes.
    pub async fn authorize(&self, identity: &ConnectionIdentity) -> Result<String, AuthError> {
        if let (Some(token), Some(client_type)) = (&identity.token, &identity.client_type) {
            return self.authorize_token(token, client_type).await;
        }
        self.authorize_cookie(identity).await
    }

    /// Connection-scoped memoizing wrapper: returns the cached id when
    /// present, otherwise authorizes once and caches the result on the
    /// connection for its lifetime.
    pub async fn user_id(&self, conn: &ConnectionHandle) -> Result<String, AuthError> {
        if let Some(cached) = conn.cached_user_id().await {
            return Ok(cached);
        }
        let user_id = self.authorize(conn.identity()).await?;
        conn.cache_user_id(user_id.clone()).await;
        Ok(user_id)
    }

    async fn authorize_token(&self, token: &str, client_type: &str) -> Result<String, AuthError> {
        let provider = self
            .providers
            .get(client_type)
            .ok_or_else(|| AuthError::UnknownClientType(client_type.to_string()))?;
        let profile = provider.exchange(token).await?;
        let registry = self.registry.as_ref().ok_or(AuthError::RegistryUnavailable)?;
        registry.user_id_for(&profile).await
    }

    async fn authorize_cookie(&self, identity: &ConnectionIdentity) -> Result<String, AuthError> {
        let raw = identity
            .cookie_header
            .as_deref()
            .ok_or(AuthError::MissingCredentials)?;
        let cookies = parse_cookie_header(raw);
        let session_id = cookies
            .get(self.cookie_name.as_str())
            .ok_or(AuthError::MissingCredentials)?;
        let signature_name = format!("{}.sig", self.cookie_name);
        let signature = cookies
            .get(signature_name.as_str())
            .ok_or(AuthError::InvalidCookie)?;
        let expected = compute_mac(self.cookie_secret.as_bytes(), &self.cookie_name, session_id);
        if *signature != expected {
            return Err(AuthError::InvalidCookie);
        }
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or(AuthError::SessionNotFound)?;
        session.user_id.ok_or(AuthError::AnonymousSession)
    }
}

fn parse_cookie_header(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Signature over `name=value`, matching the companion `.sig` cookie the
/// session layer issues.
pub(crate) fn compute_mac(secret: &[u8], name: &str, value: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("invalid hmac key");
    mac.update(name.as_bytes());
    mac.update(b"=");
    mac.update(value.as_bytes());
    let result = mac.finalize().into_bytes();
    URL_SAFE_NO_PAD.encode(result)
}

/// Session records stored as JSON under `session:<id>` in the shared store.
pub struct KvSessionStore {
    store: Arc<dyn Store>,
}

impl KvSessionStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionStore for KvSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<Session>, AuthError> {
        let Some(raw) = self.store.get(&session_key(session_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| AuthError::Store(format!("malformed session record: {err}")))
    }
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Token exchange against a remote auth endpoint.
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpIdentityProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn exchange(&self, token: &str) -> Result<Profile, AuthError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|err| AuthError::Exchange(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::Exchange(format!(
                "exchange endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<Profile>()
            .await
            .map_err(|err| AuthError::Exchange(err.to_string()))
    }
}

/// Profile-to-user lookup against a remote registry endpoint.
pub struct HttpProfileRegistry {
    client: reqwest::Client,
    url: String,
}

impl HttpProfileRegistry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProfileUserResponse {
    #[serde(default)]
    user_id: Option<String>,
}

#[async_trait]
impl ProfileRegistry for HttpProfileRegistry {
    async fn user_id_for(&self, profile: &Profile) -> Result<String, AuthError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "provider": profile.provider,
                "subject": profile.subject,
            }))
            .send()
            .await
            .map_err(|err| AuthError::Lookup(err.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AuthError::UnknownProfile);
        }
        if !response.status().is_success() {
            return Err(AuthError::Lookup(format!(
                "registry endpoint returned {}",
                response.status()
            )));
        }
        let body: ProfileUserResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Lookup(err.to_string()))?;
        body.user_id.ok_or(AuthError::UnknownProfile)
    }
}
