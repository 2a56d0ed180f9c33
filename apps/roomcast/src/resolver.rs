use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;

use crate::errors::WsError;

pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Application predicate deciding whether a user may join a room instance.
#[async_trait]
pub trait RoomAuthorizer: Send + Sync {
    async fn authorize(
        &self,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> anyhow::Result<bool>;
}

/// Admits any caller that resolved to a user id.
pub struct AllowAuthenticated;

#[async_trait]
impl RoomAuthorizer for AllowAuthenticated {
    async fn authorize(
        &self,
        _user_id: &str,
        _params: &HashMap<String, String>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// A registered room template plus its authorization predicate.
pub struct RoomPattern {
    name: String,
    params: Vec<String>,
    regex: Regex,
    authorize: Arc<dyn RoomAuthorizer>,
}

impl RoomPattern {
    /// Compiles a path template such as `/workspaces/:workspaceId/tasks/:taskId`.
    /// A `:name` segment captures exactly one path segment; capture order
    /// equals parameter declaration order.
    pub fn new(template: &str, authorize: Arc<dyn RoomAuthorizer>) -> Result<Self, WsError> {
        let (params, regex) = compile_template(template)?;
        Ok(Self {
            name: template.to_string(),
            params,
            regex,
            authorize,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn authorize(
        &self,
        user_id: &str,
        params: &HashMap<String, String>,
    ) -> anyhow::Result<bool> {
        self.authorize.authorize(user_id, params).await
    }
}

/// A concrete room path matched against a pattern. The path string itself is
/// the room's cluster-wide identity, used directly as a key into the local
/// subscriber index and the shared store.
pub struct ResolvedRoom {
    pub instance: String,
    pub pattern: Arc<RoomPattern>,
    pub params: HashMap<String, String>,
}

/// Maps concrete room paths to registered patterns, memoizing per path.
pub struct RoomResolver {
    patterns: Vec<Arc<RoomPattern>>,
    cache: DashMap<String, Arc<ResolvedRoom>>,
    cache_capacity: usize,
}

impl RoomResolver {
    pub fn new(patterns: Vec<RoomPattern>) -> Self {
        Self::with_cache_capacity(patterns, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(patterns: Vec<RoomPattern>, cache_capacity: usize) -> Self {
        Self {
            patterns: patterns.into_iter().map(Arc::new).collect(),
            cache: DashMap::new(),
            cache_capacity: cache_capacity.max(1),
        }
    }

    /// Resolves a concrete room path. First registered match wins; results
    /// are memoized so repeated resolutions of one path return the same
    /// `Arc`. Unmatched paths return `None`.
    pub fn resolve(&self, path: &str) -> Option<Arc<ResolvedRoom>> {
        if let Some(hit) = self.cache.get(path) {
            return Some(hit.value().clone());
        }
        for pattern in &self.patterns {
            let Some(caps) = pattern.regex.captures(path) else {
                continue;
            };
            let mut params = HashMap::new();
            for (i, name) in pattern.params.iter().enumerate() {
                if let Some(cap) = caps.get(i + 1) {
                    params.insert(name.clone(), cap.as_str().to_string());
                }
            }
            let resolved = Arc::new(ResolvedRoom {
                instance: path.to_string(),
                pattern: pattern.clone(),
                params,
            });
            // The pattern set is fixed after construction, so dumping the
            // whole cache at capacity only costs re-matching.
            if self.cache.len() >= self.cache_capacity {
                self.cache.clear();
            }
            self.cache.insert(path.to_string(), resolved.clone());
            return Some(resolved);
        }
        None
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn cached_instances(&self) -> usize {
        self.cache.len()
    }
}

fn compile_template(template: &str) -> Result<(Vec<String>, Regex), WsError> {
    if template.is_empty() {
        return Err(WsError::IllegalValue(
            "room template must not be empty".to_string(),
        ));
    }
    let mut params = Vec::new();
    let mut pattern = String::from("^");
    for (i, segment) in template.split('/').enumerate() {
        if i > 0 {
            pattern.push('/');
        }
        if let Some(name) = segment.strip_prefix(':') {
            if name.is_empty() {
                return Err(WsError::IllegalValue(format!(
                    "unnamed parameter in room template {template}"
                )));
            }
            params.push(name.to_string());
            pattern.push_str("([^/]+)");
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push('$');
    let regex = Regex::new(&pattern).map_err(|err| {
        WsError::IllegalValue(format!("invalid room template {template}: {err}"))
    })?;
    Ok((params, regex))
}
