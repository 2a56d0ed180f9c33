use shared_store::StoreError;
use thiserror::Error;

/// Failures surfaced to socket callers. Every variant maps to a stable wire
/// code; `Store` is the opaque bucket for transport, store and serialization
/// failures that are not translated further.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("illegal value: {0}")]
    IllegalValue(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    Access(String),
    #[error("out of range: {0}")]
    RangeOutOfBounds(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("store error: {0}")]
    Store(String),
}

impl WsError {
    pub fn code(&self) -> &'static str {
        match self {
            WsError::IllegalValue(_) => "illegal_value",
            WsError::NotFound(_) => "not_found",
            WsError::Access(_) => "access",
            WsError::RangeOutOfBounds(_) => "range_out_of_bounds",
            WsError::Authentication(_) => "authentication",
            WsError::Store(_) => "store",
        }
    }
}

impl From<StoreError> for WsError {
    fn from(err: StoreError) -> Self {
        WsError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for WsError {
    fn from(err: serde_json::Error) -> Self {
        WsError::Store(format!("serialization: {err}"))
    }
}
