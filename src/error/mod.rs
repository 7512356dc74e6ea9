use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Shared store read/write failures (connection loss, quota, rejected write)
    #[error("Store Error: {0}")]
    StoreError(String),

    /// Relay log or payload content that could not be (de)serialized
    #[error("Parse Error: {0}")]
    ParseError(String),

    /// Another writer changed the shared value between read and write
    #[error("Conflict Error: {0}")]
    ConflictError(String),

    /// Configuration errors
    #[error("Config Error: {0}")]
    ConfigError(String),

    /// Read-through fetch of rating stats failed
    #[error("Fetch Error: {0}")]
    FetchError(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::ParseError(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<redis::RedisError> for SyncError {
    fn from(err: redis::RedisError) -> Self {
        SyncError::StoreError(format!("Redis error: {}", err))
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::FetchError(format!("{:#}", err))
    }
}

impl SyncError {
    /// Whether repeating the same operation right away can succeed.
    pub fn should_retry(&self) -> bool {
        match self {
            SyncError::ConflictError(_) => true,
            SyncError::StoreError(_) => false, // quota and connection issues won't clear within a tick
            SyncError::ParseError(_) => false,
            SyncError::ConfigError(_) => false,
            SyncError::FetchError(_) => false,
        }
    }
}
