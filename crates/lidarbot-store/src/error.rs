use lidarbot_core::RecordingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("training log has schema version {found}, this build understands up to {supported}")]
    Schema { found: i64, supported: i64 },
    #[error("record {id} is corrupt: {reason}")]
    Corrupt { id: i64, reason: String },
}

impl From<StoreError> for RecordingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Json(e) => RecordingError::Encode(e.to_string()),
            other => RecordingError::Storage(other.to_string()),
        }
    }
}
