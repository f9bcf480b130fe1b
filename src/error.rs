use rusqlite::ErrorCode;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    General(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Container unavailable: {0}")]
    ContainerUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

const CORRUPTION_MARKERS: &[&str] = &["malformed", "not a database", "corrupt"];

impl AppError {
    /// True when the underlying storage engine reported a damaged file.
    /// Only this class of failure aborts a reconciliation pass.
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, message)) => {
                matches!(
                    err.code,
                    ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase
                ) || message
                    .as_deref()
                    .map(has_corruption_marker)
                    .unwrap_or(false)
            }
            Self::Database(other) => has_corruption_marker(&other.to_string()),
            _ => false,
        }
    }
}

fn has_corruption_marker(message: &str) -> bool {
    let lower = message.to_lowercase();
    CORRUPTION_MARKERS.iter().any(|m| lower.contains(m))
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
