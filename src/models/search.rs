use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One ranked hit, carrying everything a result list needs to render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub path: String,
    pub title: String,
    pub snippet: String,
    pub page_count: i64,
    pub folder_path: String,
    pub file_size_bytes: i64,
    pub ocr_completed: bool,
    pub modified_at: Option<DateTime<Utc>>,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub documents: i64,
    pub placeholders: i64,
    pub ocr_completed: i64,
}
