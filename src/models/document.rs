use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable id for a document that carries none of its own.
pub fn document_id_for_path(path: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, path.as_bytes()).to_string()
}

/// Display title derived from the file name, extension dropped.
pub fn title_for_path(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub path: String,
    pub title: String,
    pub folder_path: String,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub page_count: i64,
    pub file_size_bytes: i64,
    pub tags_csv: String,
    pub ocr_completed: bool,
    pub has_pending_draft_page: bool,
    pub is_placeholder: bool,
    pub indexed_at: DateTime<Utc>,
}

/// The full-text half of a document: the only fields ranked by search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFields {
    pub title: String,
    pub full_text: String,
    pub tags: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub record: DocumentRecord,
    pub search: SearchFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderSeed {
    pub id: String,
    pub path: String,
    pub title: String,
    pub folder_path: String,
}

impl PlaceholderSeed {
    pub fn for_path(path: &str, folder_path: &str) -> Self {
        Self {
            id: document_id_for_path(path),
            path: path.to_string(),
            title: title_for_path(path),
            folder_path: folder_path.to_string(),
        }
    }
}

/// Decoded document metadata as produced by the archive reader, including
/// whatever the OCR pass has attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub page_count: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ocr_completed: bool,
    #[serde(default)]
    pub ocr_confidence: Option<f64>,
    #[serde(default)]
    pub full_text: Option<String>,
    #[serde(default)]
    pub has_pending_draft_page: bool,
    #[serde(default = "default_format_version")]
    pub format_version: u32,
}

fn default_format_version() -> u32 {
    1
}

impl IndexEntry {
    pub fn from_metadata(
        meta: &DocumentMetadata,
        path: &str,
        folder_path: &str,
        file_size_bytes: i64,
    ) -> Self {
        let title = meta
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| title_for_path(path));
        let tags_csv = meta.tags.join(",");
        // OCR text only counts once the OCR pass has finished.
        let full_text = if meta.ocr_completed {
            meta.full_text.clone().unwrap_or_default()
        } else {
            String::new()
        };

        let record = DocumentRecord {
            id: meta
                .id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| document_id_for_path(path)),
            path: path.to_string(),
            title: title.clone(),
            folder_path: folder_path.to_string(),
            created_at: meta.created_at,
            modified_at: meta.modified_at,
            page_count: meta.page_count,
            file_size_bytes,
            tags_csv: tags_csv.clone(),
            ocr_completed: meta.ocr_completed,
            has_pending_draft_page: meta.has_pending_draft_page,
            is_placeholder: false,
            indexed_at: Utc::now(),
        };

        Self {
            record,
            search: SearchFields {
                title,
                full_text,
                tags: tags_csv.replace(',', " "),
            },
        }
    }
}
