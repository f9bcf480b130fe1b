use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const STORE_FILE_NAME: &str = "index.db";
const CONFIG_FILE_NAME: &str = "config.json";

/// Tunables for indexing, change monitoring and search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Root of the (possibly cloud-backed) document tree.
    #[serde(default = "default_documents_root")]
    pub documents_root: PathBuf,

    /// Extension that identifies a document file.
    #[serde(default = "default_document_extension")]
    pub document_extension: String,

    /// Explicit index location. Defaults to the platform data dir.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    #[serde(default = "default_placeholder_chunk_size")]
    pub placeholder_chunk_size: usize,

    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,

    #[serde(default = "default_index_batch_pause_ms")]
    pub index_batch_pause_ms: u64,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Download bursts above this share of known documents are left to the
    /// next full reconciliation.
    #[serde(default = "default_bulk_download_fraction")]
    pub bulk_download_fraction: f64,

    #[serde(default = "default_container_retry_secs")]
    pub container_retry_secs: u64,

    #[serde(default = "default_reindex_throttle_every")]
    pub reindex_throttle_every: usize,

    #[serde(default = "default_reindex_throttle_pause_ms")]
    pub reindex_throttle_pause_ms: u64,

    #[serde(default = "default_user_idle_pause_ms")]
    pub user_idle_pause_ms: i64,

    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

fn default_documents_root() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| dirs.document_dir().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_document_extension() -> String {
    "scandoc".to_string()
}

fn default_placeholder_chunk_size() -> usize {
    200
}

fn default_index_batch_size() -> usize {
    10
}

fn default_index_batch_pause_ms() -> u64 {
    50
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_bulk_download_fraction() -> f64 {
    0.5
}

fn default_container_retry_secs() -> u64 {
    30
}

fn default_reindex_throttle_every() -> usize {
    5
}

fn default_reindex_throttle_pause_ms() -> u64 {
    100
}

fn default_user_idle_pause_ms() -> i64 {
    1500
}

fn default_search_limit() -> usize {
    50
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            documents_root: default_documents_root(),
            document_extension: default_document_extension(),
            store_path: None,
            placeholder_chunk_size: default_placeholder_chunk_size(),
            index_batch_size: default_index_batch_size(),
            index_batch_pause_ms: default_index_batch_pause_ms(),
            debounce_ms: default_debounce_ms(),
            bulk_download_fraction: default_bulk_download_fraction(),
            container_retry_secs: default_container_retry_secs(),
            reindex_throttle_every: default_reindex_throttle_every(),
            reindex_throttle_pause_ms: default_reindex_throttle_pause_ms(),
            user_idle_pause_ms: default_user_idle_pause_ms(),
            search_limit: default_search_limit(),
        }
    }
}

impl IndexConfig {
    /// Reads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// `config.json` in the platform config dir.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "scanvault")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Where the index lives. Kept in the app data dir so it never lands
    /// inside the synced documents tree.
    pub fn resolve_store_path(&self) -> Result<PathBuf, AppError> {
        if let Some(path) = &self.store_path {
            return Ok(path.clone());
        }
        let dirs = directories::ProjectDirs::from("", "", "scanvault")
            .ok_or_else(|| AppError::General("failed to resolve app data dir".into()))?;
        Ok(dirs.data_local_dir().join(STORE_FILE_NAME))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn index_batch_pause(&self) -> Duration {
        Duration::from_millis(self.index_batch_pause_ms)
    }

    pub fn container_retry(&self) -> Duration {
        Duration::from_secs(self.container_retry_secs)
    }

    pub fn reindex_throttle_pause(&self) -> Duration {
        Duration::from_millis(self.reindex_throttle_pause_ms)
    }
}
