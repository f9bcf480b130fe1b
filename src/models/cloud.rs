use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    NotDownloaded,
    Downloaded,
    Current,
}

impl DownloadState {
    pub fn is_local(self) -> bool {
        !matches!(self, Self::NotDownloaded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudItem {
    pub path: String,
    pub file_name: String,
    pub download_state: DownloadState,
    /// Remote content-change timestamp, when the feed reports one.
    pub content_changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedDelta {
    pub added: Vec<CloudItem>,
    pub changed: Vec<CloudItem>,
    pub removed: Vec<CloudItem>,
}

impl FeedDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// First full listing of the container.
    InitialGather(Vec<CloudItem>),
    Delta(FeedDelta),
    /// The signed-in account changed; all tracking state is void.
    IdentityChanged,
}

/// Notifications published to observers (UI view-models, the reconciler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    DocumentsChanged,
    DocumentsDownloaded(Vec<String>),
}
