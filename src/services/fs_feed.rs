use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::cloud::{CloudItem, DownloadState, FeedDelta, FeedEvent};
use crate::services::change_monitor::CloudChangeFeed;
use crate::services::enumerator::{stub_target, DocumentEnumerator, FsEnumerator};

const FEED_CAPACITY: usize = 1000;

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn stub_for(path: &Path) -> PathBuf {
    path.with_file_name(format!(".{}.icloud", file_name_of(path)))
}

/// Resolves the parent directory only, so removed files keep the same key
/// they had while present.
fn canonical_document_path(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .unwrap_or_else(|_| parent.to_path_buf())
            .join(name),
        _ => path.to_path_buf(),
    }
}

/// Current state of a document on disk, or `None` when neither the file
/// nor its stub exists.
fn probe(path: &Path) -> Option<CloudItem> {
    let file_name = file_name_of(path);
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.is_file() {
            return Some(CloudItem {
                path: path.to_string_lossy().to_string(),
                file_name,
                download_state: DownloadState::Current,
                content_changed_at: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
    }
    if stub_for(path).is_file() {
        return Some(CloudItem {
            path: path.to_string_lossy().to_string(),
            file_name,
            download_state: DownloadState::NotDownloaded,
            content_changed_at: None,
        });
    }
    None
}

/// Turns raw watcher paths into added/changed/removed document items.
struct DeltaClassifier {
    extension: String,
    seen: HashSet<String>,
}

impl DeltaClassifier {
    fn is_document(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }

    fn classify(&mut self, paths: &[PathBuf]) -> FeedDelta {
        let mut delta = FeedDelta::default();
        let mut handled = HashSet::new();

        for raw in paths {
            let target = stub_target(raw).unwrap_or_else(|| raw.clone());
            if !self.is_document(&target) || file_name_of(&target).starts_with('.') {
                continue;
            }
            let target = canonical_document_path(&target);
            let key = target.to_string_lossy().to_string();
            if !handled.insert(key.clone()) {
                continue;
            }

            match probe(&target) {
                Some(item) if self.seen.insert(key.clone()) => delta.added.push(item),
                Some(item) => delta.changed.push(item),
                None if self.seen.remove(&key) => delta.removed.push(CloudItem {
                    path: key,
                    file_name: file_name_of(&target),
                    download_state: DownloadState::NotDownloaded,
                    content_changed_at: None,
                }),
                None => {}
            }
        }
        delta
    }
}

/// Change feed over a local folder, treating `.<name>.icloud` files as
/// not-yet-downloaded documents.
pub struct FsChangeFeed {
    root: PathBuf,
    extension: String,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FsChangeFeed {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            watcher: Mutex::new(None),
        }
    }
}

impl CloudChangeFeed for FsChangeFeed {
    fn subscribe(&self) -> Result<mpsc::Receiver<FeedEvent>, AppError> {
        let root = self.root.canonicalize().map_err(|e| {
            AppError::ContainerUnavailable(format!("{}: {e}", self.root.display()))
        })?;

        let documents = FsEnumerator::new(&root, &self.extension).list_all_recursive()?;
        let items: Vec<CloudItem> = documents
            .iter()
            .filter_map(|doc| probe(Path::new(&doc.path)))
            .collect();
        let mut classifier = DeltaClassifier {
            extension: self.extension.clone(),
            seen: items.iter().map(|item| item.path.clone()).collect(),
        };

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        tx.try_send(FeedEvent::InitialGather(items))
            .map_err(|e| AppError::Watcher(e.to_string()))?;

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    let delta = classifier.classify(&event.paths);
                    if delta.is_empty() {
                        return;
                    }
                    if tx.blocking_send(FeedEvent::Delta(delta)).is_err() {
                        debug!("change feed receiver dropped");
                    }
                }
                Err(e) => warn!(error = %e, "watcher error"),
            }
        })
        .map_err(|e| AppError::Watcher(e.to_string()))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| AppError::Watcher(e.to_string()))?;

        info!(root = %root.display(), "watching document folder");
        // Replacing the previous watcher closes the previous subscription.
        *self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(watcher);
        Ok(rx)
    }
}
