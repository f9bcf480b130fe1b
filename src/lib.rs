pub mod config;
pub mod data;
pub mod error;
pub mod models;
pub mod services;
pub mod state;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use config::IndexConfig;
use error::AppError;
use models::cloud::MonitorEvent;
use models::search::SearchResult;
use services::archive::{ArchiveReader, JsonArchiveReader};
use services::change_monitor::{CloudChangeFeed, CloudChangeMonitor, MonitorHandle};
use services::enumerator::{DocumentEnumerator, FsEnumerator};
use services::index_store::IndexStore;
use services::reconciler::{ReconcileOutcome, Reconciler};
use services::search_service;
use state::{new_shared_progress, IndexingProgressState, SharedProgress, UserActivity};

/// Process-wide services, built once at startup and handed to whoever
/// needs them.
pub struct Services {
    pub config: IndexConfig,
    pub store: Arc<IndexStore>,
    pub reconciler: Arc<Reconciler>,
    pub activity: UserActivity,
    pub progress: SharedProgress,
}

impl Services {
    /// Opens the on-disk index and wires the filesystem collaborators.
    pub fn open(config: IndexConfig) -> Result<Self, AppError> {
        let store_path = config.resolve_store_path()?;
        let store = Arc::new(IndexStore::open(&store_path)?);
        let enumerator = Arc::new(FsEnumerator::new(
            &config.documents_root,
            &config.document_extension,
        ));
        info!(store = %store_path.display(), root = %config.documents_root.display(), "services ready");
        Ok(Self::with_parts(
            config,
            store,
            enumerator,
            Arc::new(JsonArchiveReader),
        ))
    }

    pub fn with_parts(
        config: IndexConfig,
        store: Arc<IndexStore>,
        enumerator: Arc<dyn DocumentEnumerator>,
        archive: Arc<dyn ArchiveReader>,
    ) -> Self {
        let activity = UserActivity::new();
        let progress = new_shared_progress();
        let reconciler = Reconciler::new(
            store.clone(),
            enumerator,
            archive,
            config.clone(),
            progress.clone(),
        )
        .with_user_activity(activity.clone());
        Self {
            config,
            store,
            reconciler: Arc::new(reconciler),
            activity,
            progress,
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileOutcome, AppError> {
        self.reconciler.run().await
    }

    pub fn search(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        search_service::search(&self.store, query, self.config.search_limit)
    }

    pub fn notify_user_interaction(&self) {
        self.activity.notify_interaction();
    }

    pub fn indexing_status(&self) -> IndexingProgressState {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Starts the change monitor and the task that turns its download
    /// reports into targeted re-indexing. Every monitor event is also
    /// forwarded to `observer`, if given.
    pub fn start_monitor(
        &self,
        feed: Arc<dyn CloudChangeFeed>,
        observer: Option<mpsc::UnboundedSender<MonitorEvent>>,
    ) -> RunningMonitor {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor =
            CloudChangeMonitor::new(self.store.clone(), feed, self.config.clone(), events_tx)
                .start();
        let listener = tokio::spawn(forward_monitor_events(
            self.reconciler.clone(),
            events_rx,
            observer,
        ));
        RunningMonitor { monitor, listener }
    }
}

async fn forward_monitor_events(
    reconciler: Arc<Reconciler>,
    mut events: mpsc::UnboundedReceiver<MonitorEvent>,
    observer: Option<mpsc::UnboundedSender<MonitorEvent>>,
) {
    while let Some(event) = events.recv().await {
        if let Some(observer) = &observer {
            let _ = observer.send(event.clone());
        }
        let MonitorEvent::DocumentsDownloaded(paths) = event else {
            continue;
        };
        debug!(count = paths.len(), "re-indexing downloaded documents");
        match reconciler.reindex_paths(&paths).await {
            Ok(_) => {}
            Err(e) if e.is_corruption() => {
                error!(error = %e, "index corrupted during re-index, running full reconciliation");
                if let Err(e) = reconciler.run().await {
                    error!(error = %e, "recovery reconciliation failed");
                }
            }
            Err(e) => warn!(error = %e, "re-index of downloaded documents failed"),
        }
    }
}

pub struct RunningMonitor {
    monitor: MonitorHandle,
    listener: JoinHandle<()>,
}

impl RunningMonitor {
    /// Stops the monitor, then lets the listener drain what it already
    /// received.
    pub async fn shutdown(self) {
        self.monitor.stop().await;
        if let Err(e) = self.listener.await {
            warn!(error = %e, "monitor listener ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cloud::{CloudItem, DownloadState, FeedDelta, FeedEvent};
    use crate::services::reconciler::tests::{
        doc, meta, test_config, MemoryArchive, MemoryEnumerator,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    struct OneShotFeed {
        rx: Mutex<Option<mpsc::Receiver<FeedEvent>>>,
    }

    impl CloudChangeFeed for OneShotFeed {
        fn subscribe(&self) -> Result<mpsc::Receiver<FeedEvent>, AppError> {
            self.rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| AppError::ContainerUnavailable("used".into()))
        }
    }

    fn cloud(name: &str, state: DownloadState) -> CloudItem {
        CloudItem {
            path: format!("/docs/{name}.scandoc"),
            file_name: format!("{name}.scandoc"),
            download_state: state,
            content_changed_at: None,
        }
    }

    fn services() -> (Services, Arc<MemoryEnumerator>, Arc<MemoryArchive>) {
        let enumerator = Arc::new(MemoryEnumerator::default());
        let archive = Arc::new(MemoryArchive::default());
        let services = Services::with_parts(
            test_config(),
            Arc::new(IndexStore::open_in_memory().unwrap()),
            enumerator.clone(),
            archive.clone(),
        );
        (services, enumerator, archive)
    }

    #[tokio::test]
    async fn reconcile_then_search() {
        let (services, enumerator, archive) = services();
        enumerator.set(vec![doc("/docs/a.scandoc", true)]);
        archive.put("/docs/a.scandoc", &meta("quarterly statement", true, 1));

        let outcome = services.reconcile().await.unwrap();
        assert_eq!(outcome.indexed, 1);
        assert_eq!(services.search("quarter").unwrap().len(), 1);
        assert_eq!(services.indexing_status().total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn downloads_are_reindexed_through_the_monitor() {
        let (services, _enumerator, archive) = services();
        let (feed_tx, feed_rx) = mpsc::channel(16);
        let feed = Arc::new(OneShotFeed {
            rx: Mutex::new(Some(feed_rx)),
        });
        let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
        let running = services.start_monitor(feed, Some(observer_tx));

        feed_tx
            .send(FeedEvent::InitialGather(vec![
                cloud("a", DownloadState::NotDownloaded),
                cloud("b", DownloadState::NotDownloaded),
                cloud("c", DownloadState::NotDownloaded),
            ]))
            .await
            .unwrap();
        assert_eq!(observer_rx.recv().await, Some(MonitorEvent::DocumentsChanged));
        assert_eq!(services.store.count_placeholders(None).unwrap(), 3);

        archive.put("/docs/b.scandoc", &meta("hello", true, 1));
        feed_tx
            .send(FeedEvent::Delta(FeedDelta {
                changed: vec![cloud("b", DownloadState::Current)],
                ..FeedDelta::default()
            }))
            .await
            .unwrap();

        assert_eq!(
            observer_rx.recv().await,
            Some(MonitorEvent::DocumentsDownloaded(vec![
                "/docs/b.scandoc".to_string()
            ]))
        );
        let mut hits = Vec::new();
        for _ in 0..50 {
            hits = services.search("hello").unwrap();
            if !hits.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/docs/b.scandoc");
        assert_eq!(services.store.count_placeholders(None).unwrap(), 2);

        running.shutdown().await;
    }
}
