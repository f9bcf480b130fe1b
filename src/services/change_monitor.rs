use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::IndexConfig;
use crate::error::AppError;
use crate::models::cloud::{CloudItem, DownloadState, FeedDelta, FeedEvent, MonitorEvent};
use crate::models::document::PlaceholderSeed;
use crate::services::enumerator::relative_folder;
use crate::services::index_store::IndexStore;

/// Source of remote container notifications: one initial gather, then deltas.
pub trait CloudChangeFeed: Send + Sync {
    /// Opens a fresh subscription. `AppError::ContainerUnavailable` means
    /// the container cannot be reached yet.
    fn subscribe(&self) -> Result<mpsc::Receiver<FeedEvent>, AppError>;
}

/// True when a download burst is large enough to leave to the next full
/// reconciliation instead of re-reading each file.
pub fn is_bulk_download(newly_downloaded: usize, known: usize, fraction: f64) -> bool {
    newly_downloaded as f64 > known as f64 * fraction
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Added,
    Changed,
    Removed,
}

/// Net change per path across one debounce window, in first-seen order.
#[derive(Debug, Default)]
struct PendingChanges {
    order: Vec<String>,
    latest: HashMap<String, (PendingKind, CloudItem)>,
}

impl PendingChanges {
    fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    fn push(&mut self, kind: PendingKind, item: CloudItem) {
        let previous = self.latest.get(&item.path).map(|(kind, _)| *kind);
        let net = match (previous, kind) {
            // Still new to us, whatever happened to it since.
            (Some(PendingKind::Added), PendingKind::Changed) => PendingKind::Added,
            // Gone and back again: the path exists, its content may differ.
            (Some(PendingKind::Removed), PendingKind::Added) => PendingKind::Changed,
            (_, kind) => kind,
        };
        if previous.is_none() {
            self.order.push(item.path.clone());
        }
        self.latest.insert(item.path.clone(), (net, item));
    }

    fn into_delta(mut self) -> FeedDelta {
        let mut delta = FeedDelta::default();
        for path in self.order {
            let Some((kind, item)) = self.latest.remove(&path) else {
                continue;
            };
            match kind {
                PendingKind::Added => delta.added.push(item),
                PendingKind::Changed => delta.changed.push(item),
                PendingKind::Removed => delta.removed.push(item),
            }
        }
        delta
    }
}

/// Per-subscription bookkeeping. Dropped wholesale on identity change.
#[derive(Debug, Default)]
struct FeedTracker {
    known_paths: HashSet<String>,
    download_states: HashMap<String, DownloadState>,
    content_stamps: HashMap<String, DateTime<Utc>>,
    pending: PendingChanges,
}

impl FeedTracker {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn accumulate(&mut self, delta: FeedDelta) {
        for item in delta.added {
            self.pending.push(PendingKind::Added, item);
        }
        for item in delta.changed {
            self.pending.push(PendingKind::Changed, item);
        }
        for item in delta.removed {
            self.pending.push(PendingKind::Removed, item);
        }
    }

    fn take_pending(&mut self) -> FeedDelta {
        std::mem::take(&mut self.pending).into_delta()
    }

    fn record(&mut self, item: &CloudItem) {
        self.known_paths.insert(item.path.clone());
        self.download_states
            .insert(item.path.clone(), item.download_state);
        if item.download_state.is_local() {
            if let Some(stamp) = item.content_changed_at {
                self.content_stamps.insert(item.path.clone(), stamp);
            }
        }
    }

    fn forget(&mut self, path: &str) {
        self.known_paths.remove(path);
        self.download_states.remove(path);
        self.content_stamps.remove(path);
    }

    /// Updates the tracked state for a changed item and reports whether it
    /// now holds new local content: a finished download, or a newer remote
    /// revision of an already downloaded file.
    fn observe_change(&mut self, item: &CloudItem) -> bool {
        let previous = self
            .download_states
            .insert(item.path.clone(), item.download_state);
        self.known_paths.insert(item.path.clone());

        if !item.download_state.is_local() {
            self.content_stamps.remove(&item.path);
            return false;
        }

        let finished_download = previous == Some(DownloadState::NotDownloaded);
        let was_local = previous.map(DownloadState::is_local).unwrap_or(false);
        let content_updated = match item.content_changed_at {
            Some(stamp) => match self.content_stamps.insert(item.path.clone(), stamp) {
                Some(seen) => was_local && stamp > seen,
                None => false,
            },
            None => false,
        };

        finished_download || content_updated
    }
}

/// Reacts to remote container changes: seeds placeholders for new items,
/// drops removed ones, and reports downloads for targeted re-indexing.
pub struct CloudChangeMonitor {
    store: Arc<IndexStore>,
    feed: Arc<dyn CloudChangeFeed>,
    config: IndexConfig,
    root: PathBuf,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stops the monitor. Buffered deltas are discarded, not flushed.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "change monitor task ended abnormally");
        }
    }
}

impl CloudChangeMonitor {
    pub fn new(
        store: Arc<IndexStore>,
        feed: Arc<dyn CloudChangeFeed>,
        config: IndexConfig,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        let root = config
            .documents_root
            .canonicalize()
            .unwrap_or_else(|_| config.documents_root.clone());
        Self {
            store,
            feed,
            config,
            root,
            events,
        }
    }

    pub fn start(self) -> MonitorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(stop_rx));
        MonitorHandle { stop_tx, task }
    }

    fn emit(&self, event: MonitorEvent) {
        if self.events.send(event).is_err() {
            debug!("no monitor event observers left");
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut tracker = FeedTracker::default();

        'subscribe: loop {
            tracker.clear();
            let mut feed = match self.feed.subscribe() {
                Ok(feed) => feed,
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_secs = self.config.container_retry_secs,
                        "cloud container unavailable, retrying later"
                    );
                    tokio::select! {
                        _ = sleep(self.config.container_retry()) => continue 'subscribe,
                        _ = stop.changed() => return,
                    }
                }
            };
            info!("subscribed to cloud change feed");

            let mut deadline: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        debug!(pending = !tracker.pending.is_empty(), "change monitor stopping");
                        return;
                    }
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        let delta = tracker.take_pending();
                        self.process_delta(&mut tracker, delta).await;
                    }
                    event = feed.recv() => match event {
                        Some(FeedEvent::InitialGather(items)) => {
                            deadline = None;
                            self.process_gather(&mut tracker, items).await;
                        }
                        Some(FeedEvent::Delta(delta)) => {
                            tracker.accumulate(delta);
                            deadline = Some(Instant::now() + self.config.debounce());
                        }
                        Some(FeedEvent::IdentityChanged) => {
                            info!("account changed, restarting cloud subscription");
                            continue 'subscribe;
                        }
                        None => {
                            warn!(
                                retry_secs = self.config.container_retry_secs,
                                "cloud change feed closed, resubscribing later"
                            );
                            tokio::select! {
                                _ = sleep(self.config.container_retry()) => continue 'subscribe,
                                _ = stop.changed() => return,
                            }
                        }
                    }
                }
            }
        }
    }

    fn seeds_for(&self, items: &[CloudItem]) -> Vec<PlaceholderSeed> {
        items
            .iter()
            .map(|item| {
                let folder = relative_folder(&self.root, Path::new(&item.path));
                PlaceholderSeed::for_path(&item.path, &folder)
            })
            .collect()
    }

    /// Writes placeholders in short transactions, yielding between chunks.
    async fn seed_placeholders(&self, seeds: &[PlaceholderSeed]) -> usize {
        let mut inserted = 0;
        for chunk in seeds.chunks(self.config.placeholder_chunk_size.max(1)) {
            match self.store.insert_placeholders(chunk) {
                Ok(count) => inserted += count,
                Err(e) if e.is_corruption() => {
                    error!(error = %e, "index corrupted while seeding placeholders");
                    break;
                }
                Err(e) => warn!(error = %e, size = chunk.len(), "placeholder seeding failed"),
            }
            tokio::task::yield_now().await;
        }
        inserted
    }

    /// A gather is the complete listing: buffered deltas and everything
    /// learned from earlier listings are replaced by it.
    async fn process_gather(&self, tracker: &mut FeedTracker, items: Vec<CloudItem>) {
        tracker.clear();
        for item in &items {
            tracker.record(item);
        }
        let inserted = self.seed_placeholders(&self.seeds_for(&items)).await;
        info!(items = items.len(), inserted, "processed initial cloud gather");
        if inserted > 0 {
            self.emit(MonitorEvent::DocumentsChanged);
        }
    }

    async fn process_delta(&self, tracker: &mut FeedTracker, delta: FeedDelta) {
        if delta.is_empty() {
            return;
        }
        let FeedDelta {
            added,
            changed,
            removed,
        } = delta;

        let mut list_changed = false;

        if !added.is_empty() {
            for item in &added {
                tracker.record(item);
            }
            self.seed_placeholders(&self.seeds_for(&added)).await;
            list_changed = true;
        }

        if !removed.is_empty() {
            let paths: Vec<String> = removed.iter().map(|item| item.path.clone()).collect();
            for path in &paths {
                tracker.forget(path);
            }
            match self.store.remove_batch(&paths) {
                Ok(count) => debug!(count, "removed documents deleted remotely"),
                Err(e) => warn!(error = %e, "failed to remove deleted documents"),
            }
            list_changed = true;
        }

        let mut newly_downloaded = Vec::new();
        let mut first_seen = Vec::new();
        for item in &changed {
            if !tracker.known_paths.contains(&item.path) {
                first_seen.push(item.clone());
            }
            if tracker.observe_change(item) {
                newly_downloaded.push(item.path.clone());
            }
        }
        if !first_seen.is_empty() {
            self.seed_placeholders(&self.seeds_for(&first_seen)).await;
            list_changed = true;
        }

        debug!(
            added = added.len(),
            changed = changed.len(),
            removed = removed.len(),
            downloaded = newly_downloaded.len(),
            "processed cloud delta"
        );

        if list_changed {
            self.emit(MonitorEvent::DocumentsChanged);
        }

        if newly_downloaded.is_empty() {
            return;
        }
        let known = tracker.known_paths.len();
        if is_bulk_download(
            newly_downloaded.len(),
            known,
            self.config.bulk_download_fraction,
        ) {
            info!(
                downloaded = newly_downloaded.len(),
                known, "bulk download left to the next full reconciliation"
            );
            return;
        }
        self.emit(MonitorEvent::DocumentsDownloaded(newly_downloaded));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;

    #[derive(Default)]
    struct ScriptedFeed {
        subscriptions: Mutex<VecDeque<Result<mpsc::Receiver<FeedEvent>, AppError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedFeed {
        fn push_unavailable(&self) {
            self.subscriptions
                .lock()
                .unwrap()
                .push_back(Err(AppError::ContainerUnavailable("offline".into())));
        }

        fn push_channel(&self) -> mpsc::Sender<FeedEvent> {
            let (tx, rx) = mpsc::channel(64);
            self.subscriptions.lock().unwrap().push_back(Ok(rx));
            tx
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl CloudChangeFeed for ScriptedFeed {
        fn subscribe(&self) -> Result<mpsc::Receiver<FeedEvent>, AppError> {
            *self.calls.lock().unwrap() += 1;
            self.subscriptions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::ContainerUnavailable("no script".into())))
        }
    }

    fn item(name: &str, state: DownloadState) -> CloudItem {
        CloudItem {
            path: format!("/docs/{name}.scandoc"),
            file_name: format!("{name}.scandoc"),
            download_state: state,
            content_changed_at: None,
        }
    }

    fn stamped(name: &str, state: DownloadState, minute: u32) -> CloudItem {
        use chrono::TimeZone;
        CloudItem {
            content_changed_at: Some(Utc.with_ymd_and_hms(2025, 3, 1, 9, minute, 0).unwrap()),
            ..item(name, state)
        }
    }

    fn added(items: Vec<CloudItem>) -> FeedEvent {
        FeedEvent::Delta(FeedDelta {
            added: items,
            ..FeedDelta::default()
        })
    }

    fn changed(items: Vec<CloudItem>) -> FeedEvent {
        FeedEvent::Delta(FeedDelta {
            changed: items,
            ..FeedDelta::default()
        })
    }

    struct Fixture {
        store: Arc<IndexStore>,
        feed: Arc<ScriptedFeed>,
        events: mpsc::UnboundedReceiver<MonitorEvent>,
        handle: MonitorHandle,
    }

    fn start(feed: Arc<ScriptedFeed>) -> Fixture {
        let store = Arc::new(IndexStore::open_in_memory().unwrap());
        let (tx, events) = mpsc::unbounded_channel();
        let config = IndexConfig {
            documents_root: "/docs".into(),
            placeholder_chunk_size: 2,
            ..IndexConfig::default()
        };
        let handle = CloudChangeMonitor::new(store.clone(), feed.clone(), config, tx).start();
        Fixture {
            store,
            feed,
            events,
            handle,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn bulk_threshold_is_strictly_more_than_fraction() {
        assert!(!is_bulk_download(1, 3, 0.5));
        assert!(is_bulk_download(2, 3, 0.5));
        assert!(!is_bulk_download(2, 4, 0.5));
        assert!(is_bulk_download(1, 0, 0.5));
    }

    #[test]
    fn tracker_detects_download_transition() {
        let mut tracker = FeedTracker::default();
        tracker.record(&item("a", DownloadState::NotDownloaded));
        assert!(!tracker.observe_change(&item("a", DownloadState::NotDownloaded)));
        assert!(tracker.observe_change(&item("a", DownloadState::Current)));
        assert!(!tracker.observe_change(&item("a", DownloadState::Current)));
    }

    #[test]
    fn tracker_detects_newer_remote_content() {
        let mut tracker = FeedTracker::default();
        tracker.record(&stamped("a", DownloadState::Current, 0));
        assert!(!tracker.observe_change(&stamped("a", DownloadState::Current, 0)));
        assert!(tracker.observe_change(&stamped("a", DownloadState::Current, 5)));
        assert!(!tracker.observe_change(&stamped("a", DownloadState::Downloaded, 4)));
    }

    #[test]
    fn tracker_ignores_unseen_local_items() {
        let mut tracker = FeedTracker::default();
        assert!(!tracker.observe_change(&stamped("a", DownloadState::Current, 0)));
        assert!(tracker.known_paths.contains("/docs/a.scandoc"));
    }

    #[test]
    fn tracker_accumulates_union_of_deltas() {
        let mut tracker = FeedTracker::default();
        tracker.accumulate(FeedDelta {
            added: vec![item("a", DownloadState::NotDownloaded)],
            ..FeedDelta::default()
        });
        tracker.accumulate(FeedDelta {
            changed: vec![item("b", DownloadState::Current)],
            removed: vec![item("c", DownloadState::Current)],
            ..FeedDelta::default()
        });
        let pending = tracker.take_pending();
        assert_eq!(pending.added.len(), 1);
        assert_eq!(pending.changed.len(), 1);
        assert_eq!(pending.removed.len(), 1);
        assert!(tracker.take_pending().is_empty());
    }

    #[test]
    fn pending_keeps_net_change_per_path() {
        let mut tracker = FeedTracker::default();
        tracker.accumulate(FeedDelta {
            removed: vec![item("x", DownloadState::Current)],
            ..FeedDelta::default()
        });
        tracker.accumulate(FeedDelta {
            added: vec![item("x", DownloadState::Current), item("y", DownloadState::NotDownloaded)],
            ..FeedDelta::default()
        });
        tracker.accumulate(FeedDelta {
            changed: vec![item("y", DownloadState::Current)],
            removed: vec![item("z", DownloadState::NotDownloaded)],
            ..FeedDelta::default()
        });

        let pending = tracker.take_pending();
        assert_eq!(pending.changed, vec![item("x", DownloadState::Current)]);
        assert_eq!(pending.added, vec![item("y", DownloadState::Current)]);
        assert_eq!(pending.removed, vec![item("z", DownloadState::NotDownloaded)]);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_gather_seeds_placeholders_immediately() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let mut fx = start(feed);

        tx.send(FeedEvent::InitialGather(vec![
            item("a", DownloadState::NotDownloaded),
            item("b", DownloadState::NotDownloaded),
            item("c", DownloadState::Current),
        ]))
        .await
        .unwrap();

        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));
        assert_eq!(fx.store.count_placeholders(None).unwrap(), 3);
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_deltas_collapses_into_one_pass() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let mut fx = start(feed);

        tx.send(added(vec![item("a", DownloadState::NotDownloaded)])).await.unwrap();
        sleep(Duration::from_millis(1200)).await;
        tx.send(added(vec![item("b", DownloadState::NotDownloaded)])).await.unwrap();
        sleep(Duration::from_millis(1200)).await;
        tx.send(added(vec![item("c", DownloadState::NotDownloaded)])).await.unwrap();
        settle().await;

        assert_eq!(fx.events.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(fx.store.count_placeholders(None).unwrap(), 0);

        sleep(Duration::from_millis(2100)).await;

        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));
        assert_eq!(fx.events.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(fx.store.count_placeholders(None).unwrap(), 3);
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn download_transition_is_reported() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let mut fx = start(feed);

        tx.send(FeedEvent::InitialGather(vec![
            item("a", DownloadState::NotDownloaded),
            item("b", DownloadState::NotDownloaded),
            item("c", DownloadState::NotDownloaded),
        ]))
        .await
        .unwrap();
        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));

        tx.send(changed(vec![item("b", DownloadState::Current)])).await.unwrap();
        sleep(Duration::from_millis(2100)).await;

        assert_eq!(
            fx.events.recv().await,
            Some(MonitorEvent::DocumentsDownloaded(vec![
                "/docs/b.scandoc".to_string()
            ]))
        );
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_download_is_suppressed() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let mut fx = start(feed);

        tx.send(FeedEvent::InitialGather(vec![
            item("a", DownloadState::NotDownloaded),
            item("b", DownloadState::NotDownloaded),
            item("c", DownloadState::NotDownloaded),
        ]))
        .await
        .unwrap();
        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));

        tx.send(changed(vec![
            item("a", DownloadState::Current),
            item("b", DownloadState::Downloaded),
        ]))
        .await
        .unwrap();
        sleep(Duration::from_millis(2100)).await;
        settle().await;

        assert_eq!(fx.events.try_recv(), Err(TryRecvError::Empty));
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn newer_content_on_downloaded_file_is_reported() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let mut fx = start(feed);

        tx.send(FeedEvent::InitialGather(vec![
            stamped("a", DownloadState::Current, 0),
            item("b", DownloadState::NotDownloaded),
            item("c", DownloadState::NotDownloaded),
        ]))
        .await
        .unwrap();
        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));

        tx.send(changed(vec![stamped("a", DownloadState::Current, 0)]))
            .await
            .unwrap();
        sleep(Duration::from_millis(2100)).await;
        settle().await;
        assert_eq!(fx.events.try_recv(), Err(TryRecvError::Empty));

        tx.send(changed(vec![stamped("a", DownloadState::Current, 7)]))
            .await
            .unwrap();
        sleep(Duration::from_millis(2100)).await;
        assert_eq!(
            fx.events.recv().await,
            Some(MonitorEvent::DocumentsDownloaded(vec![
                "/docs/a.scandoc".to_string()
            ]))
        );
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removal_deletes_record() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let mut fx = start(feed);

        tx.send(FeedEvent::InitialGather(vec![
            item("a", DownloadState::NotDownloaded),
            item("b", DownloadState::NotDownloaded),
        ]))
        .await
        .unwrap();
        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));

        tx.send(FeedEvent::Delta(FeedDelta {
            removed: vec![item("a", DownloadState::NotDownloaded)],
            ..FeedDelta::default()
        }))
        .await
        .unwrap();
        sleep(Duration::from_millis(2100)).await;

        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));
        assert!(fx.store.get_by_path("/docs/a.scandoc").unwrap().is_none());
        assert!(fx.store.get_by_path("/docs/b.scandoc").unwrap().is_some());
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_container_is_retried_after_delay() {
        let feed = Arc::new(ScriptedFeed::default());
        feed.push_unavailable();
        let tx = feed.push_channel();
        let mut fx = start(feed);

        settle().await;
        assert_eq!(fx.feed.calls(), 1);
        sleep(Duration::from_secs(29)).await;
        assert_eq!(fx.feed.calls(), 1);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.feed.calls(), 2);

        tx.send(FeedEvent::InitialGather(vec![item("a", DownloadState::NotDownloaded)]))
            .await
            .unwrap();
        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn identity_change_discards_pending_and_resubscribes() {
        let feed = Arc::new(ScriptedFeed::default());
        let first = feed.push_channel();
        let second = feed.push_channel();
        let mut fx = start(feed);

        first
            .send(added(vec![item("x", DownloadState::NotDownloaded)]))
            .await
            .unwrap();
        first.send(FeedEvent::IdentityChanged).await.unwrap();
        settle().await;
        assert_eq!(fx.feed.calls(), 2);

        sleep(Duration::from_secs(3)).await;
        assert!(fx.store.get_by_path("/docs/x.scandoc").unwrap().is_none());

        second
            .send(FeedEvent::InitialGather(vec![item("y", DownloadState::NotDownloaded)]))
            .await
            .unwrap();
        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));
        assert!(fx.store.get_by_path("/docs/y.scandoc").unwrap().is_some());
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_buffered_deltas() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let fx = start(feed);

        tx.send(added(vec![item("a", DownloadState::NotDownloaded)])).await.unwrap();
        settle().await;
        fx.handle.stop().await;

        sleep(Duration::from_secs(3)).await;
        assert_eq!(fx.store.count_placeholders(None).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_then_restore_in_one_window_keeps_record() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let mut fx = start(feed);

        tx.send(FeedEvent::InitialGather(vec![item("x", DownloadState::NotDownloaded)]))
            .await
            .unwrap();
        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));

        tx.send(FeedEvent::Delta(FeedDelta {
            removed: vec![item("x", DownloadState::NotDownloaded)],
            ..FeedDelta::default()
        }))
        .await
        .unwrap();
        sleep(Duration::from_millis(300)).await;
        tx.send(added(vec![item("x", DownloadState::NotDownloaded)])).await.unwrap();
        sleep(Duration::from_secs(3)).await;
        settle().await;

        assert!(fx.store.get_by_path("/docs/x.scandoc").unwrap().is_some());
        assert_eq!(fx.events.try_recv(), Err(TryRecvError::Empty));
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn gather_cancels_armed_debounce() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let mut fx = start(feed);

        tx.send(added(vec![item("stale", DownloadState::NotDownloaded)]))
            .await
            .unwrap();
        sleep(Duration::from_millis(500)).await;
        tx.send(FeedEvent::InitialGather(vec![
            item("a", DownloadState::NotDownloaded),
            item("b", DownloadState::NotDownloaded),
        ]))
        .await
        .unwrap();
        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));

        sleep(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(fx.events.try_recv(), Err(TryRecvError::Empty));
        assert!(fx.store.get_by_path("/docs/stale.scandoc").unwrap().is_none());
        assert_eq!(fx.store.count_placeholders(None).unwrap(), 2);
        fx.handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_gather_replaces_known_paths() {
        let feed = Arc::new(ScriptedFeed::default());
        let tx = feed.push_channel();
        let mut fx = start(feed);

        let six: Vec<CloudItem> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|name| item(name, DownloadState::NotDownloaded))
            .collect();
        tx.send(FeedEvent::InitialGather(six.clone())).await.unwrap();
        assert_eq!(fx.events.recv().await, Some(MonitorEvent::DocumentsChanged));

        tx.send(FeedEvent::InitialGather(six[..3].to_vec()))
            .await
            .unwrap();
        settle().await;

        // Two of three known documents is a bulk download; it would not be
        // with the six paths from the first listing still counted.
        tx.send(changed(vec![
            item("a", DownloadState::Current),
            item("b", DownloadState::Current),
        ]))
        .await
        .unwrap();
        sleep(Duration::from_millis(2100)).await;
        settle().await;

        assert_eq!(fx.events.try_recv(), Err(TryRecvError::Empty));
        fx.handle.stop().await;
    }
}
