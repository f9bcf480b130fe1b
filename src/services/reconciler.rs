use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::IndexConfig;
use crate::error::AppError;
use crate::models::document::{DocumentRecord, IndexEntry, PlaceholderSeed};
use crate::services::archive::{self, ArchiveReader};
use crate::services::enumerator::{self, DocumentEnumerator, EnumeratedDocument};
use crate::services::index_store::IndexStore;
use crate::state::{
    publish_progress, IndexingProgressState, ProgressListener, ReconcilePhase, SharedProgress,
    UserActivity,
};

/// Counters for one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub total: usize,
    pub skipped: usize,
    pub unchanged: usize,
    pub fast_tracked: usize,
    pub placeholders_seeded: usize,
    pub indexed: usize,
    pub failed: usize,
    pub pruned: usize,
    pub recovered_from_corruption: bool,
    pub cancelled: bool,
    pub already_running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexOutcome {
    pub indexed: usize,
    pub unavailable: usize,
    pub failed: usize,
}

enum DocumentRead {
    /// Not readable locally; keep it as a placeholder.
    Unavailable(AppError),
    /// Readable but undecodable.
    Invalid(AppError),
    Ready(IndexEntry),
}

fn read_document(archive: &dyn ArchiveReader, path: &str, folder: &str) -> DocumentRead {
    let raw = match archive.read_metadata(Path::new(path)) {
        Ok(raw) => raw,
        Err(e) => return DocumentRead::Unavailable(e),
    };
    let meta = match archive::decode_metadata(&raw) {
        Ok(meta) => meta,
        Err(e) => return DocumentRead::Invalid(e),
    };
    let size = std::fs::metadata(path)
        .map(|m| i64::try_from(m.len()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    DocumentRead::Ready(IndexEntry::from_metadata(&meta, path, folder, size))
}

/// A downloaded document that still needs its metadata read.
struct Candidate {
    doc: EnumeratedDocument,
    existing: Option<DocumentRecord>,
}

#[derive(Default)]
struct PassPlan {
    all_paths: HashSet<String>,
    skipped: usize,
    placeholders: Vec<PlaceholderSeed>,
    /// Indexed before OCR finished; any of these may be fast-tracked.
    ocr_pending: Vec<Candidate>,
    /// No content indexed yet.
    unindexed: Vec<Candidate>,
    cancelled: bool,
}

/// Decides what each enumerated document needs from the store alone. Runs
/// on a blocking thread; no document content is read here.
fn plan_pass(
    store: &IndexStore,
    docs: Vec<EnumeratedDocument>,
    cancel: &AtomicBool,
) -> Result<PassPlan, AppError> {
    let mut plan = PassPlan {
        all_paths: docs.iter().map(|d| d.path.clone()).collect(),
        ..PassPlan::default()
    };

    for doc in docs {
        if cancel.load(Ordering::Relaxed) {
            plan.cancelled = true;
            return Ok(plan);
        }

        if store.is_fully_indexed(&doc.path)? {
            plan.skipped += 1;
            continue;
        }

        if !doc.is_downloaded {
            plan.placeholders
                .push(PlaceholderSeed::for_path(&doc.path, &doc.relative_folder));
            continue;
        }

        let existing = store.get_by_path(&doc.path)?;
        let indexed = existing.as_ref().is_some_and(|r| !r.is_placeholder);
        let candidate = Candidate { doc, existing };
        if indexed {
            plan.ocr_pending.push(candidate);
        } else {
            plan.unindexed.push(candidate);
        }
    }

    Ok(plan)
}

/// What one read batch turned out to need.
#[derive(Default)]
struct BatchWork {
    fast_track: Vec<IndexEntry>,
    full: Vec<IndexEntry>,
    placeholders: Vec<PlaceholderSeed>,
    unchanged: usize,
    failed: usize,
}

fn classify_batch(archive: &dyn ArchiveReader, batch: Vec<Candidate>) -> BatchWork {
    let mut work = BatchWork::default();
    for Candidate { doc, existing } in batch {
        let entry = match read_document(archive, &doc.path, &doc.relative_folder) {
            DocumentRead::Ready(entry) => entry,
            DocumentRead::Unavailable(e) => {
                debug!(path = %doc.path, error = %e, "metadata unreadable, treating as placeholder");
                work.placeholders
                    .push(PlaceholderSeed::for_path(&doc.path, &doc.relative_folder));
                continue;
            }
            DocumentRead::Invalid(e) => {
                warn!(path = %doc.path, error = %e, "skipping document with bad metadata");
                work.failed += 1;
                continue;
            }
        };

        match existing {
            Some(existing) if !existing.is_placeholder && entry.record.ocr_completed => {
                work.fast_track.push(entry);
            }
            Some(existing)
                if !existing.is_placeholder
                    && existing.modified_at == entry.record.modified_at
                    && existing.ocr_completed == entry.record.ocr_completed =>
            {
                work.unchanged += 1;
            }
            _ => work.full.push(entry),
        }
    }
    work
}

/// Brings the index in line with the live document tree.
pub struct Reconciler {
    store: Arc<IndexStore>,
    enumerator: Arc<dyn DocumentEnumerator>,
    archive: Arc<dyn ArchiveReader>,
    config: IndexConfig,
    root: std::path::PathBuf,
    cancel_flag: Arc<AtomicBool>,
    progress: SharedProgress,
    listener: Option<ProgressListener>,
    activity: Option<UserActivity>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: Arc<IndexStore>,
        enumerator: Arc<dyn DocumentEnumerator>,
        archive: Arc<dyn ArchiveReader>,
        config: IndexConfig,
        progress: SharedProgress,
    ) -> Self {
        let root = config
            .documents_root
            .canonicalize()
            .unwrap_or_else(|_| config.documents_root.clone());
        Self {
            store,
            enumerator,
            archive,
            config,
            root,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            progress,
            listener: None,
            activity: None,
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Pauses between chunks while the user is interacting.
    pub fn with_user_activity(mut self, activity: UserActivity) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn with_progress_listener(mut self, listener: ProgressListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    /// Stops the running pass at its next yield point, or the next pass if
    /// none is running.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    fn publish(&self, phase: ReconcilePhase, processed: usize, total: usize) {
        publish_progress(&self.progress, phase, processed, total);
        if let Some(listener) = &self.listener {
            listener(&IndexingProgressState {
                processed,
                total,
                phase,
            });
        }
    }

    async fn cooperate(&self, phase: ReconcilePhase, processed: usize, total: usize) {
        tokio::task::yield_now().await;
        let Some(activity) = &self.activity else {
            return;
        };
        let pause_ms = self.config.user_idle_pause_ms;
        if activity.is_active(pause_ms) {
            self.publish(ReconcilePhase::PausedForUser, processed, total);
            activity.wait_until_idle(pause_ms).await;
            self.publish(phase, processed, total);
        }
    }

    /// Runs one full reconciliation. On storage corruption the index is
    /// reset and the pass restarted once; a second corruption is returned.
    ///
    /// A cancellation requested before the run starts applies to it. The
    /// flag is cleared once the run ends.
    pub async fn run(&self) -> Result<ReconcileOutcome, AppError> {
        let Ok(_guard) = self.pass_lock.try_lock() else {
            debug!("reconciliation already running");
            return Ok(ReconcileOutcome {
                already_running: true,
                ..ReconcileOutcome::default()
            });
        };
        let result = self.run_with_recovery().await;
        self.cancel_flag.store(false, Ordering::Relaxed);
        result
    }

    async fn run_with_recovery(&self) -> Result<ReconcileOutcome, AppError> {
        let mut recovered = false;
        loop {
            match self.run_pass().await {
                Ok(mut outcome) => {
                    outcome.recovered_from_corruption = recovered;
                    let phase = if outcome.cancelled {
                        ReconcilePhase::Cancelled
                    } else {
                        ReconcilePhase::Idle
                    };
                    self.publish(phase, outcome.total, outcome.total);
                    info!(
                        total = outcome.total,
                        skipped = outcome.skipped,
                        fast_tracked = outcome.fast_tracked,
                        placeholders = outcome.placeholders_seeded,
                        indexed = outcome.indexed,
                        failed = outcome.failed,
                        pruned = outcome.pruned,
                        cancelled = outcome.cancelled,
                        "reconciliation finished"
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_corruption() && !recovered => {
                    error!(error = %e, "index corruption detected, rebuilding");
                    if let Err(reset_err) = self.store.reset() {
                        error!(error = %reset_err, "index reset failed");
                        self.publish(ReconcilePhase::Idle, 0, 0);
                        return Err(reset_err);
                    }
                    recovered = true;
                }
                Err(e) => {
                    error!(error = %e, "reconciliation aborted");
                    self.publish(ReconcilePhase::Idle, 0, 0);
                    return Err(e);
                }
            }
        }
    }

    async fn run_pass(&self) -> Result<ReconcileOutcome, AppError> {
        let mut outcome = ReconcileOutcome::default();
        self.publish(ReconcilePhase::Scanning, 0, 0);

        let enumerator = self.enumerator.clone();
        let docs = tokio::task::spawn_blocking(move || enumerator.list_all_recursive())
            .await
            .map_err(|e| AppError::General(format!("enumeration task failed: {e}")))??;
        outcome.total = docs.len();
        let total = outcome.total;

        if self.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let store = self.store.clone();
        let cancel = self.cancel_flag.clone();
        let plan = tokio::task::spawn_blocking(move || plan_pass(&store, docs, &cancel))
            .await
            .map_err(|e| AppError::General(format!("planning task failed: {e}")))??;

        outcome.skipped = plan.skipped;
        if plan.cancelled {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        let mut processed = plan.skipped;
        self.publish(ReconcilePhase::Indexing, processed, total);

        // Documents indexed before OCR finished go first.
        let PassPlan {
            all_paths,
            placeholders,
            ocr_pending,
            unindexed,
            ..
        } = plan;

        if !self
            .index_candidates(ocr_pending, &mut outcome, &mut processed, total)
            .await?
        {
            return Ok(outcome);
        }

        for chunk in placeholders.chunks(self.config.placeholder_chunk_size.max(1)) {
            if self.is_cancelled() {
                outcome.cancelled = true;
                return Ok(outcome);
            }
            self.seed_placeholders(chunk, &mut outcome)?;
            processed += chunk.len();
            self.publish(ReconcilePhase::Indexing, processed, total);
            self.cooperate(ReconcilePhase::Indexing, processed, total).await;
        }

        if !self
            .index_candidates(unindexed, &mut outcome, &mut processed, total)
            .await?
        {
            return Ok(outcome);
        }

        if self.is_cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }

        self.publish(ReconcilePhase::Pruning, processed, total);
        outcome.pruned = self.store.prune_stale(&all_paths)?;

        if outcome.indexed + outcome.fast_tracked > 0 {
            self.publish(ReconcilePhase::Optimizing, processed, total);
            match self.store.optimize() {
                Ok(()) => {}
                Err(e) if e.is_corruption() => return Err(e),
                Err(e) => warn!(error = %e, "index optimize failed"),
            }
        }

        Ok(outcome)
    }

    /// Reads and writes candidates one batch at a time, pausing between
    /// batches. Returns false when the pass was cancelled.
    async fn index_candidates(
        &self,
        candidates: Vec<Candidate>,
        outcome: &mut ReconcileOutcome,
        processed: &mut usize,
        total: usize,
    ) -> Result<bool, AppError> {
        let batch_size = self.config.index_batch_size.max(1);
        let mut remaining = candidates.into_iter().peekable();

        while remaining.peek().is_some() {
            if self.is_cancelled() {
                outcome.cancelled = true;
                return Ok(false);
            }
            let batch: Vec<Candidate> = remaining.by_ref().take(batch_size).collect();
            let size = batch.len();

            let archive = self.archive.clone();
            let work = tokio::task::spawn_blocking(move || classify_batch(archive.as_ref(), batch))
                .await
                .map_err(|e| AppError::General(format!("metadata read task failed: {e}")))?;

            outcome.unchanged += work.unchanged;
            outcome.failed += work.failed;

            for entry in &work.fast_track {
                match self.store.upsert(entry) {
                    Ok(()) => {
                        debug!(path = %entry.record.path, "fast-tracked OCR update");
                        outcome.fast_tracked += 1;
                    }
                    Err(e) if e.is_corruption() => return Err(e),
                    Err(e) => {
                        warn!(path = %entry.record.path, error = %e, "fast-track index failed");
                        outcome.failed += 1;
                    }
                }
            }
            self.seed_placeholders(&work.placeholders, outcome)?;
            if !work.full.is_empty() {
                let (indexed, failed) = self.write_batch(&work.full)?;
                outcome.indexed += indexed;
                outcome.failed += failed;
            }

            *processed += size;
            self.publish(ReconcilePhase::Indexing, *processed, total);
            tokio::time::sleep(self.config.index_batch_pause()).await;
            self.cooperate(ReconcilePhase::Indexing, *processed, total).await;
        }
        Ok(true)
    }

    /// One short transaction. A non-corruption failure counts the chunk as
    /// failed and lets the pass continue.
    fn seed_placeholders(
        &self,
        chunk: &[PlaceholderSeed],
        outcome: &mut ReconcileOutcome,
    ) -> Result<(), AppError> {
        match self.store.insert_placeholders(chunk) {
            Ok(inserted) => outcome.placeholders_seeded += inserted,
            Err(e) if e.is_corruption() => return Err(e),
            Err(e) => {
                warn!(error = %e, size = chunk.len(), "placeholder chunk failed");
                outcome.failed += chunk.len();
            }
        }
        Ok(())
    }

    /// Writes one batch atomically. A non-corruption failure falls back to
    /// per-document writes so one bad record only costs itself.
    fn write_batch(&self, batch: &[IndexEntry]) -> Result<(usize, usize), AppError> {
        match self.store.upsert_batch(batch) {
            Ok(()) => return Ok((batch.len(), 0)),
            Err(e) if e.is_corruption() => return Err(e),
            Err(e) => debug!(error = %e, size = batch.len(), "batch write failed, retrying singly"),
        }

        let mut indexed = 0;
        let mut failed = 0;
        for entry in batch {
            match self.store.upsert(entry) {
                Ok(()) => indexed += 1,
                Err(e) if e.is_corruption() => return Err(e),
                Err(e) => {
                    warn!(path = %entry.record.path, error = %e, "index write failed");
                    failed += 1;
                }
            }
        }
        Ok((indexed, failed))
    }

    /// Re-reads and indexes specific paths, typically ones the change
    /// monitor just saw finish downloading. Reads happen on a blocking
    /// thread; writes are throttled every few files.
    pub async fn reindex_paths(&self, paths: &[String]) -> Result<ReindexOutcome, AppError> {
        let mut outcome = ReindexOutcome::default();
        let every = self.config.reindex_throttle_every.max(1);

        for (i, path) in paths.iter().enumerate() {
            if i > 0 && i % every == 0 {
                tokio::time::sleep(self.config.reindex_throttle_pause()).await;
            }

            let archive = self.archive.clone();
            let folder = enumerator::relative_folder(&self.root, Path::new(path));
            let owned_path = path.clone();
            let read = tokio::task::spawn_blocking(move || {
                read_document(archive.as_ref(), &owned_path, &folder)
            })
            .await
            .map_err(|e| AppError::General(format!("metadata read task failed: {e}")))?;

            match read {
                DocumentRead::Ready(entry) => match self.store.upsert(&entry) {
                    Ok(()) => outcome.indexed += 1,
                    Err(e) if e.is_corruption() => return Err(e),
                    Err(e) => {
                        warn!(path = %path, error = %e, "re-index write failed");
                        outcome.failed += 1;
                    }
                },
                DocumentRead::Unavailable(e) => {
                    debug!(path = %path, error = %e, "downloaded document not readable yet");
                    outcome.unavailable += 1;
                }
                DocumentRead::Invalid(e) => {
                    warn!(path = %path, error = %e, "skipping document with bad metadata");
                    outcome.failed += 1;
                }
            }
        }

        if outcome.indexed > 0 {
            info!(indexed = outcome.indexed, "re-indexed downloaded documents");
        }
        Ok(outcome)
    }
}
