use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const USER_INTERACTION_PAUSE_SLEEP_MS: u64 = 120;

/// Where a reconciliation pass currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePhase {
    Idle,
    Scanning,
    Indexing,
    Pruning,
    Optimizing,
    Cancelled,
    PausedForUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingProgressState {
    pub processed: usize,
    pub total: usize,
    pub phase: ReconcilePhase,
}

impl Default for IndexingProgressState {
    fn default() -> Self {
        Self {
            processed: 0,
            total: 0,
            phase: ReconcilePhase::Idle,
        }
    }
}

pub type SharedProgress = Arc<Mutex<IndexingProgressState>>;

/// Called with every progress update, e.g. to forward it to a UI.
pub type ProgressListener = Arc<dyn Fn(&IndexingProgressState) + Send + Sync>;

pub fn new_shared_progress() -> SharedProgress {
    Arc::new(Mutex::new(IndexingProgressState::default()))
}

pub fn publish_progress(
    progress: &SharedProgress,
    phase: ReconcilePhase,
    processed: usize,
    total: usize,
) {
    let mut guard = progress
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = IndexingProgressState {
        processed,
        total,
        phase,
    };
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Timestamp of the last interactive input, used to keep background
/// indexing out of the way while the user is active.
#[derive(Debug, Clone, Default)]
pub struct UserActivity {
    last_interaction_at: Arc<AtomicI64>,
}

impl UserActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_interaction(&self) {
        self.last_interaction_at
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn is_active(&self, pause_ms: i64) -> bool {
        let last = self.last_interaction_at.load(Ordering::Relaxed);
        last > 0 && now_millis().saturating_sub(last) < pause_ms
    }

    /// Sleeps until no input has arrived for `pause_ms`. Returns whether it
    /// had to wait at all.
    pub async fn wait_until_idle(&self, pause_ms: i64) -> bool {
        let mut waited = false;
        while self.is_active(pause_ms) {
            waited = true;
            tokio::time::sleep(Duration::from_millis(USER_INTERACTION_PAUSE_SLEEP_MS)).await;
        }
        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_is_idle() {
        let activity = UserActivity::new();
        assert!(!activity.is_active(1500));
    }

    #[test]
    fn interaction_marks_active_within_window() {
        let activity = UserActivity::new();
        activity.notify_interaction();
        assert!(activity.is_active(60_000));
        assert!(!activity.is_active(0));
    }

    #[test]
    fn clones_share_the_timestamp() {
        let activity = UserActivity::new();
        let ui_side = activity.clone();
        ui_side.notify_interaction();
        assert!(activity.is_active(60_000));
    }

    #[test]
    fn publish_overwrites_progress() {
        let progress = new_shared_progress();
        publish_progress(&progress, ReconcilePhase::Indexing, 3, 10);
        let snapshot = progress.lock().unwrap().clone();
        assert_eq!(snapshot.phase, ReconcilePhase::Indexing);
        assert_eq!((snapshot.processed, snapshot.total), (3, 10));
    }

    #[tokio::test]
    async fn idle_tracker_does_not_wait() {
        let activity = UserActivity::new();
        assert!(!activity.wait_until_idle(1500).await);
    }
}
