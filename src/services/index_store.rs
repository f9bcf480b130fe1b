use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, Transaction};
use tracing::{debug, info, warn};

use crate::data::{migrations, repository};
use crate::error::AppError;
use crate::models::document::{DocumentRecord, IndexEntry, PlaceholderSeed};
use crate::models::search::{IndexStats, SearchResult};

const STORE_SIDE_FILE_SUFFIXES: &[&str] = &["-wal", "-shm", "-journal"];

/// Turns free user input into an FTS5 expression.
///
/// Input containing a double quote is treated as a literal phrase query and
/// passed through. Anything else is split on whitespace and each term becomes
/// a quoted prefix match, so operators and punctuation in user input never
/// reach the query parser.
pub fn sanitize_query(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('"') {
        return Some(trimmed.to_string());
    }

    let terms: Vec<String> = trimmed
        .split_whitespace()
        .map(|term| term.replace(['\u{201C}', '\u{201D}', '\u{201E}'], ""))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\"*"))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

fn open_connection(path: &Path) -> Result<Connection, AppError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

fn open_memory() -> Result<Connection, AppError> {
    let conn = Connection::open_in_memory()?;
    migrations::run_migrations(&conn)?;
    Ok(conn)
}

fn remove_store_files(path: &Path) -> Result<(), AppError> {
    let mut targets = vec![path.to_path_buf()];
    for suffix in STORE_SIDE_FILE_SUFFIXES {
        let mut side = path.as_os_str().to_owned();
        side.push(suffix);
        targets.push(PathBuf::from(side));
    }
    for target in targets {
        match std::fs::remove_file(&target) {
            Ok(()) => debug!(path = %target.display(), "removed store file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Durable document index: one metadata row and one full-text row per
/// document. Every mutation runs inside a single transaction behind the
/// connection lock, so writers are serialized.
pub struct IndexStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    #[cfg(test)]
    injected_failures: Mutex<Option<(i32, usize)>>,
}

impl IndexStore {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let conn = open_connection(path)?;
        info!(path = %path.display(), "opened index store");
        Ok(Self::from_connection(conn, Some(path.to_path_buf())))
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Ok(Self::from_connection(open_memory()?, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn: Mutex::new(conn),
            path,
            #[cfg(test)]
            injected_failures: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn lock_for_tests(&self) -> MutexGuard<'_, Connection> {
        self.lock()
    }

    /// Makes the next write fail with the given SQLite result code.
    #[cfg(test)]
    pub(crate) fn inject_write_failure(&self, code: i32) {
        self.inject_write_failures(code, 1);
    }

    #[cfg(test)]
    pub(crate) fn inject_write_failures(&self, code: i32, count: usize) {
        *self
            .injected_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((code, count));
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> Result<(), AppError> {
        let mut pending = self
            .injected_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some((code, remaining)) = *pending else {
            return Ok(());
        };
        *pending = (remaining > 1).then_some((code, remaining - 1));
        Err(AppError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            Some("injected failure".to_string()),
        )))
    }

    fn write<T, F>(&self, op: F) -> Result<T, AppError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, AppError>,
    {
        #[cfg(test)]
        self.take_injected_failure()?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Replaces the document with the same id. Idempotent.
    pub fn upsert(&self, entry: &IndexEntry) -> Result<(), AppError> {
        self.write(|tx| repository::upsert_entry(tx, entry))
    }

    /// Like [`IndexStore::upsert`] for many documents, committed as one unit.
    pub fn upsert_batch(&self, entries: &[IndexEntry]) -> Result<(), AppError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.write(|tx| {
            for entry in entries {
                repository::upsert_entry(tx, entry)?;
            }
            Ok(())
        })
    }

    pub fn insert_placeholder(&self, seed: &PlaceholderSeed) -> Result<bool, AppError> {
        self.write(|tx| repository::insert_placeholder(tx, seed, Utc::now()))
    }

    /// Seeds a chunk of placeholders in one transaction. Returns how many
    /// rows were actually inserted.
    pub fn insert_placeholders(&self, seeds: &[PlaceholderSeed]) -> Result<usize, AppError> {
        if seeds.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        self.write(|tx| {
            let mut inserted = 0;
            for seed in seeds {
                if repository::insert_placeholder(tx, seed, now)? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    pub fn remove(&self, id: &str) -> Result<usize, AppError> {
        self.write(|tx| repository::delete_by_id(tx, id))
    }

    pub fn remove_by_path(&self, path: &str) -> Result<usize, AppError> {
        self.write(|tx| repository::delete_by_path(tx, path))
    }

    pub fn remove_batch(&self, paths: &[String]) -> Result<usize, AppError> {
        if paths.is_empty() {
            return Ok(0);
        }
        self.write(|tx| {
            let mut removed = 0;
            for path in paths {
                removed += repository::delete_by_path(tx, path)?;
            }
            Ok(removed)
        })
    }

    /// Deletes every document whose path is not in `valid_paths`.
    pub fn prune_stale(&self, valid_paths: &HashSet<String>) -> Result<usize, AppError> {
        let removed = self.write(|tx| {
            let mut removed = 0;
            for (id, path) in repository::list_ids_and_paths(tx)? {
                if !valid_paths.contains(&path) {
                    removed += repository::delete_by_id(tx, &id)?;
                }
            }
            Ok(removed)
        })?;
        if removed > 0 {
            info!(removed, "pruned stale index entries");
        }
        Ok(removed)
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, AppError> {
        let Some(fts_query) = sanitize_query(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        repository::search_fts(&self.lock(), &fts_query, limit)
    }

    pub fn count_placeholders(&self, folder_path: Option<&str>) -> Result<i64, AppError> {
        repository::count_placeholders(&self.lock(), folder_path)
    }

    pub fn is_fully_indexed(&self, path: &str) -> Result<bool, AppError> {
        repository::is_fully_indexed(&self.lock(), path)
    }

    pub fn is_indexed_by_path(&self, path: &str) -> Result<bool, AppError> {
        repository::is_indexed_by_path(&self.lock(), path)
    }

    pub fn get_by_path(&self, path: &str) -> Result<Option<DocumentRecord>, AppError> {
        repository::get_by_path(&self.lock(), path)
    }

    pub fn stats(&self) -> Result<IndexStats, AppError> {
        repository::stats(&self.lock())
    }

    pub fn optimize(&self) -> Result<(), AppError> {
        repository::optimize(&self.lock())
    }

    /// Drops the storage file (and its WAL/SHM companions) and recreates an
    /// empty index. Only used to recover from corruption.
    ///
    /// If the file cannot be recreated the store keeps serving from an empty
    /// in-memory index until the next successful reset.
    pub fn reset(&self) -> Result<(), AppError> {
        let mut conn = self.lock();
        let stale = std::mem::replace(&mut *conn, open_memory()?);
        if let Err((_, e)) = stale.close() {
            warn!(error = %e, "closing damaged index store failed");
        }
        if let Some(path) = &self.path {
            remove_store_files(path)?;
            *conn = open_connection(path)?;
        }
        warn!(path = ?self.path, "index store reset");
        Ok(())
    }
}
