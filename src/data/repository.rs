use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::error::AppError;
use crate::models::document::{document_id_for_path, DocumentRecord, IndexEntry, PlaceholderSeed};
use crate::models::search::{IndexStats, SearchResult};

/// bm25 column weights: document_id, title, full_text, tags.
const BM25_WEIGHTS: &str = "0.0, 100.0, 1.0, 10.0";
const SNIPPET_TOKENS: i64 = 12;

const RECORD_COLUMNS: &str = "id, path, title, folder_path, created_at, modified_at, page_count, \
     file_size_bytes, tags_csv, ocr_completed, has_pending_draft_page, is_placeholder, indexed_at";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        title: row.get(2)?,
        folder_path: row.get(3)?,
        created_at: row.get(4)?,
        modified_at: row.get(5)?,
        page_count: row.get(6)?,
        file_size_bytes: row.get(7)?,
        tags_csv: row.get(8)?,
        ocr_completed: row.get(9)?,
        has_pending_draft_page: row.get(10)?,
        is_placeholder: row.get(11)?,
        indexed_at: row.get(12)?,
    })
}

fn delete_row(conn: &Connection, id: &str) -> Result<usize, AppError> {
    conn.execute(
        "DELETE FROM documents_fts WHERE document_id = ?1",
        params![id],
    )?;
    let count = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
    Ok(count)
}

/// Writes both halves of a document. Any other row holding the same path
/// (normally its placeholder) is removed first so the path stays unique.
/// An id already owned by a different path is not taken over; the document
/// is keyed by its path instead.
pub fn upsert_entry(conn: &Connection, entry: &IndexEntry) -> Result<(), AppError> {
    let record = &entry.record;

    let owner: Option<String> = conn
        .prepare_cached("SELECT path FROM documents WHERE id = ?1")?
        .query_row(params![record.id], |row| row.get(0))
        .optional()?;
    let id = match owner {
        Some(owner) if owner != record.path => {
            warn!(
                id = %record.id,
                path = %record.path,
                owner = %owner,
                "document id already in use, keying by path"
            );
            document_id_for_path(&record.path)
        }
        _ => record.id.clone(),
    };

    let displaced: Vec<String> = conn
        .prepare_cached("SELECT id FROM documents WHERE path = ?1 AND id <> ?2")?
        .query_map(params![record.path, id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    for id in &displaced {
        delete_row(conn, id)?;
    }

    conn.execute(
        "DELETE FROM documents_fts WHERE document_id = ?1",
        params![id],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO documents (id, path, title, folder_path, created_at, modified_at, page_count,
             file_size_bytes, tags_csv, ocr_completed, has_pending_draft_page, is_placeholder, indexed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            id,
            record.path,
            record.title,
            record.folder_path,
            record.created_at,
            record.modified_at,
            record.page_count,
            record.file_size_bytes,
            record.tags_csv,
            record.ocr_completed,
            record.has_pending_draft_page,
            record.is_placeholder,
            record.indexed_at,
        ],
    )?;
    conn.execute(
        "INSERT INTO documents_fts (document_id, title, full_text, tags) VALUES (?1, ?2, ?3, ?4)",
        params![
            id,
            entry.search.title,
            entry.search.full_text,
            entry.search.tags,
        ],
    )?;
    Ok(())
}

/// Insert-if-absent by path. Returns whether a row was written.
pub fn insert_placeholder(
    conn: &Connection,
    seed: &PlaceholderSeed,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let exists: bool = conn
        .prepare_cached("SELECT EXISTS(SELECT 1 FROM documents WHERE path = ?1)")?
        .query_row(params![seed.path], |row| row.get(0))?;
    if exists {
        return Ok(false);
    }

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO documents (id, path, title, folder_path, is_placeholder, indexed_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        params![seed.id, seed.path, seed.title, seed.folder_path, now],
    )?;
    if inserted == 0 {
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO documents_fts (document_id, title, full_text, tags) VALUES (?1, ?2, '', '')",
        params![seed.id, seed.title],
    )?;
    Ok(true)
}

pub fn delete_by_id(conn: &Connection, id: &str) -> Result<usize, AppError> {
    delete_row(conn, id)
}

pub fn delete_by_path(conn: &Connection, path: &str) -> Result<usize, AppError> {
    let id: Option<String> = conn
        .prepare_cached("SELECT id FROM documents WHERE path = ?1")?
        .query_row(params![path], |row| row.get(0))
        .optional()?;
    match id {
        Some(id) => delete_row(conn, &id),
        None => Ok(0),
    }
}

/// Every (id, path) pair in the index.
pub fn list_ids_and_paths(conn: &Connection) -> Result<Vec<(String, String)>, AppError> {
    let rows = conn
        .prepare("SELECT id, path FROM documents")?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

pub fn get_by_path(conn: &Connection, path: &str) -> Result<Option<DocumentRecord>, AppError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM documents WHERE path = ?1");
    let record = conn
        .prepare_cached(&sql)?
        .query_row(params![path], record_from_row)
        .optional()?;
    Ok(record)
}

pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<DocumentRecord>, AppError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM documents WHERE id = ?1");
    let record = conn
        .prepare_cached(&sql)?
        .query_row(params![id], record_from_row)
        .optional()?;
    Ok(record)
}

pub fn count_placeholders(conn: &Connection, folder_path: Option<&str>) -> Result<i64, AppError> {
    let count = match folder_path {
        Some(folder) => conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE is_placeholder = 1 AND folder_path = ?1",
            params![folder],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE is_placeholder = 1",
            [],
            |row| row.get(0),
        )?,
    };
    Ok(count)
}

/// Content indexed and OCR complete.
pub fn is_fully_indexed(conn: &Connection, path: &str) -> Result<bool, AppError> {
    let found = conn
        .prepare_cached(
            "SELECT EXISTS(SELECT 1 FROM documents
             WHERE path = ?1 AND is_placeholder = 0 AND ocr_completed = 1)",
        )?
        .query_row(params![path], |row| row.get(0))?;
    Ok(found)
}

/// Content indexed, regardless of OCR state.
pub fn is_indexed_by_path(conn: &Connection, path: &str) -> Result<bool, AppError> {
    let found = conn
        .prepare_cached(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE path = ?1 AND is_placeholder = 0)",
        )?
        .query_row(params![path], |row| row.get(0))?;
    Ok(found)
}

pub fn search_fts(
    conn: &Connection,
    fts_query: &str,
    limit: usize,
) -> Result<Vec<SearchResult>, AppError> {
    let sql = format!(
        "SELECT d.id, d.path, d.title,
                snippet(documents_fts, -1, '[', ']', '…', {SNIPPET_TOKENS}),
                d.page_count, d.folder_path, d.file_size_bytes, d.ocr_completed, d.modified_at,
                bm25(documents_fts, {BM25_WEIGHTS}) AS rank
         FROM documents_fts
         JOIN documents d ON d.id = documents_fts.document_id
         WHERE documents_fts MATCH ?1
         ORDER BY rank
         LIMIT ?2"
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let results = conn
        .prepare_cached(&sql)?
        .query_map(params![fts_query, limit], |row| {
            let rank: f64 = row.get(9)?;
            Ok(SearchResult {
                id: row.get(0)?,
                path: row.get(1)?,
                title: row.get(2)?,
                snippet: row.get(3)?,
                page_count: row.get(4)?,
                folder_path: row.get(5)?,
                file_size_bytes: row.get(6)?,
                ocr_completed: row.get(7)?,
                modified_at: row.get(8)?,
                score: -rank,
            })
        })?
        .collect::<Result<_, _>>()?;
    Ok(results)
}

pub fn stats(conn: &Connection) -> Result<IndexStats, AppError> {
    let stats = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(is_placeholder), 0),
                COALESCE(SUM(CASE WHEN is_placeholder = 0 AND ocr_completed = 1 THEN 1 ELSE 0 END), 0)
         FROM documents",
        [],
        |row| {
            Ok(IndexStats {
                documents: row.get(0)?,
                placeholders: row.get(1)?,
                ocr_completed: row.get(2)?,
            })
        },
    )?;
    Ok(stats)
}

/// Merges FTS segments and refreshes planner statistics.
pub fn optimize(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch(
        "INSERT INTO documents_fts(documents_fts) VALUES('optimize');
         PRAGMA optimize;",
    )?;
    Ok(())
}
