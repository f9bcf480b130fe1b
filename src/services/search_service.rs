use rusqlite::ErrorCode;
use tracing::debug;

use crate::error::AppError;
use crate::models::search::SearchResult;
use crate::services::index_store::IndexStore;

const QUERY_ERROR_MARKERS: &[&str] = &["fts5", "syntax error", "unterminated string"];

/// Quoted input reaches FTS5 verbatim, so a malformed phrase is a user typo
/// rather than a storage failure.
fn is_query_syntax_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, Some(message)) => {
            failure.code == ErrorCode::Unknown
                && QUERY_ERROR_MARKERS
                    .iter()
                    .any(|marker| message.contains(marker))
        }
        _ => false,
    }
}

pub fn search(store: &IndexStore, query: &str, limit: usize) -> Result<Vec<SearchResult>, AppError> {
    match store.search(query, limit) {
        Ok(results) => Ok(results),
        Err(AppError::Database(e)) if is_query_syntax_error(&e) => {
            debug!(query, error = %e, "ignoring malformed search query");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}
