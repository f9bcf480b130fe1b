use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::AppError;

const STUB_SUFFIX: &str = ".icloud";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedDocument {
    pub path: String,
    /// Parent folder relative to the documents root; empty at the root.
    pub relative_folder: String,
    /// False when only a cloud stub exists locally.
    pub is_downloaded: bool,
}

/// Lists every document under the documents root. Implementations must
/// resolve symlinks so a path means the same file on every call.
pub trait DocumentEnumerator: Send + Sync {
    fn list_all_recursive(&self) -> Result<Vec<EnumeratedDocument>, AppError>;
}

/// Path of the document a cloud stub (`.<name>.icloud`) stands in for.
pub fn stub_target(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let inner = name.strip_prefix('.')?.strip_suffix(STUB_SUFFIX)?;
    if inner.is_empty() {
        return None;
    }
    Some(path.with_file_name(inner))
}

pub fn relative_folder(root: &Path, path: &Path) -> String {
    path.parent()
        .and_then(|parent| parent.strip_prefix(root).ok())
        .map(|rel| rel.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with('.'))
            .unwrap_or(false)
}

/// Walks a local directory tree for files carrying the document extension.
pub struct FsEnumerator {
    root: PathBuf,
    extension: String,
}

impl FsEnumerator {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn is_document(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }
}

impl DocumentEnumerator for FsEnumerator {
    fn list_all_recursive(&self) -> Result<Vec<EnumeratedDocument>, AppError> {
        let root = self.root.canonicalize()?;
        let mut found: BTreeMap<String, EnumeratedDocument> = BTreeMap::new();

        let walker = walkdir::WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| !(e.file_type().is_dir() && is_hidden(e)))
            .filter_map(|e| e.ok());

        for entry in walker {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            if let Some(target) = stub_target(path) {
                if !self.is_document(&target) {
                    continue;
                }
                let parent = target.parent().unwrap_or(root.as_path());
                let target = canonical(parent).join(target.file_name().unwrap_or_default());
                let key = target.to_string_lossy().to_string();
                found.entry(key.clone()).or_insert(EnumeratedDocument {
                    path: key,
                    relative_folder: relative_folder(&root, &target),
                    is_downloaded: false,
                });
                continue;
            }

            if is_hidden(&entry) || !self.is_document(path) {
                continue;
            }
            let resolved = canonical(path);
            let key = resolved.to_string_lossy().to_string();
            found.insert(
                key.clone(),
                EnumeratedDocument {
                    path: key,
                    relative_folder: relative_folder(&root, &resolved),
                    is_downloaded: true,
                },
            );
        }

        debug!(root = %root.display(), documents = found.len(), "enumerated documents");
        Ok(found.into_values().collect())
    }
}
