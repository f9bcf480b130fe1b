use std::path::Path;

use serde::Deserialize;

use crate::error::AppError;
use crate::models::document::DocumentMetadata;

pub const CURRENT_FORMAT_VERSION: u32 = 2;

/// Metadata block as stored in a document archive, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMetadata {
    pub bytes: Vec<u8>,
    pub format_version: u32,
}

/// Reads the metadata block of a document archive. Any error means the
/// archive is not readable locally right now.
pub trait ArchiveReader: Send + Sync {
    fn read_metadata(&self, path: &Path) -> Result<RawMetadata, AppError>;
}

pub fn decode_metadata(raw: &RawMetadata) -> Result<DocumentMetadata, AppError> {
    if raw.format_version == 0 || raw.format_version > CURRENT_FORMAT_VERSION {
        return Err(AppError::Metadata(format!(
            "unsupported format version {}",
            raw.format_version
        )));
    }
    let mut meta: DocumentMetadata = serde_json::from_slice(&raw.bytes)
        .map_err(|e| AppError::Metadata(format!("decode failed: {e}")))?;
    meta.format_version = raw.format_version;
    Ok(meta)
}

#[derive(Deserialize)]
struct VersionPeek {
    #[serde(default = "default_version")]
    format_version: u32,
}

fn default_version() -> u32 {
    1
}

/// Archives whose metadata block is the whole file, serialized as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonArchiveReader;

impl ArchiveReader for JsonArchiveReader {
    fn read_metadata(&self, path: &Path) -> Result<RawMetadata, AppError> {
        let bytes = std::fs::read(path)?;
        let peek: VersionPeek = serde_json::from_slice(&bytes)?;
        Ok(RawMetadata {
            bytes,
            format_version: peek.format_version,
        })
    }
}
