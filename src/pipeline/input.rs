//! Input validation: make sure a user-supplied path is a readable PDF.
//!
//! pdfium reports a missing file and a garbage file with the same opaque
//! error, so the `%PDF` magic bytes are checked here first to give the
//! caller a precise [`RasterizeError`].

use crate::error::RasterizeError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// Validate that `path` exists, is readable, and starts with `%PDF`.
pub fn resolve_local(path: &Path) -> Result<PathBuf, RasterizeError> {
    let path = path.to_path_buf();

    if !path.is_file() {
        return Err(RasterizeError::FileNotFound { path });
    }

    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(RasterizeError::PermissionDenied { path });
        }
        Err(_) => return Err(RasterizeError::FileNotFound { path }),
    };

    let mut magic = Vec::with_capacity(PDF_MAGIC.len());
    file.by_ref()
        .take(PDF_MAGIC.len() as u64)
        .read_to_end(&mut magic)
        .map_err(|e| RasterizeError::CorruptPdf {
            path: path.clone(),
            detail: e.to_string(),
        })?;

    if magic.as_slice() != PDF_MAGIC {
        return Err(RasterizeError::NotAPdf { path, magic });
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(path)
}
