//! File-based coordination between the agent, the watchdogs and the UI.
//!
//! Each file has exactly one writer. Writers replace whole files through a
//! temp file and rename so readers see either the old or the new content.
//! Cross-process exclusion uses [`FileLease`] in place of a mutex.

mod coordination;
mod lease;

pub use coordination::CoordinationStore;
pub use lease::FileLease;

use std::io::Write;
use std::path::Path;

use crate::error::{Result, WardenError};

/// Writes `payload` to a temp file next to `path` and renames it into place.
pub(crate) fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(dir)
        .map_err(|e| WardenError::io(format!("Failed to create {}", dir.display()), e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| WardenError::io("Failed to create temp file", e))?;
    tmp.write_all(payload)
        .map_err(|e| WardenError::io("Failed to write temp file", e))?;
    tmp.flush()
        .map_err(|e| WardenError::io("Failed to flush temp file", e))?;
    tmp.persist(path).map_err(|e| {
        WardenError::io(format!("Failed to persist {}", path.display()), e.error)
    })?;
    Ok(())
}
