//! Filesystem utilities.
//!
//! This module provides safe primitives for writing queue files in a crash-tolerant way.
//!
//! Every file a reader may observe concurrently (queue store, progress sidecars) is
//! produced by writing a sibling temporary file and renaming it over the destination,
//! so readers see either the old or the new content and never a partial write.

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::core::{QueueError, QueueResult};

// =============================================================================
// Path Validation Utilities
// =============================================================================

/// Validates that an identifier component is safe to embed in a file name.
///
/// Task ids become part of sidecar and signal file names, so anything that could
/// escape the queue directory is rejected:
/// - Empty strings
/// - Path traversal sequences (`..`)
/// - Path separators (`/`, `\`)
/// - Drive letter indicators (`:`)
/// - Control characters
pub fn validate_path_id_component(id: &str, label: &str) -> QueueResult<()> {
    let trimmed = id.trim();
    if trimmed.is_empty() || trimmed.len() != id.len() {
        return Err(QueueError::InvalidTaskId(format!(
            "{label} is empty or has surrounding whitespace"
        )));
    }
    if trimmed.contains("..")
        || trimmed.contains('/')
        || trimmed.contains('\\')
        || trimmed.contains(':')
    {
        return Err(QueueError::InvalidTaskId(format!(
            "{label} contains path traversal characters: {id}"
        )));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(QueueError::InvalidTaskId(format!(
            "{label} contains control characters"
        )));
    }
    if trimmed.len() > 128 {
        return Err(QueueError::InvalidTaskId(format!(
            "{label} is too long (max 128 chars)"
        )));
    }
    Ok(())
}

// =============================================================================
// Atomic Writes
// =============================================================================

/// Write bytes to `path` using an atomic replace pattern.
///
/// Implementation notes:
/// - Write to a sibling temporary file in the same directory.
/// - Flush and sync the temp file.
/// - Rename over the destination (replaces atomically on Unix and on NTFS).
/// - If the plain rename is refused, fall back to a backup swap.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> QueueResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_path_for(path);
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(bytes)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    atomic_replace(path, &tmp_path)
}

/// Write a JSON file atomically with pretty formatting.
pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> QueueResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Removes a file, treating "already gone" as success.
///
/// Returns `true` when a file was actually deleted.
pub fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Moves a damaged file aside as `<name>.corrupt-<timestamp>` and returns the new path.
pub fn quarantine_file(path: &Path) -> QueueResult<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f");
    let mut target = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "queue".to_string());
    target.set_file_name(format!("{file_name}.corrupt-{stamp}"));
    std::fs::rename(path, &target)?;
    Ok(target)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "tmp".to_string());
    tmp.set_file_name(format!("{file_name}.tmp"));
    tmp
}

fn bak_path_for(path: &Path) -> PathBuf {
    let mut bak = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "bak".to_string());
    bak.set_file_name(format!("{file_name}.bak"));
    bak
}

fn atomic_replace(dest: &Path, src_tmp: &Path) -> QueueResult<()> {
    let first_err = match std::fs::rename(src_tmp, dest) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    if !dest.exists() {
        let _ = std::fs::remove_file(src_tmp);
        return Err(QueueError::IoError(first_err));
    }

    // Some filesystems refuse rename-over-existing; swap through a backup instead.
    let bak = bak_path_for(dest);
    if bak.exists() {
        let _ = std::fs::remove_file(&bak);
    }

    std::fs::rename(dest, &bak)?;
    match std::fs::rename(src_tmp, dest) {
        Ok(()) => {
            let _ = std::fs::remove_file(&bak);
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::rename(&bak, dest);
            let _ = std::fs::remove_file(src_tmp);
            Err(QueueError::IoError(e))
        }
    }
}
