//! Common utility functions used across modules.
//!
//! - [`write_atomic`] - Write a file through a temporary file + rename
//! - [`format_duration_ago`] - Human-readable age of a timestamp
//! - [`truncate`] - Truncate strings with ellipsis

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write `contents` to `path` so that readers never observe a partial file.
///
/// The temporary file is created in the same directory as the target so
/// the final rename stays on one filesystem.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_file = stage_file(path, contents)?;
    temp_file
        .persist(path)
        .with_context(|| format!("Failed to persist {:?}", path))?;
    Ok(())
}

/// Write `contents` to a synced temporary file next to `path` without
/// replacing it. The caller decides whether to `persist` it.
pub fn stage_file(path: &Path, contents: &[u8]) -> Result<NamedTempFile> {
    let parent_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("Failed to create directory {:?}", parent_dir))?;

    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .with_context(|| format!("Failed to create temporary file in {:?}", parent_dir))?;
    temp_file.write_all(contents)?;
    temp_file.as_file().sync_all()?;
    Ok(temp_file)
}

/// Format duration since a timestamp
pub fn format_duration_ago(dt: DateTime<Utc>) -> String {
    let seconds = Utc::now().signed_duration_since(dt).num_seconds();
    if seconds < 60 {
        "just now".to_string()
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else if seconds < 86400 {
        format!("{}h ago", seconds / 3600)
    } else {
        format!("{}d ago", seconds / 86400)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
///
/// # Examples
/// ```
/// use openpath::utils::truncate;
/// assert_eq!(truncate("short", 10), "short");
/// assert_eq!(truncate("this is long", 10), "this is...");
/// ```
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
