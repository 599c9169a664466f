//! Cross-process advisory lock around enforcement state.
//!
//! The scheduled update, the watchdog, the captive-portal detector and
//! manual CLI overrides may all run at once, in different processes. Each
//! state-mutating coordinator operation takes this lock without blocking;
//! a caller that cannot get it skips its tick and retries on the next one.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Holds the exclusive lock; released when dropped (the file is closed).
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Try to take the lock at `path` without waiting.
    ///
    /// Returns `Ok(None)` when another holder has it. Errors are reserved
    /// for failures to open the lock file itself.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {:?}", parent))?;
        }

        // create+read+write without truncate avoids a create/lock race
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                _file: file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EWOULDBLOCK) => {
                debug!("Lock {:?} is held by another caller", path);
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to lock {:?}", path)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
