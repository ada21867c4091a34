// src/lock.rs

//! Whole-archive exclusive advisory lock
//!
//! Every mutating operation takes this lock on `<archive>/.lock` before
//! touching the archive or the database. Readers do not take it and must
//! tolerate observing a half-finished mutation.
//!
//! Re-entrant acquisition by the same process is a programming bug, not a
//! recoverable condition, and panics.

use crate::error::{Error, Result};
use crate::layout;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Set while this process holds the archive lock
static PROCESS_HOLDS_LOCK: AtomicBool = AtomicBool::new(false);

/// Exclusive advisory lock over an entire archive
///
/// The lock is released on [`ArchiveLock::release`] or on drop.
pub struct ArchiveLock {
    file: Option<File>,
    path: PathBuf,
}

impl ArchiveLock {
    /// Acquire the archive lock.
    ///
    /// With `wait` true, blocks until the lock is free; otherwise fails
    /// immediately with [`Error::LockHeld`] if another process holds it.
    /// `reason` is logged at acquire for operator visibility.
    ///
    /// # Panics
    ///
    /// Panics if this process already holds the lock.
    pub fn acquire(archive: &Path, reason: &str, wait: bool) -> Result<Self> {
        assert!(
            !PROCESS_HOLDS_LOCK.swap(true, Ordering::SeqCst),
            "archive lock acquired twice by the same process"
        );

        let path = layout::lock_path(archive);
        let result = Self::do_acquire(&path, reason, wait);
        if result.is_err() {
            PROCESS_HOLDS_LOCK.store(false, Ordering::SeqCst);
        }
        result
    }

    fn do_acquire(path: &Path, reason: &str, wait: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if wait {
            file.lock_exclusive()?;
        } else {
            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Err(Error::LockHeld(path.display().to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!("Acquired archive lock at {:?}: {}", path, reason);
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    /// Drop the lock and close the lock file
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
            PROCESS_HOLDS_LOCK.store(false, Ordering::SeqCst);
            debug!("Released archive lock at {:?}", self.path);
        }
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}
