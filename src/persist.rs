//! Atomic persistence and the catalog cache lock.
//!
//! Two primitives used everywhere a file is written or cache integrity
//! matters:
//!
//! - [`write_atomic`]: write `<path>.tmp` then rename over `<path>`, so a
//!   concurrent reader never observes a partially written file.
//! - [`CacheLock`]: advisory exclusive lock on `<cache-dir>/.catalog.lock`
//!   with a bounded retry budget. The lock serializes writers; the atomic
//!   rename keeps readers correct without locking.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Lock acquisition retries: 50 attempts x 100 ms = 5 s budget.
const LOCK_RETRIES: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Name of the lock file inside the cache directory.
pub const LOCK_FILE_NAME: &str = ".catalog.lock";

/// Write `bytes` to `path` atomically: temp-write then rename.
///
/// On rename failure the temp file is removed before the error is returned,
/// so a crashed writer leaves no droppings next to the real file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::Io(e).context(format!("renaming {} into place", tmp.display())));
    }
    Ok(())
}

/// [`write_atomic`] with a POSIX file mode applied to the temp file before
/// the rename, so the final file never exists with looser permissions.
/// On non-POSIX platforms the mode is ignored.
#[cfg_attr(not(unix), allow(unused_variables))]
pub fn write_atomic_mode(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_sibling(path);
    fs::write(&tmp, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::Io(e).context(format!("renaming {} into place", tmp.display())));
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Advisory exclusive lock on the catalog cache.
///
/// Writers wrap their critical section in [`with_cache_lock`]; readers do
/// not lock at all and rely on [`write_atomic`] for consistency.
pub struct CacheLock {
    lock: fd_lock::RwLock<File>,
    path: PathBuf,
}

impl CacheLock {
    /// Open (creating if absent) the lock file in `cache_dir`.
    pub fn open(cache_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cache_dir)?;
        let path = cache_dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        Ok(Self {
            lock: fd_lock::RwLock::new(file),
            path,
        })
    }

    /// Run `f` while holding the exclusive lock.
    ///
    /// Retries acquisition up to the 5 s budget, then fails with
    /// [`Error::LockTimeout`]. The guard is released on every exit path,
    /// including panics, because the fd-lock guard unlocks on drop.
    pub fn with<T>(&mut self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut attempts = 0;
        loop {
            match self.lock.try_write() {
                Ok(guard) => {
                    let result = f();
                    drop(guard);
                    return result;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    attempts += 1;
                    if attempts >= LOCK_RETRIES {
                        return Err(Error::LockTimeout(self.path.clone()));
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(e) => return Err(Error::Io(e).context("acquiring catalog cache lock")),
            }
        }
    }
}

/// Convenience wrapper: open the lock in `cache_dir` and run `f` under it.
pub fn with_cache_lock<T>(cache_dir: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let mut lock = CacheLock::open(cache_dir)?;
    lock.with(f)
}

/// Log a warning at most once per process.
///
/// Used for non-fatal noise that would otherwise repeat every loop
/// iteration (lock release failures, per-show remote probe errors).
pub struct WarnOnce {
    fired: AtomicBool,
}

impl WarnOnce {
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Emit the warning if it has not fired yet.
    pub fn warn(&self, message: &str) {
        if !self.fired.swap(true, Ordering::Relaxed) {
            warn!("{message}");
        }
    }

    #[cfg(test)]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Relaxed)
    }
}

impl Default for WarnOnce {
    fn default() -> Self {
        Self::new()
    }
}
