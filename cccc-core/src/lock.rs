//! Cross-process locking.
//!
//! Advisory file locks guard every multi-writer file: inbox sequence
//! counters, ledger compaction, the global event log, and the bridge
//! singleton. The lock handle releases on drop (and on process death, which
//! is what makes the singleton lock safe against crashed bridges).
//!
//! Filesystems without working advisory locks fall back to a `mkdir`-based
//! mutex directory next to the lock file.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

const MAX_RETRIES: usize = 50;
const RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Held lock. Dropping it releases the underlying OS lock or mutex directory.
pub struct FileLock {
    inner: LockInner,
}

enum LockInner {
    Flock(File),
    MutexDir(PathBuf),
}

impl Drop for FileLock {
    fn drop(&mut self) {
        match &self.inner {
            LockInner::Flock(file) => {
                let _ = fs2::FileExt::unlock(file);
            }
            LockInner::MutexDir(dir) => {
                let _ = std::fs::remove_dir(dir);
            }
        }
    }
}

/// Acquire an exclusive lock, blocking (with bounded retries) until it is held.
pub fn acquire_exclusive(path: &Path) -> anyhow::Result<FileLock> {
    acquire(path, true)
}

/// Try to acquire an exclusive lock without waiting. `Ok(None)` means another
/// process holds it.
pub fn try_acquire_exclusive(path: &Path) -> anyhow::Result<Option<FileLock>> {
    match acquire(path, false) {
        Ok(lock) => Ok(Some(lock)),
        Err(e) if is_would_block(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

fn acquire(path: &Path, blocking: bool) -> anyhow::Result<FileLock> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open lock file {}", path.display()))?;

    match lock_file(&file, blocking) {
        Ok(()) => Ok(FileLock {
            inner: LockInner::Flock(file),
        }),
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
            Err(anyhow::Error::new(e).context("lock held by another process"))
        }
        // Advisory locks unsupported here (e.g. some network filesystems):
        // fall back to a mutex directory next to the lock file.
        Err(_) => mutex_dir_lock(path, blocking),
    }
}

// Calls are fully qualified: newer std ships inherent `File::try_lock_*`
// methods with a different error type, which would otherwise shadow fs2's.
fn lock_file(file: &File, blocking: bool) -> std::io::Result<()> {
    if blocking {
        for _ in 0..MAX_RETRIES {
            match fs2::FileExt::try_lock_exclusive(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(RETRY_SLEEP),
                Err(e) => return Err(e),
            }
        }
        // Last resort: a genuinely blocking acquire.
        fs2::FileExt::lock_exclusive(file)
    } else {
        fs2::FileExt::try_lock_exclusive(file)
    }
}

fn mutex_dir_lock(path: &Path, blocking: bool) -> anyhow::Result<FileLock> {
    let dir = path.with_extension("lckdir");
    let attempts = if blocking { MAX_RETRIES } else { 1 };
    for _ in 0..attempts {
        match std::fs::create_dir(&dir) {
            Ok(()) => {
                return Ok(FileLock {
                    inner: LockInner::MutexDir(dir),
                });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if blocking {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to create mutex dir {}", dir.display())));
            }
        }
    }
    Err(anyhow::Error::new(std::io::Error::new(
        ErrorKind::WouldBlock,
        "mutex dir held by another process",
    )))
}

fn is_would_block(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_lock_blocks_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let held = acquire_exclusive(&path).unwrap();
        assert!(try_acquire_exclusive(&path).unwrap().is_none());
        drop(held);
        assert!(try_acquire_exclusive(&path).unwrap().is_some());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("y.lock");
        {
            let _held = acquire_exclusive(&path).unwrap();
        }
        let again = acquire_exclusive(&path);
        assert!(again.is_ok());
    }

    #[test]
    fn concurrent_holders_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("z.lock");
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let path = path.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                let _held = acquire_exclusive(&path).unwrap();
                let v = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                // While held, nobody else may have bumped the counter.
                std::thread::sleep(Duration::from_millis(5));
                assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), v + 1);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 8);
    }
}
