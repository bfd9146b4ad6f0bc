//! Advisory, non-blocking, per-(node, purpose) locks.
//!
//! A lock is a `<purpose>.lock` file in the node's spool directory. Holding
//! it means "someone is already tossing/checking/calling this node"; a
//! second acquirer gets `LockError::Busy` immediately instead of waiting.
//! The lock file itself is never removed; only the OS-level lock on it
//! matters.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Platform lock primitive: at most one holder per path, advisory only.
pub trait AdvisoryLock: Sized {
    /// Take the lock or fail with `Busy` without blocking.
    fn acquire_nonblocking(path: &Path) -> Result<Self, LockError>;

    fn release(&mut self) -> io::Result<()>;
}

/// `flock(2)`-based lock. Distinct opens of the same file contend with each
/// other, within one process as well as across processes.
#[derive(Debug)]
pub struct FlockFile {
    file: Option<File>,
    path: PathBuf,
}

#[cfg(unix)]
impl AdvisoryLock for FlockFile {
    fn acquire_nonblocking(path: &Path) -> Result<Self, LockError> {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| LockError::io(path, e))?;
        // Safety: the fd belongs to `file`, which is open for the whole call
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
                    Err(LockError::Busy(path.to_path_buf()))
                }
                _ => Err(LockError::io(path, err)),
            };
        }
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    fn release(&mut self) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        if let Some(file) = self.file.take() {
            // Safety: the fd belongs to `file`, which is dropped only after the call
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                return Err(io::Error::new(
                    err.kind(),
                    format!("unlock {}: {err}", self.path.display()),
                ));
            }
        }
        Ok(())
    }
}

/// Fallback without flock: the lock is the existence of the file.
#[cfg(not(unix))]
impl AdvisoryLock for FlockFile {
    fn acquire_nonblocking(path: &Path) -> Result<Self, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Self {
                file: Some(file),
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(LockError::Busy(path.to_path_buf()))
            }
            Err(e) => Err(LockError::io(path, e)),
        }
    }

    fn release(&mut self) -> io::Result<()> {
        if self.file.take().is_some() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// A held lock. Released when dropped, on every exit path.
#[derive(Debug)]
pub struct SpoolLock<L: AdvisoryLock = FlockFile> {
    inner: L,
    path: PathBuf,
}

impl<L: AdvisoryLock> SpoolLock<L> {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let inner = L::acquire_nonblocking(path)?;
        tracing::debug!(lock = %path.display(), "acquired");
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<L: AdvisoryLock> Drop for SpoolLock<L> {
    fn drop(&mut self) {
        match self.inner.release() {
            Ok(()) => tracing::debug!(lock = %self.path.display(), "released"),
            Err(e) => tracing::warn!(lock = %self.path.display(), error = %e, "unlock failed"),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {} is held by another process", .0.display())]
    Busy(PathBuf),
    #[error("lock {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::Busy(_))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_lock_path() -> (PathBuf, PathBuf) {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("nncp-lock-test-{}-{}", std::process::id(), id));
        std::fs::create_dir_all(&dir).unwrap();
        (dir.join("toss.lock"), dir)
    }

    #[test]
    fn second_acquire_is_busy_until_release() {
        let (path, dir) = temp_lock_path();
        let first = SpoolLock::<FlockFile>::acquire(&path).unwrap();
        let err = SpoolLock::<FlockFile>::acquire(&path).unwrap_err();
        assert!(err.is_busy(), "got {err}");

        drop(first);
        let again = SpoolLock::<FlockFile>::acquire(&path).unwrap();
        assert_eq!(again.path(), path);
        drop(again);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn purposes_are_independent() {
        let (path, dir) = temp_lock_path();
        let other = dir.join("call.lock");
        let _a = SpoolLock::<FlockFile>::acquire(&path).unwrap();
        let _b = SpoolLock::<FlockFile>::acquire(&other).unwrap();
        drop((_a, _b));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn concurrent_acquire_has_exactly_one_winner() {
        let (path, dir) = temp_lock_path();
        let threads = 2;
        let start = Arc::new(Barrier::new(threads));
        let tried = Arc::new(Barrier::new(threads));
        let wins = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let (path, start, tried) = (path.clone(), start.clone(), tried.clone());
                let (wins, busy) = (wins.clone(), busy.clone());
                std::thread::spawn(move || {
                    start.wait();
                    let held = SpoolLock::<FlockFile>::acquire(&path);
                    match &held {
                        Ok(_) => wins.fetch_add(1, Ordering::SeqCst),
                        Err(e) if e.is_busy() => busy.fetch_add(1, Ordering::SeqCst),
                        Err(e) => panic!("unexpected lock error: {e}"),
                    };
                    // Hold until everyone has tried.
                    tried.wait();
                    drop(held);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(busy.load(Ordering::SeqCst), 1);

        assert!(SpoolLock::<FlockFile>::acquire(&path).is_ok());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let (_, dir) = temp_lock_path();
        let path = dir.join("absent").join("toss.lock");
        let err = SpoolLock::<FlockFile>::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Io { .. }));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
