use std::collections::HashMap;
use std::fs::{File, OpenOptions, TryLockError};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::storage::common::check_path_length;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("locked file not found")]
    NotFound,
    #[error("file is locked by another holder")]
    Busy,
    #[error("locked file exceeds the {0} byte metadata bound")]
    TooLarge(u64),
    #[error("path name too long")]
    NameTooLong,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock pool internal error: {0}")]
    Internal(String),
}

#[derive(Debug)]
struct ReaderEntry {
    file: Arc<File>,
    refs: usize,
}

/// Process-local registry of advisory file locks keyed by absolute path.
///
/// Shared readers are pooled: the first `open` of a path takes the OS-level
/// shared lock and later opens only bump a refcount on the same handle.
/// Exclusive holders are not pooled; they own their handle outright and the
/// lock dies with the guard. Every acquisition is fail-fast — contention
/// surfaces as `Busy`, never as a wait — and the map mutex guards only the
/// bookkeeping, so no I/O ever happens under it.
#[derive(Debug)]
pub struct FsIoPool {
    readers: Mutex<HashMap<PathBuf, ReaderEntry>>,
}

impl FsIoPool {
    pub fn new() -> Arc<Self> {
        Arc::new(FsIoPool {
            readers: Mutex::new(HashMap::new()),
        })
    }

    /// Acquires a shared-read handle on `path` without waiting. Piggybacks
    /// on an already-pooled handle when one exists; otherwise takes the
    /// OS-level shared lock, failing fast with `Busy` while an exclusive
    /// holder exists. Callers retry at a higher level.
    pub fn open(self: &Arc<Self>, path: &Path) -> Result<ReadGuard, PoolError> {
        check_path_length(path).map_err(|_| PoolError::NameTooLong)?;

        {
            let mut readers = self.lock_readers()?;
            if let Some(entry) = readers.get_mut(path) {
                entry.refs += 1;
                return Ok(ReadGuard {
                    pool: Arc::clone(self),
                    path: path.to_path_buf(),
                    file: Arc::clone(&entry.file),
                });
            }
        }

        let file = File::open(path)?;
        try_lock_shared(&file)?;
        let file = Arc::new(file);

        // If a racing open inserted an entry meanwhile, piggyback on it;
        // our redundant shared lock is released when `file` drops.
        let mut readers = self.lock_readers()?;
        let entry = readers
            .entry(path.to_path_buf())
            .and_modify(|e| e.refs += 1)
            .or_insert_with(|| ReaderEntry {
                file: Arc::clone(&file),
                refs: 1,
            });
        Ok(ReadGuard {
            pool: Arc::clone(self),
            path: path.to_path_buf(),
            file: Arc::clone(&entry.file),
        })
    }

    /// Creates `path` (and parents) and takes the exclusive lock without
    /// waiting. Fails with `Busy` while any other holder exists.
    pub fn create(&self, path: &Path) -> Result<WriteGuard, PoolError> {
        check_path_length(path).map_err(|_| PoolError::NameTooLong)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        try_lock_exclusive(&file)?;
        Ok(WriteGuard { file })
    }

    /// Exclusive lock on an existing file; `NotFound` when absent.
    pub fn write(&self, path: &Path) -> Result<WriteGuard, PoolError> {
        check_path_length(path).map_err(|_| PoolError::NameTooLong)?;
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PoolError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        try_lock_exclusive(&file)?;
        Ok(WriteGuard { file })
    }

    fn close(&self, path: &Path) {
        let Ok(mut readers) = self.readers.lock() else {
            return;
        };
        if let Some(entry) = readers.get_mut(path) {
            entry.refs -= 1;
            if entry.refs == 0 {
                // Dropping the last handle closes the descriptor and with
                // it the OS-level shared lock.
                readers.remove(path);
            }
        }
    }

    fn lock_readers(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<PathBuf, ReaderEntry>>, PoolError> {
        self.readers
            .lock()
            .map_err(|e| PoolError::Internal(e.to_string()))
    }

    #[cfg(test)]
    fn reader_refs(&self, path: &Path) -> usize {
        self.readers
            .lock()
            .unwrap()
            .get(path)
            .map(|e| e.refs)
            .unwrap_or(0)
    }
}

fn try_lock_exclusive(file: &File) -> Result<(), PoolError> {
    match file.try_lock() {
        Ok(()) => Ok(()),
        Err(TryLockError::WouldBlock) => Err(PoolError::Busy),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

fn try_lock_shared(file: &File) -> Result<(), PoolError> {
    match file.try_lock_shared() {
        Ok(()) => Ok(()),
        Err(TryLockError::WouldBlock) => Err(PoolError::Busy),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

/// Refcounted shared-read handle; dropping it releases this holder's claim
/// and, for the last holder, the underlying lock.
#[derive(Debug)]
pub struct ReadGuard {
    pool: Arc<FsIoPool>,
    path: PathBuf,
    file: Arc<File>,
}

impl ReadGuard {
    pub fn size(&self) -> Result<u64, PoolError> {
        Ok(self.file.metadata()?.len())
    }

    /// Reads the whole locked file. Positioned reads keep concurrent
    /// holders of the same pooled handle from disturbing each other.
    pub fn read_all(&self, max_size: u64) -> Result<Vec<u8>, PoolError> {
        let size = self.size()?;
        if size > max_size {
            return Err(PoolError::TooLarge(max_size));
        }
        let mut buf = vec![0u8; size as usize];
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(buf)
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.pool.close(&self.path);
    }
}

/// Exclusive handle; the advisory lock is held until the guard drops.
pub struct WriteGuard {
    file: File,
}

impl WriteGuard {
    /// Truncates and rewrites the locked file in one pass.
    pub fn write_all(&self, bytes: &[u8]) -> Result<(), PoolError> {
        self.file.set_len(0)?;
        self.file.write_all_at(bytes, 0)?;
        Ok(())
    }

    pub fn read_all(&self, max_size: u64) -> Result<Vec<u8>, PoolError> {
        let size = self.file.metadata()?.len();
        if size > max_size {
            return Err(PoolError::TooLarge(max_size));
        }
        let mut buf = vec![0u8; size as usize];
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn shared_handles_are_pooled_and_refcounted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.json");
        std::fs::write(&path, b"{}").unwrap();

        let pool = FsIoPool::new();
        let a = pool.open(&path).unwrap();
        let b = pool.open(&path).unwrap();
        assert_eq!(pool.reader_refs(&path), 2);

        drop(a);
        assert_eq!(pool.reader_refs(&path), 1);
        assert_eq!(b.read_all(1024).unwrap(), b"{}");
        drop(b);
        assert_eq!(pool.reader_refs(&path), 0);
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let pool = FsIoPool::new();
        let err = pool.open(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, PoolError::Io(_)));
    }

    #[test]
    fn exclusive_fails_fast_while_readers_hold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.json");
        std::fs::write(&path, b"{}").unwrap();

        let pool = FsIoPool::new();
        let rguard = pool.open(&path).unwrap();
        assert!(matches!(pool.write(&path), Err(PoolError::Busy)));
        drop(rguard);
        pool.write(&path).unwrap();
    }

    #[test]
    fn shared_fails_fast_while_writer_holds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.json");
        std::fs::write(&path, b"{}").unwrap();

        let pool = FsIoPool::new();
        let wguard = pool.write(&path).unwrap();
        assert!(matches!(pool.open(&path), Err(PoolError::Busy)));
        drop(wguard);
        pool.open(&path).unwrap();
    }

    #[test]
    fn create_conflicts_with_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta/obj/fs.json");

        let pool = FsIoPool::new();
        let first = pool.create(&path).unwrap();
        assert!(matches!(pool.create(&path), Err(PoolError::Busy)));
        drop(first);
        pool.create(&path).unwrap();
    }

    #[test]
    fn write_requires_existing_file() {
        let dir = tempdir().unwrap();
        let pool = FsIoPool::new();
        assert!(matches!(
            pool.write(&dir.path().join("absent")),
            Err(PoolError::NotFound)
        ));
    }

    #[test]
    fn write_guard_truncates_on_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.json");
        std::fs::write(&path, b"a much longer original document").unwrap();

        let pool = FsIoPool::new();
        let guard = pool.write(&path).unwrap();
        guard.write_all(b"short").unwrap();
        drop(guard);

        assert_eq!(std::fs::read(&path).unwrap(), b"short");
    }
}
