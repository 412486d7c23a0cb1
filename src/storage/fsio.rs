use nix::errno::Errno;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};

use crate::storage::common::check_path_length;
use crate::storage::StorageError;

/// Closed error taxonomy for the low-level filesystem primitives. Host
/// errno values are translated here, exactly once; the facade turns these
/// into contextual `StorageError`s.
#[derive(Debug, Error)]
pub enum FsIoError {
    #[error("file or directory not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("file or directory already exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("disk full")]
    DiskFull,
    #[error("path name too long")]
    NameTooLong,
    #[error("i/o error: {0}")]
    Io(std::io::Error),
    #[error("unexpected filesystem error: {0}")]
    Unexpected(String),
}

pub type FsIoResult<T> = Result<T, FsIoError>;

impl From<std::io::Error> for FsIoError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => FsIoError::NotFound,
            ErrorKind::PermissionDenied => FsIoError::AccessDenied,
            ErrorKind::AlreadyExists => FsIoError::Exists,
            ErrorKind::DirectoryNotEmpty => FsIoError::NotEmpty,
            ErrorKind::StorageFull => FsIoError::DiskFull,
            _ => match e.raw_os_error().map(Errno::from_raw) {
                Some(Errno::ENAMETOOLONG) => FsIoError::NameTooLong,
                Some(Errno::ENOSPC) | Some(Errno::EDQUOT) => FsIoError::DiskFull,
                Some(Errno::ENOTEMPTY) => FsIoError::NotEmpty,
                _ => FsIoError::Io(e),
            },
        }
    }
}

impl From<StorageError> for FsIoError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NameTooLong(_) => FsIoError::NameTooLong,
            other => FsIoError::Unexpected(other.to_string()),
        }
    }
}

/// Adds bucket/object context to a primitive error. The facade calls this
/// at its outermost layer so every error surfaces exactly one taxonomy kind.
pub fn to_object_err(err: FsIoError, bucket: &str, object: &str) -> StorageError {
    match err {
        FsIoError::NotFound => {
            if object.is_empty() {
                StorageError::BucketNotFound(bucket.to_string())
            } else {
                StorageError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: object.to_string(),
                }
            }
        }
        FsIoError::Exists => StorageError::BucketExists(bucket.to_string()),
        FsIoError::NotEmpty => StorageError::BucketNotEmpty(bucket.to_string()),
        FsIoError::AccessDenied => StorageError::Io(std::io::Error::new(
            ErrorKind::PermissionDenied,
            format!("access denied: {bucket}/{object}"),
        )),
        FsIoError::DiskFull => StorageError::DiskFull,
        FsIoError::NameTooLong => {
            StorageError::NameTooLong(format!("{bucket}/{object}"))
        }
        FsIoError::Io(e) => StorageError::Io(e),
        FsIoError::Unexpected(msg) => StorageError::Unexpected(msg),
    }
}

pub async fn mkdir_all(path: &Path) -> FsIoResult<()> {
    check_path_length(path)?;
    fs::create_dir_all(path).await?;
    Ok(())
}

/// Creates a single directory; `Exists` when it is already there.
pub async fn mkdir(path: &Path) -> FsIoResult<()> {
    check_path_length(path)?;
    fs::create_dir(path).await?;
    Ok(())
}

/// Stats a path expected to be a directory. A regular file at the path is
/// reported as `AccessDenied` so bucket listings can skip it.
pub async fn stat_dir(path: &Path) -> FsIoResult<std::fs::Metadata> {
    check_path_length(path)?;
    let meta = fs::metadata(path).await?;
    if !meta.is_dir() {
        return Err(FsIoError::AccessDenied);
    }
    Ok(meta)
}

/// Stats a path expected to be a regular file. Directories report
/// `NotFound`: a directory occupying an object path is not that object.
pub async fn stat_file(path: &Path) -> FsIoResult<std::fs::Metadata> {
    check_path_length(path)?;
    let meta = fs::metadata(path).await?;
    if meta.is_dir() {
        return Err(FsIoError::NotFound);
    }
    Ok(meta)
}

pub async fn remove_dir(path: &Path) -> FsIoResult<()> {
    check_path_length(path)?;
    fs::remove_dir(path).await?;
    Ok(())
}

/// Recursive removal; a missing path is not an error.
pub async fn remove_all(path: &Path) -> FsIoResult<()> {
    check_path_length(path)?;
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn remove_file(path: &Path) -> FsIoResult<()> {
    check_path_length(path)?;
    fs::remove_file(path).await?;
    Ok(())
}

/// The atomicity primitive for puts: makes the destination parent, then
/// renames source over destination in one step.
pub async fn rename_file(src: &Path, dst: &Path) -> FsIoResult<()> {
    check_path_length(src)?;
    check_path_length(dst)?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(src, dst).await?;
    Ok(())
}

/// Streams `reader` into a newly created file at `path` through a buffer of
/// `buf_size` bytes, stopping at `limit` when one is given. Returns the
/// number of bytes actually transferred.
pub async fn create_file<R>(
    path: &Path,
    reader: &mut R,
    buf_size: usize,
    limit: Option<u64>,
) -> FsIoResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    check_path_length(path)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file = fs::File::create(path).await?;
    let mut writer = BufWriter::with_capacity(buf_size, file);
    let mut buf = vec![0u8; buf_size];
    let mut written: u64 = 0;

    loop {
        let want = match limit {
            Some(limit) => {
                let remaining = limit - written;
                if remaining == 0 {
                    break;
                }
                buf.len().min(remaining as usize)
            }
            None => buf.len(),
        };
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        written += n as u64;
    }

    writer.flush().await?;
    Ok(written)
}

/// Opens a regular file for reading at `offset`; returns the handle and the
/// total file size.
pub async fn open_file_read(path: &Path, offset: u64) -> FsIoResult<(fs::File, u64)> {
    check_path_length(path)?;
    let mut file = fs::File::open(path).await?;
    let meta = file.metadata().await?;
    if meta.is_dir() {
        return Err(FsIoError::NotFound);
    }
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset)).await?;
    }
    Ok((file, meta.len()))
}

/// Lists the names in a directory, appending `/` to subdirectory names.
/// This is the entry convention the tree-walker sorts and filters on.
pub async fn read_dir_entries(path: &Path) -> FsIoResult<Vec<String>> {
    check_path_length(path)?;
    let mut rd = fs::read_dir(path).await?;
    let mut entries = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            entries.push(format!("{name}/"));
        } else if file_type.is_file() {
            entries.push(name);
        }
        // Sockets, fifos and other special files never enter the namespace.
    }
    Ok(entries)
}

/// Reads an entire small file, rejecting anything above `max_size`.
pub async fn read_file_bounded(path: &Path, max_size: u64) -> FsIoResult<Vec<u8>> {
    check_path_length(path)?;
    let meta = fs::metadata(path).await?;
    if meta.len() > max_size {
        return Err(FsIoError::Unexpected(format!(
            "refusing to read {}: {} bytes exceeds the {} byte bound",
            path.display(),
            meta.len(),
            max_size
        )));
    }
    Ok(fs::read(path).await?)
}

/// Unlinks `path`, then prunes empty parent directories bottom-up, stopping
/// at (and never touching) `base`.
pub async fn delete_file(base: &Path, path: &Path) -> FsIoResult<()> {
    if base == path {
        return Ok(());
    }
    check_path_length(base)?;
    check_path_length(path)?;

    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::IsADirectory => {
            // Directory objects are plain empty directories.
            fs::remove_dir(path).await?;
        }
        Err(e) => return Err(e.into()),
    }

    let mut current: Option<PathBuf> = path.parent().map(Path::to_path_buf);
    while let Some(dir) = current {
        if dir == base {
            break;
        }
        // Stop at the first parent that is non-empty or otherwise
        // unremovable; the prune is best-effort past the unlink.
        if fs::remove_dir(&dir).await.is_err() {
            break;
        }
        current = dir.parent().map(Path::to_path_buf);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_file_respects_limit_and_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/dir/file.bin");
        let mut data: &[u8] = b"hello world";
        let written = create_file(&path, &mut data, 4, Some(5)).await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn create_file_reads_to_eof_without_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let mut data: &[u8] = b"0123456789";
        let written = create_file(&path, &mut data, 3, None).await.unwrap();
        assert_eq!(written, 10);
    }

    #[tokio::test]
    async fn delete_file_prunes_empty_parents() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("bucket");
        let file = base.join("a/b/c.txt");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"x").unwrap();

        delete_file(&base, &file).await.unwrap();

        assert!(!base.join("a").exists());
        assert!(base.exists());
    }

    #[tokio::test]
    async fn delete_file_keeps_nonempty_parents() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("bucket");
        std::fs::create_dir_all(base.join("a/b")).unwrap();
        std::fs::write(base.join("a/b/one.txt"), b"1").unwrap();
        std::fs::write(base.join("a/keep.txt"), b"2").unwrap();

        delete_file(&base, &base.join("a/b/one.txt")).await.unwrap();

        assert!(!base.join("a/b").exists());
        assert!(base.join("a/keep.txt").exists());
    }

    #[tokio::test]
    async fn stat_file_rejects_directories() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            stat_file(dir.path()).await,
            Err(FsIoError::NotFound)
        ));
    }

    #[tokio::test]
    async fn read_dir_marks_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();
        let mut entries = read_dir_entries(dir.path()).await.unwrap();
        entries.sort();
        assert_eq!(entries, vec!["file".to_string(), "sub/".to_string()]);
    }

    #[tokio::test]
    async fn bounded_read_rejects_large_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(read_file_bounded(&path, 16).await.is_err());
        assert_eq!(read_file_bounded(&path, 64).await.unwrap().len(), 64);
    }
}
