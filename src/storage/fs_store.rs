use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::observability::metrics;
use crate::storage::append::BackgroundAppend;
use crate::storage::common::{
    check_bucket_name, check_object_name, is_meta_bucket, is_object_dir, is_valid_bucket_name,
    is_valid_object_prefix, path_join, BUCKET_META_PREFIX, META_BUCKET, MULTIPART_META_PREFIX,
    SLASH_SEPARATOR, TMP_META_PREFIX,
};
use crate::storage::disk;
use crate::storage::fsio::{self, to_object_err, FsIoError};
use crate::storage::listpool::{ListParams, TreeWalkPool};
use crate::storage::meta::{
    dir_object_info, load_format, save_format, FormatFs, FsMeta, FS_META_JSON_FILE, MD5_SUM_KEY,
    META_MAX_SIZE,
};
use crate::storage::rwpool::{FsIoPool, PoolError, ReadGuard, WriteGuard};
use crate::storage::treewalk::start_tree_walk;
use crate::storage::{
    BackendType, BucketInfo, ListObjectsInfo, ObjectInfo, ObjectLayer, StorageError, StorageInfo,
};

const BACKEND_LABEL: &str = "fs";

/// Filesystem-backed object layer: one directory tree exports the whole
/// bucket/object namespace. Cheap to clone; all mutable state lives behind
/// the shared pools.
#[derive(Clone, Debug)]
pub struct FsStore {
    root: PathBuf,
    /// Unique per mount; names the staging directory so a crashed instance
    /// never collides with its successor.
    mount_uuid: String,
    min_free_space: u64,
    min_free_inodes: u64,
    skip_disk_checks: bool,
    inode_exempt_fs_types: Arc<Vec<String>>,
    read_buffer_size: usize,
    write_buffer_size: usize,
    max_object_list: usize,
    rw_pool: Arc<FsIoPool>,
    list_pool: Arc<TreeWalkPool>,
    bg_append: Arc<BackgroundAppend>,
}

impl FsStore {
    /// Mounts the namespace rooted at `config.root`: creates the root and
    /// the meta volume when missing, validates (or writes) `format.json`,
    /// and reserves this instance's staging directory.
    pub async fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let root = std::path::absolute(Path::new(&config.root))?;

        match tokio::fs::metadata(&root).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(StorageError::Unexpected(format!(
                    "mount root {} is not a directory",
                    root.display()
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                fsio::mkdir_all(&root)
                    .await
                    .map_err(|e| to_object_err(e, "", ""))?;
            }
            Err(e) => return Err(StorageError::Io(e)),
        }

        let mount_uuid = Uuid::new_v4().to_string();

        for dir in [
            root.join(META_BUCKET),
            root.join(META_BUCKET).join(TMP_META_PREFIX).join(&mount_uuid),
            root.join(META_BUCKET).join(MULTIPART_META_PREFIX),
        ] {
            fsio::mkdir_all(&dir)
                .await
                .map_err(|e| to_object_err(e, META_BUCKET, ""))?;
        }

        match load_format(&root).await? {
            Some(format) => format.validate()?,
            None => save_format(&root, &FormatFs::new()).await?,
        }

        let store = FsStore {
            root,
            mount_uuid,
            min_free_space: config.min_free_space,
            min_free_inodes: config.min_free_inodes,
            skip_disk_checks: config.skip_disk_checks,
            inode_exempt_fs_types: Arc::new(config.inode_check_exempt_fstypes.clone()),
            read_buffer_size: config.io.read_buffer_size.max(1),
            write_buffer_size: config.io.write_buffer_size.max(1),
            max_object_list: config.list.max_object_list.max(1),
            rw_pool: FsIoPool::new(),
            list_pool: TreeWalkPool::new(
                Duration::from_secs(config.list.lookup_timeout_secs),
                config.list.max_parked_walkers,
            ),
            bg_append: Arc::new(BackgroundAppend::new()),
        };

        tracing::info!(
            root = %store.root.display(),
            mount_uuid = %store.mount_uuid,
            "fs backend mounted"
        );
        Ok(store)
    }

    pub fn background_append(&self) -> &BackgroundAppend {
        &self.bg_append
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, object: &str) -> PathBuf {
        path_join(&self.bucket_dir(bucket), object)
    }

    fn meta_bucket_dir(&self) -> PathBuf {
        self.root.join(META_BUCKET)
    }

    /// `<root>/.minio.sys/buckets/<bucket>/<key>/fs.json`
    fn fs_meta_path(&self, bucket: &str, object: &str) -> PathBuf {
        let base = self.meta_bucket_dir().join(BUCKET_META_PREFIX).join(bucket);
        path_join(&base, object).join(FS_META_JSON_FILE)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.meta_bucket_dir()
            .join(TMP_META_PREFIX)
            .join(&self.mount_uuid)
    }

    async fn stat_bucket_dir(&self, bucket: &str) -> Result<std::fs::Metadata, StorageError> {
        check_bucket_name(bucket)?;
        fsio::stat_dir(&self.bucket_dir(bucket))
            .await
            .map_err(|e| match e {
                // A regular file squatting on the bucket path is as good as
                // no bucket.
                FsIoError::NotFound | FsIoError::AccessDenied => {
                    StorageError::BucketNotFound(bucket.to_string())
                }
                other => to_object_err(other, bucket, ""),
            })
    }

    fn check_disk_free(&self) -> Result<(), StorageError> {
        if self.skip_disk_checks {
            return Ok(());
        }
        disk::check_disk_free(
            &self.root,
            self.min_free_space,
            self.min_free_inodes,
            &self.inode_exempt_fs_types,
        )
    }

    /// Reads the sidecar under a fresh shared lock; absent or still-empty
    /// documents fall back to empty metadata (pre-existing data files). An
    /// in-flight writer surfaces as `LockContention` for the caller to
    /// retry.
    fn read_fs_meta(&self, bucket: &str, object: &str) -> Result<FsMeta, StorageError> {
        let meta_path = self.fs_meta_path(bucket, object);
        let start = Instant::now();
        let rlk = match self.rw_pool.open(&meta_path) {
            Ok(rlk) => rlk,
            Err(PoolError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FsMeta::new());
            }
            Err(e) => return Err(pool_err(e, bucket, object)),
        };
        metrics::record_lock_wait("shared", start.elapsed().as_secs_f64());
        decode_locked_meta(rlk.read_all(META_MAX_SIZE), bucket, object)
    }

    async fn get_object_info_inner(
        &self,
        bucket: &str,
        object: &str,
    ) -> Result<ObjectInfo, StorageError> {
        let fs_meta = if is_meta_bucket(bucket) {
            FsMeta::new()
        } else {
            self.read_fs_meta(bucket, object)?
        };

        let fi = fsio::stat_file(&self.object_path(bucket, object))
            .await
            .map_err(|e| to_object_err(e, bucket, object))?;
        Ok(fs_meta.to_object_info(bucket, object, &fi))
    }

    /// Resolves one walker entry into user-facing info. Entries with a
    /// trailing slash are common prefixes and need no stat.
    async fn entry_to_object_info(
        &self,
        bucket: &str,
        entry: &str,
    ) -> Result<ObjectInfo, StorageError> {
        if entry.ends_with(SLASH_SEPARATOR) {
            return Ok(ObjectInfo {
                bucket: bucket.to_string(),
                name: entry.to_string(),
                size: 0,
                mod_time: Utc::now(),
                is_dir: true,
                md5_sum: String::new(),
                content_type: String::new(),
                user_defined: HashMap::new(),
            });
        }
        let fi = fsio::stat_file(&self.object_path(bucket, entry))
            .await
            .map_err(|e| to_object_err(e, bucket, entry))?;
        // Listings never open sidecars; keys, sizes and mtimes suffice.
        Ok(FsMeta::new().to_object_info(bucket, entry, &fi))
    }

    fn check_list_objs_args(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
    ) -> Result<(), StorageError> {
        check_bucket_name(bucket)?;
        if !is_valid_object_prefix(prefix) {
            return Err(StorageError::InvalidObjectName(prefix.to_string()));
        }
        if !delimiter.is_empty() && delimiter != "/" {
            return Err(StorageError::InvalidArgument);
        }
        if !marker.is_empty() && !marker.starts_with(prefix) {
            return Err(StorageError::InvalidArgument);
        }
        Ok(())
    }
}

fn pool_err(e: PoolError, bucket: &str, object: &str) -> StorageError {
    match e {
        PoolError::NotFound => StorageError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: object.to_string(),
        },
        PoolError::Busy => StorageError::LockContention(format!("{bucket}/{object}")),
        PoolError::TooLarge(bound) => StorageError::Unexpected(format!(
            "sidecar for {bucket}/{object} exceeds the {bound} byte bound"
        )),
        PoolError::NameTooLong => StorageError::NameTooLong(format!("{bucket}/{object}")),
        PoolError::Io(e) => StorageError::Io(e),
        PoolError::Internal(msg) => StorageError::Unexpected(msg),
    }
}

fn decode_locked_meta(
    bytes: Result<Vec<u8>, PoolError>,
    bucket: &str,
    object: &str,
) -> Result<FsMeta, StorageError> {
    let bytes = bytes.map_err(|e| pool_err(e, bucket, object))?;
    if bytes.is_empty() {
        // A put that crashed between sidecar creation and the namespace
        // rename leaves a zero-length fs.json behind.
        return Ok(FsMeta::new());
    }
    FsMeta::decode(&bytes)
}

/// Tee over the incoming stream: bytes flow through untouched while the
/// MD5 (and optional SHA-256) states absorb them.
struct HashingReader<'a> {
    inner: &'a mut (dyn AsyncRead + Send + Unpin),
    md5: &'a mut Md5,
    sha256: Option<&'a mut Sha256>,
}

impl AsyncRead for HashingReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut *me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let data = &buf.filled()[before..];
                me.md5.update(data);
                if let Some(sha256) = me.sha256.as_deref_mut() {
                    sha256.update(data);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[async_trait]
impl ObjectLayer for FsStore {
    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        check_bucket_name(bucket)?;
        match fsio::mkdir(&self.bucket_dir(bucket)).await {
            Ok(()) => {
                tracing::debug!(bucket = %bucket, "bucket created");
                Ok(())
            }
            Err(FsIoError::Exists) => Err(StorageError::BucketExists(bucket.to_string())),
            Err(e) => Err(to_object_err(e, bucket, "")),
        }
    }

    async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo, StorageError> {
        let st = self.stat_bucket_dir(bucket).await?;
        let created = st
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(BucketInfo {
            name: bucket.to_string(),
            created,
        })
    }

    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StorageError> {
        let entries = fsio::read_dir_entries(&self.root)
            .await
            .map_err(|_| StorageError::DiskNotFound)?;

        let mut buckets = Vec::new();
        let mut skipped = Vec::new();
        for entry in entries {
            let Some(name) = entry.strip_suffix(SLASH_SEPARATOR) else {
                continue; // regular files at the root are not buckets
            };
            if is_meta_bucket(name) {
                continue;
            }
            let st = match fsio::stat_dir(&self.root.join(name)).await {
                Ok(st) => st,
                Err(FsIoError::NotFound) | Err(FsIoError::AccessDenied) => continue,
                Err(e) => return Err(to_object_err(e, name, "")),
            };
            if !is_valid_bucket_name(name) {
                skipped.push(name.to_string());
                continue;
            }
            let created = st
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            buckets.push(BucketInfo {
                name: name.to_string(),
                created,
            });
        }

        if !skipped.is_empty() {
            tracing::warn!(
                skipped = ?skipped,
                "skipping directories incompatible with bucket naming rules"
            );
        }
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        check_bucket_name(bucket)?;
        match fsio::remove_dir(&self.bucket_dir(bucket)).await {
            Ok(()) => {}
            Err(FsIoError::NotFound) => {
                return Err(StorageError::BucketNotFound(bucket.to_string()))
            }
            Err(FsIoError::NotEmpty) => {
                return Err(StorageError::BucketNotEmpty(bucket.to_string()))
            }
            Err(e) => return Err(to_object_err(e, bucket, "")),
        }

        // The bucket is gone; listings resumed against it would only race
        // the purge below.
        self.list_pool.evict_bucket(bucket);
        self.bg_append.abort_bucket(bucket).await;

        let multipart_dir = self
            .meta_bucket_dir()
            .join(MULTIPART_META_PREFIX)
            .join(bucket);
        fsio::remove_all(&multipart_dir)
            .await
            .map_err(|e| to_object_err(e, bucket, ""))?;

        let bucket_meta_dir = self.meta_bucket_dir().join(BUCKET_META_PREFIX).join(bucket);
        fsio::remove_all(&bucket_meta_dir)
            .await
            .map_err(|e| to_object_err(e, bucket, ""))?;

        tracing::debug!(bucket = %bucket, "bucket deleted");
        Ok(())
    }

    #[tracing::instrument(skip(self, reader, metadata), fields(bucket = %bucket, key = %object, size = size))]
    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        size: i64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        mut metadata: HashMap<String, String>,
        sha256_hex: Option<&str>,
    ) -> Result<ObjectInfo, StorageError> {
        let start = Instant::now();
        check_bucket_name(bucket)?;
        check_object_name(object)?;
        self.stat_bucket_dir(bucket).await?;

        // A zero-size key with a terminal slash denotes a directory
        // object; nothing is streamed.
        if is_object_dir(object, size) {
            fsio::mkdir_all(&self.object_path(bucket, object))
                .await
                .map_err(|e| to_object_err(e, bucket, object))?;
            return Ok(dir_object_info(bucket, object, metadata));
        }

        self.check_disk_free()?;

        // The exclusive sidecar lock is held from here until return: the
        // rename and the metadata write happen inside one writer critical
        // section.
        let wlk: Option<WriteGuard> = if is_meta_bucket(bucket) {
            None
        } else {
            let lock_start = Instant::now();
            let guard = self
                .rw_pool
                .create(&self.fs_meta_path(bucket, object))
                .map_err(|e| pool_err(e, bucket, object))?;
            metrics::record_lock_wait("exclusive", lock_start.elapsed().as_secs_f64());
            Some(guard)
        };

        let tmp_path = self.tmp_dir().join(Uuid::new_v4().to_string());

        let mut md5 = Md5::new();
        let mut sha256 = sha256_hex.map(|_| Sha256::new());
        let mut tee = HashingReader {
            inner: reader,
            md5: &mut md5,
            sha256: sha256.as_mut(),
        };

        let buf_size = if size > 0 {
            self.write_buffer_size.min(size as usize)
        } else {
            self.write_buffer_size
        };
        let limit = if size >= 0 { Some(size as u64) } else { None };

        let bytes_written = match fsio::create_file(&tmp_path, &mut tee, buf_size, limit).await {
            Ok(n) => n,
            Err(e) => {
                let _ = fsio::remove_file(&tmp_path).await;
                return Err(to_object_err(e, bucket, object));
            }
        };

        if size >= 0 && bytes_written < size as u64 {
            let _ = fsio::remove_file(&tmp_path).await;
            return Err(StorageError::IncompleteBody);
        }

        let calculated_md5 = format!("{:x}", md5.finalize());
        let expected_md5 = metadata
            .entry(MD5_SUM_KEY.to_string())
            .or_insert_with(|| calculated_md5.clone())
            .clone();
        if expected_md5 != calculated_md5 {
            let _ = fsio::remove_file(&tmp_path).await;
            return Err(StorageError::BadDigest {
                expected: expected_md5,
                calculated: calculated_md5,
            });
        }
        if let (Some(sha256), Some(expected)) = (sha256, sha256_hex) {
            let calculated = format!("{:x}", sha256.finalize());
            if !calculated.eq_ignore_ascii_case(expected) {
                let _ = fsio::remove_file(&tmp_path).await;
                return Err(StorageError::Sha256Mismatch);
            }
        }

        // Commit point: before this rename the namespace is untouched, and
        // a crash leaves only a staging orphan for the next mount to sweep.
        let obj_path = self.object_path(bucket, object);
        if let Err(e) = fsio::rename_file(&tmp_path, &obj_path).await {
            let _ = fsio::remove_file(&tmp_path).await;
            return Err(to_object_err(e, bucket, object));
        }

        let mut fs_meta = FsMeta::new();
        fs_meta.meta = metadata;
        if let Some(wlk) = &wlk {
            let bytes = fs_meta.encode()?;
            wlk.write_all(&bytes)
                .map_err(|e| pool_err(e, bucket, object))?;
        }

        let fi = fsio::stat_file(&obj_path)
            .await
            .map_err(|e| to_object_err(e, bucket, object))?;
        let info = fs_meta.to_object_info(bucket, object, &fi);

        let duration = start.elapsed().as_secs_f64();
        metrics::record_storage_op("put", BACKEND_LABEL, duration);
        tracing::debug!(
            bucket = %bucket,
            key = %object,
            size = bytes_written,
            duration_ms = duration * 1000.0,
            "put object completed"
        );
        Ok(info)
    }

    #[tracing::instrument(skip(self, writer), fields(bucket = %bucket, key = %object, offset = offset, length = length))]
    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        offset: i64,
        length: i64,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), StorageError> {
        let start = Instant::now();
        check_bucket_name(bucket)?;
        check_object_name(object)?;
        self.stat_bucket_dir(bucket).await?;

        if offset < 0 {
            return Err(StorageError::InvalidArgument);
        }

        // Hold a shared sidecar lock across the read so a concurrent
        // metadata-only copy cannot swap the document mid-stream; absence
        // is fine (pre-existing data) and an in-flight writer surfaces as
        // `LockContention` rather than a wait.
        let _rlk: Option<ReadGuard> = if is_meta_bucket(bucket) {
            None
        } else {
            match self.rw_pool.open(&self.fs_meta_path(bucket, object)) {
                Ok(rlk) => Some(rlk),
                Err(PoolError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(pool_err(e, bucket, object)),
            }
        };

        let (mut file, size) = fsio::open_file_read(&self.object_path(bucket, object), offset as u64)
            .await
            .map_err(|e| to_object_err(e, bucket, object))?;
        let size = size as i64;

        let length = if length < 0 { size - offset } else { length };
        if length < 0 || offset > size || offset + length > size {
            return Err(StorageError::InvalidRange {
                offset,
                length,
                size,
            });
        }

        let buf_size = self.read_buffer_size.min((length.max(1)) as usize);
        let mut buf = vec![0u8; buf_size];
        let mut remaining = length as u64;
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                // The file shrank underneath us; never hand out a short
                // body as a success.
                return Err(StorageError::Unexpected(format!(
                    "short read on {bucket}/{object}: {remaining} bytes missing"
                )));
            }
            writer.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        writer.flush().await?;

        let duration = start.elapsed().as_secs_f64();
        metrics::record_storage_op("get", BACKEND_LABEL, duration);
        tracing::debug!(
            bucket = %bucket,
            key = %object,
            sent = length,
            duration_ms = duration * 1000.0,
            "get object completed"
        );
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(bucket = %bucket, key = %object))]
    async fn get_object_info(
        &self,
        bucket: &str,
        object: &str,
    ) -> Result<ObjectInfo, StorageError> {
        let start = Instant::now();
        check_bucket_name(bucket)?;
        check_object_name(object)?;
        self.stat_bucket_dir(bucket).await?;

        let info = self.get_object_info_inner(bucket, object).await?;

        metrics::record_storage_op("head", BACKEND_LABEL, start.elapsed().as_secs_f64());
        Ok(info)
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectInfo, StorageError> {
        let start = Instant::now();
        check_bucket_name(src_bucket)?;
        check_object_name(src_object)?;
        check_bucket_name(dst_bucket)?;
        check_object_name(dst_object)?;
        self.stat_bucket_dir(src_bucket).await?;

        let src_path = self.object_path(src_bucket, src_object);
        let fi = fsio::stat_file(&src_path)
            .await
            .map_err(|e| to_object_err(e, src_bucket, src_object))?;

        let metadata_only = format!("{src_bucket}/{src_object}")
            .eq_ignore_ascii_case(&format!("{dst_bucket}/{dst_object}"));
        if metadata_only {
            let wlk = self
                .rw_pool
                .write(&self.fs_meta_path(src_bucket, src_object))
                .map_err(|e| pool_err(e, src_bucket, src_object))?;

            // Replace user metadata wholesale but never lose the body
            // digest recorded by the original put.
            let old = decode_locked_meta(wlk.read_all(META_MAX_SIZE), src_bucket, src_object)?;
            let mut fs_meta = FsMeta::new();
            fs_meta.meta = metadata;
            if !fs_meta.meta.contains_key(MD5_SUM_KEY) {
                if let Some(md5_sum) = old.meta.get(MD5_SUM_KEY) {
                    fs_meta
                        .meta
                        .insert(MD5_SUM_KEY.to_string(), md5_sum.clone());
                }
            }
            let bytes = fs_meta.encode()?;
            wlk.write_all(&bytes)
                .map_err(|e| pool_err(e, src_bucket, src_object))?;

            metrics::record_storage_op("copy", BACKEND_LABEL, start.elapsed().as_secs_f64());
            return Ok(fs_meta.to_object_info(src_bucket, src_object, &fi));
        }

        let length = fi.len() as i64;
        let (mut pipe_reader, pipe_writer) = tokio::io::duplex(self.write_buffer_size);

        // Producer streams the source into the pipe; this task consumes it
        // through the ordinary put pipeline, so backpressure and cleanup
        // are the put pipeline's.
        let producer = {
            let store = self.clone();
            let bucket = src_bucket.to_string();
            let object = src_object.to_string();
            tokio::spawn(async move {
                let mut pipe_writer = pipe_writer;
                let result = store
                    .get_object(&bucket, &object, 0, length, &mut pipe_writer)
                    .await;
                // Dropping the writer closes the pipe either way; the
                // consumer sees EOF and, on a short body, IncompleteBody.
                let _ = pipe_writer.shutdown().await;
                result
            })
        };

        let put_result = self
            .put_object(dst_bucket, dst_object, length, &mut pipe_reader, metadata, None)
            .await;
        drop(pipe_reader);

        let producer_result = producer
            .await
            .map_err(|e| StorageError::Unexpected(format!("copy producer: {e}")))?;

        match (put_result, producer_result) {
            (Ok(info), Ok(())) => {
                metrics::record_storage_op("copy", BACKEND_LABEL, start.elapsed().as_secs_f64());
                Ok(info)
            }
            // The producer's failure is the root cause; the consumer only
            // saw a truncated stream.
            (_, Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
        }
    }

    #[tracing::instrument(skip(self), fields(bucket = %bucket, key = %object))]
    async fn delete_object(&self, bucket: &str, object: &str) -> Result<(), StorageError> {
        let start = Instant::now();
        check_bucket_name(bucket)?;
        check_object_name(object)?;
        self.stat_bucket_dir(bucket).await?;

        let meta_path = self.fs_meta_path(bucket, object);
        let _wlk: Option<WriteGuard> = if is_meta_bucket(bucket) {
            None
        } else {
            match self.rw_pool.write(&meta_path) {
                Ok(wlk) => Some(wlk),
                // No sidecar, nothing to serialize against.
                Err(PoolError::NotFound) => None,
                Err(e) => return Err(pool_err(e, bucket, object)),
            }
        };

        match fsio::delete_file(&self.bucket_dir(bucket), &self.object_path(bucket, object)).await
        {
            Ok(()) | Err(FsIoError::NotFound) => {}
            Err(e) => return Err(to_object_err(e, bucket, object)),
        }

        if !is_meta_bucket(bucket) {
            match fsio::delete_file(&self.meta_bucket_dir(), &meta_path).await {
                Ok(()) | Err(FsIoError::NotFound) => {}
                Err(e) => return Err(to_object_err(e, bucket, object)),
            }
        }

        metrics::record_storage_op("delete", BACKEND_LABEL, start.elapsed().as_secs_f64());
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(bucket = %bucket, prefix = %prefix, marker = %marker, max_keys = max_keys))]
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: i32,
    ) -> Result<ListObjectsInfo, StorageError> {
        let start = Instant::now();
        self.check_list_objs_args(bucket, prefix, marker, delimiter)?;
        self.stat_bucket_dir(bucket).await?;

        if max_keys == 0 {
            return Ok(ListObjectsInfo::default());
        }
        // With both prefix and delimiter set to '/' every key sits below
        // the delimiter; S3 semantics say the listing is empty.
        if delimiter == "/" && prefix == "/" {
            return Ok(ListObjectsInfo::default());
        }

        let recursive = delimiter != "/";
        let max_keys = if max_keys < 0 || max_keys as usize > self.max_object_list {
            self.max_object_list
        } else {
            max_keys as usize
        };

        let params = ListParams {
            bucket: bucket.to_string(),
            recursive,
            marker: marker.to_string(),
            prefix: prefix.to_string(),
            heal: false,
        };
        let (mut rx, cancel) = match self.list_pool.release(&params) {
            Some(parked) => parked,
            None => {
                let cancel = CancellationToken::new();
                let rx = start_tree_walk(
                    self.bucket_dir(bucket),
                    prefix,
                    marker,
                    recursive,
                    cancel.clone(),
                    self.max_object_list,
                );
                (rx, cancel)
            }
        };

        let mut infos: Vec<ObjectInfo> = Vec::new();
        let mut eof = false;
        while infos.len() < max_keys {
            let Some(item) = rx.recv().await else {
                eof = true;
                break;
            };
            let result = match item {
                Ok(result) => result,
                Err(e) => {
                    cancel.cancel();
                    return Err(to_object_err(e, bucket, prefix));
                }
            };
            let info = match self.entry_to_object_info(bucket, &result.entry).await {
                Ok(info) => info,
                Err(_) => {
                    // The entry vanished between enumeration and stat; the
                    // page is abandoned rather than served with holes.
                    cancel.cancel();
                    return Ok(ListObjectsInfo::default());
                }
            };
            infos.push(info);
            if result.end {
                eof = true;
                break;
            }
        }

        if eof {
            cancel.cancel();
        } else {
            let next = ListParams {
                marker: infos.last().map(|i| i.name.clone()).unwrap_or_default(),
                ..params
            };
            self.list_pool.park(next, rx, cancel);
        }

        let mut out = ListObjectsInfo {
            is_truncated: !eof,
            ..Default::default()
        };
        for info in infos {
            out.next_marker = info.name.clone();
            if info.is_dir {
                out.prefixes.push(info.name);
            } else {
                out.objects.push(info);
            }
        }

        let duration = start.elapsed().as_secs_f64();
        metrics::record_storage_op("list", BACKEND_LABEL, duration);
        tracing::debug!(
            bucket = %bucket,
            prefix = %prefix,
            count = out.objects.len() + out.prefixes.len(),
            truncated = out.is_truncated,
            duration_ms = duration * 1000.0,
            "list objects completed"
        );
        Ok(out)
    }

    async fn storage_info(&self) -> StorageInfo {
        match disk::disk_usage(&self.root) {
            Ok(usage) => StorageInfo {
                total: usage.total,
                free: usage.free,
                backend: BackendType::Fs,
            },
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "unable to probe disk");
                StorageInfo {
                    total: 0,
                    free: 0,
                    backend: BackendType::Fs,
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<(), StorageError> {
        self.list_pool.shutdown();
        self.bg_append.abort_all().await;
        fsio::remove_all(&self.tmp_dir())
            .await
            .map_err(|e| to_object_err(e, META_BUCKET, ""))?;
        tracing::info!(mount_uuid = %self.mount_uuid, "fs backend shut down");
        Ok(())
    }

    async fn heal_bucket(&self, _bucket: &str) -> Result<(), StorageError> {
        Err(StorageError::NotImplemented)
    }

    async fn heal_object(&self, _bucket: &str, _object: &str) -> Result<(), StorageError> {
        Err(StorageError::NotImplemented)
    }

    async fn list_objects_heal(
        &self,
        _bucket: &str,
        _prefix: &str,
        _marker: &str,
        _delimiter: &str,
        _max_keys: i32,
    ) -> Result<ListObjectsInfo, StorageError> {
        Err(StorageError::NotImplemented)
    }

    async fn list_buckets_heal(&self) -> Result<Vec<BucketInfo>, StorageError> {
        Err(StorageError::NotImplemented)
    }
}
