use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod append;
pub mod common;
pub mod disk;
pub mod fs_store;
pub mod fsio;
pub mod listpool;
pub mod meta;
pub mod rwpool;
pub mod treewalk;

/// Metadata for a single bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketInfo {
    pub name: String,
    /// Directory mtime stands in for creation time; filesystems rarely
    /// expose a portable birthtime.
    pub created: DateTime<Utc>,
}

/// Metadata describing one object (or one common prefix during listing).
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub bucket: String,
    pub name: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
    /// Lowercase hex MD5 of the object body, mirrored from the sidecar.
    pub md5_sum: String,
    pub content_type: String,
    pub user_defined: HashMap<String, String>,
}

/// One page of a ListObjects enumeration.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsInfo {
    pub objects: Vec<ObjectInfo>,
    pub prefixes: Vec<String>,
    pub next_marker: String,
    pub is_truncated: bool,
}

/// Aggregate capacity numbers for the disk backing the namespace.
#[derive(Debug, Clone, Copy)]
pub struct StorageInfo {
    pub total: u64,
    pub free: u64,
    pub backend: BackendType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Fs,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid bucket name: {0}")]
    InvalidBucketName(String),
    #[error("invalid object name: {0}")]
    InvalidObjectName(String),
    #[error("bucket not found: {0}")]
    BucketNotFound(String),
    #[error("bucket already exists: {0}")]
    BucketExists(String),
    #[error("bucket not empty: {0}")]
    BucketNotEmpty(String),
    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid range: offset {offset}, length {length}, object size {size}")]
    InvalidRange { offset: i64, length: i64, size: i64 },
    #[error("body shorter than declared content length")]
    IncompleteBody,
    #[error("md5 mismatch: expected {expected}, calculated {calculated}")]
    BadDigest { expected: String, calculated: String },
    #[error("sha256 content digest mismatch")]
    Sha256Mismatch,
    #[error("disk path is full")]
    DiskFull,
    #[error("disk not found")]
    DiskNotFound,
    #[error("disk is not in fs format: {0}")]
    UnformattedDisk(String),
    #[error("path name too long: {0}")]
    NameTooLong(String),
    #[error("operation not implemented for this backend")]
    NotImplemented,
    #[error("resource busy: {0}")]
    LockContention(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected backend error: {0}")]
    Unexpected(String),
}

/// The capability set exposed by a storage backend: bucket operations,
/// object operations, listing, and the (unimplemented here) heal surface.
#[async_trait]
pub trait ObjectLayer: Send + Sync + 'static {
    // Bucket operations
    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError>;
    async fn get_bucket_info(&self, bucket: &str) -> Result<BucketInfo, StorageError>;
    async fn list_buckets(&self) -> Result<Vec<BucketInfo>, StorageError>;
    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    // Object operations
    async fn put_object(
        &self,
        bucket: &str,
        object: &str,
        size: i64,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        metadata: HashMap<String, String>,
        sha256_hex: Option<&str>,
    ) -> Result<ObjectInfo, StorageError>;

    async fn get_object(
        &self,
        bucket: &str,
        object: &str,
        offset: i64,
        length: i64,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), StorageError>;

    async fn get_object_info(&self, bucket: &str, object: &str)
        -> Result<ObjectInfo, StorageError>;

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_object: &str,
        dst_bucket: &str,
        dst_object: &str,
        metadata: HashMap<String, String>,
    ) -> Result<ObjectInfo, StorageError>;

    async fn delete_object(&self, bucket: &str, object: &str) -> Result<(), StorageError>;

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: i32,
    ) -> Result<ListObjectsInfo, StorageError>;

    async fn storage_info(&self) -> StorageInfo;

    /// Releases parked listings, aborts background appends, and removes the
    /// per-mount staging directory. Callers drain in-flight operations first.
    async fn shutdown(&self) -> Result<(), StorageError>;

    // Heal surface; valid only for the erasure-coded sibling backend.
    async fn heal_bucket(&self, bucket: &str) -> Result<(), StorageError>;
    async fn heal_object(&self, bucket: &str, object: &str) -> Result<(), StorageError>;
    async fn list_objects_heal(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        delimiter: &str,
        max_keys: i32,
    ) -> Result<ListObjectsInfo, StorageError>;
    async fn list_buckets_heal(&self) -> Result<Vec<BucketInfo>, StorageError>;
}
