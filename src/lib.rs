pub mod config;
pub mod observability;
pub mod storage;

pub use config::{Config, StorageConfig};
pub use storage::fs_store::FsStore;
pub use storage::{
    BucketInfo, ListObjectsInfo, ObjectInfo, ObjectLayer, StorageError, StorageInfo,
};
