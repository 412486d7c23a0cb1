use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

use crate::storage::common::META_BUCKET;
use crate::storage::fsio;
use crate::storage::{ObjectInfo, StorageError};

pub const FS_META_JSON_FILE: &str = "fs.json";
pub const FORMAT_JSON_FILE: &str = "format.json";

pub const FS_META_VERSION: &str = "1.0.0";
pub const FS_META_FORMAT: &str = "fs";
pub const FORMAT_VERSION: &str = "1";

/// Sidecar and format documents are small; anything larger than this is a
/// corrupt or foreign file and is rejected unread.
pub const META_MAX_SIZE: u64 = 256 * 1024;

/// Canonical key storing the lowercase hex MD5 of the object body.
pub const MD5_SUM_KEY: &str = "md5Sum";
pub const CONTENT_TYPE_KEY: &str = "content-type";

/// The per-object sidecar document (`fs.json`). Top-level fields this
/// version does not know about are captured in `extra` and written back
/// unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsMeta {
    pub version: String,
    pub format: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Default for FsMeta {
    fn default() -> Self {
        Self::new()
    }
}

impl FsMeta {
    pub fn new() -> Self {
        FsMeta {
            version: FS_META_VERSION.to_string(),
            format: FS_META_FORMAT.to_string(),
            meta: HashMap::new(),
            extra: Map::new(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Unexpected(format!("parse fs.json: {e}")))
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self)
            .map_err(|e| StorageError::Unexpected(format!("encode fs.json: {e}")))
    }

    /// Builds the user-facing object description from this sidecar and a
    /// stat of the data file.
    pub fn to_object_info(
        &self,
        bucket: &str,
        object: &str,
        fi: &std::fs::Metadata,
    ) -> ObjectInfo {
        let mod_time = fi
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let mut user_defined = self.meta.clone();
        let md5_sum = user_defined.get(MD5_SUM_KEY).cloned().unwrap_or_default();
        let content_type = user_defined
            .remove(CONTENT_TYPE_KEY)
            .unwrap_or_else(|| "application/octet-stream".to_string());
        ObjectInfo {
            bucket: bucket.to_string(),
            name: object.to_string(),
            size: fi.len() as i64,
            mod_time,
            is_dir: fi.is_dir(),
            md5_sum,
            content_type,
            user_defined,
        }
    }
}

/// Synthesizes the info for a directory object; there is no data file and
/// no sidecar to consult.
pub fn dir_object_info(
    bucket: &str,
    object: &str,
    metadata: HashMap<String, String>,
) -> ObjectInfo {
    ObjectInfo {
        bucket: bucket.to_string(),
        name: object.to_string(),
        size: 0,
        mod_time: Utc::now(),
        is_dir: true,
        md5_sum: String::new(),
        content_type: "application/octet-stream".to_string(),
        user_defined: metadata,
    }
}

/// The per-disk format descriptor (`format.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatFs {
    pub version: String,
    pub format: String,
    pub fs: FsFormatVersion,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsFormatVersion {
    pub version: String,
}

impl FormatFs {
    pub fn new() -> Self {
        FormatFs {
            version: FORMAT_VERSION.to_string(),
            format: FS_META_FORMAT.to_string(),
            fs: FsFormatVersion {
                version: FORMAT_VERSION.to_string(),
            },
            extra: Map::new(),
        }
    }

    /// Rejects descriptors written by any other backend. Called once at
    /// mount; failure is fatal for the mount.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.format != FS_META_FORMAT {
            return Err(StorageError::UnformattedDisk(format!(
                "backend format {:?} is not {:?}",
                self.format, FS_META_FORMAT
            )));
        }
        if self.version != FORMAT_VERSION || self.fs.version != FORMAT_VERSION {
            return Err(StorageError::UnformattedDisk(format!(
                "unsupported fs format version {}/{}",
                self.version, self.fs.version
            )));
        }
        Ok(())
    }
}

impl Default for FormatFs {
    fn default() -> Self {
        Self::new()
    }
}

fn format_path(root: &Path) -> std::path::PathBuf {
    root.join(META_BUCKET).join(FORMAT_JSON_FILE)
}

/// Loads `format.json` from the meta bucket; `Ok(None)` when the disk has
/// never been formatted.
pub async fn load_format(root: &Path) -> Result<Option<FormatFs>, StorageError> {
    match fsio::read_file_bounded(&format_path(root), META_MAX_SIZE).await {
        Ok(bytes) => {
            let format: FormatFs = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::UnformattedDisk(format!("parse format.json: {e}")))?;
            Ok(Some(format))
        }
        Err(fsio::FsIoError::NotFound) => Ok(None),
        Err(e) => Err(fsio::to_object_err(e, META_BUCKET, FORMAT_JSON_FILE)),
    }
}

pub async fn save_format(root: &Path, format: &FormatFs) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(format)
        .map_err(|e| StorageError::Unexpected(format!("encode format.json: {e}")))?;
    tokio::fs::write(format_path(root), bytes)
        .await
        .map_err(StorageError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_meta_round_trip() {
        let mut meta = FsMeta::new();
        meta.meta.insert(MD5_SUM_KEY.into(), "abc123".into());
        meta.meta.insert("x-amz-meta-lang".into(), "en".into());
        let bytes = meta.encode().unwrap();
        let back = FsMeta::decode(&bytes).unwrap();
        assert_eq!(back.version, FS_META_VERSION);
        assert_eq!(back.format, FS_META_FORMAT);
        assert_eq!(back.meta.get("x-amz-meta-lang").unwrap(), "en");
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let doc = r#"{"version":"1.0.0","format":"fs","meta":{},"minio":{"release":"dev"}}"#;
        let meta = FsMeta::decode(doc.as_bytes()).unwrap();
        let bytes = meta.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["minio"]["release"], "dev");
    }

    #[test]
    fn format_validation() {
        FormatFs::new().validate().unwrap();

        let xl: FormatFs = serde_json::from_str(
            r#"{"version":"1","format":"xl","fs":{"version":"1"}}"#,
        )
        .unwrap();
        assert!(matches!(
            xl.validate(),
            Err(StorageError::UnformattedDisk(_))
        ));
    }

    #[tokio::test]
    async fn format_load_save() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(META_BUCKET)).unwrap();

        assert!(load_format(dir.path()).await.unwrap().is_none());
        save_format(dir.path(), &FormatFs::new()).await.unwrap();
        let loaded = load_format(dir.path()).await.unwrap().unwrap();
        loaded.validate().unwrap();
    }
}
