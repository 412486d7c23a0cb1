use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::storage::fsio;

/// One in-progress multipart assembly: the scratch file the uploaded parts
/// are appended into while the upload is still open.
#[derive(Debug, Clone)]
pub struct AppendInfo {
    pub bucket: String,
    pub key: String,
    pub append_file: PathBuf,
}

/// Registry of in-progress multipart assemblies keyed by upload id.
///
/// The multipart state machine itself is a collaborator; the object layer
/// owns only this map's lifecycle so bucket deletion and shutdown can
/// abort scratch work that would otherwise be orphaned.
#[derive(Debug)]
pub struct BackgroundAppend {
    uploads: Mutex<HashMap<String, AppendInfo>>,
}

impl BackgroundAppend {
    pub fn new() -> Self {
        BackgroundAppend {
            uploads: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new assembly; false when the upload id is already
    /// tracked (the existing entry is left untouched).
    pub fn register(&self, upload_id: &str, info: AppendInfo) -> bool {
        let Ok(mut uploads) = self.uploads.lock() else {
            return false;
        };
        if uploads.contains_key(upload_id) {
            return false;
        }
        uploads.insert(upload_id.to_string(), info);
        true
    }

    pub fn get(&self, upload_id: &str) -> Option<AppendInfo> {
        self.uploads.lock().ok()?.get(upload_id).cloned()
    }

    /// Drops the entry and unlinks its scratch file. Missing entries and
    /// missing files are both fine; abort must be idempotent.
    pub async fn remove(&self, upload_id: &str) {
        let info = match self.uploads.lock() {
            Ok(mut uploads) => uploads.remove(upload_id),
            Err(_) => None,
        };
        if let Some(info) = info {
            let _ = fsio::remove_file(&info.append_file).await;
        }
    }

    /// Aborts every assembly targeting `bucket`; called by DeleteBucket.
    pub async fn abort_bucket(&self, bucket: &str) {
        let dropped = match self.uploads.lock() {
            Ok(mut uploads) => {
                let ids: Vec<String> = uploads
                    .iter()
                    .filter(|(_, info)| info.bucket == bucket)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| uploads.remove(&id))
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for info in dropped {
            let _ = fsio::remove_file(&info.append_file).await;
        }
    }

    /// Aborts everything; called once at shutdown.
    pub async fn abort_all(&self) {
        let dropped: Vec<AppendInfo> = match self.uploads.lock() {
            Ok(mut uploads) => uploads.drain().map(|(_, info)| info).collect(),
            Err(_) => Vec::new(),
        };
        for info in dropped {
            let _ = fsio::remove_file(&info.append_file).await;
        }
    }
}

impl Default for BackgroundAppend {
    fn default() -> Self {
        Self::new()
    }
}
