use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;
use crate::storage::common::path_join;
use crate::storage::fsio::{self, FsIoError};

/// One enumerated key. `entry` is bucket-relative; directory entries carry
/// a trailing `/`. `end` marks the naturally last entry of the whole walk
/// so consumers can detect EOF without an extra pull.
#[derive(Debug, Clone)]
pub struct TreeWalkResult {
    pub entry: String,
    pub end: bool,
}

pub type WalkReceiver = mpsc::Receiver<Result<TreeWalkResult, FsIoError>>;

enum WalkFlow {
    Continue,
    Abort,
}

struct Walker {
    bucket_dir: PathBuf,
    recursive: bool,
    tx: mpsc::Sender<Result<TreeWalkResult, FsIoError>>,
    cancel: CancellationToken,
}

/// Spawns a lazy ordered enumeration of the keys under `bucket_dir`
/// matching `prefix`, strictly after `marker`. With `recursive` off,
/// subdirectories are reported once as common prefixes (trailing `/`);
/// with it on they are descended into instead.
///
/// The walker owns no state outside the spawned task: cancelling the token
/// or dropping the receiver stops it at its next suspension point and
/// releases all open directory handles.
pub fn start_tree_walk(
    bucket_dir: PathBuf,
    prefix: &str,
    marker: &str,
    recursive: bool,
    cancel: CancellationToken,
    buffer: usize,
) -> WalkReceiver {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    // Descend straight to the directory named by the prefix; only the final
    // fragment after the last slash filters entries inside it.
    let (prefix_dir, entry_prefix) = match prefix.rfind('/') {
        Some(idx) => (prefix[..=idx].to_string(), prefix[idx + 1..].to_string()),
        None => (String::new(), prefix.to_string()),
    };
    let marker = marker
        .strip_prefix(prefix_dir.as_str())
        .unwrap_or(marker)
        .to_string();

    let walker = Walker {
        bucket_dir,
        recursive,
        tx,
        cancel,
    };
    tokio::spawn(async move {
        metrics::inc_active_walkers();
        // Closing the channel on return is the consumer's natural EOF.
        walker.walk(prefix_dir, entry_prefix, marker, true).await;
        metrics::dec_active_walkers();
    });
    rx
}

impl Walker {
    fn walk<'a>(
        &'a self,
        prefix_dir: String,
        entry_prefix_match: String,
        marker: String,
        is_end: bool,
    ) -> Pin<Box<dyn Future<Output = WalkFlow> + Send + 'a>> {
        Box::pin(async move {
            // For marker "four/five.txt": marker_dir is "four/" and
            // marker_base "five.txt", applied on the first descent only.
            let (marker_dir, marker_base) = match marker.split_once('/') {
                Some((head, rest)) => (format!("{head}/"), rest.to_string()),
                None => (marker.clone(), String::new()),
            };

            let dir_path = path_join(&self.bucket_dir, &prefix_dir);
            let mut entries = match fsio::read_dir_entries(&dir_path).await {
                Ok(entries) => entries,
                Err(FsIoError::NotFound) | Err(FsIoError::AccessDenied) => {
                    // Concurrently deleted or unreadable subtrees are
                    // skipped, never surfaced.
                    return WalkFlow::Continue;
                }
                Err(e) => {
                    let _ = self.send(Err(e)).await;
                    return WalkFlow::Abort;
                }
            };
            entries.sort();
            entries.retain(|e| e.starts_with(entry_prefix_match.as_str()));
            let from = entries.partition_point(|e| e.as_str() < marker_dir.as_str());
            let entries = &entries[from..];

            for (i, entry) in entries.iter().enumerate() {
                let is_dir = entry.ends_with('/');
                if i == 0 && *entry == marker_dir {
                    // The marker itself was delivered by a previous page;
                    // only a directory marker in recursive mode needs a
                    // re-descent to finish its subtree.
                    if !self.recursive || !is_dir {
                        continue;
                    }
                }

                if self.recursive && is_dir {
                    let marker_arg = if *entry == marker_dir {
                        marker_base.clone()
                    } else {
                        String::new()
                    };
                    let mark_end = i == entries.len() - 1 && is_end;
                    match self
                        .walk(format!("{prefix_dir}{entry}"), String::new(), marker_arg, mark_end)
                        .await
                    {
                        WalkFlow::Continue => continue,
                        WalkFlow::Abort => return WalkFlow::Abort,
                    }
                }

                let eof = i == entries.len() - 1 && is_end;
                let result = TreeWalkResult {
                    entry: format!("{prefix_dir}{entry}"),
                    end: eof,
                };
                if !self.send(Ok(result)).await {
                    return WalkFlow::Abort;
                }
            }
            WalkFlow::Continue
        })
    }

    /// Sends one result, yielding to backpressure; false when the walk was
    /// cancelled or the consumer went away.
    async fn send(&self, item: Result<TreeWalkResult, FsIoError>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}
