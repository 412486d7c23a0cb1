// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use crate::storage::StorageError;
use std::path::{Path, PathBuf};

/// Reserved top-level directory holding format, sidecars, multipart scratch
/// and put staging. Never user-visible as a bucket.
pub const META_BUCKET: &str = ".minio.sys";
/// Per-object sidecar subtree under the meta bucket.
pub const BUCKET_META_PREFIX: &str = "buckets";
/// Multipart scratch subtree under the meta bucket.
pub const MULTIPART_META_PREFIX: &str = "multipart";
/// Put staging subtree under the meta bucket; one directory per mount UUID.
pub const TMP_META_PREFIX: &str = "tmp";

pub const SLASH_SEPARATOR: char = '/';

const MAX_OBJECT_NAME_LEN: usize = 1024;
const MAX_PATH_LEN: usize = 4096;
const MAX_COMPONENT_LEN: usize = 255;

/// True for the reserved system namespace that internal collaborators
/// (policy storage, multipart scratch) address through the same facade.
pub fn is_meta_bucket(bucket: &str) -> bool {
    bucket == META_BUCKET
}

/// Validates a bucket name against the S3 (v2) naming rules: 3-63 chars,
/// lowercase alphanumerics with interior `.` and `-`, no `..`, and not an
/// IPv4 literal. The meta bucket passes so internal callers can reach it;
/// listings hide it separately.
pub fn is_valid_bucket_name(bucket: &str) -> bool {
    if is_meta_bucket(bucket) {
        return true;
    }
    if bucket.len() < 3 || bucket.len() > 63 {
        return false;
    }
    if bucket.contains("..") {
        return false;
    }
    let bytes = bucket.as_bytes();
    if !bytes[0].is_ascii_lowercase() && !bytes[0].is_ascii_digit() {
        return false;
    }
    if !bytes[bytes.len() - 1].is_ascii_lowercase() && !bytes[bytes.len() - 1].is_ascii_digit() {
        return false;
    }
    if !bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return false;
    }
    if looks_like_ip_address(bucket) {
        return false;
    }
    true
}

fn looks_like_ip_address(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Validates an object key: non-empty, bounded, no NUL or backslash, and no
/// `.`/`..` components once split on `/`. Purely lexical; never touches the
/// filesystem.
pub fn is_valid_object_name(object: &str) -> bool {
    if object.is_empty() || object.len() > MAX_OBJECT_NAME_LEN {
        return false;
    }
    if object.contains('\0') || object.contains('\\') {
        return false;
    }
    if object.starts_with(SLASH_SEPARATOR) {
        return false;
    }
    object
        .split(SLASH_SEPARATOR)
        .all(|comp| comp != "." && comp != "..")
}

/// Object prefixes relax the non-empty and leading-slash rules but keep
/// the traversal checks.
pub fn is_valid_object_prefix(prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if prefix.len() > MAX_OBJECT_NAME_LEN || prefix.contains('\0') || prefix.contains('\\') {
        return false;
    }
    prefix
        .split(SLASH_SEPARATOR)
        .all(|comp| comp != "." && comp != "..")
}

pub fn check_bucket_name(bucket: &str) -> Result<(), StorageError> {
    if !is_valid_bucket_name(bucket) {
        return Err(StorageError::InvalidBucketName(bucket.to_string()));
    }
    Ok(())
}

pub fn check_object_name(object: &str) -> Result<(), StorageError> {
    if !is_valid_object_name(object) {
        return Err(StorageError::InvalidObjectName(object.to_string()));
    }
    Ok(())
}

/// Enforces platform path limits before any syscall so an over-long name
/// cannot leave a half-finished operation behind.
pub fn check_path_length(path: &Path) -> Result<(), StorageError> {
    let s = path.to_string_lossy();
    if s.len() > MAX_PATH_LEN {
        return Err(StorageError::NameTooLong(s.into_owned()));
    }
    for comp in s.split(std::path::MAIN_SEPARATOR) {
        if comp.len() > MAX_COMPONENT_LEN {
            return Err(StorageError::NameTooLong(s.into_owned()));
        }
    }
    Ok(())
}

/// Joins a slash-separated key under `base`, one component at a time, so a
/// key can never escape the bucket root.
pub fn path_join(base: &Path, key: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for comp in key.split(SLASH_SEPARATOR) {
        if comp.is_empty() {
            continue;
        }
        path.push(comp);
    }
    path
}

/// True when a put for `object` with a declared size of zero denotes a
/// directory object (key ends in `/`).
pub fn is_object_dir(object: &str, size: i64) -> bool {
    object.ends_with(SLASH_SEPARATOR) && size == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_names() {
        for ok in ["photos", "my-bucket", "a.b.c", "abc", "0bucket9"] {
            assert!(is_valid_bucket_name(ok), "{ok} should be valid");
        }
        // Internal callers address the system namespace directly.
        assert!(is_valid_bucket_name(META_BUCKET));
        for bad in [
            "ab",
            "-leading",
            "trailing-",
            "UPPER",
            "double..dot",
            "10.0.0.1",
            "with_underscore",
            &"x".repeat(64),
        ] {
            assert!(!is_valid_bucket_name(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn object_names() {
        assert!(is_valid_object_name("a"));
        assert!(is_valid_object_name("path/to/key.txt"));
        assert!(is_valid_object_name("trailing/slash/"));
        assert!(!is_valid_object_name(""));
        assert!(!is_valid_object_name("/leading"));
        assert!(!is_valid_object_name("has/../traversal"));
        assert!(!is_valid_object_name("dot/./inside"));
        assert!(!is_valid_object_name("back\\slash"));
        assert!(!is_valid_object_name(&"k".repeat(1025)));
    }

    #[test]
    fn object_prefixes() {
        assert!(is_valid_object_prefix(""));
        assert!(is_valid_object_prefix("/"));
        assert!(is_valid_object_prefix("logs/2024/"));
        assert!(!is_valid_object_prefix("logs/../etc"));
    }

    #[test]
    fn join_stays_under_base() {
        let base = Path::new("/data/bucket");
        assert_eq!(path_join(base, "a/b/c"), PathBuf::from("/data/bucket/a/b/c"));
        assert_eq!(path_join(base, "a//b/"), PathBuf::from("/data/bucket/a/b"));
    }

    #[test]
    fn path_length_limits() {
        assert!(check_path_length(Path::new("/ok/short")).is_ok());
        let long_component = format!("/x/{}", "y".repeat(256));
        assert!(matches!(
            check_path_length(Path::new(&long_component)),
            Err(StorageError::NameTooLong(_))
        ));
    }

    #[test]
    fn dir_object_detection() {
        assert!(is_object_dir("logs/", 0));
        assert!(!is_object_dir("logs/", 5));
        assert!(!is_object_dir("logs", 0));
    }
}
