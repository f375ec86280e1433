//! Shared file helpers.
//!
//! Every persisted record goes through [`write_atomic`]: the bytes land in a
//! sibling temp file which is then renamed over the target, so a concurrent
//! reader sees either the old document or the new one, never a partial write.

use crate::errors::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Write `bytes` to `path` via temp file + rename, creating parent directories.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));
    std::fs::write(&tmp_path, bytes).map_err(|e| StoreError::io(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp_path);
        StoreError::io(path, e)
    })
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut json = serde_json::to_string_pretty(value).map_err(StoreError::Serialize)?;
    json.push('\n');
    write_atomic(path, json.as_bytes())
}

/// Read and parse a JSON record. A missing file maps to `StoreError::NotFound`.
pub fn read_json<T: DeserializeOwned>(
    path: &Path,
    kind: &'static str,
    key: &str,
) -> Result<T, StoreError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound {
                kind,
                key: key.to_string(),
            });
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_str(&content).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Remove a file, treating "already gone" as success. Returns whether a file was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Keys safe to use as file stems: no separators, no leading dot.
pub fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Record {
        name: String,
        count: u32,
    }

    #[test]
    fn write_then_read_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/record.json");
        let record = Record {
            name: "a".into(),
            count: 3,
        };
        write_json_atomic(&path, &record).unwrap();
        let back: Record = read_json(&path, "record", "a").unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"a\":1}").unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn read_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let err = read_json::<Record>(&dir.path().join("nope.json"), "record", "nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn read_garbage_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_json::<Record>(&path, "record", "bad").unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[test]
    fn remove_if_exists_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x");
        std::fs::write(&path, "1").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn safe_keys() {
        assert!(is_safe_key("pipeline-123"));
        assert!(is_safe_key("build"));
        assert!(!is_safe_key("../etc"));
        assert!(!is_safe_key("a/b"));
        assert!(!is_safe_key(""));
        assert!(!is_safe_key(".hidden"));
    }
}
