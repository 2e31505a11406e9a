//! Atomic file persistence for the cache index, resource bodies and config.
//!
//! Writes go to a sibling temp file tagged with the process and thread, are
//! synced, then renamed over the target. Readers see the old file or the new
//! one, never a torn write.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{CenoError, Result};

/// Parse a JSON file. A missing file is `Ok(None)`.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let Some(raw) = read_optional(path)? else {
        return Ok(None);
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| CenoError::Json {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })
}

/// Serialize `value` as pretty JSON and write it atomically.
///
/// With `keep_backup`, the previous file is first copied to `<name>.json.bak`;
/// a failed copy is logged and does not stop the write.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T, keep_backup: bool) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| CenoError::Json {
        message: format!("Failed to serialize {}: {}", path.display(), e),
        source: Some(e),
    })?;

    if keep_backup && path.exists() {
        let backup = path.with_extension("json.bak");
        match fs::copy(path, &backup) {
            Ok(_) => debug!("Backed up {} to {}", path.display(), backup.display()),
            Err(e) => warn!("Could not back up {}: {}", path.display(), e),
        }
    }

    atomic_write_bytes(path, &json)
}

/// Write `bytes` to `path` atomically, creating parent directories.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| CenoError::io_with_path(e, parent))?;
    }

    let temp = temp_path_for(path);
    if let Err(e) = write_synced(&temp, bytes) {
        let _ = fs::remove_file(&temp);
        return Err(CenoError::io_with_path(e, &temp));
    }
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(CenoError::io_with_path(e, path));
    }

    debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Read a whole file, or `None` if it does not exist.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CenoError::io_with_path(e, path)),
    };
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| CenoError::io_with_path(e, path))?;
    Ok(Some(contents))
}

/// Delete a file. Returns whether anything was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CenoError::io_with_path(e, path)),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}-{}.tmp", name, std::process::id(), thread_tag()))
}

fn thread_tag() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Budget {
        disk_bytes: u64,
        altruism_percent: u8,
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("budget.json");
        let budget = Budget {
            disk_bytes: 1 << 30,
            altruism_percent: 25,
        };

        atomic_write_json(&path, &budget, false).unwrap();

        assert_eq!(atomic_read_json::<Budget>(&path).unwrap(), Some(budget));
        assert_eq!(files_in(dir.path()), vec!["budget.json"]);
    }

    #[test]
    fn test_backup_keeps_previous_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        atomic_write_json(&path, &Budget { disk_bytes: 1, altruism_percent: 10 }, true).unwrap();
        atomic_write_json(&path, &Budget { disk_bytes: 2, altruism_percent: 20 }, true).unwrap();

        let backup: Budget = atomic_read_json(&path.with_extension("json.bak")).unwrap().unwrap();
        assert_eq!(backup.disk_bytes, 1);
        let current: Budget = atomic_read_json(&path).unwrap().unwrap();
        assert_eq!(current.disk_bytes, 2);
    }

    #[test]
    fn test_missing_and_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("index.json");
        assert!(atomic_read_json::<Budget>(&missing).unwrap().is_none());

        atomic_write_bytes(&missing, b"{ not json").unwrap();
        assert!(matches!(
            atomic_read_json::<Budget>(&missing),
            Err(CenoError::Json { .. })
        ));
    }

    #[test]
    fn test_bytes_create_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let objects = dir.path().join("objects");
        let body = objects.join("abc.body");

        atomic_write_bytes(&body, b"payload").unwrap();

        assert_eq!(read_optional(&body).unwrap().as_deref(), Some(&b"payload"[..]));
        assert_eq!(files_in(&objects), vec!["abc.body"]);
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.meta.json");

        atomic_write_bytes(&path, b"{}").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }
}
