use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

fn temp_name(path: &Path) -> std::path::PathBuf {
    let stem = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".into());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp = format!(".{stem}.{}.{nanos}.tmp", std::process::id());
    path.with_file_name(tmp)
}

/// Write bytes to a sibling temp file (name carries pid + timestamp), then
/// rename into place. Readers never observe a partial file.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_name(path);
    fs::write(&tmp, bytes)?;
    match fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(err.into())
        }
    }
}

/// Atomically persist a value as pretty-printed JSON.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_bytes_atomic(path, json.as_bytes())
}

/// Read and parse a JSON file. Returns `None` when the file is missing or
/// malformed; shared-state readers skip bad files rather than failing the
/// whole scan.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "skipping malformed json file");
            None
        }
    }
}

/// Strict variant for files this process owns: missing stays `None`, but a
/// parse failure is surfaced.
pub fn read_json_strict<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}
