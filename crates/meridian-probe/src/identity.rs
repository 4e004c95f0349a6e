//! Durable probe identity. The id lives in a plain text file so the probe
//! keeps the same identity across restarts and the controller can resume its
//! session indexing after a reconnect. The file is the source of truth.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Resolution order: `PROBE_ID_FILE`, `PROBE_ID_DIR/probe_id.txt`, the user
/// config directory, and finally the working directory.
pub fn probe_id_path() -> PathBuf {
    if let Ok(file) = env::var("PROBE_ID_FILE") {
        let file = file.trim();
        if !file.is_empty() {
            return PathBuf::from(file);
        }
    }

    if let Ok(dir) = env::var("PROBE_ID_DIR") {
        let dir = dir.trim();
        if !dir.is_empty() {
            return Path::new(dir).join("probe_id.txt");
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("meridian").join("probe_id.txt");
    }

    PathBuf::from("probe_id.txt")
}

/// Read the id verbatim if the file exists, otherwise mint a new one and
/// persist it before returning.
pub fn load_or_create(path: &Path) -> io::Result<String> {
    if let Ok(data) = fs::read_to_string(path) {
        let probe_id = data.trim().to_string();
        if !probe_id.is_empty() {
            info!(probe_id = %probe_id, "loaded existing probe id");
            return Ok(probe_id);
        }
    }

    let probe_id = format!("probe-{}", Uuid::new_v4());
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(path, &probe_id)?;

    info!(probe_id = %probe_id, path = %path.display(), "created and persisted new probe id");
    Ok(probe_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_then_reloads_the_same_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("probe_id.txt");

        let first = load_or_create(&path).unwrap();
        assert!(first.starts_with("probe-"));

        let second = load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn file_contents_win_over_generation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe_id.txt");
        fs::write(&path, "probe-pinned\n").unwrap();

        assert_eq!(load_or_create(&path).unwrap(), "probe-pinned");
    }

    #[test]
    fn empty_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe_id.txt");
        fs::write(&path, "  \n").unwrap();

        let id = load_or_create(&path).unwrap();
        assert!(id.starts_with("probe-"));
        assert_eq!(fs::read_to_string(&path).unwrap(), id);
    }
}
