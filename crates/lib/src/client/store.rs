//! Client-side session id storage, so a restarted client resumes the same thread.

use anyhow::Result;
use std::path::{Path, PathBuf};

/// Default path for the stored session id (`~/.plg-gateway/client_session`).
pub fn default_session_path() -> PathBuf {
    crate::config::default_config_dir().join("client_session")
}

/// Load the stored session id if present.
pub fn load_session_id(path: &Path) -> Option<String> {
    let s = std::fs::read_to_string(path).ok()?;
    let t = s.trim().to_string();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

/// Persist the session id (after `session.id`).
pub fn save_session_id(path: &Path, session_id: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, session_id)?;
    Ok(())
}

/// Remove the stored session id (after a reset). Missing file is fine.
pub fn clear_session_id(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
