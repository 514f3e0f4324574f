//! Persisted login credentials
//!
//! A small JSON record holding the device identifier and the long-lived auth
//! token. The record's absence just means first run; the interactive login
//! flow creates it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub device_id: String,
    pub token: String,
}

/// On-disk credential store.
#[derive(Debug, Clone)]
pub struct AuthStore {
    path: PathBuf,
}

impl AuthStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load stored credentials, or `None` on first run or a corrupt record.
    pub fn load(&self) -> Option<Credentials> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn save(&self, credentials: &Credentials) -> std::io::Result<()> {
        let content = serde_json::to_string(credentials)?;
        std::fs::write(&self.path, content)
    }
}
