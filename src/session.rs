use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    core::{unique_time_suffix, unix_now_secs, write_atomically},
    error::Result,
    model::SessionId,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
struct StoredSession {
    session_id: SessionId,
    saved_at: u64,
}

/// Last authenticated session, kept on disk so a restart can resume it.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<SessionId>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        match serde_json::from_str::<StoredSession>(&content) {
            Ok(stored) => Ok(Some(stored.session_id)),
            Err(error) => {
                let backup_path = self
                    .path
                    .with_extension(format!("corrupt-{}.json", unique_time_suffix()));
                match fs::rename(&self.path, &backup_path) {
                    Ok(()) => tracing::warn!(
                        backup = %backup_path.display(),
                        %error,
                        "moved corrupt session file aside"
                    ),
                    Err(rename_error) => tracing::warn!(
                        %rename_error,
                        %error,
                        "failed to back up corrupt session file"
                    ),
                }
                Ok(None)
            }
        }
    }

    pub fn save(&self, session_id: SessionId) -> Result<()> {
        let content = serde_json::to_string_pretty(&StoredSession {
            session_id,
            saved_at: unix_now_secs(),
        })?;
        write_atomically(&self.path, &content)?;
        tracing::debug!(%session_id, path = %self.path.display(), "session persisted");
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
