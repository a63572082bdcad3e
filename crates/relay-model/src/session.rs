use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{ModelError, Result};

/// The model subprocess's own notion of conversational continuity —
/// distinct from [`relay_sessions::AgentSession`], which tracks agent
/// attribution rather than subprocess `--resume` state. Persisted to disk
/// so a gateway restart doesn't lose the ability to resume.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelSession {
    pub id: Option<String>,
    pub last_activity: Option<String>,
}

/// Load/persist a [`ModelSession`] at a fixed path, writing via
/// temp-file-then-rename so a crash mid-write never leaves a corrupt file.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[instrument(skip(self))]
    pub fn load(&self) -> ModelSession {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ModelSession::default(),
            Err(e) => {
                warn!(error = %e, "failed to read model session file, starting fresh");
                ModelSession::default()
            }
        }
    }

    #[instrument(skip(self, session))]
    pub fn save(&self, session: &ModelSession) -> Result<()> {
        let parent = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(ModelError::Io)?;

        let tmp_path = parent.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("session.json")
        ));
        let body = serde_json::to_string_pretty(session)
            .map_err(|e| ModelError::SessionPersist(e.to_string()))?;
        std::fs::write(&tmp_path, body).map_err(ModelError::Io)?;
        std::fs::rename(&tmp_path, &self.path).map_err(ModelError::Io)?;
        debug!(path = %self.path.display(), "persisted model session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        let session = store.load();
        assert!(session.id.is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        let session = ModelSession {
            id: Some("abc-123".to_string()),
            last_activity: Some("2026-07-28T00:00:00Z".to_string()),
        };
        store.save(&session).unwrap();
        let loaded = store.load();
        assert_eq!(loaded.id, session.id);
    }

    #[test]
    fn save_never_leaves_a_stray_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        store.save(&ModelSession::default()).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(entries, vec!["session.json"]);
    }
}
