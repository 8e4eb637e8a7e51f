//! Idempotency record store for the reply protocol.
//!
//! Once a request id has a record here, no second final reply is ever
//! written for it. The file is replaced atomically (write temp, rename) so
//! no reader can observe a half-written state.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One handled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandledRecord {
    /// Milliseconds since epoch when the final reply was written.
    pub at: i64,
    pub reply_to: String,
    pub reply_stream: String,
    /// Store-assigned id of the reply entry.
    pub msg_id: String,
}

/// Persisted set of handled request ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandledState {
    #[serde(default)]
    pub handled: BTreeMap<String, HandledRecord>,
}

impl HandledState {
    /// Load from disk. A missing or corrupt file yields an empty state;
    /// corruption must never block reply handling, it only forgets history.
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    "Idempotency state at {} unreadable ({}), starting empty",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Atomically persist the state.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, format!("{}\n", json))?;
        std::fs::rename(&tmp, path).map_err(|e| {
            Error::Other(format!("rename {} -> {}: {}", tmp.display(), path.display(), e))
        })?;
        Ok(())
    }

    pub fn is_handled(&self, req_id: &str) -> bool {
        self.handled.contains_key(req_id)
    }

    pub fn record(&mut self, req_id: &str, record: HandledRecord) {
        self.handled.insert(req_id.to_string(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let state = HandledState::load(&dir.path().join("nope.json"));
        assert!(state.handled.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let state = HandledState::load(&path);
        assert!(state.handled.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let mut state = HandledState::default();
        state.record(
            "10-0",
            HandledRecord {
                at: 1700000000000,
                reply_to: "boss".to_string(),
                reply_stream: "boss:messages".to_string(),
                msg_id: "11-0".to_string(),
            },
        );
        state.save(&path).unwrap();

        let reloaded = HandledState::load(&path);
        assert!(reloaded.is_handled("10-0"));
        assert!(!reloaded.is_handled("12-0"));
        assert_eq!(reloaded.handled["10-0"].msg_id, "11-0");
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        HandledState::default().save(&path).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }
}
