//! Crash-safe consumer checkpoint: the last mailbox entry id fully handled.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::types::now_millis;

/// Cursor meaning "read from the beginning".
pub const GENESIS: &str = "0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub last_id: String,
    pub updated_at: i64,
}

/// Load the last handled id. Absent or corrupt files reset progress to
/// genesis; they never crash the consumer.
pub fn load(path: &Path) -> String {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return GENESIS.to_string();
    };
    match serde_json::from_str::<Checkpoint>(&raw) {
        Ok(cp) if !cp.last_id.is_empty() => cp.last_id,
        Ok(_) => GENESIS.to_string(),
        Err(e) => {
            tracing::warn!(
                "Checkpoint at {} unreadable ({}), restarting from genesis",
                path.display(),
                e
            );
            GENESIS.to_string()
        }
    }
}

/// Persist the last handled id atomically (write temp, rename). A crash
/// mid-save leaves either the previous or the new checkpoint, never a torn
/// file.
pub fn save(path: &Path, last_id: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let cp = Checkpoint {
        last_id: last_id.to_string(),
        updated_at: now_millis(),
    };
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, serde_json::to_string(&cp)?)?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::Checkpoint(format!("rename to {}: {}", path.display(), e)))?;
    Ok(())
}
