use std::path::Path;

use chrono::{DateTime, Utc};
use fitcrm_common::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::sidecar;

/// Summary written to the status file after every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub last_updated: DateTime<Utc>,
    pub current_version: u32,
    pub pending_count: usize,
    /// Migration files found on disk, including ones that failed to parse.
    pub total_count: usize,
}

/// Replace the status file atomically: write a sibling temp file, then rename.
pub fn write_status(path: &Path, summary: &StatusSummary) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = sidecar(path, ".tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(summary)?)?;
    std::fs::rename(&tmp, path)?;
    debug!("status file written to {}", path.display());
    Ok(())
}

pub fn read_status(path: &Path) -> Result<Option<StatusSummary>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("migration-status.json");
        assert!(read_status(&path).unwrap().is_none());

        let summary = StatusSummary {
            last_updated: Utc::now(),
            current_version: 3,
            pending_count: 0,
            total_count: 3,
        };
        write_status(&path, &summary).unwrap();
        assert_eq!(read_status(&path).unwrap(), Some(summary));
        assert!(!sidecar(&path, ".tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        for key in ["last_updated", "current_version", "pending_count", "total_count"] {
            assert!(raw.get(key).is_some(), "missing {key}");
        }
    }
}
