use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fitcrm_common::{Result, RunId};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One line of the migration run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    /// `apply`, `rollback` or `restore`.
    pub action: String,
    pub filename: String,
    pub version: u32,
    pub status: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunLogEntry {
    pub fn new(run_id: &RunId, action: &str, filename: &str, version: u32, status: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            action: action.to_string(),
            filename: filename.to_string(),
            version,
            status: status.to_string(),
            duration_ms: 0,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Append-only JSON-lines file.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &RunLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Log write failures are reported but never fail the migration.
    pub fn record(&self, entry: &RunLogEntry) {
        if let Err(e) = self.append(entry) {
            warn!("failed to write run log {}: {e}", self.path.display());
        }
    }

    /// Entries in file order; unreadable lines are skipped.
    pub fn read_all(&self) -> Result<Vec<RunLogEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("skipping malformed run log line: {e}");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("logs").join("migrations.log"));
        let run_id = RunId::new();

        log.append(&RunLogEntry::new(&run_id, "apply", "001_init.sql", 1, "applied").with_duration(12))
            .unwrap();
        log.append(
            &RunLogEntry::new(&run_id, "apply", "002_bad.sql", 2, "failed")
                .with_error("near \"TABL\": syntax error"),
        )
        .unwrap();

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(!raw.lines().next().unwrap().contains("\"error\""));

        let entries = log.read_all().unwrap();
        assert_eq!(entries[0].duration_ms, 12);
        assert_eq!(entries[1].status, "failed");
        assert_eq!(entries[1].run_id, run_id.to_string());
        assert!(entries[1].error.as_deref().unwrap().contains("syntax error"));
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("nope.log"));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path().join("m.log"));
        std::fs::write(log.path(), "not json\n").unwrap();
        log.append(&RunLogEntry::new(&RunId::new(), "rollback", "002_x.sql", 2, "reverted"))
            .unwrap();
        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "rollback");
    }
}
