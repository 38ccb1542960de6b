//! Whole-file snapshots of the store.
//!
//! The migration engine only talks to [`BackupProvider`]. [`SnapshotStore`]
//! is the implementation the CLI wires in: consistent copies taken with
//! SQLite's online backup API, one file per snapshot.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use fitcrm_common::{Error, Result, SnapshotId};
use rusqlite::Connection;
use rusqlite::backup::Backup;
use serde::Serialize;
use tracing::{info, warn};

/// Label for the snapshot taken right before an emergency restore. These
/// are not counted or pruned by retention.
pub const PRE_RESTORE_LABEL: &str = "pre-restore";

const SNAPSHOT_EXTENSION: &str = "db";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 100;
const BACKUP_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Snapshot service consumed by the safety gate and the rollback coordinator.
pub trait BackupProvider {
    fn create_snapshot(&self, label: &str) -> Result<SnapshotId>;

    /// Replace the live storage wholesale with snapshot `id`.
    fn restore_snapshot(&self, id: &SnapshotId) -> Result<()>;

    /// All snapshots, oldest first.
    fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>>;

    fn latest_snapshot(&self) -> Result<Option<SnapshotInfo>> {
        Ok(self.list_snapshots()?.into_iter().max_by_key(|s| s.created_at))
    }

    fn has_recent_snapshot(&self, max_age: Duration) -> Result<bool> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| Error::Backup(format!("invalid snapshot age: {e}")))?;
        let cutoff = Utc::now() - max_age;
        Ok(self
            .latest_snapshot()?
            .is_some_and(|s| s.created_at >= cutoff))
    }
}

pub struct SnapshotStore {
    db_path: PathBuf,
    dir: PathBuf,
    retention: usize,
}

impl SnapshotStore {
    pub fn new(db_path: impl Into<PathBuf>, dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            db_path: db_path.into(),
            dir: dir.into(),
            retention: retention.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, id: &SnapshotId) -> PathBuf {
        self.dir
            .join(format!("{}.{SNAPSHOT_EXTENSION}", id.as_str()))
    }

    /// Delete the oldest snapshots beyond the retention count.
    fn prune(&self) -> Result<()> {
        let suffix = format!("_{PRE_RESTORE_LABEL}");
        let snapshots: Vec<SnapshotInfo> = self
            .list_snapshots()?
            .into_iter()
            .filter(|s| !s.id.as_str().ends_with(&suffix))
            .collect();
        if snapshots.len() <= self.retention {
            return Ok(());
        }
        let remove_count = snapshots.len() - self.retention;
        for old in snapshots.into_iter().take(remove_count) {
            match std::fs::remove_file(&old.path) {
                Ok(()) => info!("pruned snapshot {}", old.id),
                Err(e) => warn!("failed to prune snapshot {}: {e}", old.path.display()),
            }
        }
        Ok(())
    }
}

impl BackupProvider for SnapshotStore {
    fn create_snapshot(&self, label: &str) -> Result<SnapshotId> {
        if !self.db_path.exists() {
            return Err(Error::Backup(format!(
                "no storage file at {}",
                self.db_path.display()
            )));
        }
        std::fs::create_dir_all(&self.dir)?;

        let id = SnapshotId::from_str(format!(
            "{}_{}",
            Utc::now().format(TIMESTAMP_FORMAT),
            sanitize_label(label)
        ));
        let path = self.snapshot_path(&id);
        if path.exists() {
            return Err(Error::Backup(format!(
                "snapshot {} already exists",
                path.display()
            )));
        }

        let src = Connection::open(&self.db_path)
            .map_err(|e| Error::Backup(format!("failed to open {}: {e}", self.db_path.display())))?;
        let mut dst = Connection::open(&path)
            .map_err(|e| Error::Backup(format!("failed to create {}: {e}", path.display())))?;
        copy_database(&src, &mut dst)?;
        quick_check(&dst, &path)?;
        drop(dst);

        info!("created snapshot {} at {}", id, path.display());
        self.prune()?;
        Ok(id)
    }

    fn restore_snapshot(&self, id: &SnapshotId) -> Result<()> {
        let path = self.snapshot_path(id);
        if !path.is_file() {
            return Err(Error::NotFound(format!("snapshot {id}")));
        }

        let src = Connection::open(&path)
            .map_err(|e| Error::Backup(format!("failed to open {}: {e}", path.display())))?;
        quick_check(&src, &path)?;

        let mut live = Connection::open(&self.db_path)
            .map_err(|e| Error::Backup(format!("failed to open {}: {e}", self.db_path.display())))?;
        copy_database(&src, &mut live)?;

        warn!("restored {} from snapshot {}", self.db_path.display(), id);
        Ok(())
    }

    fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let mut snapshots = Vec::new();
        if !self.dir.exists() {
            return Ok(snapshots);
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION)
            {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(created_at) = parse_created_at(stem) else {
                continue;
            };
            snapshots.push(SnapshotInfo {
                id: SnapshotId::from_str(stem),
                created_at,
                size_bytes: entry.metadata()?.len(),
                path,
            });
        }

        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.as_str().cmp(b.id.as_str())));
        Ok(snapshots)
    }
}

fn copy_database(src: &Connection, dst: &mut Connection) -> Result<()> {
    let backup = Backup::new(src, dst)
        .map_err(|e| Error::Backup(format!("failed to start SQLite backup: {e}")))?;
    backup
        .run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_PAUSE, None)
        .map_err(|e| Error::Backup(format!("SQLite backup failed: {e}")))
}

fn quick_check(conn: &Connection, path: &Path) -> Result<()> {
    let result: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| Error::Backup(format!("quick_check failed on {}: {e}", path.display())))?;
    if result != "ok" {
        return Err(Error::Backup(format!(
            "snapshot {} failed quick_check: {result}",
            path.display()
        )));
    }
    Ok(())
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "snapshot".to_string()
    } else {
        cleaned.to_string()
    }
}

fn parse_created_at(stem: &str) -> Option<DateTime<Utc>> {
    let (timestamp, _) = stem.split_once('_')?;
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}
