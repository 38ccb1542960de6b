//! The `migrations` table: what has been applied to this store.
//!
//! Rows are inserted only through [`Ledger::record`] and deleted only
//! through [`Ledger::erase`]. Both take a [`Transaction`] so the row change
//! always commits together with the schema change it describes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use fitcrm_common::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::descriptor::MigrationDescriptor;

pub const LEDGER_TABLE: &str = "migrations";

const LEDGER_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    version INTEGER NOT NULL,
    description TEXT,
    executed_at TEXT NOT NULL,
    execution_time_ms INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    rollback_sql TEXT
);";

const REQUIRED_COLUMNS: [&str; 8] = [
    "id",
    "filename",
    "version",
    "description",
    "executed_at",
    "execution_time_ms",
    "checksum",
    "rollback_sql",
];

const SELECT_COLUMNS: &str = "id, filename, version, description, executed_at, execution_time_ms, checksum, rollback_sql";

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub filename: String,
    pub version: u32,
    pub description: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
    pub checksum: String,
    /// The DOWN script as it was when the migration was applied.
    pub rollback_sql: Option<String>,
}

/// An applied migration whose file changed after it was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub filename: String,
    pub recorded: String,
    pub actual: String,
}

impl ChecksumMismatch {
    pub fn to_error(&self) -> Error {
        Error::ChecksumMismatch {
            filename: self.filename.clone(),
            recorded: self.recorded.clone(),
            actual: self.actual.clone(),
        }
    }
}

/// Result of comparing the ledger against the files on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChecksumAudit {
    pub mismatches: Vec<ChecksumMismatch>,
    /// Applied filenames with no file on disk any more.
    pub missing_files: Vec<String>,
}

pub struct Ledger<'c> {
    conn: &'c Connection,
}

impl<'c> Ledger<'c> {
    /// Open the ledger, creating the table when it does not exist yet.
    ///
    /// An existing table without the expected columns is reported as
    /// corrupt; it is never dropped or rewritten.
    pub fn open(conn: &'c Connection) -> Result<Self> {
        conn.execute_batch(LEDGER_SCHEMA)
            .map_err(|e| Error::Storage(format!("failed to create ledger table: {e}")))?;

        let mut stmt = conn
            .prepare("SELECT name FROM pragma_table_info('migrations')")
            .map_err(|e| Error::Storage(format!("failed to inspect ledger table: {e}")))?;
        let columns: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect())
            .map_err(|e| Error::Storage(format!("failed to inspect ledger table: {e}")))?;

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| !columns.contains(*c))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Storage(format!(
                "ledger table '{LEDGER_TABLE}' is corrupt: missing columns {}",
                missing.join(", ")
            )));
        }

        Ok(Self { conn })
    }

    /// All entries, ascending by version.
    pub fn load(&self) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM migrations ORDER BY version ASC, id ASC"
            ))
            .map_err(|e| Error::Storage(format!("failed to read ledger: {e}")))?;

        let rows = stmt
            .query_map([], raw_entry)
            .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>())
            .map_err(|e| Error::Storage(format!("failed to read ledger: {e}")))?;

        rows.into_iter().map(RawEntry::into_entry).collect()
    }

    /// Highest applied version, or 0 for a fresh store.
    pub fn current_version(&self) -> Result<u32> {
        self.conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |row| {
                row.get(0)
            })
            .map_err(|e| Error::Storage(format!("failed to read current version: {e}")))
    }

    pub fn find(&self, filename: &str) -> Result<Option<LedgerEntry>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM migrations WHERE filename = ?1"),
                params![filename],
                raw_entry,
            )
            .optional()
            .map_err(|e| Error::Storage(format!("failed to look up {filename}: {e}")))?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// Descriptors not yet recorded, ascending by version.
    pub fn diff(&self, descriptors: &[MigrationDescriptor]) -> Result<Vec<MigrationDescriptor>> {
        let applied: HashSet<String> = self.load()?.into_iter().map(|e| e.filename).collect();
        let mut pending: Vec<MigrationDescriptor> = descriptors
            .iter()
            .filter(|d| !applied.contains(&d.filename))
            .cloned()
            .collect();
        pending.sort_by(|a, b| (a.version, &a.filename).cmp(&(b.version, &b.filename)));
        Ok(pending)
    }

    /// Compare recorded checksums with the files currently on disk.
    pub fn verify_checksums(&self, descriptors: &[MigrationDescriptor]) -> Result<ChecksumAudit> {
        self.audit(descriptors, &[])
    }

    /// Like [`verify_checksums`](Self::verify_checksums), but files that
    /// exist yet failed to parse are not reported as missing.
    pub fn audit(
        &self,
        descriptors: &[MigrationDescriptor],
        unparsed_files: &[&str],
    ) -> Result<ChecksumAudit> {
        let on_disk: HashMap<&str, &MigrationDescriptor> = descriptors
            .iter()
            .map(|d| (d.filename.as_str(), d))
            .collect();

        let mut audit = ChecksumAudit::default();
        for entry in self.load()? {
            match on_disk.get(entry.filename.as_str()) {
                Some(d) if d.checksum != entry.checksum => {
                    audit.mismatches.push(ChecksumMismatch {
                        filename: entry.filename.clone(),
                        recorded: entry.checksum.clone(),
                        actual: d.checksum.clone(),
                    });
                }
                Some(_) => {}
                None if unparsed_files.contains(&entry.filename.as_str()) => {}
                None => audit.missing_files.push(entry.filename.clone()),
            }
        }
        Ok(audit)
    }

    /// Insert the ledger row for `descriptor` inside the caller's transaction.
    pub fn record(
        tx: &Transaction<'_>,
        descriptor: &MigrationDescriptor,
        execution_time_ms: u64,
    ) -> Result<()> {
        tx.execute(
            "INSERT INTO migrations (filename, version, description, executed_at, execution_time_ms, checksum, rollback_sql)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                descriptor.filename,
                descriptor.version,
                descriptor.description,
                Utc::now().to_rfc3339(),
                i64::try_from(execution_time_ms).unwrap_or(i64::MAX),
                descriptor.checksum,
                descriptor.down_script,
            ],
        )
        .map_err(|e| {
            Error::Storage(format!(
                "failed to record {} in ledger: {e}",
                descriptor.filename
            ))
        })?;
        debug!(filename = %descriptor.filename, "ledger row recorded");
        Ok(())
    }

    /// Delete the ledger row for `filename` inside the caller's transaction.
    pub fn erase(tx: &Transaction<'_>, filename: &str) -> Result<()> {
        let deleted = tx
            .execute("DELETE FROM migrations WHERE filename = ?1", params![filename])
            .map_err(|e| Error::Storage(format!("failed to erase {filename} from ledger: {e}")))?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("{filename} is not in the ledger")));
        }
        info!(filename, "ledger row erased");
        Ok(())
    }
}

struct RawEntry {
    id: i64,
    filename: String,
    version: i64,
    description: Option<String>,
    executed_at: String,
    execution_time_ms: i64,
    checksum: String,
    rollback_sql: Option<String>,
}

fn raw_entry(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        id: row.get(0)?,
        filename: row.get(1)?,
        version: row.get(2)?,
        description: row.get(3)?,
        executed_at: row.get(4)?,
        execution_time_ms: row.get(5)?,
        checksum: row.get(6)?,
        rollback_sql: row.get(7)?,
    })
}

impl RawEntry {
    fn into_entry(self) -> Result<LedgerEntry> {
        let version = u32::try_from(self.version)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                Error::Storage(format!(
                    "ledger row {} has invalid version {}",
                    self.filename, self.version
                ))
            })?;
        let executed_at = DateTime::parse_from_rfc3339(&self.executed_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                Error::Storage(format!(
                    "ledger row {} has invalid executed_at '{}': {e}",
                    self.filename, self.executed_at
                ))
            })?;

        Ok(LedgerEntry {
            id: self.id,
            filename: self.filename,
            version,
            description: self.description,
            executed_at,
            execution_time_ms: u64::try_from(self.execution_time_ms).unwrap_or(0),
            checksum: self.checksum,
            rollback_sql: self.rollback_sql,
        })
    }
}
