use fitcrm_common::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The CRM's embedded SQLite file.
///
/// Every migration component borrows the connection from here; nothing else
/// opens the live database for writing except the snapshot restore path.
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Storage(format!("failed to set pragmas: {e}")))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Storage(format!("failed to set busy timeout: {e}")))?;

        Ok(Self {
            conn,
            path: Some(db_path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Storage(format!("failed to set pragmas: {e}")))?;

        Ok(Self { conn, path: None })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Bytes on disk, including the write-ahead log.
    pub fn file_size(&self) -> Result<u64> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let mut total = 0;
        for candidate in [path.clone(), sidecar(path, "-wal")] {
            match std::fs::metadata(&candidate) {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Probe SQLite's own writer lock without waiting for it.
    ///
    /// Returns `Ok(false)` when another connection currently holds a write
    /// transaction on the file.
    pub fn writer_lock_available(&self) -> Result<bool> {
        self.conn
            .busy_timeout(Duration::ZERO)
            .map_err(|e| Error::Storage(format!("failed to set busy timeout: {e}")))?;

        let attempt = self.conn.execute_batch("BEGIN IMMEDIATE; ROLLBACK;");

        self.conn
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Storage(format!("failed to set busy timeout: {e}")))?;

        match attempt {
            Ok(()) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(Error::Storage(format!("writer lock check failed: {e}"))),
        }
    }
}

/// `<path><suffix>`, e.g. `fitcrm.db-wal`.
pub(crate) fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
