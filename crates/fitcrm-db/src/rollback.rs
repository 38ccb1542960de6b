//! Reverting applied migrations.
//!
//! Two paths exist. Targeted rollback replays the DOWN scripts stored in the
//! ledger, newest first, one transaction per migration. Emergency restore
//! replaces the whole store with a snapshot from the [`BackupProvider`].
//!
//! [`plan_rollback`] is pure and decides everything that can be decided
//! before storage is touched: whether the target is applied, whether later
//! migrations block it, and whether every step has a DOWN script.

use std::time::Instant;

use fitcrm_common::{Error, Result, RunId, SnapshotId};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::backup::{BackupProvider, PRE_RESTORE_LABEL};
use crate::ledger::{Ledger, LedgerEntry};
use crate::runlog::{RunLog, RunLogEntry};
use crate::transaction::{ExecutionLimits, with_transaction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackPlan {
    pub target: String,
    /// Entries to revert, strictly descending by version.
    pub steps: Vec<LedgerEntry>,
}

/// Work out which ledger entries must be reverted to undo `filename`.
pub fn plan_rollback(entries: &[LedgerEntry], filename: &str, cascade: bool) -> Result<RollbackPlan> {
    let target = entries
        .iter()
        .find(|e| e.filename == filename)
        .ok_or_else(|| Error::NotFound(format!("{filename} is not applied")))?;

    let mut later: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|e| e.version > target.version)
        .collect();
    later.sort_by_key(|e| e.version);

    if !later.is_empty() && !cascade {
        return Err(Error::Dependency {
            filename: filename.to_string(),
            blocked_by: later.iter().map(|e| e.filename.clone()).collect(),
        });
    }

    let steps: Vec<LedgerEntry> = later
        .into_iter()
        .rev()
        .chain(std::iter::once(target))
        .cloned()
        .collect();

    if let Some(missing) = steps.iter().find(|s| {
        s.rollback_sql
            .as_deref()
            .is_none_or(|sql| sql.trim().is_empty())
    }) {
        return Err(Error::NoRollbackScript(missing.filename.clone()));
    }

    Ok(RollbackPlan {
        target: filename.to_string(),
        steps,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RevertedMigration {
    pub filename: String,
    pub version: u32,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct RollbackReport {
    pub run_id: RunId,
    pub reverted: Vec<RevertedMigration>,
    /// Step that failed; earlier steps stay reverted.
    pub failed_at: Option<String>,
    pub error: Option<Error>,
    pub current_version: u32,
}

impl RollbackReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub restored: SnapshotId,
    /// Snapshot of the state that was replaced, if one could be taken.
    pub safety_snapshot: Option<SnapshotId>,
    pub current_version: u32,
}

pub struct RollbackCoordinator<'a> {
    conn: &'a Connection,
    limits: &'a ExecutionLimits,
    log: Option<&'a RunLog>,
    run_id: RunId,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(conn: &'a Connection, limits: &'a ExecutionLimits) -> Self {
        Self {
            conn,
            limits,
            log: None,
            run_id: RunId::new(),
        }
    }

    pub fn with_run_log(mut self, log: &'a RunLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Plan against the current ledger, then execute.
    pub fn rollback(&self, filename: &str, cascade: bool) -> Result<RollbackReport> {
        let entries = Ledger::open(self.conn)?.load()?;
        let plan = plan_rollback(&entries, filename, cascade)?;
        self.execute_plan(&plan)
    }

    pub fn execute_plan(&self, plan: &RollbackPlan) -> Result<RollbackReport> {
        let mut reverted = Vec::new();
        let mut failed_at = None;
        let mut failure = None;

        for step in &plan.steps {
            let started = Instant::now();
            let result = with_transaction(self.conn, self.limits, |tx| {
                let sql = step
                    .rollback_sql
                    .as_deref()
                    .ok_or_else(|| Error::NoRollbackScript(step.filename.clone()))?;
                tx.execute_batch(sql).map_err(|e| Error::Execution {
                    filename: step.filename.clone(),
                    version: step.version,
                    message: format!("rollback script failed: {e}"),
                })?;
                Ledger::erase(tx, &step.filename)
            });
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(()) => {
                    info!(version = step.version, "rolled back {}", step.filename);
                    self.log_step(step, "reverted", duration_ms, None);
                    reverted.push(RevertedMigration {
                        filename: step.filename.clone(),
                        version: step.version,
                        duration_ms,
                    });
                }
                Err(err) => {
                    error!("rollback of {} failed: {err}", step.filename);
                    self.log_step(step, "failed", duration_ms, Some(&err));
                    failed_at = Some(step.filename.clone());
                    failure = Some(err);
                    break;
                }
            }
        }

        Ok(RollbackReport {
            run_id: self.run_id.clone(),
            reverted,
            failed_at,
            error: failure,
            current_version: Ledger::open(self.conn)?.current_version()?,
        })
    }

    /// Replace the store with `snapshot`, or the newest one when `None`.
    ///
    /// The current state is snapshotted first under [`PRE_RESTORE_LABEL`];
    /// if that fails the restore still proceeds.
    pub fn emergency_restore(
        &self,
        backup: &dyn BackupProvider,
        snapshot: Option<&SnapshotId>,
    ) -> Result<RestoreReport> {
        let target = match snapshot {
            Some(id) => id.clone(),
            None => {
                backup
                    .latest_snapshot()?
                    .ok_or_else(|| Error::NotFound("no snapshots available to restore".into()))?
                    .id
            }
        };

        let safety_snapshot = match backup.create_snapshot(PRE_RESTORE_LABEL) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("could not snapshot current state before restore: {e}");
                None
            }
        };

        warn!("emergency restore from snapshot {target}");
        backup.restore_snapshot(&target)?;
        let current_version = Ledger::open(self.conn)?.current_version()?;

        if let Some(log) = self.log {
            log.record(&RunLogEntry::new(
                &self.run_id,
                "restore",
                target.as_str(),
                current_version,
                "restored",
            ));
        }

        Ok(RestoreReport {
            restored: target,
            safety_snapshot,
            current_version,
        })
    }

    fn log_step(&self, step: &LedgerEntry, status: &str, duration_ms: u64, err: Option<&Error>) {
        let Some(log) = self.log else {
            return;
        };
        let mut entry = RunLogEntry::new(&self.run_id, "rollback", &step.filename, step.version, status)
            .with_duration(duration_ms);
        if let Some(err) = err {
            entry = entry.with_error(err);
        }
        log.record(&entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(version: u32, name: &str, down: Option<&str>) -> LedgerEntry {
        LedgerEntry {
            id: i64::from(version),
            filename: format!("{version:03}_{name}.sql"),
            version,
            description: None,
            executed_at: Utc::now(),
            execution_time_ms: 1,
            checksum: "c".into(),
            rollback_sql: down.map(str::to_string),
        }
    }

    #[test]
    fn topmost_needs_no_cascade() {
        let entries = vec![entry(1, "init", Some("DROP TABLE a;")), entry(2, "col", Some("SELECT 1;"))];
        let plan = plan_rollback(&entries, "002_col.sql", false).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].version, 2);
    }

    #[test]
    fn lower_version_is_blocked_without_cascade() {
        let entries = vec![
            entry(1, "init", Some("x")),
            entry(2, "col", Some("y")),
            entry(3, "idx", Some("z")),
        ];
        match plan_rollback(&entries, "001_init.sql", false).unwrap_err() {
            Error::Dependency { filename, blocked_by } => {
                assert_eq!(filename, "001_init.sql");
                assert_eq!(blocked_by, vec!["002_col.sql", "003_idx.sql"]);
            }
            other => panic!("expected Dependency, got {other:?}"),
        }

        let plan = plan_rollback(&entries, "001_init.sql", true).unwrap();
        let versions: Vec<u32> = plan.steps.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[test]
    fn every_step_needs_a_down_script() {
        let entries = vec![entry(1, "init", Some("x")), entry(2, "col", Some("  \n"))];
        assert!(matches!(
            plan_rollback(&entries, "001_init.sql", true),
            Err(Error::NoRollbackScript(f)) if f == "002_col.sql"
        ));
    }

    #[test]
    fn unknown_filename_is_not_found() {
        assert!(matches!(
            plan_rollback(&[entry(1, "init", Some("x"))], "009_nope.sql", false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn failing_step_keeps_earlier_reverts() {
        let conn = Connection::open_in_memory().unwrap();
        let ledger = Ledger::open(&conn).unwrap();
        let limits = ExecutionLimits::default();

        conn.execute_batch(
            "CREATE TABLE members (id INTEGER);
             CREATE TABLE classes (id INTEGER);",
        )
        .unwrap();
        for (filename, version, down) in [
            ("001_members.sql", 1, "DROP TABLE does_not_exist;"),
            ("002_classes.sql", 2, "DROP TABLE classes;"),
        ] {
            conn.execute(
                "INSERT INTO migrations (filename, version, executed_at, execution_time_ms, checksum, rollback_sql)
                 VALUES (?1, ?2, ?3, 0, 'c', ?4)",
                rusqlite::params![filename, version, Utc::now().to_rfc3339(), down],
            )
            .unwrap();
        }

        let coordinator = RollbackCoordinator::new(&conn, &limits);
        let report = coordinator.rollback("001_members.sql", true).unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.reverted.len(), 1);
        assert_eq!(report.reverted[0].filename, "002_classes.sql");
        assert_eq!(report.failed_at.as_deref(), Some("001_members.sql"));
        assert_eq!(report.current_version, 1);
        assert!(ledger.find("001_members.sql").unwrap().is_some());
    }
}
