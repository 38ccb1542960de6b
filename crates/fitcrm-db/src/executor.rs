//! Applies pending migrations, one transaction each.

use std::time::Instant;

use fitcrm_common::{Error, Result, RunId};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{error, info};

use crate::descriptor::MigrationDescriptor;
use crate::ledger::Ledger;
use crate::runlog::{RunLog, RunLogEntry};
use crate::transaction::{ExecutionLimits, with_transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Pending,
    Applying,
    Applied,
    Failed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub filename: String,
    pub version: u32,
    pub state: MigrationState,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    /// Every migration handed to the run, in execution order. Those after a
    /// failure stay `Pending`.
    pub outcomes: Vec<MigrationOutcome>,
    /// Filename of the migration that failed, if the run stopped early.
    pub halted_at: Option<String>,
    pub error: Option<Error>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.state == MigrationState::Applied)
            .count()
    }
}

pub struct Executor<'a> {
    conn: &'a Connection,
    limits: &'a ExecutionLimits,
    log: Option<&'a RunLog>,
    run_id: RunId,
}

impl<'a> Executor<'a> {
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

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Execute the UP script and record the ledger row as one unit.
    ///
    /// Returns the script's execution time. On error neither the schema
    /// change nor the ledger row survive.
    pub fn apply(&self, migration: &MigrationDescriptor) -> Result<u64> {
        with_transaction(self.conn, self.limits, |tx| {
            let started = Instant::now();
            tx.execute_batch(&migration.up_script)
                .map_err(|e| Error::Execution {
                    filename: migration.filename.clone(),
                    version: migration.version,
                    message: e.to_string(),
                })?;
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            Ledger::record(tx, migration, elapsed)?;
            Ok(elapsed)
        })
    }

    /// Apply `pending` in order, stopping at the first failure.
    ///
    /// Migrations committed before the failure stay applied.
    pub fn run(&self, pending: &[MigrationDescriptor]) -> RunReport {
        let mut report = RunReport {
            run_id: self.run_id.clone(),
            outcomes: pending
                .iter()
                .map(|m| MigrationOutcome {
                    filename: m.filename.clone(),
                    version: m.version,
                    state: MigrationState::Pending,
                    duration_ms: 0,
                    error: None,
                })
                .collect(),
            halted_at: None,
            error: None,
        };

        for (migration, outcome) in pending.iter().zip(report.outcomes.iter_mut()) {
            outcome.state = MigrationState::Applying;
            info!(
                run_id = %self.run_id,
                version = migration.version,
                "applying {}",
                migration.filename
            );

            let started = Instant::now();
            match self.apply(migration) {
                Ok(script_ms) => {
                    outcome.state = MigrationState::Applied;
                    outcome.duration_ms = script_ms;
                    info!("applied {} in {script_ms}ms", migration.filename);
                    self.log_outcome(migration, outcome);
                }
                Err(err) => {
                    outcome.state = MigrationState::Failed;
                    outcome.duration_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    outcome.error = Some(err.to_string());
                    error!("migration {} failed: {err}", migration.filename);
                    self.log_outcome(migration, outcome);
                    report.halted_at = Some(migration.filename.clone());
                    report.error = Some(err);
                    break;
                }
            }
        }

        report
    }

    fn log_outcome(&self, migration: &MigrationDescriptor, outcome: &MigrationOutcome) {
        let Some(log) = self.log else {
            return;
        };
        let mut entry = RunLogEntry::new(
            &self.run_id,
            "apply",
            &migration.filename,
            migration.version,
            outcome.state.as_str(),
        )
        .with_duration(outcome.duration_ms);
        if let Some(error) = &outcome.error {
            entry = entry.with_error(error);
        }
        log.record(&entry);
    }
}
