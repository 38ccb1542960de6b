//! `Migrator`: one entry point per CLI command.
//!
//! The facade owns no state of its own beyond settings. Each call opens the
//! ledger, rescans the migrations directory and composes the components in
//! the order the command needs.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use fitcrm_common::{Error, Result, RunId, SanityCheck, SnapshotId};
use serde::Serialize;
use tracing::{info, warn};

use crate::backup::{BackupProvider, SnapshotInfo};
use crate::descriptor::MigrationDescriptor;
use crate::executor::{Executor, RunReport};
use crate::ledger::{ChecksumAudit, Ledger, LedgerEntry};
use crate::rollback::{RestoreReport, RollbackCoordinator, RollbackReport};
use crate::runlog::RunLog;
use crate::safety::{GateInput, RunLock, SafetyGate, SafetyPolicy, SafetyReport, failures_in_pending_range};
use crate::scanner::{MigrationScanner, ScaffoldedMigration, ScanReport};
use crate::status::{StatusSummary, write_status};
use crate::store::Store;
use crate::transaction::{CancelToken, ExecutionLimits};
use crate::verifier::{IntegrityVerifier, VerificationReport};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub migrations_dir: PathBuf,
    pub status_file: Option<PathBuf>,
    pub run_log: Option<PathBuf>,
    pub safety: SafetyPolicy,
    pub snapshot_before_run: bool,
    pub run_timeout: Option<Duration>,
    pub sanity_checks: Vec<SanityCheck>,
}

impl EngineSettings {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
            status_file: None,
            run_log: None,
            safety: SafetyPolicy::default(),
            snapshot_before_run: true,
            run_timeout: None,
            sanity_checks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Proceed past overridable safety issues. The caller must have
    /// confirmed this with the operator.
    pub override_safety: bool,
    /// Skip the pre-run snapshot even when settings ask for one.
    pub skip_snapshot: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackOptions {
    pub cascade: bool,
    pub override_safety: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: u32,
    pub filename: String,
    pub description: Option<String>,
    pub reversible: bool,
}

impl From<&MigrationDescriptor> for PendingMigration {
    fn from(d: &MigrationDescriptor) -> Self {
        Self {
            version: d.version,
            filename: d.filename.clone(),
            description: d.description.clone(),
            reversible: d.down_script.is_some(),
        }
    }
}

#[derive(Debug)]
pub struct CheckReport {
    pub current_version: u32,
    pub applied_count: usize,
    pub pending: Vec<PendingMigration>,
    /// Files that failed to parse, as display strings.
    pub parse_failures: Vec<String>,
    pub audit: ChecksumAudit,
    pub safety: SafetyReport,
    pub verification: VerificationReport,
}

impl CheckReport {
    /// Nothing pending, nothing blocking and the store verifies clean.
    pub fn healthy(&self) -> bool {
        self.pending.is_empty()
            && self.safety.is_clear()
            && self.audit.mismatches.is_empty()
            && self.verification.passed
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub report: RunReport,
    pub snapshot: Option<SnapshotId>,
    pub warnings: Vec<String>,
    /// Only present when every migration applied.
    pub verification: Option<VerificationReport>,
    pub status: StatusSummary,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.report.succeeded()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub current_version: u32,
    pub applied: Vec<LedgerEntry>,
    pub pending: Vec<PendingMigration>,
    pub parse_failures: Vec<String>,
    pub missing_files: Vec<String>,
    pub checksum_mismatches: Vec<String>,
}

pub struct Migrator<'a> {
    store: &'a Store,
    settings: &'a EngineSettings,
    backup: Option<&'a dyn BackupProvider>,
    cancel: CancelToken,
    run_log: Option<RunLog>,
}

impl<'a> Migrator<'a> {
    pub fn new(store: &'a Store, settings: &'a EngineSettings) -> Self {
        Self {
            store,
            settings,
            backup: None,
            cancel: CancelToken::new(),
            run_log: settings.run_log.as_ref().map(RunLog::new),
        }
    }

    pub fn with_backup(mut self, backup: &'a dyn BackupProvider) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn scan(&self) -> Result<ScanReport> {
        MigrationScanner::new(&self.settings.migrations_dir).discover()
    }

    /// Report what `run` would do without changing anything.
    pub fn check(&self) -> Result<CheckReport> {
        let ledger = Ledger::open(self.store.connection())?;
        let applied = ledger.load()?;
        let scan = self.scan()?;
        let pending = ledger.diff(&scan.migrations)?;
        let audit = ledger.audit(&scan.migrations, &unparsed_names(&scan))?;

        let safety = SafetyGate::new(self.store, self.backup, &self.settings.safety).evaluate(
            &GateInput {
                applied: &applied,
                pending: &pending,
                audit: &audit,
                failures: &scan.failures,
                lock_held: false,
                snapshot_planned: self.snapshot_planned(&pending, false),
            },
        )?;
        let verification =
            IntegrityVerifier::new(self.store.connection(), &self.settings.sanity_checks).verify();

        Ok(CheckReport {
            current_version: ledger.current_version()?,
            applied_count: applied.len(),
            pending: pending.iter().map(PendingMigration::from).collect(),
            parse_failures: scan.failures.iter().map(|f| f.error.to_string()).collect(),
            audit,
            safety,
            verification,
        })
    }

    /// Apply every pending migration.
    ///
    /// `Err` means nothing was applied. A migration failing mid-run is
    /// reported through [`RunSummary::report`]; migrations committed before
    /// it stay applied.
    pub fn run(&self, options: RunOptions) -> Result<RunSummary> {
        let lock = self.acquire_lock()?;
        let ledger = Ledger::open(self.store.connection())?;
        let applied = ledger.load()?;
        let mut scan = self.scan()?;
        let current = ledger.current_version()?;

        let audit = ledger.audit(&scan.migrations, &unparsed_names(&scan))?;
        if let Some(mismatch) = audit.mismatches.first() {
            return Err(mismatch.to_error());
        }
        for failure in &scan.failures {
            let Some(entry) = applied.iter().find(|e| e.filename == failure.filename) else {
                continue;
            };
            if failure.checksum.as_deref() != Some(entry.checksum.as_str()) {
                return Err(Error::ChecksumMismatch {
                    filename: entry.filename.clone(),
                    recorded: entry.checksum.clone(),
                    actual: failure
                        .checksum
                        .clone()
                        .unwrap_or_else(|| "unreadable".to_string()),
                });
            }
        }

        let pending = ledger.diff(&scan.migrations)?;
        let blocking_parse = failures_in_pending_range(current, &scan.failures)
            .first()
            .map(|f| f.filename.clone());
        if let Some(filename) = blocking_parse {
            let idx = scan.failures.iter().position(|f| f.filename == filename);
            if let Some(idx) = idx {
                return Err(scan.failures.swap_remove(idx).error);
            }
        }

        let mut warnings = Vec::new();
        for filename in &audit.missing_files {
            warnings.push(format!("applied migration {filename} is missing from disk"));
        }

        let report;
        let mut snapshot = None;
        if pending.is_empty() {
            info!("no pending migrations; store is at version {current}");
            report = RunReport {
                run_id: RunId::new(),
                outcomes: Vec::new(),
                halted_at: None,
                error: None,
            };
        } else {
            let snapshot_planned = self.snapshot_planned(&pending, options.skip_snapshot);
            let safety = SafetyGate::new(self.store, self.backup, &self.settings.safety).evaluate(
                &GateInput {
                    applied: &applied,
                    pending: &pending,
                    audit: &audit,
                    failures: &scan.failures,
                    lock_held: lock.is_some(),
                    snapshot_planned,
                },
            )?;
            for issue in &safety.warnings {
                warn!("safety: {issue}");
                warnings.push(issue.to_string());
            }
            safety.verdict(options.override_safety)?;

            if snapshot_planned {
                snapshot = self.pre_run_snapshot(&pending, &mut warnings)?;
            }

            let limits = ExecutionLimits::new(self.cancel.clone(), self.settings.run_timeout);
            let mut executor = Executor::new(self.store.connection(), &limits);
            if let Some(log) = &self.run_log {
                executor = executor.with_run_log(log);
            }
            report = executor.run(&pending);
        }

        let verification = if report.succeeded() && report.applied_count() > 0 {
            let verification =
                IntegrityVerifier::new(self.store.connection(), &self.settings.sanity_checks)
                    .verify();
            for issue in &verification.issues {
                warn!("post-run verification: {issue}");
            }
            Some(verification)
        } else {
            None
        };

        let status = StatusSummary {
            last_updated: Utc::now(),
            current_version: ledger.current_version()?,
            pending_count: pending.len() - report.applied_count(),
            total_count: scan.total_files(),
        };
        self.write_status_file(&status);

        drop(lock);
        Ok(RunSummary {
            report,
            snapshot,
            warnings,
            verification,
            status,
        })
    }

    /// Revert `filename`, and with `cascade` everything applied after it.
    pub fn rollback(&self, filename: &str, options: RollbackOptions) -> Result<RollbackReport> {
        let lock = self.acquire_lock()?;
        let ledger = Ledger::open(self.store.connection())?;
        let applied = ledger.load()?;

        let safety = SafetyGate::new(self.store, self.backup, &self.settings.safety).evaluate(
            &GateInput {
                applied: &applied,
                pending: &[],
                audit: &ChecksumAudit::default(),
                failures: &[],
                lock_held: lock.is_some(),
                snapshot_planned: false,
            },
        )?;
        for issue in &safety.warnings {
            warn!("safety: {issue}");
        }
        safety.verdict(options.override_safety)?;

        let limits = ExecutionLimits::new(self.cancel.clone(), self.settings.run_timeout);
        let mut coordinator = RollbackCoordinator::new(self.store.connection(), &limits);
        if let Some(log) = &self.run_log {
            coordinator = coordinator.with_run_log(log);
        }
        let report = coordinator.rollback(filename, options.cascade)?;

        self.refresh_status(&ledger)?;
        drop(lock);
        Ok(report)
    }

    /// Replace the store with a snapshot. Latest one unless `snapshot` names one.
    pub fn emergency_restore(&self, snapshot: Option<&SnapshotId>) -> Result<RestoreReport> {
        let backup = self.require_backup()?;
        let lock = self.acquire_lock()?;

        let limits = ExecutionLimits::default();
        let mut coordinator = RollbackCoordinator::new(self.store.connection(), &limits);
        if let Some(log) = &self.run_log {
            coordinator = coordinator.with_run_log(log);
        }
        let report = coordinator.emergency_restore(backup, snapshot)?;

        let ledger = Ledger::open(self.store.connection())?;
        self.refresh_status(&ledger)?;
        drop(lock);
        Ok(report)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let ledger = Ledger::open(self.store.connection())?;
        let applied = ledger.load()?;
        let scan = self.scan()?;
        let pending = ledger.diff(&scan.migrations)?;
        let audit = ledger.audit(&scan.migrations, &unparsed_names(&scan))?;

        Ok(StatusReport {
            current_version: ledger.current_version()?,
            applied,
            pending: pending.iter().map(PendingMigration::from).collect(),
            parse_failures: scan.failures.iter().map(|f| f.error.to_string()).collect(),
            missing_files: audit.missing_files,
            checksum_mismatches: audit.mismatches.iter().map(|m| m.filename.clone()).collect(),
        })
    }

    /// Scaffold the next-numbered migration file.
    pub fn create(&self, description: &str) -> Result<ScaffoldedMigration> {
        let ledger = Ledger::open(self.store.connection())?;
        let scan = self.scan()?;
        let highest = scan.max_version().max(ledger.current_version()?);
        let next = highest.checked_add(1).ok_or_else(|| {
            Error::InvalidInput(format!("no version number is left after {highest}"))
        })?;
        MigrationScanner::new(&self.settings.migrations_dir).scaffold(next, description)
    }

    /// Verify the store. Reports only; never changes schema or data.
    pub fn repair(&self) -> Result<VerificationReport> {
        Ok(IntegrityVerifier::new(self.store.connection(), &self.settings.sanity_checks).verify())
    }

    pub fn snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.require_backup()?.list_snapshots()
    }

    fn require_backup(&self) -> Result<&'a dyn BackupProvider> {
        self.backup
            .ok_or_else(|| Error::Backup("no backup provider is configured".into()))
    }

    fn acquire_lock(&self) -> Result<Option<RunLock>> {
        self.store.path().map(RunLock::acquire).transpose()
    }

    fn snapshot_planned(&self, pending: &[MigrationDescriptor], skip: bool) -> bool {
        !skip && self.settings.snapshot_before_run && self.backup.is_some() && !pending.is_empty()
    }

    fn pre_run_snapshot(
        &self,
        pending: &[MigrationDescriptor],
        warnings: &mut Vec<String>,
    ) -> Result<Option<SnapshotId>> {
        let Some(backup) = self.backup else {
            return Ok(None);
        };
        let label = format!("pre-v{}", pending.first().map_or(0, |m| m.version));
        match backup.create_snapshot(&label) {
            Ok(id) => {
                info!("pre-run snapshot {id} created");
                Ok(Some(id))
            }
            Err(e) if self.settings.safety.require_backup => Err(e),
            Err(e) => {
                warn!("pre-run snapshot failed, continuing without one: {e}");
                warnings.push(format!("pre-run snapshot failed: {e}"));
                Ok(None)
            }
        }
    }

    fn refresh_status(&self, ledger: &Ledger<'_>) -> Result<()> {
        if self.settings.status_file.is_none() {
            return Ok(());
        }
        let scan = self.scan()?;
        let pending = ledger.diff(&scan.migrations)?;
        self.write_status_file(&StatusSummary {
            last_updated: Utc::now(),
            current_version: ledger.current_version()?,
            pending_count: pending.len(),
            total_count: scan.total_files(),
        });
        Ok(())
    }

    fn write_status_file(&self, status: &StatusSummary) {
        let Some(path) = &self.settings.status_file else {
            return;
        };
        if let Err(e) = write_status(path, status) {
            warn!("failed to write status file {}: {e}", path.display());
        }
    }
}

fn unparsed_names(scan: &ScanReport) -> Vec<&str> {
    scan.failures.iter().map(|f| f.filename.as_str()).collect()
}
