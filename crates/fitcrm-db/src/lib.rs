pub mod backup;
pub mod descriptor;
pub mod engine;
pub mod executor;
pub mod ledger;
pub mod rollback;
pub mod runlog;
pub mod safety;
pub mod scanner;
pub mod status;
pub mod store;
pub mod transaction;
pub mod verifier;

pub use backup::{BackupProvider, PRE_RESTORE_LABEL, SnapshotInfo, SnapshotStore};
pub use descriptor::{MigrationDescriptor, load_migration, parse_migration};
pub use engine::{
    CheckReport, EngineSettings, Migrator, PendingMigration, RollbackOptions, RunOptions,
    RunSummary, StatusReport,
};
pub use executor::{Executor, MigrationOutcome, MigrationState, RunReport};
pub use ledger::{ChecksumAudit, ChecksumMismatch, Ledger, LedgerEntry};
pub use rollback::{RestoreReport, RollbackCoordinator, RollbackPlan, RollbackReport, plan_rollback};
pub use runlog::{RunLog, RunLogEntry};
pub use safety::{LockState, RunLock, SafetyCheckKind, SafetyGate, SafetyIssue, SafetyPolicy, SafetyReport};
pub use scanner::{MigrationScanner, ScaffoldedMigration, ScanFailure, ScanReport};
pub use status::{StatusSummary, read_status, write_status};
pub use store::Store;
pub use transaction::{CancelToken, ExecutionLimits, with_transaction};
pub use verifier::{IntegrityVerifier, VerificationReport};
