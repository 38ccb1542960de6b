//! Pre-flight checks run before anything touches the store.
//!
//! The gate only collects [`SafetyIssue`]s into a [`SafetyReport`]; whether
//! the operation may proceed is decided by [`SafetyReport::verdict`], which is
//! pure. Operator confirmation of an override lives in the CLI.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fitcrm_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backup::BackupProvider;
use crate::descriptor::MigrationDescriptor;
use crate::ledger::{ChecksumAudit, LedgerEntry};
use crate::scanner::ScanFailure;
use crate::store::{Store, sidecar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyCheckKind {
    BackupFreshness,
    DiskHeadroom,
    SingleWriter,
    VersionContiguity,
    ChecksumIntegrity,
    ParseFailure,
}

impl SafetyCheckKind {
    /// Only environmental checks may be overridden. Structural problems with
    /// the migration set or a concurrent writer never are.
    pub fn overridable(&self) -> bool {
        matches!(self, Self::BackupFreshness | Self::DiskHeadroom)
    }
}

impl fmt::Display for SafetyCheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BackupFreshness => "backup freshness",
            Self::DiskHeadroom => "disk headroom",
            Self::SingleWriter => "single writer",
            Self::VersionContiguity => "version contiguity",
            Self::ChecksumIntegrity => "checksum integrity",
            Self::ParseFailure => "parse failure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyIssue {
    pub check: SafetyCheckKind,
    pub message: String,
}

impl fmt::Display for SafetyIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.check, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SafetyReport {
    pub warnings: Vec<SafetyIssue>,
    pub blocking: Vec<SafetyIssue>,
}

impl SafetyReport {
    pub fn warn(&mut self, check: SafetyCheckKind, message: impl Into<String>) {
        self.warnings.push(SafetyIssue {
            check,
            message: message.into(),
        });
    }

    pub fn block(&mut self, check: SafetyCheckKind, message: impl Into<String>) {
        self.blocking.push(SafetyIssue {
            check,
            message: message.into(),
        });
    }

    pub fn is_clear(&self) -> bool {
        self.blocking.is_empty()
    }

    /// True when every blocking issue could be bypassed with an override.
    pub fn overridable(&self) -> bool {
        self.blocking.iter().all(|i| i.check.overridable())
    }

    /// Decide whether the operation may proceed.
    ///
    /// Non-overridable issues map to their own error class: contiguity to
    /// [`Error::Order`], a concurrent writer to [`Error::Locked`], anything
    /// else to [`Error::SafetyCheck`].
    pub fn verdict(&self, override_safety: bool) -> Result<()> {
        if self.blocking.is_empty() {
            return Ok(());
        }

        let structural: Vec<&SafetyIssue> = self
            .blocking
            .iter()
            .filter(|i| !i.check.overridable())
            .collect();

        if let Some(issue) = structural
            .iter()
            .find(|i| i.check == SafetyCheckKind::VersionContiguity)
        {
            return Err(Error::Order(issue.message.clone()));
        }
        if let Some(issue) = structural
            .iter()
            .find(|i| i.check == SafetyCheckKind::SingleWriter)
        {
            return Err(Error::Locked(issue.message.clone()));
        }
        if !structural.is_empty() {
            return Err(Error::SafetyCheck(
                structural.iter().map(|i| i.to_string()).collect(),
            ));
        }

        if override_safety {
            for issue in &self.blocking {
                warn!("safety check overridden by operator: {issue}");
            }
            return Ok(());
        }

        Err(Error::SafetyCheck(
            self.blocking.iter().map(|i| i.to_string()).collect(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyPolicy {
    pub backup_max_age: Duration,
    pub require_backup: bool,
    pub disk_headroom_factor: f64,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            backup_max_age: Duration::from_secs(24 * 60 * 60),
            require_backup: false,
            disk_headroom_factor: 2.0,
        }
    }
}

/// What the gate inspects besides the store itself.
pub struct GateInput<'a> {
    pub applied: &'a [LedgerEntry],
    pub pending: &'a [MigrationDescriptor],
    pub audit: &'a ChecksumAudit,
    pub failures: &'a [ScanFailure],
    /// Set when the caller already holds the run lock.
    pub lock_held: bool,
    /// Set when a fresh snapshot will be taken before anything is applied.
    pub snapshot_planned: bool,
}

pub struct SafetyGate<'a> {
    store: &'a Store,
    backup: Option<&'a dyn BackupProvider>,
    policy: &'a SafetyPolicy,
}

impl<'a> SafetyGate<'a> {
    pub fn new(
        store: &'a Store,
        backup: Option<&'a dyn BackupProvider>,
        policy: &'a SafetyPolicy,
    ) -> Self {
        Self {
            store,
            backup,
            policy,
        }
    }

    pub fn evaluate(&self, input: &GateInput<'_>) -> Result<SafetyReport> {
        let mut report = SafetyReport::default();

        self.check_backup(input.snapshot_planned, &mut report);
        self.check_disk(&mut report)?;
        self.check_writer(input.lock_held, &mut report)?;
        check_contiguity(input.applied, input.pending, &mut report);
        check_checksums(input.audit, input.applied, input.failures, &mut report);
        check_parse_failures(input.applied, input.failures, &mut report);

        debug!(
            warnings = report.warnings.len(),
            blocking = report.blocking.len(),
            "safety gate evaluated"
        );
        Ok(report)
    }

    fn check_backup(&self, snapshot_planned: bool, report: &mut SafetyReport) {
        let mut flag = |message: String| {
            if self.policy.require_backup {
                report.block(SafetyCheckKind::BackupFreshness, message);
            } else {
                report.warn(SafetyCheckKind::BackupFreshness, message);
            }
        };

        let Some(backup) = self.backup else {
            flag("no backup provider is configured".to_string());
            return;
        };
        if snapshot_planned {
            return;
        }
        match backup.has_recent_snapshot(self.policy.backup_max_age) {
            Ok(true) => {}
            Ok(false) => flag(format!(
                "no snapshot newer than {}h",
                self.policy.backup_max_age.as_secs() / 3600
            )),
            Err(e) => flag(format!("could not query snapshots: {e}")),
        }
    }

    fn check_disk(&self, report: &mut SafetyReport) -> Result<()> {
        let Some(path) = self.store.path() else {
            return Ok(());
        };
        let size = self.store.file_size()?;
        // Precision loss only matters for files far beyond any CRM store.
        let required = (size as f64 * self.policy.disk_headroom_factor).ceil() as u64;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        match available_space(dir) {
            Ok(Some(free)) if free < required => report.block(
                SafetyCheckKind::DiskHeadroom,
                format!(
                    "{} bytes free on {}, need {} ({}x the {}-byte store)",
                    free,
                    dir.display(),
                    required,
                    self.policy.disk_headroom_factor,
                    size
                ),
            ),
            Ok(Some(_)) => {}
            Ok(None) => report.warn(
                SafetyCheckKind::DiskHeadroom,
                "free disk space cannot be determined on this platform",
            ),
            Err(e) => report.warn(
                SafetyCheckKind::DiskHeadroom,
                format!("free disk space check failed: {e}"),
            ),
        }
        Ok(())
    }

    fn check_writer(&self, lock_held: bool, report: &mut SafetyReport) -> Result<()> {
        let file_lock_path = if lock_held { None } else { self.store.path() };
        if let Some(path) = file_lock_path {
            match RunLock::inspect(path)? {
                LockState::Free => {}
                LockState::Held(owner) => report.block(
                    SafetyCheckKind::SingleWriter,
                    format!("migration lock is held by {owner}"),
                ),
                LockState::Stale(pid) => report.warn(
                    SafetyCheckKind::SingleWriter,
                    format!("stale migration lock from pid {pid} will be reclaimed"),
                ),
            }
        }

        if !self.store.writer_lock_available()? {
            report.block(
                SafetyCheckKind::SingleWriter,
                "another connection holds a write transaction on the store",
            );
        }
        Ok(())
    }
}

fn check_contiguity(
    applied: &[LedgerEntry],
    pending: &[MigrationDescriptor],
    report: &mut SafetyReport,
) {
    let mut applied_versions: Vec<u32> = applied.iter().map(|e| e.version).collect();
    applied_versions.sort_unstable();
    for (idx, version) in applied_versions.iter().enumerate() {
        let expected = idx as u32 + 1;
        if *version != expected {
            report.block(
                SafetyCheckKind::VersionContiguity,
                format!(
                    "applied versions are not contiguous: expected {expected}, ledger has {version}"
                ),
            );
            return;
        }
    }

    let current = applied_versions.last().copied().unwrap_or(0);
    let mut expected = current + 1;
    let mut previous: Option<&MigrationDescriptor> = None;
    for migration in pending {
        if let Some(prev) = previous.filter(|p| p.version == migration.version) {
            report.block(
                SafetyCheckKind::VersionContiguity,
                format!(
                    "version {} is claimed by both {} and {}",
                    migration.version, prev.filename, migration.filename
                ),
            );
            return;
        }
        if migration.version != expected {
            report.block(
                SafetyCheckKind::VersionContiguity,
                format!(
                    "pending migration {} has version {}, expected {}",
                    migration.filename, migration.version, expected
                ),
            );
            return;
        }
        expected += 1;
        previous = Some(migration);
    }
}

fn check_checksums(
    audit: &ChecksumAudit,
    applied: &[LedgerEntry],
    failures: &[ScanFailure],
    report: &mut SafetyReport,
) {
    for mismatch in &audit.mismatches {
        report.block(
            SafetyCheckKind::ChecksumIntegrity,
            format!(
                "{} changed after it was applied (recorded {}, on disk {})",
                mismatch.filename, mismatch.recorded, mismatch.actual
            ),
        );
    }
    for filename in &audit.missing_files {
        report.warn(
            SafetyCheckKind::ChecksumIntegrity,
            format!("applied migration {filename} is missing from disk"),
        );
    }
    for failure in failures {
        let Some(entry) = applied.iter().find(|e| e.filename == failure.filename) else {
            continue;
        };
        if failure.checksum.as_deref() == Some(entry.checksum.as_str()) {
            report.warn(
                SafetyCheckKind::ParseFailure,
                format!("applied migration {} no longer parses", failure.filename),
            );
        } else {
            report.block(
                SafetyCheckKind::ChecksumIntegrity,
                format!(
                    "{} changed after it was applied and no longer parses",
                    failure.filename
                ),
            );
        }
    }
}

/// Failures claiming a version above `current`, i.e. files a run would
/// have to apply.
pub fn failures_in_pending_range(current: u32, failures: &[ScanFailure]) -> Vec<&ScanFailure> {
    failures
        .iter()
        .filter(|f| f.version.is_some_and(|v| v > current))
        .collect()
}

fn check_parse_failures(applied: &[LedgerEntry], failures: &[ScanFailure], report: &mut SafetyReport) {
    let current = applied.iter().map(|e| e.version).max().unwrap_or(0);
    let in_range = failures_in_pending_range(current, failures);

    for failure in failures {
        if applied.iter().any(|e| e.filename == failure.filename) {
            continue;
        }
        if in_range.iter().any(|f| f.filename == failure.filename) {
            report.block(SafetyCheckKind::ParseFailure, failure.error.to_string());
        } else {
            report.warn(SafetyCheckKind::ParseFailure, failure.error.to_string());
        }
    }
}

#[cfg(unix)]
fn available_space(dir: &Path) -> Result<Option<u64>> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| Error::InvalidInput(format!("path contains NUL byte: {e}")))?;
    // SAFETY: `statvfs` is a plain C struct for which all-zero bytes are valid.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `c_path` is NUL-terminated and `stat` is a valid out-pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    #[allow(clippy::unnecessary_cast)]
    let free = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
    Ok(Some(free))
}

#[cfg(not(unix))]
fn available_space(_dir: &Path) -> Result<Option<u64>> {
    Ok(None)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    /// Description of the live holder.
    Held(String),
    /// Left behind by a process that no longer exists.
    Stale(u32),
}

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

const LOCK_ATTEMPTS: usize = 3;

/// Advisory `<db>.migrate.lock` file; removed when dropped.
///
/// On unix, exclusion comes from an `flock` held on the open file for the
/// lifetime of the guard, so a crashed holder releases it automatically. The
/// JSON record inside only describes the holder.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    // Holds the OS lock; must outlive the unlink in `Drop`.
    file: File,
}

impl RunLock {
    pub fn lock_path(db_path: &Path) -> PathBuf {
        sidecar(db_path, ".migrate.lock")
    }

    pub fn inspect(db_path: &Path) -> Result<LockState> {
        let path = Self::lock_path(db_path);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockState::Free),
            Err(e) => return Err(e.into()),
        };

        let record = read_record(&mut file);
        if held_elsewhere(&file, record.as_ref(), false)? {
            return Ok(LockState::Held(describe_holder(record.as_ref(), &path)));
        }
        Ok(match record {
            Some(record) => LockState::Stale(record.pid),
            None => LockState::Free,
        })
    }

    pub fn acquire(db_path: &Path) -> Result<Self> {
        let path = Self::lock_path(db_path);

        for _ in 0..LOCK_ATTEMPTS {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            let previous = read_record(&mut file);
            if held_elsewhere(&file, previous.as_ref(), true)? {
                return Err(Error::Locked(describe_holder(previous.as_ref(), &path)));
            }
            // The previous holder may have unlinked the path between our open and lock.
            if !still_linked(&file, &path)? {
                continue;
            }

            if let Some(stale) = &previous {
                warn!(
                    "reclaiming stale migration lock from pid {} at {}",
                    stale.pid,
                    path.display()
                );
            }
            let record = LockRecord {
                pid: std::process::id(),
                acquired_at: Utc::now(),
            };
            file.set_len(0)?;
            file.rewind()?;
            file.write_all(serde_json::to_string(&record)?.as_bytes())?;

            debug!("acquired migration lock {}", path.display());
            return Ok(Self { path, file });
        }

        Err(Error::Locked(format!(
            "lock file {} keeps being replaced",
            path.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Never unlink a file that now belongs to a newer holder.
        if !matches!(still_linked(&self.file, &self.path), Ok(true)) {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("released migration lock {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove lock file {}: {e}", self.path.display()),
        }
    }
}

fn read_record(file: &mut File) -> Option<LockRecord> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    serde_json::from_str(&content).ok()
}

fn describe_holder(record: Option<&LockRecord>, path: &Path) -> String {
    match record {
        Some(record) => format!(
            "pid {} since {} ({})",
            record.pid,
            record.acquired_at.to_rfc3339(),
            path.display()
        ),
        None => format!("an unknown process ({})", path.display()),
    }
}

/// Try the OS lock without blocking; `true` means another open file holds it.
#[cfg(unix)]
fn held_elsewhere(file: &File, _record: Option<&LockRecord>, exclusive: bool) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    // SAFETY: the descriptor is owned by `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(false);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(true)
    } else {
        Err(err.into())
    }
}

/// Without `flock`, any readable record counts as a live holder.
#[cfg(not(unix))]
fn held_elsewhere(_file: &File, record: Option<&LockRecord>, _exclusive: bool) -> Result<bool> {
    Ok(record.is_some())
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, _path: &Path) -> Result<bool> {
    Ok(true)
}
