//! Terminal output for the migrate commands.

use chrono::{DateTime, Local, Utc};
use colored::Colorize;
use fitcrm_common::Error;
use fitcrm_db::{
    CheckReport, LedgerEntry, MigrationState, PendingMigration, RestoreReport, RollbackPlan,
    RollbackReport, RunSummary, ScaffoldedMigration, SnapshotInfo, StatusReport,
    VerificationReport,
};

fn local_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn pending_line(p: &PendingMigration) -> String {
    let mut line = format!("{:>4}  {}", p.version, p.filename);
    if let Some(desc) = &p.description {
        line.push_str(&format!(" - {desc}"));
    }
    if !p.reversible {
        line.push_str(&format!(" {}", "(no rollback)".yellow()));
    }
    line
}

/// One applied migration, as shown in history listings and selection prompts.
pub(crate) fn entry_line(entry: &LedgerEntry) -> String {
    let mut line = format!(
        "{:>4}  {}  applied {} ({} ms)",
        entry.version,
        entry.filename,
        local_time(&entry.executed_at),
        entry.execution_time_ms
    );
    if entry.rollback_sql.is_none() {
        line.push_str(" [irreversible]");
    }
    line
}

pub(crate) fn error(err: &Error) {
    eprintln!("{} {err}", "error:".red().bold());
    hint(err);
}

pub(crate) fn hint(err: &Error) {
    if let Some(hint) = err.recovery_hint() {
        eprintln!("{} {hint}", "hint:".yellow().bold());
    }
}

/// Prints the whole context chain, then the recovery hint of the first
/// domain error found in it.
pub(crate) fn fatal(err: &anyhow::Error) {
    eprintln!("{} {err}", "error:".red().bold());
    for cause in err.chain().skip(1) {
        eprintln!("  caused by: {cause}");
    }
    if let Some(domain) = err.chain().find_map(|e| e.downcast_ref::<Error>()) {
        if let Error::SafetyCheck(issues) = domain {
            blocking_issues(issues);
        }
        if let Error::Integrity(issues) = domain {
            for issue in issues {
                eprintln!("  - {issue}");
            }
        }
        if let Some(hint) = domain.recovery_hint() {
            eprintln!("{} {hint}", "hint:".yellow().bold());
        }
    }
}

pub(crate) fn blocking_issues(issues: &[String]) {
    eprintln!("{}", "Blocking safety issues:".red().bold());
    for issue in issues {
        eprintln!("  - {issue}");
    }
}

pub(crate) fn check(report: &CheckReport) {
    println!("{}", "Migration check".bold());
    println!("  current version: {}", report.current_version);
    println!("  applied:         {}", report.applied_count);
    println!("  pending:         {}", report.pending.len());
    for p in &report.pending {
        println!("    {}", pending_line(p));
    }

    if !report.parse_failures.is_empty() {
        println!("{}", "Unparseable files:".red());
        for failure in &report.parse_failures {
            println!("  - {failure}");
        }
    }
    for mismatch in &report.audit.mismatches {
        println!(
            "{} {} was edited after it was applied",
            "checksum:".red(),
            mismatch.filename
        );
    }
    for missing in &report.audit.missing_files {
        println!("{} {missing} is applied but its file is gone", "warning:".yellow());
    }

    for issue in &report.safety.blocking {
        println!("{} {issue}", "blocked:".red().bold());
    }
    for issue in &report.safety.warnings {
        println!("{} {issue}", "warning:".yellow());
    }

    verification(&report.verification);
    if report.healthy() {
        println!("{}", "Ready.".green().bold());
    } else {
        println!("{}", "Not ready; resolve the issues above.".red().bold());
    }
}

pub(crate) fn run_summary(summary: &RunSummary) {
    for warning in &summary.warnings {
        println!("{} {warning}", "warning:".yellow());
    }
    if let Some(id) = &summary.snapshot {
        println!("Snapshot taken: {id}");
    }

    let report = &summary.report;
    if report.outcomes.is_empty() {
        println!("{}", "Already up to date.".green());
        return;
    }

    println!("{} {}", "Run".bold(), report.run_id);
    for outcome in &report.outcomes {
        let state = match outcome.state {
            MigrationState::Applied => outcome.state.as_str().green(),
            MigrationState::Failed => outcome.state.as_str().red().bold(),
            _ => outcome.state.as_str().yellow(),
        };
        print!("  {:>4}  {:<40} {state}", outcome.version, outcome.filename);
        if outcome.state == MigrationState::Applied {
            print!(" ({} ms)", outcome.duration_ms);
        }
        println!();
        if let Some(err) = &outcome.error {
            println!("        {}", err.red());
        }
    }

    if let Some(verification_report) = &summary.verification {
        verification(verification_report);
    }

    if summary.succeeded() {
        println!(
            "{} applied {} migration(s); now at version {}",
            "Done:".green().bold(),
            report.applied_count(),
            summary.status.current_version
        );
    } else {
        if let Some(err) = &report.error {
            eprintln!("{} {err}", "error:".red().bold());
        }
        println!(
            "Applied {} migration(s) before stopping; store is at version {}",
            report.applied_count(),
            summary.status.current_version
        );
    }
}

pub(crate) fn rollback_plan(plan: &RollbackPlan) {
    println!("{} {}", "Rollback of".bold(), plan.target);
    println!("The following migrations will be reverted, newest first:");
    for step in &plan.steps {
        println!("  {}", entry_line(step));
    }
}

pub(crate) fn rollback_report(report: &RollbackReport) {
    for reverted in &report.reverted {
        println!(
            "  {:>4}  {:<40} {} ({} ms)",
            reverted.version,
            reverted.filename,
            "reverted".green(),
            reverted.duration_ms
        );
    }
    if let Some(failed) = &report.failed_at {
        println!("  {failed} {}", "failed".red().bold());
    }
    if let Some(err) = &report.error {
        eprintln!("{} {err}", "error:".red().bold());
    }
    println!("Store is at version {}", report.current_version);
}

pub(crate) fn restore_report(report: &RestoreReport) {
    if let Some(id) = &report.safety_snapshot {
        println!("Pre-restore snapshot: {id}");
    }
    println!(
        "{} restored snapshot {}; store is at version {}",
        "Done:".green().bold(),
        report.restored,
        report.current_version
    );
}

pub(crate) fn status(report: &StatusReport) {
    println!("{} {}", "Current version:".bold(), report.current_version);

    println!("{}", "Applied:".bold());
    if report.applied.is_empty() {
        println!("  (none)");
    }
    for entry in &report.applied {
        let line = entry_line(entry);
        if report.checksum_mismatches.contains(&entry.filename) {
            println!("  {line} {}", "[modified]".red());
        } else if report.missing_files.contains(&entry.filename) {
            println!("  {line} {}", "[file missing]".yellow());
        } else {
            println!("  {line}");
        }
    }

    println!("{}", "Pending:".bold());
    if report.pending.is_empty() {
        println!("  (none)");
    }
    for p in &report.pending {
        println!("  {}", pending_line(p));
    }

    if !report.parse_failures.is_empty() {
        println!("{}", "Unparseable:".red().bold());
        for failure in &report.parse_failures {
            println!("  - {failure}");
        }
    }
}

pub(crate) fn verification(report: &VerificationReport) {
    if report.passed {
        println!("{} integrity checks passed", "ok:".green());
        return;
    }
    println!("{}", "Integrity problems:".red().bold());
    for issue in &report.issues {
        println!("  - {issue}");
    }
}

pub(crate) fn created(created: &ScaffoldedMigration) {
    println!(
        "{} version {} at {}",
        "Created".green().bold(),
        created.version,
        created.path.display()
    );
}

pub(crate) fn snapshots(list: &[SnapshotInfo]) {
    if list.is_empty() {
        println!("No snapshots.");
        return;
    }
    println!("{}", "Snapshots (oldest first):".bold());
    for info in list {
        println!(
            "  {}  {}  {}",
            info.id,
            local_time(&info.created_at),
            human_size(info.size_bytes)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(rollback_sql: Option<&str>) -> LedgerEntry {
        LedgerEntry {
            id: 1,
            filename: "003_member_notes.sql".into(),
            version: 3,
            description: Some("member notes".into()),
            executed_at: Utc::now(),
            execution_time_ms: 12,
            checksum: "abc".into(),
            rollback_sql: rollback_sql.map(str::to_string),
        }
    }

    #[test]
    fn entry_line_marks_irreversible() {
        assert!(entry_line(&entry(None)).ends_with("[irreversible]"));
        let line = entry_line(&entry(Some("DROP TABLE notes;")));
        assert!(line.contains("003_member_notes.sql"));
        assert!(line.contains("(12 ms)"));
        assert!(!line.contains("irreversible"));
    }

    #[test]
    fn human_size_units() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MiB");
    }
}
