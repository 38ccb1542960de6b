use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use dialoguer::{Confirm, Select};
use fitcrm_common::{Error, SnapshotId};
use fitcrm_config::{AppConfig, ResolvedPaths};
use fitcrm_db::{
    CancelToken, EngineSettings, Migrator, RollbackOptions, RunOptions, SafetyPolicy,
    SnapshotStore, Store, plan_rollback,
};
use tracing::debug;

use crate::Commands;
use crate::render;

/// Loaded configuration with every path resolved.
pub(crate) struct Context {
    config_dir: PathBuf,
    config: AppConfig,
    paths: ResolvedPaths,
}

impl Context {
    pub(crate) fn new(config_dir: &Path, config: AppConfig) -> Self {
        let paths = config.resolve_paths(config_dir);
        Self {
            config_dir: config_dir.to_path_buf(),
            config,
            paths,
        }
    }

    fn settings(&self) -> EngineSettings {
        let safety = &self.config.safety;
        EngineSettings {
            migrations_dir: self.paths.migrations_dir.clone(),
            status_file: Some(self.paths.status_file.clone()),
            run_log: Some(self.paths.run_log.clone()),
            safety: SafetyPolicy {
                backup_max_age: Duration::from_secs(safety.backup_max_age_hours * 3600),
                require_backup: safety.require_backup,
                disk_headroom_factor: safety.disk_headroom_factor,
            },
            snapshot_before_run: safety.snapshot_before_run,
            run_timeout: self.config.migrations.run_timeout_secs.map(Duration::from_secs),
            sanity_checks: self.config.integrity.sanity_checks.clone(),
        }
    }

    fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(
            self.paths.database.clone(),
            self.paths.backup_dir.clone(),
            self.config.backup.retention,
        )
    }

    fn open_store(&self) -> Result<Store> {
        Store::open(&self.paths.database)
            .with_context(|| format!("failed to open store {}", self.paths.database.display()))
    }
}

/// Returns whether the command succeeded; drives the process exit code.
pub(crate) fn execute(command: Commands, ctx: &Context, cancel: &CancelToken) -> Result<bool> {
    debug!("config dir: {}", ctx.config_dir.display());
    let store = ctx.open_store()?;
    let settings = ctx.settings();
    let backup = ctx.snapshot_store();
    let migrator = Migrator::new(&store, &settings)
        .with_backup(&backup)
        .with_cancel(cancel.clone());

    match command {
        Commands::Check => check(&migrator),
        Commands::Run {
            force,
            yes,
            no_snapshot,
        } => run(&migrator, force, yes, no_snapshot),
        Commands::Rollback {
            filename,
            cascade,
            emergency,
            snapshot,
            force,
            yes,
        } => {
            if emergency {
                let id = snapshot.map(SnapshotId::from_str);
                emergency_restore(&migrator, id.as_ref(), yes)
            } else {
                rollback(&migrator, filename, cascade, force, yes)
            }
        }
        Commands::Status { json } => status(&migrator, json),
        Commands::Create { description } => {
            let created = migrator.create(&description.join(" "))?;
            render::created(&created);
            Ok(true)
        }
        Commands::Repair => {
            let report = migrator.repair()?;
            render::verification(&report);
            Ok(report.passed)
        }
        Commands::Snapshots => {
            render::snapshots(&migrator.snapshots()?);
            Ok(true)
        }
    }
}

/// `--yes` short-circuits; a prompt that cannot be shown counts as "no".
fn confirm(prompt: &str, yes: bool) -> bool {
    if yes {
        return true;
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}

/// `--force` only waves through environmental issues; anything structural
/// fails before the operator is asked.
fn forceable(migrator: &Migrator<'_>) -> Result<bool> {
    Ok(migrator.check()?.safety.overridable())
}

fn check(migrator: &Migrator<'_>) -> Result<bool> {
    let report = migrator.check()?;
    render::check(&report);
    Ok(report.healthy())
}

fn run(migrator: &Migrator<'_>, force: bool, yes: bool, no_snapshot: bool) -> Result<bool> {
    let mut options = RunOptions {
        override_safety: false,
        skip_snapshot: no_snapshot,
    };

    let summary = match migrator.run(options) {
        Err(Error::SafetyCheck(issues)) if force => {
            render::blocking_issues(&issues);
            if !forceable(migrator)? {
                return Err(Error::SafetyCheck(issues).into());
            }
            if !confirm("Override these safety checks and apply migrations?", yes) {
                println!("Aborted. Nothing was applied.");
                return Ok(false);
            }
            options.override_safety = true;
            migrator.run(options)?
        }
        other => other?,
    };

    render::run_summary(&summary);
    if summary.succeeded() {
        return Ok(true);
    }

    if let Some(err) = &summary.report.error {
        render::hint(err);
        if matches!(err, Error::Execution { .. } | Error::Timeout(_)) {
            offer_restore(migrator, summary.snapshot.as_ref());
        }
    }
    Ok(false)
}

fn rollback(
    migrator: &Migrator<'_>,
    filename: Option<String>,
    cascade: bool,
    force: bool,
    yes: bool,
) -> Result<bool> {
    let applied = migrator.status()?.applied;
    let filename = match filename {
        Some(f) => f,
        None => {
            if applied.is_empty() {
                println!("Nothing to roll back.");
                return Ok(true);
            }
            let items: Vec<String> = applied.iter().rev().map(render::entry_line).collect();
            let idx = Select::new()
                .with_prompt("Migration to roll back")
                .items(&items)
                .default(0)
                .interact()
                .context("selection cancelled")?;
            applied[applied.len() - 1 - idx].filename.clone()
        }
    };

    let plan = match plan_rollback(&applied, &filename, cascade) {
        Ok(plan) => plan,
        Err(err @ (Error::Dependency { .. } | Error::NoRollbackScript(_))) => {
            render::error(&err);
            offer_restore(migrator, None);
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };

    render::rollback_plan(&plan);
    if !confirm("Revert these migrations?", yes) {
        println!("Aborted. Nothing was reverted.");
        return Ok(false);
    }

    let mut options = RollbackOptions {
        cascade,
        override_safety: false,
    };
    let report = match migrator.rollback(&filename, options) {
        Err(Error::SafetyCheck(issues)) if force => {
            render::blocking_issues(&issues);
            if !forceable(migrator)? {
                return Err(Error::SafetyCheck(issues).into());
            }
            if !confirm("Override these safety checks and roll back?", yes) {
                println!("Aborted. Nothing was reverted.");
                return Ok(false);
            }
            options.override_safety = true;
            migrator.rollback(&filename, options)?
        }
        other => other?,
    };

    render::rollback_report(&report);
    if let Some(err) = &report.error {
        render::hint(err);
    }
    Ok(report.succeeded())
}

fn emergency_restore(migrator: &Migrator<'_>, id: Option<&SnapshotId>, yes: bool) -> Result<bool> {
    let target = match id {
        Some(id) => id.clone(),
        None => match migrator.snapshots()?.pop() {
            Some(latest) => latest.id,
            None => anyhow::bail!("no snapshots available to restore"),
        },
    };

    let prompt = format!(
        "Replace the store with snapshot {target}? The current state is snapshotted first."
    );
    if !confirm(&prompt, yes) {
        println!("Aborted. The store was not changed.");
        return Ok(false);
    }

    let report = migrator.emergency_restore(Some(&target))?;
    render::restore_report(&report);
    Ok(true)
}

/// Emergency restore is only ever started by an explicit operator answer.
fn offer_restore(migrator: &Migrator<'_>, snapshot: Option<&SnapshotId>) {
    let prompt = match snapshot {
        Some(id) => format!("Restore the pre-run snapshot {id} now?"),
        None => "Restore the newest snapshot now?".to_string(),
    };
    let accepted = Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false);
    if !accepted {
        return;
    }
    match migrator.emergency_restore(snapshot) {
        Ok(report) => render::restore_report(&report),
        Err(err) => render::error(&err),
    }
}

fn status(migrator: &Migrator<'_>, json: bool) -> Result<bool> {
    let report = migrator.status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render::status(&report);
    }
    Ok(true)
}
