use fitcrm_common::SanityCheck;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub migrations: MigrationsConfig,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub integrity: IntegrityConfig,

    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding the CRM data. Defaults to `<config_dir>/data/fitcrm.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Directory scanned for `NNN_description.sql` files. Defaults to `<config_dir>/migrations`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// JSON status summary rewritten after every run. Defaults to `<config_dir>/migration-status.json`.
    #[serde(default)]
    pub status_file: Option<PathBuf>,

    /// Append-only JSON-lines run log. Defaults to `<config_dir>/logs/migrations.log`.
    #[serde(default)]
    pub run_log: Option<PathBuf>,

    /// Whole-run deadline; the in-flight transaction is interrupted when it passes.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// A snapshot younger than this counts as recent.
    #[serde(default = "default_backup_max_age_hours")]
    pub backup_max_age_hours: u64,

    /// Turns the backup freshness warning into a blocking issue.
    #[serde(default)]
    pub require_backup: bool,

    /// Free space must be at least this multiple of the storage file size.
    #[serde(default = "default_disk_headroom_factor")]
    pub disk_headroom_factor: f64,

    /// Take a snapshot before applying pending migrations.
    #[serde(default = "default_true")]
    pub snapshot_before_run: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            backup_max_age_hours: default_backup_max_age_hours(),
            require_backup: false,
            disk_headroom_factor: default_disk_headroom_factor(),
            snapshot_before_run: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Snapshot directory. Defaults to `<config_dir>/backups`.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Number of snapshots kept; older ones are pruned after each new snapshot.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: None,
            retention: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityConfig {
    #[serde(default)]
    pub sanity_checks: Vec<SanityCheck>,
}

fn default_backup_max_age_hours() -> u64 {
    24
}

fn default_disk_headroom_factor() -> f64 {
    2.0
}

fn default_retention() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Concrete filesystem locations after applying defaults against the config dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub database: PathBuf,
    pub migrations_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub status_file: PathBuf,
    pub run_log: PathBuf,
}

impl AppConfig {
    /// Resolve every optional path. Relative paths are taken relative to `config_dir`.
    pub fn resolve_paths(&self, config_dir: &Path) -> ResolvedPaths {
        let resolve = |configured: &Option<PathBuf>, fallback: PathBuf| match configured {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => config_dir.join(p),
            None => fallback,
        };

        ResolvedPaths {
            database: resolve(&self.database.path, config_dir.join("data").join("fitcrm.db")),
            migrations_dir: resolve(&self.migrations.dir, config_dir.join("migrations")),
            backup_dir: resolve(&self.backup.dir, config_dir.join("backups")),
            status_file: resolve(
                &self.migrations.status_file,
                config_dir.join("migration-status.json"),
            ),
            run_log: resolve(
                &self.migrations.run_log,
                config_dir.join("logs").join("migrations.log"),
            ),
        }
    }
}
