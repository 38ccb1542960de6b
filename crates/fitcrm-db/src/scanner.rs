use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use fitcrm_common::{Error, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::descriptor::{self, MIGRATION_EXTENSION, MigrationDescriptor};

/// A migration file that could not be parsed.
#[derive(Debug)]
pub struct ScanFailure {
    pub filename: String,
    /// Version prefix, when the filename itself was readable.
    pub version: Option<u32>,
    /// Checksum of the raw bytes, when the file could be read.
    pub checksum: Option<String>,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct ScanReport {
    /// Parsed migrations, ascending by version then filename.
    pub migrations: Vec<MigrationDescriptor>,
    pub failures: Vec<ScanFailure>,
}

impl ScanReport {
    /// Versions that more than one file claims.
    pub fn duplicate_versions(&self) -> Vec<u32> {
        let mut dups: Vec<u32> = self
            .migrations
            .windows(2)
            .filter(|w| w[0].version == w[1].version)
            .map(|w| w[0].version)
            .collect();
        dups.dedup();
        dups
    }

    /// Highest version claimed by any file, parsed or not.
    pub fn max_version(&self) -> u32 {
        self.migrations
            .iter()
            .map(|m| m.version)
            .chain(self.failures.iter().filter_map(|f| f.version))
            .max()
            .unwrap_or(0)
    }

    pub fn total_files(&self) -> usize {
        self.migrations.len() + self.failures.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaffoldedMigration {
    pub version: u32,
    pub path: PathBuf,
}

pub struct MigrationScanner {
    migrations_dir: PathBuf,
}

impl MigrationScanner {
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Parse every `*.sql` file in the migrations directory.
    ///
    /// Files that fail to parse are collected in [`ScanReport::failures`]
    /// and do not stop the scan.
    pub fn discover(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        if !self.migrations_dir.exists() {
            return Ok(report);
        }

        let entries = std::fs::read_dir(&self.migrations_dir)?;

        for entry in entries {
            let entry = entry?;
            let path = entry.path();

            if !path.is_file() {
                continue;
            }

            let ext = path.extension().and_then(|e| e.to_str());
            if ext != Some(MIGRATION_EXTENSION) {
                continue;
            }

            match descriptor::load_migration(&path) {
                Ok(migration) => {
                    debug!("discovered migration: {}", migration.filename);
                    report.migrations.push(migration);
                }
                Err(error) => {
                    let filename = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    warn!("skipping invalid migration at {}: {}", path.display(), error);
                    report.failures.push(ScanFailure {
                        version: descriptor::parse_filename(&filename).ok().map(|(v, _)| v),
                        checksum: std::fs::read(&path).ok().map(|b| descriptor::checksum(&b)),
                        filename,
                        error,
                    });
                }
            }
        }

        report
            .migrations
            .sort_by(|a, b| (a.version, &a.filename).cmp(&(b.version, &b.filename)));
        report.failures.sort_by(|a, b| a.filename.cmp(&b.filename));

        info!(
            "scanned {}: {} migration(s), {} invalid",
            self.migrations_dir.display(),
            report.migrations.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Write a new `NNN_slug.sql` skeleton with the given version.
    pub fn scaffold(&self, version: u32, description: &str) -> Result<ScaffoldedMigration> {
        let slug = slugify(description);
        if slug.is_empty() {
            return Err(Error::InvalidInput(
                "migration description must contain letters or digits".into(),
            ));
        }
        if version == 0 {
            return Err(Error::InvalidInput("migration version must be positive".into()));
        }

        std::fs::create_dir_all(&self.migrations_dir)?;
        let path = self
            .migrations_dir
            .join(format!("{version:03}_{slug}.{MIGRATION_EXTENSION}"));

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                Error::InvalidInput(format!("cannot create {}: {e}", path.display()))
            })?;
        file.write_all(template(description.trim()).as_bytes())?;

        info!("created migration {}", path.display());
        Ok(ScaffoldedMigration { version, path })
    }
}

fn template(description: &str) -> String {
    format!(
        "-- Description: {description}\n-- UP\n-- forward SQL goes here\n\n-- DOWN\n-- statements that undo the UP section (optional)\n"
    )
}

/// Lowercase, `_`-separated, ASCII alphanumerics only.
fn slugify(description: &str) -> String {
    description
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| part.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn nonexistent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = MigrationScanner::new(dir.path().join("missing"));
        let report = scanner.discover().unwrap();
        assert!(report.migrations.is_empty());
        assert!(report.failures.is_empty());
    }

    #[test]
    fn discovers_and_sorts_valid_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("010_late.sql"), "-- UP\nSELECT 10;").unwrap();
        fs::write(dir.path().join("002_b.sql"), "-- UP\nSELECT 2;").unwrap();
        fs::write(dir.path().join("001_a.sql"), "-- UP\nSELECT 1;").unwrap();

        let report = MigrationScanner::new(dir.path()).discover().unwrap();
        let versions: Vec<u32> = report.migrations.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(report.max_version(), 10);
    }

    #[test]
    fn collects_failures_and_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("001_a.sql"), "-- UP\nSELECT 1;").unwrap();
        fs::write(dir.path().join("002_broken.sql"), "SELECT 2;").unwrap();
        fs::write(dir.path().join("notes.sql"), "-- UP\nSELECT 3;").unwrap();
        fs::write(dir.path().join("README.md"), "not a migration").unwrap();
        fs::create_dir(dir.path().join("003_dir.sql")).unwrap();

        let report = MigrationScanner::new(dir.path()).discover().unwrap();
        assert_eq!(report.migrations.len(), 1);
        assert_eq!(report.failures.len(), 2);

        let broken = &report.failures[0];
        assert_eq!(broken.filename, "002_broken.sql");
        assert_eq!(broken.version, Some(2));
        assert!(matches!(broken.error, Error::Parse { .. }));
        assert_eq!(
            broken.checksum.as_deref(),
            Some(descriptor::checksum(b"SELECT 2;").as_str())
        );

        let unnumbered = &report.failures[1];
        assert_eq!(unnumbered.filename, "notes.sql");
        assert_eq!(unnumbered.version, None);

        assert_eq!(report.max_version(), 2);
        assert_eq!(report.total_files(), 3);
    }

    #[test]
    fn reports_duplicate_versions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("001_a.sql"), "-- UP\nSELECT 1;").unwrap();
        fs::write(dir.path().join("002_b.sql"), "-- UP\nSELECT 2;").unwrap();
        fs::write(dir.path().join("002_c.sql"), "-- UP\nSELECT 3;").unwrap();

        let report = MigrationScanner::new(dir.path()).discover().unwrap();
        assert_eq!(report.duplicate_versions(), vec![2]);
    }

    #[test]
    fn scaffold_writes_numbered_template() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = MigrationScanner::new(dir.path());

        let created = scanner.scaffold(4, "Add member notes!").unwrap();
        assert_eq!(created.path, dir.path().join("004_add_member_notes.sql"));

        let content = fs::read_to_string(&created.path).unwrap();
        assert!(content.starts_with("-- Description: Add member notes!\n-- UP\n"));
        assert!(content.contains("-- DOWN"));

        // The skeleton has no statements yet, so it must not be runnable.
        let report = scanner.discover().unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].version, Some(4));
    }

    #[test]
    fn scaffold_refuses_to_overwrite_or_accept_empty_slug() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = MigrationScanner::new(dir.path());
        scanner.scaffold(1, "init").unwrap();

        assert!(scanner.scaffold(1, "init").is_err());
        assert!(matches!(
            scanner.scaffold(2, "  !!  "),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("  Add  Member-Notes (v2) "), "add_member_notes_v2");
    }
}
