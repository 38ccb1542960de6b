use std::path::{Path, PathBuf};

use fitcrm_common::{Error, Result};
use tracing::info;

use crate::model::AppConfig;

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Result<Self> {
        let config_dir = Self::default_config_dir();
        Ok(Self { config_dir })
    }

    pub fn default_config_dir() -> PathBuf {
        let home_config = dirs::home_dir().map(|h| h.join(".fitcrm"));
        let xdg_config = dirs::config_dir().map(|c| c.join("fitcrm"));

        match (xdg_config, home_config) {
            (Some(xdg), Some(home)) => {
                // If XDG exists, prefer it.
                if xdg.exists() {
                    xdg
                }
                // Older desktop builds kept everything under ~/.fitcrm.
                else if home.exists() {
                    home
                }
                // Fresh installs go to XDG.
                else {
                    xdg
                }
            }
            (Some(xdg), None) => xdg,
            (None, Some(home)) => home,
            (None, None) => PathBuf::from(".fitcrm"),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Returns true if a config file (YAML or TOML) exists on disk.
    pub fn config_file_exists(&self) -> bool {
        self.config_dir.join("config.yml").exists() || self.config_dir.join("config.toml").exists()
    }

    pub fn load(&self) -> Result<AppConfig> {
        let yaml_path = self.config_dir.join("config.yml");
        let toml_path = self.config_dir.join("config.toml");

        let config: AppConfig = if yaml_path.exists() {
            info!("loading config from {}", yaml_path.display());
            let contents = std::fs::read_to_string(&yaml_path)?;
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}")))?
        } else if toml_path.exists() {
            info!("loading config from {}", toml_path.display());
            let contents = std::fs::read_to_string(&toml_path)?;
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))?
        } else {
            info!("no config file found, using defaults");
            AppConfig::default()
        };

        validate(&config)?;
        Ok(config)
    }

    pub fn ensure_dirs(&self, config: &AppConfig) -> Result<()> {
        let paths = config.resolve_paths(&self.config_dir);
        let mut dirs = vec![
            self.config_dir.clone(),
            paths.migrations_dir,
            paths.backup_dir,
        ];
        for file in [&paths.database, &paths.status_file, &paths.run_log] {
            if let Some(parent) = file.parent() {
                dirs.push(parent.to_path_buf());
            }
        }

        for dir in &dirs {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        Ok(())
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    let headroom = config.safety.disk_headroom_factor;
    if headroom.is_nan() || headroom < 1.0 {
        return Err(Error::Config(format!(
            "safety.disk_headroom_factor must be at least 1.0, got {}",
            config.safety.disk_headroom_factor
        )));
    }
    if config.safety.backup_max_age_hours == 0 {
        return Err(Error::Config(
            "safety.backup_max_age_hours must be greater than zero".into(),
        ));
    }
    if config.migrations.run_timeout_secs == Some(0) {
        return Err(Error::Config(
            "migrations.run_timeout_secs must be greater than zero when set".into(),
        ));
    }
    for check in &config.integrity.sanity_checks {
        if check.name.trim().is_empty() || check.query.trim().is_empty() {
            return Err(Error::Config(
                "integrity.sanity_checks entries need a name and a query".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ConfigLoader;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "fitcrm-config-test-{}-{}-{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn load_returns_default_when_no_config_exists() {
        let dir = temp_dir("default");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.safety.backup_max_age_hours, 24);
        assert!(!config.safety.require_backup);
        assert_eq!(config.safety.disk_headroom_factor, 2.0);
        assert!(config.integrity.sanity_checks.is_empty());

        let paths = config.resolve_paths(&dir);
        assert_eq!(paths.database, dir.join("data").join("fitcrm.db"));
        assert_eq!(paths.migrations_dir, dir.join("migrations"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_prefers_yaml_over_toml_when_both_exist() {
        let dir = temp_dir("yaml-precedence");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.yml"),
            "safety:\n  require_backup: true\n  backup_max_age_hours: 6\n",
        )
        .expect("failed to write yaml config");
        fs::write(
            dir.join("config.toml"),
            "[safety]\nrequire_backup = false\nbackup_max_age_hours = 48\n",
        )
        .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert!(config.safety.require_backup);
        assert_eq!(config.safety.backup_max_age_hours, 6);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_reads_toml_when_yaml_missing() {
        let dir = temp_dir("toml");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.toml"),
            "[database]\npath = \"/srv/gym/crm.db\"\n\n[migrations]\nrun_timeout_secs = 90\n",
        )
        .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.migrations.run_timeout_secs, Some(90));
        assert_eq!(
            config.resolve_paths(&dir).database,
            PathBuf::from("/srv/gym/crm.db")
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_parses_sanity_checks() {
        let dir = temp_dir("sanity");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.yml"),
            "integrity:\n  sanity_checks:\n    - name: members without name\n      query: SELECT COUNT(*) FROM members WHERE name = ''\n    - name: at least one plan\n      query: SELECT COUNT(*) FROM plans\n      expect_zero: false\n",
        )
        .expect("failed to write yaml config");

        let config = ConfigLoader::with_dir(&dir).load().expect("load should succeed");
        assert_eq!(config.integrity.sanity_checks.len(), 2);
        assert!(config.integrity.sanity_checks[0].expect_zero);
        assert!(!config.integrity.sanity_checks[1].expect_zero);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_rejects_headroom_below_one() {
        let dir = temp_dir("bad-headroom");
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        fs::write(dir.join("config.yml"), "safety:\n  disk_headroom_factor: 0.5\n")
            .expect("failed to write yaml config");

        let err = ConfigLoader::with_dir(&dir).load().unwrap_err();
        assert!(err.to_string().contains("disk_headroom_factor"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = temp_dir("relative");
        let mut config = crate::model::AppConfig::default();
        config.migrations.dir = Some(PathBuf::from("sql"));

        let paths = config.resolve_paths(&dir);
        assert_eq!(paths.migrations_dir, dir.join("sql"));
        assert_eq!(paths.run_log, dir.join("logs").join("migrations.log"));
    }

    #[test]
    fn ensure_dirs_creates_expected_subdirectories() {
        let dir = temp_dir("ensure-dirs");
        let loader = ConfigLoader::with_dir(&dir);
        let config = crate::model::AppConfig::default();

        loader.ensure_dirs(&config).expect("ensure_dirs should succeed");

        assert!(dir.exists());
        assert!(dir.join("data").exists());
        assert!(dir.join("migrations").exists());
        assert!(dir.join("backups").exists());
        assert!(dir.join("logs").exists());

        let _ = fs::remove_dir_all(dir);
    }
}
