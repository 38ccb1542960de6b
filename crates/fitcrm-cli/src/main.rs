use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fitcrm_config::ConfigLoader;
use fitcrm_db::CancelToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod render;

#[derive(Parser)]
#[command(
    name = "fitcrm-migrate",
    version,
    about = "fitcrm - versioned schema migrations for the CRM store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory (default: ~/.config/fitcrm)
    #[arg(long, global = true, env = "FITCRM_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Show current version, pending migrations and store health
    Check,

    /// Apply all pending migrations
    Run {
        /// Allow overriding blocking backup and disk-space checks
        #[arg(long)]
        force: bool,

        /// Answer yes to confirmation prompts
        #[arg(long, short)]
        yes: bool,

        /// Do not take a snapshot before applying
        #[arg(long)]
        no_snapshot: bool,
    },

    /// Revert applied migrations, or restore a snapshot
    Rollback {
        /// Migration to revert (prompted for when omitted)
        filename: Option<String>,

        /// Also revert every migration applied after FILENAME
        #[arg(long)]
        cascade: bool,

        /// Replace the whole store with a snapshot instead
        #[arg(long, conflicts_with_all = ["filename", "cascade"])]
        emergency: bool,

        /// Snapshot to restore (default: the newest)
        #[arg(long, value_name = "ID", requires = "emergency")]
        snapshot: Option<String>,

        /// Allow overriding blocking backup and disk-space checks
        #[arg(long)]
        force: bool,

        /// Answer yes to confirmation prompts
        #[arg(long, short)]
        yes: bool,
    },

    /// Show the full migration history
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Create the next-numbered migration file
    Create {
        /// What the migration does, e.g. "add member notes"
        #[arg(required = true, num_args = 1..)]
        description: Vec<String>,
    },

    /// Run integrity checks and report problems (read-only)
    Repair,

    /// List available snapshots
    Snapshots,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            render::fatal(&err);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let loader = match &cli.config_dir {
        Some(dir) => ConfigLoader::with_dir(dir),
        None => ConfigLoader::new()?,
    };
    let config = loader
        .load()
        .with_context(|| format!("failed to load config from {}", loader.config_dir().display()))?;

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)))
        .init();

    if !loader.config_file_exists() {
        info!(
            "no config file in {}; using defaults",
            loader.config_dir().display()
        );
    }
    loader.ensure_dirs(&config)?;
    let ctx = commands::Context::new(loader.config_dir(), config);

    let cancel = CancelToken::new();
    watch_interrupts(cancel.clone());

    let command = cli.command;
    let succeeded = tokio::task::spawn_blocking(move || commands::execute(command, &ctx, &cancel))
        .await
        .context("migration task panicked")??;
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// First Ctrl-C cancels the in-flight transaction; a second one exits.
fn watch_interrupts(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received; rolling back the in-flight migration");
        cancel.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn create_joins_words() {
        let cli = Cli::try_parse_from(["fitcrm-migrate", "create", "add", "member", "notes"]).unwrap();
        match cli.command {
            Commands::Create { description } => assert_eq!(description.join(" "), "add member notes"),
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn snapshot_requires_emergency() {
        assert!(Cli::try_parse_from(["fitcrm-migrate", "rollback", "--snapshot", "x"]).is_err());
        assert!(
            Cli::try_parse_from(["fitcrm-migrate", "rollback", "--emergency", "--snapshot", "x"])
                .is_ok()
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "fitcrm-migrate",
            "status",
            "--json",
            "--config-dir",
            "/tmp/fitcrm",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/fitcrm")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }
}
