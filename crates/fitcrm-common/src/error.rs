use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed migration file. `line` is 1-based; 0 means the filename itself.
    #[error("parse error in {file} (line {line}): {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("version order violated: {0}")]
    Order(String),

    #[error("checksum mismatch for {filename}: recorded {recorded}, on disk {actual}")]
    ChecksumMismatch {
        filename: String,
        recorded: String,
        actual: String,
    },

    #[error("safety checks blocked the operation: {}", .0.join("; "))]
    SafetyCheck(Vec<String>),

    #[error("migration {filename} (v{version}) failed: {message}")]
    Execution {
        filename: String,
        version: u32,
        message: String,
    },

    #[error("no rollback script recorded for {0}")]
    NoRollbackScript(String),

    #[error("cannot roll back {filename}: later migrations still applied ({})", .blocked_by.join(", "))]
    Dependency {
        filename: String,
        blocked_by: Vec<String>,
    },

    #[error("integrity verification failed: {}", .0.join("; "))]
    Integrity(Vec<String>),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("backup error: {0}")]
    Backup(String),

    #[error("another migration session holds the lock: {0}")]
    Locked(String),

    #[error("operation cancelled by operator")]
    Cancelled,

    #[error("run deadline of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// What the operator can do next, if anything.
    pub fn recovery_hint(&self) -> Option<&'static str> {
        match self {
            Self::Parse { .. } => Some("fix the migration file and re-run `check`"),
            Self::Order(_) => {
                Some("renumber the pending migration files so they follow the current version")
            }
            Self::ChecksumMismatch { .. } => Some(
                "restore the applied file to its original content; put new changes in a new migration",
            ),
            Self::SafetyCheck(_) => {
                Some("resolve the listed issues or re-run with --force after reviewing them")
            }
            Self::Execution { .. } | Self::Timeout(_) | Self::Cancelled => Some(
                "earlier migrations stay applied; fix the failing script and re-run, or use `rollback --emergency` to restore the latest snapshot",
            ),
            Self::NoRollbackScript(_) => {
                Some("use `rollback --emergency` to restore the latest snapshot")
            }
            Self::Dependency { .. } => Some(
                "re-run with --cascade to revert the later migrations first, or use `rollback --emergency`",
            ),
            Self::Integrity(_) => Some("inspect the reported rows; `repair` never modifies schema"),
            Self::Locked(_) => {
                Some("wait for the other session to finish or remove the stale lock file")
            }
            _ => None,
        }
    }

    /// Errors that mean storage was never touched by the failing operation.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::Order(_)
                | Self::ChecksumMismatch { .. }
                | Self::SafetyCheck(_)
                | Self::Locked(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn dependency_message_lists_blockers() {
        let err = Error::Dependency {
            filename: "001_init.sql".into(),
            blocked_by: vec!["002_add_column.sql".into(), "003_index.sql".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("001_init.sql"));
        assert!(msg.contains("002_add_column.sql, 003_index.sql"));
    }

    #[test]
    fn preflight_classes_are_flagged() {
        assert!(Error::Order("gap".into()).is_preflight());
        assert!(
            !Error::Execution {
                filename: "002_x.sql".into(),
                version: 2,
                message: "syntax error".into(),
            }
            .is_preflight()
        );
    }

    #[test]
    fn execution_errors_offer_emergency_restore() {
        let hint = Error::Cancelled.recovery_hint().unwrap();
        assert!(hint.contains("--emergency"));
    }
}
