//! Scoped transactions for migration work.
//!
//! [`with_transaction`] is the only way engine code opens a write
//! transaction. The body receives a borrowed [`Transaction`]; returning `Err`
//! or unwinding drops it, and rusqlite rolls back on drop. Statements inside
//! the scope are interrupted when the operator cancels or the run deadline
//! passes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use fitcrm_common::{Error, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::warn;

/// SQLite VM instructions between progress-handler callbacks.
const PROGRESS_INTERVAL: i32 = 1_000;

/// Cooperative cancellation flag shared with the CLI's signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancellation and deadline applied to every statement of one run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLimits {
    cancel: CancelToken,
    deadline: Option<(Instant, Duration)>,
}

impl ExecutionLimits {
    /// Starts the run clock now.
    pub fn new(cancel: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: timeout.map(|t| (Instant::now() + t, t)),
        }
    }

    fn interruption(&self) -> Option<Error> {
        if self.cancel.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => Some(Error::Timeout(limit)),
            _ => None,
        }
    }

    /// Fails fast when the run has already been cancelled or timed out.
    pub fn check(&self) -> Result<()> {
        match self.interruption() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Installs a progress handler for as long as it lives.
struct InterruptGuard<'c> {
    conn: &'c Connection,
}

impl<'c> InterruptGuard<'c> {
    fn install(conn: &'c Connection, limits: &ExecutionLimits) -> Self {
        let cancel = limits.cancel.clone();
        let deadline = limits.deadline.map(|(at, _)| at);
        conn.progress_handler(
            PROGRESS_INTERVAL,
            Some(move || {
                cancel.is_cancelled() || deadline.is_some_and(|at| Instant::now() >= at)
            }),
        );
        Self { conn }
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }
}

/// Run `body` inside one `BEGIN IMMEDIATE` … `COMMIT`.
///
/// Any error from `body`, from the commit, or an interruption leaves the
/// database exactly as it was before the call. Interruptions surface as
/// [`Error::Cancelled`] or [`Error::Timeout`] regardless of how SQLite
/// reported them.
pub fn with_transaction<T, F>(conn: &Connection, limits: &ExecutionLimits, body: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    limits.check()?;
    let _guard = InterruptGuard::install(conn, limits);

    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_err(|e| Error::Storage(format!("BEGIN failed: {e}")))?;

    let value = match body(&tx) {
        Ok(value) => value,
        Err(err) => {
            drop(tx);
            return Err(limits.interruption().unwrap_or(err));
        }
    };

    if let Some(err) = limits.interruption() {
        drop(tx);
        return Err(err);
    }

    tx.commit().map_err(|e| {
        warn!("commit failed, transaction rolled back: {e}");
        Error::Storage(format!("COMMIT failed: {e}"))
    })?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn commits_on_success() {
        let conn = conn();
        let limits = ExecutionLimits::default();
        with_transaction(&conn, &limits, |tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])
                .map_err(|e| Error::Storage(e.to_string()))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(count(&conn), 1);
    }

    #[test]
    fn rolls_back_when_body_fails() {
        let conn = conn();
        let limits = ExecutionLimits::default();
        let result: Result<()> = with_transaction(&conn, &limits, |tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])
                .map_err(|e| Error::Storage(e.to_string()))?;
            Err(Error::Storage("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(count(&conn), 0);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn cancelled_token_refuses_to_begin() {
        let conn = conn();
        let token = CancelToken::new();
        token.cancel();
        let limits = ExecutionLimits::new(token, None);

        let err = with_transaction(&conn, &limits, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn deadline_interrupts_long_statement() {
        let conn = conn();
        let limits = ExecutionLimits::new(CancelToken::new(), Some(Duration::from_millis(50)));

        let err = with_transaction(&conn, &limits, |tx| {
            tx.execute("INSERT INTO t VALUES (1)", [])
                .map_err(|e| Error::Storage(e.to_string()))?;
            // Unbounded recursive CTE; only the progress handler stops it.
            tx.query_row(
                "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c) SELECT MAX(n) FROM c",
                [],
                |r| r.get::<_, i64>(0),
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
            Ok(())
        })
        .unwrap_err();

        assert!(matches!(err, Error::Timeout(limit) if limit == Duration::from_millis(50)));
        assert_eq!(err.to_string(), "run deadline of 50ms exceeded");
        assert_eq!(count(&conn), 0);
    }
}
