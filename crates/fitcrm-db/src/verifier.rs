use fitcrm_common::{Error, Result, SanityCheck};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub issues: Vec<String>,
}

impl VerificationReport {
    pub fn into_result(self) -> Result<()> {
        if self.passed {
            Ok(())
        } else {
            Err(Error::Integrity(self.issues))
        }
    }
}

/// Post-run consistency checks. Read-only.
pub struct IntegrityVerifier<'a> {
    conn: &'a Connection,
    sanity_checks: &'a [SanityCheck],
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(conn: &'a Connection, sanity_checks: &'a [SanityCheck]) -> Self {
        Self {
            conn,
            sanity_checks,
        }
    }

    pub fn verify(&self) -> VerificationReport {
        let mut issues = Vec::new();

        match self.integrity_check() {
            Ok(found) => issues.extend(found),
            Err(e) => issues.push(format!("integrity_check could not run: {e}")),
        }
        match self.foreign_key_check() {
            Ok(found) => issues.extend(found),
            Err(e) => issues.push(format!("foreign_key_check could not run: {e}")),
        }
        for check in self.sanity_checks {
            if let Some(issue) = self.run_sanity_check(check) {
                issues.push(issue);
            }
        }

        let report = VerificationReport {
            passed: issues.is_empty(),
            issues,
        };
        if report.passed {
            info!("integrity verification passed");
        } else {
            warn!(
                "integrity verification found {} issue(s)",
                report.issues.len()
            );
        }
        report
    }

    fn integrity_check(&self) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare("PRAGMA integrity_check")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter(|r| r != "ok")
            .map(|r| format!("integrity_check: {r}"))
            .collect())
    }

    fn foreign_key_check(&self) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self.conn.prepare("PRAGMA foreign_key_check")?;
        let rows = stmt
            .query_map([], |row| {
                let table: String = row.get(0)?;
                let rowid: Option<i64> = row.get(1)?;
                let parent: String = row.get(2)?;
                Ok((table, rowid, parent))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .map(|(table, rowid, parent)| match rowid {
                Some(rowid) => format!(
                    "foreign key violation: {table} rowid {rowid} references missing row in {parent}"
                ),
                None => format!("foreign key violation: {table} references missing row in {parent}"),
            })
            .collect())
    }

    fn run_sanity_check(&self, check: &SanityCheck) -> Option<String> {
        let count: i64 = match self.conn.query_row(&check.query, [], |row| row.get(0)) {
            Ok(count) => count,
            Err(e) => return Some(format!("sanity check '{}' failed to run: {e}", check.name)),
        };
        match (check.expect_zero, count) {
            (true, 0) => None,
            (true, n) => Some(format!("sanity check '{}' found {n} violating row(s)", check.name)),
            (false, 0) => Some(format!("sanity check '{}' returned 0, expected rows", check.name)),
            (false, _) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crm() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE members (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT);
             CREATE TABLE visits (id INTEGER PRIMARY KEY, member_id INTEGER NOT NULL REFERENCES members(id));
             INSERT INTO members (id, name, email) VALUES (1, 'Ana', 'ana@gym.test');
             INSERT INTO visits (member_id) VALUES (1);",
        )
        .unwrap();
        conn
    }

    fn check(name: &str, query: &str, expect_zero: bool) -> SanityCheck {
        SanityCheck {
            name: name.into(),
            query: query.into(),
            expect_zero,
        }
    }

    #[test]
    fn healthy_store_passes() {
        let conn = crm();
        let checks = vec![
            check("members without email", "SELECT COUNT(*) FROM members WHERE email IS NULL", true),
            check("has members", "SELECT COUNT(*) FROM members", false),
        ];
        let report = IntegrityVerifier::new(&conn, &checks).verify();
        assert!(report.passed, "{:?}", report.issues);
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn orphaned_rows_are_reported() {
        let conn = crm();
        // foreign_keys is off on this connection, so the orphan goes in.
        conn.execute_batch("INSERT INTO visits (member_id) VALUES (99);")
            .unwrap();
        let report = IntegrityVerifier::new(&conn, &[]).verify();
        assert!(!report.passed);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains("visits"));
        assert!(report.issues[0].contains("members"));
    }

    #[test]
    fn sanity_check_violations_and_failures() {
        let conn = crm();
        conn.execute_batch("INSERT INTO members (name) VALUES ('Bo');")
            .unwrap();
        let checks = vec![
            check("members without email", "SELECT COUNT(*) FROM members WHERE email IS NULL", true),
            check("no trainers", "SELECT COUNT(*) FROM trainers", true),
            check("has visits today", "SELECT 0", false),
        ];
        let report = IntegrityVerifier::new(&conn, &checks).verify();
        assert_eq!(report.issues.len(), 3);
        assert!(report.issues[0].contains("1 violating row"));
        assert!(report.issues[1].contains("failed to run"));
        assert!(report.issues[2].contains("expected rows"));
        assert!(matches!(report.into_result(), Err(Error::Integrity(_))));
    }
}
