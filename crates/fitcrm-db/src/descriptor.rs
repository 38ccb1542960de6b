//! Migration file parsing.
//!
//! A migration file is plain SQL split into sections by marker comments:
//!
//! ```text
//! -- Description: add emergency contact to members
//! -- UP
//! ALTER TABLE members ADD COLUMN emergency_contact TEXT;
//! -- DOWN
//! ALTER TABLE members DROP COLUMN emergency_contact;
//! ```
//!
//! Parsing runs in two passes: [`lex_markers`] finds every marker line, then
//! [`parse_migration`] validates their order and slices the bodies between
//! them. Errors name the file, the 1-based line and what was expected.

use std::path::Path;

use fitcrm_common::{Error, Result};
use ring::digest;
use serde::Serialize;

pub const MIGRATION_EXTENSION: &str = "sql";

/// A migration as found on disk. Re-derived on every scan, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationDescriptor {
    pub version: u32,
    pub filename: String,
    pub description: Option<String>,
    pub up_script: String,
    pub down_script: Option<String>,
    /// Lowercase hex SHA-256 of the raw file bytes.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Marker {
    Description(String),
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MarkerLine {
    pub line: usize,
    /// Byte offset where the marker line starts.
    pub start: usize,
    /// Byte offset just past the marker line's terminator.
    pub end: usize,
    pub marker: Marker,
}

/// Split `NNN_description.ext` into its version and description slug.
pub fn parse_filename(filename: &str) -> Result<(u32, String)> {
    let fail = |message: &str| Error::Parse {
        file: filename.to_string(),
        line: 0,
        message: message.to_string(),
    };

    let (stem, ext) = filename
        .rsplit_once('.')
        .ok_or_else(|| fail("filename has no extension"))?;
    if ext.is_empty() {
        return Err(fail("filename has no extension"));
    }

    let digits_end = stem
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(stem.len());
    if digits_end == 0 {
        return Err(fail("filename must start with a numeric version prefix"));
    }

    let version: u32 = stem[..digits_end]
        .parse()
        .map_err(|_| fail("version prefix does not fit in 32 bits"))?;
    if version == 0 {
        return Err(fail("version prefix must be a positive integer"));
    }

    let slug = stem[digits_end..]
        .strip_prefix('_')
        .ok_or_else(|| fail("version prefix must be followed by '_' and a description"))?;
    if slug.trim_matches('_').is_empty() {
        return Err(fail("filename description is empty"));
    }

    Ok((version, slug.to_string()))
}

/// First pass: locate every marker line in `content`.
pub(crate) fn lex_markers(content: &str) -> Vec<MarkerLine> {
    let mut markers = Vec::new();
    let mut offset = 0;

    for (idx, raw) in content.split_inclusive('\n').enumerate() {
        let start = offset;
        offset += raw.len();

        let Some(comment) = raw.trim().strip_prefix("--") else {
            continue;
        };
        let comment = comment.trim();

        let marker = if comment.eq_ignore_ascii_case("UP") {
            Marker::Up
        } else if comment.eq_ignore_ascii_case("DOWN") {
            Marker::Down
        } else if let Some(text) = strip_prefix_ignore_case(comment, "description:") {
            Marker::Description(text.trim().to_string())
        } else {
            continue;
        };

        markers.push(MarkerLine {
            line: idx + 1,
            start,
            end: offset,
            marker,
        });
    }

    markers
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

/// True when `sql` holds something other than whitespace and `--` comments.
fn has_statements(sql: &str) -> bool {
    sql.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with("--")
    })
}

/// Second pass: validate marker order and slice the UP/DOWN bodies.
pub fn parse_migration(filename: &str, content: &str) -> Result<MigrationDescriptor> {
    let (version, slug) = parse_filename(filename)?;
    let fail = |line: usize, message: String| Error::Parse {
        file: filename.to_string(),
        line,
        message,
    };

    // Editors on Windows often prepend a BOM; the checksum still covers it.
    let body = content.strip_prefix('\u{feff}').unwrap_or(content);
    let markers = lex_markers(body);
    let mut up: Option<&MarkerLine> = None;
    let mut down: Option<&MarkerLine> = None;
    let mut description: Option<String> = None;

    for marker in &markers {
        match &marker.marker {
            Marker::Up => {
                if let Some(first) = up {
                    return Err(fail(
                        marker.line,
                        format!("duplicate -- UP marker (first on line {})", first.line),
                    ));
                }
                up = Some(marker);
            }
            Marker::Down => {
                if let Some(first) = down {
                    return Err(fail(
                        marker.line,
                        format!("duplicate -- DOWN marker (first on line {})", first.line),
                    ));
                }
                if up.is_none() {
                    return Err(fail(
                        marker.line,
                        "-- DOWN section appears before -- UP".to_string(),
                    ));
                }
                down = Some(marker);
            }
            // Only the header counts; later ones are ordinary SQL comments.
            Marker::Description(text) if up.is_none() && description.is_none() => {
                if !text.is_empty() {
                    description = Some(text.clone());
                }
            }
            Marker::Description(_) => {}
        }
    }

    let up = up.ok_or_else(|| fail(0, "missing -- UP section".to_string()))?;
    let up_end = down.map_or(body.len(), |d| d.start);
    let up_script = body[up.end..up_end].trim();
    if !has_statements(up_script) {
        return Err(fail(up.line, "-- UP section has no SQL statements".to_string()));
    }

    let down_script = down
        .map(|d| body[d.end..].trim())
        .filter(|sql| has_statements(sql))
        .map(str::to_string);

    Ok(MigrationDescriptor {
        version,
        filename: filename.to_string(),
        description: description.or_else(|| Some(slug.replace('_', " ").trim().to_string())),
        up_script: up_script.to_string(),
        down_script,
        checksum: checksum(content.as_bytes()),
    })
}

/// Read and parse one migration file.
pub fn load_migration(path: &Path) -> Result<MigrationDescriptor> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Parse {
            file: path.display().to_string(),
            line: 0,
            message: "filename is not valid UTF-8".into(),
        })?;

    let bytes = std::fs::read(path)?;
    let content = String::from_utf8(bytes).map_err(|e| Error::Parse {
        file: filename.to_string(),
        line: 0,
        message: format!("file is not valid UTF-8: {e}"),
    })?;

    parse_migration(filename, &content)
}

/// Lowercase hex SHA-256.
pub fn checksum(data: &[u8]) -> String {
    use std::fmt::Write;
    let digest = digest::digest(&digest::SHA256, data);
    let mut out = String::with_capacity(64);
    for byte in digest.as_ref() {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "-- Description: Create members table\n-- UP\nCREATE TABLE members (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\n-- DOWN\nDROP TABLE members;\n";

    fn parse_err(filename: &str, content: &str) -> (usize, String) {
        match parse_migration(filename, content) {
            Err(Error::Parse { line, message, .. }) => (line, message),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn parses_full_file() {
        let m = parse_migration("001_init.sql", FULL).unwrap();
        assert_eq!(m.version, 1);
        assert_eq!(m.filename, "001_init.sql");
        assert_eq!(m.description.as_deref(), Some("Create members table"));
        assert_eq!(
            m.up_script,
            "CREATE TABLE members (id INTEGER PRIMARY KEY, name TEXT NOT NULL);"
        );
        assert_eq!(m.down_script.as_deref(), Some("DROP TABLE members;"));
        assert_eq!(m.checksum, checksum(FULL.as_bytes()));
        assert_eq!(m.checksum.len(), 64);
    }

    #[test]
    fn missing_down_is_not_an_error() {
        let m = parse_migration("002_index.sql", "-- UP\nCREATE INDEX i ON members(name);\n")
            .unwrap();
        assert!(m.down_script.is_none());
        assert_eq!(m.description.as_deref(), Some("index"));
    }

    #[test]
    fn empty_down_body_is_none() {
        let m = parse_migration("003_x.sql", "-- UP\nSELECT 1;\n-- DOWN\n\n-- nothing\n").unwrap();
        assert!(m.down_script.is_none());
    }

    #[test]
    fn leading_byte_order_mark_is_ignored() {
        let content = "\u{feff}-- UP\nCREATE TABLE a(x);\n-- DOWN\nDROP TABLE a;\n";
        let m = parse_migration("001_init.sql", content).unwrap();
        assert_eq!(m.up_script, "CREATE TABLE a(x);");
        assert_eq!(m.down_script.as_deref(), Some("DROP TABLE a;"));
        assert_eq!(m.checksum, checksum(content.as_bytes()));
        assert_ne!(m.checksum, checksum(&content.as_bytes()[3..]));
    }

    #[test]
    fn description_falls_back_to_filename_slug() {
        let m = parse_migration("004_add_member_notes.sql", "-- UP\nSELECT 1;").unwrap();
        assert_eq!(m.description.as_deref(), Some("add member notes"));
    }

    #[test]
    fn markers_are_case_and_space_insensitive() {
        let m = parse_migration(
            "005_x.sql",
            "  --   up  \nCREATE TABLE a (id INTEGER);\n--Down\nDROP TABLE a;",
        )
        .unwrap();
        assert_eq!(m.up_script, "CREATE TABLE a (id INTEGER);");
        assert_eq!(m.down_script.as_deref(), Some("DROP TABLE a;"));
    }

    #[test]
    fn crlf_line_endings_parse() {
        let m = parse_migration("006_x.sql", "-- UP\r\nSELECT 1;\r\n-- DOWN\r\nSELECT 2;\r\n")
            .unwrap();
        assert_eq!(m.up_script, "SELECT 1;");
        assert_eq!(m.down_script.as_deref(), Some("SELECT 2;"));
    }

    #[test]
    fn missing_up_section() {
        let (line, msg) = parse_err("001_init.sql", "CREATE TABLE a (id INTEGER);\n");
        assert_eq!(line, 0);
        assert!(msg.contains("missing -- UP"));
    }

    #[test]
    fn comment_only_up_section() {
        let (line, msg) = parse_err("001_init.sql", "-- Description: x\n-- UP\n-- TODO\n\n-- DOWN\nDROP TABLE a;");
        assert_eq!(line, 2);
        assert!(msg.contains("no SQL statements"));
    }

    #[test]
    fn duplicate_up_marker_reports_both_lines() {
        let (line, msg) = parse_err("001_init.sql", "-- UP\nSELECT 1;\n-- UP\nSELECT 2;");
        assert_eq!(line, 3);
        assert!(msg.contains("first on line 1"));
    }

    #[test]
    fn down_before_up() {
        let (line, msg) = parse_err("001_init.sql", "-- DOWN\nDROP TABLE a;\n-- UP\nSELECT 1;");
        assert_eq!(line, 1);
        assert!(msg.contains("before -- UP"));
    }

    #[test]
    fn description_inside_up_body_stays_sql() {
        let m = parse_migration(
            "007_x.sql",
            "-- UP\n-- Description: not a header\nSELECT 1;",
        )
        .unwrap();
        assert_eq!(m.description.as_deref(), Some("x"));
        assert!(m.up_script.contains("not a header"));
    }

    #[test]
    fn filename_rules() {
        assert_eq!(parse_filename("012_add_column.sql").unwrap(), (12, "add_column".to_string()));
        assert!(parse_filename("add_column.sql").is_err());
        assert!(parse_filename("000_zero.sql").is_err());
        assert!(parse_filename("001.sql").is_err());
        assert!(parse_filename("001_.sql").is_err());
        assert!(parse_filename("001_init").is_err());
        assert!(parse_filename("99999999999_big.sql").is_err());
    }

    #[test]
    fn checksum_covers_comments() {
        let edited = FULL.replace("Create members table", "Create member table");
        let a = parse_migration("001_init.sql", FULL).unwrap();
        let b = parse_migration("001_init.sql", &edited).unwrap();
        assert_eq!(a.up_script, b.up_script);
        assert_ne!(a.checksum, b.checksum);
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("001_init.sql");
        std::fs::write(&path, FULL).unwrap();

        let m = load_migration(&path).unwrap();
        assert_eq!(m.filename, "001_init.sql");
        assert_eq!(m.checksum, checksum(FULL.as_bytes()));
    }
}
