//! Filesystem store for versioned schema migrations.
//!
//! A migration is a single `.sql` file named `YYYY-MM-DD-HH-MM-SS-<slug>.sql`
//! containing a `-- up` and a `-- down` section. The filename (minus the
//! extension) is the migration id; ids sort lexicographically in the same
//! order they were created.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lazy_regex::regex_is_match;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("malformed migration {id}: {reason}")]
    Definition { id: String, reason: String },

    #[error("cannot prepare migrations directory {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An ordered pair of forward/backward schema-change statements.
///
/// `id` is immutable once created and unique within a store (it is the
/// filename, so two definitions cannot share one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationDefinition {
    pub id: String,
    pub forward_statement: String,
    pub backward_statement: String,
}

fn is_migration_filename(name: &str) -> bool {
    regex_is_match!(
        r"^\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}-[a-z0-9][a-z0-9-]*\.sql$",
        name
    )
}

/// Scan `path` (non-recursive) for migration definitions, sorted ascending
/// by id. Files that do not match the naming convention are ignored; a file
/// that matches but lacks an up or down section fails the whole discovery.
///
/// A missing directory yields an empty store rather than an error, so a
/// project with no migrations yet behaves the same as an empty directory.
pub fn discover(path: &Path) -> Result<Vec<MigrationDefinition>, StoreError> {
    if !path.is_dir() {
        debug!(path = %path.display(), "migrations directory absent, store is empty");
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut definitions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if !is_migration_filename(name) {
            debug!(file = name, "ignoring non-migration file");
            continue;
        }

        let file_path = entry.path();
        let content = fs::read_to_string(&file_path).map_err(|source| StoreError::Io {
            path: file_path.clone(),
            source,
        })?;

        let id = name.trim_end_matches(".sql").to_string();
        let (forward, backward) = parse_sections(&id, &content)?;
        definitions.push(MigrationDefinition {
            id,
            forward_statement: forward,
            backward_statement: backward,
        });
    }

    definitions.sort_by(|a, b| a.id.cmp(&b.id));

    // Filenames are unique per directory, but two paths fed through a
    // symlinked layout could still collide on id.
    for pair in definitions.windows(2) {
        if pair[0].id == pair[1].id {
            return Err(StoreError::Definition {
                id: pair[0].id.clone(),
                reason: "duplicate migration id".to_string(),
            });
        }
    }

    Ok(definitions)
}

/// Split a definition file into its up and down SQL. Full-line comments and
/// blank lines are dropped; anything else belongs to the section opened by
/// the most recent marker.
fn parse_sections(id: &str, content: &str) -> Result<(String, String), StoreError> {
    enum Section {
        None,
        Up,
        Down,
    }

    let mut section = Section::None;
    let mut up = Vec::new();
    let mut down = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim();
        let lowered = trimmed.to_ascii_lowercase();
        if lowered == "-- up" {
            section = Section::Up;
            continue;
        }
        if lowered == "-- down" {
            section = Section::Down;
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        match section {
            Section::Up => up.push(line),
            Section::Down => down.push(line),
            Section::None => {
                return Err(StoreError::Definition {
                    id: id.to_string(),
                    reason: format!("SQL before any section marker: {trimmed:?}"),
                })
            }
        }
    }

    if up.is_empty() {
        return Err(StoreError::Definition {
            id: id.to_string(),
            reason: "missing or empty '-- up' section".to_string(),
        });
    }
    if down.is_empty() {
        return Err(StoreError::Definition {
            id: id.to_string(),
            reason: "missing or empty '-- down' section".to_string(),
        });
    }

    Ok((up.join("\n"), down.join("\n")))
}

/// Lowercase a free-text message into the id slug: runs of anything other
/// than letters and digits collapse to a single dash.
pub fn slugify(message: &str) -> String {
    let mut slug = String::with_capacity(message.len());
    let mut pending_dash = false;
    for ch in message.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn timestamp_prefix(now: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02}-{:02}-{:02}-{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

const STUB: &str = "-- up\n-- forward SQL goes here\n\n-- down\n-- backward SQL goes here\n";

/// Scaffold a new migration file under `path`, creating the directory if
/// needed. The returned definition carries the generated id; its statements
/// are empty until the operator edits the stub (discovery rejects the file
/// until both sections are filled in).
pub fn create(path: &Path, message: &str) -> Result<MigrationDefinition, StoreError> {
    let slug = slugify(message);
    if slug.is_empty() {
        return Err(StoreError::Definition {
            id: String::new(),
            reason: format!("message {message:?} produces an empty slug"),
        });
    }

    fs::create_dir_all(path).map_err(|source| StoreError::Path {
        path: path.to_path_buf(),
        source,
    })?;

    let id = format!("{}-{}", timestamp_prefix(OffsetDateTime::now_utc()), slug);
    let file_path = path.join(format!("{id}.sql"));
    let body = format!("-- {message}\n{STUB}");
    fs::write(&file_path, body).map_err(|source| StoreError::Io {
        path: file_path.clone(),
        source,
    })?;

    info!(migration = %id, path = %file_path.display(), "created migration stub");
    Ok(MigrationDefinition {
        id,
        forward_statement: String::new(),
        backward_statement: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    const GOOD_BODY: &str = "-- up\ncreate table t (id int);\n\n-- down\ndrop table t;\n";

    #[test]
    fn slugify_collapses_and_lowercases() {
        assert_eq!(slugify("Add users table"), "add-users-table");
        assert_eq!(slugify("  weird -- punctuation!! "), "weird-punctuation");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn timestamp_prefix_is_zero_padded() {
        let at = datetime!(2024-01-02 03:04:05 UTC);
        assert_eq!(timestamp_prefix(at), "2024-01-02-03-04-05");
    }

    #[test]
    fn discover_sorts_by_id_regardless_of_write_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "2024-01-02-00-00-00-second.sql", GOOD_BODY);
        write(dir.path(), "2024-01-01-00-00-00-first.sql", GOOD_BODY);
        write(dir.path(), "2023-12-31-23-59-59-earliest.sql", GOOD_BODY);

        let defs = discover(dir.path()).unwrap();
        let ids: Vec<_> = defs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "2023-12-31-23-59-59-earliest",
                "2024-01-01-00-00-00-first",
                "2024-01-02-00-00-00-second",
            ]
        );
    }

    #[test]
    fn discover_ignores_non_conforming_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "README.md", "not a migration");
        write(dir.path(), "notes.sql", "-- up\nx;\n-- down\ny;\n");
        write(dir.path(), "2024-01-01-00-00-00-real.sql", GOOD_BODY);

        let defs = discover(dir.path()).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id, "2024-01-01-00-00-00-real");
    }

    #[test]
    fn discover_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(discover(&missing).unwrap().is_empty());
    }

    #[test]
    fn missing_down_section_fails_discovery_with_id() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "2024-01-01-00-00-00-broken.sql",
            "-- up\ncreate table t (id int);\n",
        );

        let err = discover(dir.path()).unwrap_err();
        match err {
            StoreError::Definition { id, reason } => {
                assert_eq!(id, "2024-01-01-00-00-00-broken");
                assert!(reason.contains("down"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn sql_before_marker_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "2024-01-01-00-00-00-headless.sql",
            "create table t (id int);\n-- up\nx;\n-- down\ny;\n",
        );
        assert!(matches!(
            discover(dir.path()),
            Err(StoreError::Definition { .. })
        ));
    }

    #[test]
    fn parse_keeps_multi_line_statements_and_drops_comments() {
        let body = "\
-- up
create table t (
    id int
);
-- a trailing note
insert into t values (1);

-- down
drop table t;
";
        let (up, down) = parse_sections("m", body).unwrap();
        assert_eq!(
            up,
            "create table t (\n    id int\n);\ninsert into t values (1);"
        );
        assert_eq!(down, "drop table t;");
    }

    #[test]
    fn create_writes_a_conforming_stub() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("migrations").join("appdb");

        let def = create(&target, "Add users table").unwrap();
        assert!(def.id.ends_with("-add-users-table"));
        assert!(is_migration_filename(&format!("{}.sql", def.id)));

        // The stub only has comment placeholders, so it stays malformed
        // until edited.
        assert!(matches!(
            discover(&target),
            Err(StoreError::Definition { .. })
        ));
    }

    #[test]
    fn create_rejects_unsluggable_message() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            create(dir.path(), "!!!"),
            Err(StoreError::Definition { .. })
        ));
    }
}
