use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{Error, Kind};
use crate::migration::{checksum_of, MigrationFile, MigrationId, MigrationKind};

const DIR_RE: &str = r"^(\d{14})_([a-z0-9_]+)$";
const FLAT_FILE_RE: &str = r"^(\d{14})_([a-z0-9_]+)\.sql$";

fn dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DIR_RE).unwrap())
}

fn flat_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FLAT_FILE_RE).unwrap())
}

/// Canonical up/down markers, checked in priority order, case-insensitive.
const UP_MARKERS: &[&str] = &["-- migration: up", "-- up"];
const DOWN_MARKERS: &[&str] = &["-- migration: down", "-- down"];

/// Enumerate and parse the migrations found directly beneath `dir`, ordered by id.
///
/// Entries that are hidden (dotfiles) are skipped. Any other entry that doesn't match
/// the directory or legacy flat-file grammar is a fatal [`Kind::InvalidMigrationFormat`].
/// A missing or empty directory yields an empty list, not an error.
pub fn read_migrations(dir: &Path) -> Result<Vec<MigrationFile>, Error> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| Error::new(Kind::ReadError(dir.to_path_buf(), e), None))?
        .filter_map(Result::ok)
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut migrations = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();

    for entry in entries {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let path = entry.path();
        let migration = if path.is_dir() {
            if let Some(caps) = dir_re().captures(name) {
                Some(parse_directory_migration(&path, &caps[1], &caps[2])?)
            } else {
                None
            }
        } else if let Some(caps) = flat_file_re().captures(name) {
            Some(parse_flat_file_migration(&path, &caps[1], &caps[2])?)
        } else {
            None
        };

        match migration {
            Some(m) => {
                if !seen_ids.insert(m.id.clone()) {
                    return Err(Error::new(Kind::DuplicateId(m.id), None));
                }
                migrations.push(m);
            }
            None => {
                return Err(Error::new(
                    Kind::InvalidMigrationFormat(format!(
                        "entry {name:?} does not match the migration naming convention \
                         (expected YYYYMMDDHHMMSS_name)"
                    )),
                    None,
                ));
            }
        }
    }

    migrations.sort();
    Ok(migrations)
}

fn parse_directory_migration(
    dir: &Path,
    id_raw: &str,
    name: &str,
) -> Result<MigrationFile, Error> {
    let id = MigrationId::parse(id_raw)
        .ok_or_else(|| Error::new(Kind::InvalidMigrationFormat(format!("bad id {id_raw:?}")), None))?;

    let sql_path = dir.join("migration.sql");
    if sql_path.exists() {
        let raw = fs::read(&sql_path).map_err(|e| Error::new(Kind::ReadError(sql_path.clone(), e), None))?;
        let checksum = checksum_of(&raw);
        let text = String::from_utf8_lossy(&raw).into_owned();
        let (up, down) = split_up_down(&text);
        return Ok(MigrationFile {
            id,
            name: name.to_string(),
            path: dir.to_path_buf(),
            kind: MigrationKind::Sql { up, down },
            checksum,
        });
    }

    // Code migration: any other regular file directly in the migration directory is
    // treated as the loader program, deferring import until execution (§4.1, §9).
    let program = fs::read_dir(dir)
        .map_err(|e| Error::new(Kind::ReadError(dir.to_path_buf(), e), None))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .find(|p| p.is_file())
        .ok_or_else(|| {
            Error::new(
                Kind::InvalidMigrationFormat(format!(
                    "directory {dir:?} contains neither migration.sql nor a code module"
                )),
                None,
            )
        })?;

    let raw = fs::read(&program).map_err(|e| Error::new(Kind::ReadError(program.clone(), e), None))?;
    let checksum = checksum_of(&raw);

    Ok(MigrationFile {
        id,
        name: name.to_string(),
        path: dir.to_path_buf(),
        kind: MigrationKind::Code { program },
        checksum,
    })
}

fn parse_flat_file_migration(path: &Path, id_raw: &str, name: &str) -> Result<MigrationFile, Error> {
    let id = MigrationId::parse(id_raw)
        .ok_or_else(|| Error::new(Kind::InvalidMigrationFormat(format!("bad id {id_raw:?}")), None))?;
    let raw = fs::read(path).map_err(|e| Error::new(Kind::ReadError(path.to_path_buf(), e), None))?;
    let checksum = checksum_of(&raw);
    let text = String::from_utf8_lossy(&raw).into_owned();
    let (up, down) = split_up_down(&text);

    Ok(MigrationFile {
        id,
        name: name.to_string(),
        path: path.to_path_buf(),
        kind: MigrationKind::Sql { up, down },
        checksum,
    })
}

/// Split a migration file into up/down halves by scanning for marker lines.
///
/// Priority: `-- Migration: Up` / `-- Migration: Down`, then legacy `-- UP` / `-- DOWN`.
/// Absence of any marker puts the whole file in `up` and leaves `down` empty.
fn split_up_down(text: &str) -> (String, String) {
    let lines: Vec<&str> = text.lines().collect();

    let up_idx = find_marker_line(&lines, UP_MARKERS);
    let down_idx = find_marker_line(&lines, DOWN_MARKERS);

    match (up_idx, down_idx) {
        (Some(u), Some(d)) if d > u => {
            let up = lines[u + 1..d].join("\n");
            let down = lines[d + 1..].join("\n");
            (up.trim_end().to_string(), down.trim_end().to_string())
        }
        (Some(u), _) => {
            let up = lines[u + 1..].join("\n");
            (up.trim_end().to_string(), String::new())
        }
        (None, Some(d)) => {
            let up = lines[..d].join("\n");
            let down = lines[d + 1..].join("\n");
            (up.trim_end().to_string(), down.trim_end().to_string())
        }
        (None, None) => (text.trim_end().to_string(), String::new()),
    }
}

fn find_marker_line(lines: &[&str], markers: &[&str]) -> Option<usize> {
    lines.iter().position(|line| {
        let trimmed = line.trim().to_lowercase();
        markers.iter().any(|m| trimmed == *m)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn empty_directory_yields_empty_list() {
        let tmp = TempDir::new().unwrap();
        assert!(read_migrations(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_directory_yields_empty_list() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("does-not-exist");
        assert!(read_migrations(&missing).unwrap().is_empty());
    }

    #[test]
    fn reads_canonical_marker_migration() {
        let tmp = TempDir::new().unwrap();
        let mig_dir = tmp.path().join("20240101000000_init");
        fs::create_dir(&mig_dir).unwrap();
        write(
            &mig_dir,
            "migration.sql",
            "-- Migration: Up\nCREATE TABLE users(id INT PRIMARY KEY);\n-- Migration: Down\nDROP TABLE users;\n",
        );

        let migrations = read_migrations(tmp.path()).unwrap();
        assert_eq!(migrations.len(), 1);
        let m = &migrations[0];
        assert_eq!(m.id.as_str(), "20240101000000");
        assert_eq!(m.name, "init");
        match &m.kind {
            MigrationKind::Sql { up, down } => {
                assert_eq!(up, "CREATE TABLE users(id INT PRIMARY KEY);");
                assert_eq!(down, "DROP TABLE users;");
            }
            _ => panic!("expected sql migration"),
        }
    }

    #[test]
    fn reads_legacy_marker_migration() {
        let tmp = TempDir::new().unwrap();
        let mig_dir = tmp.path().join("20240101000000_init");
        fs::create_dir(&mig_dir).unwrap();
        write(&mig_dir, "migration.sql", "-- UP\nCREATE TABLE t(id INT);\n-- DOWN\nDROP TABLE t;\n");

        let migrations = read_migrations(tmp.path()).unwrap();
        match &migrations[0].kind {
            MigrationKind::Sql { up, down } => {
                assert_eq!(up, "CREATE TABLE t(id INT);");
                assert_eq!(down, "DROP TABLE t;");
            }
            _ => panic!("expected sql migration"),
        }
    }

    #[test]
    fn no_marker_puts_everything_in_up() {
        let tmp = TempDir::new().unwrap();
        let mig_dir = tmp.path().join("20240101000000_init");
        fs::create_dir(&mig_dir).unwrap();
        write(&mig_dir, "migration.sql", "CREATE TABLE t(id INT);");

        let migrations = read_migrations(tmp.path()).unwrap();
        match &migrations[0].kind {
            MigrationKind::Sql { up, down } => {
                assert_eq!(up, "CREATE TABLE t(id INT);");
                assert!(down.is_empty());
            }
            _ => panic!("expected sql migration"),
        }
    }

    #[test]
    fn orders_by_id_ascending() {
        let tmp = TempDir::new().unwrap();
        for (id, name) in [("20240102000000", "second"), ("20240101000000", "first")] {
            let mig_dir = tmp.path().join(format!("{id}_{name}"));
            fs::create_dir(&mig_dir).unwrap();
            write(&mig_dir, "migration.sql", "SELECT 1;");
        }

        let migrations = read_migrations(tmp.path()).unwrap();
        assert_eq!(migrations[0].name, "first");
        assert_eq!(migrations[1].name, "second");
    }

    #[test]
    fn rejects_unmatched_entries() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("not-a-migration")).unwrap();
        let err = read_migrations(tmp.path()).unwrap_err();
        assert!(matches!(err.kind(), Kind::InvalidMigrationFormat(_)));
    }

    #[test]
    fn accepts_legacy_flat_sql_file() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "20240101000000_init.sql", "CREATE TABLE t(id INT);");
        let migrations = read_migrations(tmp.path()).unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].name, "init");
    }

    #[test]
    fn ignores_hidden_entries() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), ".gitkeep", "");
        assert!(read_migrations(tmp.path()).unwrap().is_empty());
    }
}
