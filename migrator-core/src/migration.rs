use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;

/// The 14-digit `YYYYMMDDHHMMSS` identifier assigned to a migration at creation time.
///
/// Ids are the sole canonical key; lexicographic order on the digit string is the
/// migration order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MigrationId(String);

impl MigrationId {
    /// Validate that `raw` is exactly 14 ASCII digits.
    pub fn parse(raw: &str) -> Option<MigrationId> {
        if raw.len() == 14 && raw.bytes().all(|b| b.is_ascii_digit()) {
            Some(MigrationId(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The payload of a migration, either inline SQL text or an out-of-process program.
///
/// Code migrations are documented in DESIGN.md as a Rust-native resolution of the
/// source's dynamic module loading: only the path is stored here, the Executor invokes
/// it at apply time.
#[derive(Clone, Debug)]
pub enum MigrationKind {
    Sql { up: String, down: String },
    Code { program: PathBuf },
}

/// A parsed migration directory, immutable once constructed by the Reader.
#[derive(Clone, Debug)]
pub struct MigrationFile {
    pub id: MigrationId,
    pub name: String,
    pub path: PathBuf,
    pub kind: MigrationKind,
    pub checksum: String,
}

impl MigrationFile {
    /// Whether this migration has any statements to run in reverse.
    pub fn has_down(&self) -> bool {
        match &self.kind {
            MigrationKind::Sql { down, .. } => !down.trim().is_empty(),
            MigrationKind::Code { .. } => true,
        }
    }
}

impl fmt::Display for MigrationFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.id, self.name)
    }
}

impl PartialEq for MigrationFile {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MigrationFile {}

impl PartialOrd for MigrationFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MigrationFile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// SHA-256 of `content` after normalizing line endings to `\n`, hex lowercase.
///
/// No trailing-whitespace trim: content is compared byte-exact after LF normalization.
pub fn checksum_of(content: &[u8]) -> String {
    let normalized = normalize_line_endings(content);
    let mut hasher = Sha256::new();
    hasher.update(&normalized);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn normalize_line_endings(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len());
    let mut i = 0;
    while i < content.len() {
        if content[i] == b'\r' && content.get(i + 1) == Some(&b'\n') {
            out.push(b'\n');
            i += 2;
        } else if content[i] == b'\r' {
            out.push(b'\n');
            i += 1;
        } else {
            out.push(content[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_id() {
        assert!(MigrationId::parse("20240101000000").is_some());
    }

    #[test]
    fn rejects_short_or_non_digit_id() {
        assert!(MigrationId::parse("2024010100000").is_none());
        assert!(MigrationId::parse("2024010100000x").is_none());
    }

    #[test]
    fn checksum_is_stable_across_line_endings() {
        let lf = checksum_of(b"CREATE TABLE t();\n-- Migration: Down\nDROP TABLE t;\n");
        let crlf = checksum_of(b"CREATE TABLE t();\r\n-- Migration: Down\r\nDROP TABLE t;\r\n");
        assert_eq!(lf, crlf);
    }

    #[test]
    fn checksum_is_pure_function_of_content() {
        let a = checksum_of(b"select 1;");
        let b = checksum_of(b"select 1;");
        let c = checksum_of(b"select 2;");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ordering_is_by_id_only() {
        let make = |id: &str| MigrationFile {
            id: MigrationId::parse(id).unwrap(),
            name: "x".into(),
            path: PathBuf::new(),
            kind: MigrationKind::Sql {
                up: String::new(),
                down: String::new(),
            },
            checksum: String::new(),
        };
        let a = make("20240101000000");
        let b = make("20240102000000");
        assert!(a < b);
    }
}
