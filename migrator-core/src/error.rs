use std::fmt;
use std::path::PathBuf;
use thiserror::Error as TError;

use crate::migration::MigrationId;
use crate::runner::Report;

/// An error that occurred while discovering, verifying or applying migrations.
#[derive(Debug)]
pub struct Error {
    kind: Box<Kind>,
    report: Option<Report>,
}

impl Error {
    pub(crate) fn new(kind: Kind, report: Option<Report>) -> Error {
        Error {
            kind: Box::new(kind),
            report,
        }
    }

    /// The migrations that had already committed before this error occurred, if any.
    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Attach a report to an error that doesn't already carry one. Used by the runner
    /// to record which migrations committed in a multi-step `up`/`down` run before the
    /// step that failed.
    pub(crate) fn with_report(mut self, report: Report) -> Error {
        if self.report.is_none() {
            self.report = Some(report);
        }
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

/// The distinct error kinds the runner can surface, per the error handling design.
#[derive(Debug, TError)]
pub enum Kind {
    #[error("missing or invalid settings: {0}")]
    ConfigError(String),

    #[error("invalid migration format: {0}")]
    InvalidMigrationFormat(String),

    #[error("migration {0} is duplicated, migration ids must be unique")]
    DuplicateId(MigrationId),

    #[error("Migration {0} has been modified since it was applied")]
    ChecksumMismatch(MigrationId),

    #[error("migration {0} has not been applied")]
    NotApplied(MigrationId),

    #[error("migration {0} has no down statements; pass force=true to discard the ledger row anyway")]
    NoDownStatements(MigrationId),

    #[error("could not acquire the migration lock within {0}ms")]
    LockAcquisitionTimeout(u64),

    #[error("ledger row violates the expected schema: {0}")]
    LedgerCorrupt(String),

    #[error("I/O error reading migration at {0}: {1}")]
    ReadError(PathBuf, #[source] std::io::Error),

    #[error("database error: {0}")]
    DatabaseError(#[source] Box<dyn std::error::Error + Sync + Send>),

    #[error("migration operation was cancelled")]
    Cancelled,
}

/// Helper for wrapping an underlying database driver's error in [`Kind::DatabaseError`],
/// optionally attaching the migrations already committed in this run.
pub trait WrapMigrationError<T, E> {
    fn migration_err(self, applied: Option<&[crate::migration::MigrationFile]>) -> Result<T, Error>;
}

impl<T, E> WrapMigrationError<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn migration_err(
        self,
        applied: Option<&[crate::migration::MigrationFile]>,
    ) -> Result<T, Error> {
        match self {
            Ok(v) => Ok(v),
            Err(err) => Err(Error {
                kind: Box::new(Kind::DatabaseError(Box::new(err))),
                report: applied.map(|am| Report::new(am.to_vec())),
            }),
        }
    }
}
