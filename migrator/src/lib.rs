//! Database migration runner.
//!
//! Discovers migrations from a directory on disk, verifies what's already been applied
//! against a Postgres schema history table, serializes concurrent runs with an advisory
//! lock, and applies or rolls back migrations inside transactions.
//!
//! This crate is a thin facade over [`migrator_core`]; see [`Runner`] for the entry
//! point.

pub use migrator_core::config;
pub use migrator_core::error;
pub use migrator_core::{
    read_migrations, Error, LedgerRow, MigrationFile, MigrationId, MigrationKind, MigrationState,
    RefreshOutcome, Report, StatusEntry, UpIfNotLockedOutcome,
};

#[cfg(feature = "postgres")]
pub use migrator_core::Runner;

#[cfg(feature = "postgres")]
pub use migrator_core::sqlx;
