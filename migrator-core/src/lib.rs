pub mod config;
pub mod error;
mod executor;
mod ledger;
mod lock;
mod migration;
mod reader;
mod runner;

pub use crate::error::Error;
pub use crate::ledger::LedgerRow;
pub use crate::migration::{MigrationFile, MigrationId, MigrationKind};
pub use crate::reader::read_migrations;
pub use crate::runner::{MigrationState, Report, StatusEntry, UpIfNotLockedOutcome, RefreshOutcome};

#[cfg(feature = "postgres")]
pub use crate::runner::pg::Runner;

#[cfg(feature = "postgres")]
pub use sqlx;
