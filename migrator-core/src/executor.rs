use crate::error::{Error, Kind};
use crate::ledger::LedgerRow;
use crate::migration::MigrationFile;

/// Walk applied rows whose id also appears on disk and verify each stored checksum
/// still matches the current file checksum. Pure and DB-free so it can run before any
/// database call is made, per spec.md §4.4's pre-run integrity scan.
pub fn verify_checksums(files: &[MigrationFile], applied: &[LedgerRow]) -> Result<(), Error> {
    for row in applied {
        if let Some(file) = files.iter().find(|f| f.id == row.id) {
            if file.checksum != row.checksum {
                return Err(Error::new(Kind::ChecksumMismatch(file.id.clone()), None));
            }
        }
    }
    Ok(())
}

/// Migrations on disk not present in `applied`, ordered ascending by id.
pub fn compute_pending(files: &[MigrationFile], applied: &[LedgerRow]) -> Vec<MigrationFile> {
    let mut pending: Vec<MigrationFile> = files
        .iter()
        .filter(|f| !applied.iter().any(|r| r.id == f.id))
        .cloned()
        .collect();
    pending.sort();
    pending
}

/// The last `steps` applied rows, reverse (descending) id order — the set a `down`
/// call would roll back.
pub fn compute_down_set(applied: &[LedgerRow], steps: usize) -> Vec<LedgerRow> {
    let mut rows = applied.to_vec();
    rows.sort_by(|a, b| a.id.cmp(&b.id));
    rows.into_iter().rev().take(steps).collect()
}

#[cfg(feature = "postgres")]
pub mod pg {
    use sqlx::{PgPool, Postgres, Transaction};

    use super::verify_checksums;
    use crate::error::{Error, Kind, WrapMigrationError};
    use crate::ledger::pg as ledger;
    use crate::ledger::LedgerRow;
    use crate::migration::{MigrationFile, MigrationKind};

    /// Apply a single migration's up payload in one transaction: insert the started
    /// ledger row, run the payload, mark it finished, commit. Any failure between those
    /// steps rolls the transaction back, leaving no ledger row and no schema change.
    ///
    /// If `id` already has a ledger row (a `--force` repair re-run), the stored checksum
    /// is compared to the file's current checksum first and the call refuses to proceed
    /// on a mismatch (§4.4's checksum guard); a not-yet-applied migration has no stored
    /// checksum, so this check is a no-op for the common path.
    pub async fn up(pool: &PgPool, table_name: &str, migration: &MigrationFile) -> Result<(), Error> {
        if let Some(stored) = ledger::get_checksum(pool, table_name, &migration.id).await? {
            if stored != migration.checksum {
                return Err(Error::new(Kind::ChecksumMismatch(migration.id.clone()), None));
            }
        }

        let mut tx = pool.begin().await.migration_err(None)?;

        let result: Result<(), Error> = async {
            ledger::insert_start(&mut *tx, table_name, &migration.id, &migration.name, &migration.checksum)
                .await?;
            run_up_payload(&mut tx, migration).await?;
            ledger::mark_finished(&mut *tx, table_name, &migration.id).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await.migration_err(None)?;
                log::info!("applied migration {migration}");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Roll back a single applied migration: verify it's applied, run the down
    /// payload (unless `force`, which only discards the ledger row), delete the row,
    /// commit. Any failure leaves the migration applied.
    pub async fn down(
        pool: &PgPool,
        table_name: &str,
        migration: &MigrationFile,
        force: bool,
    ) -> Result<(), Error> {
        if !ledger::is_applied(pool, table_name, &migration.id).await? {
            return Err(Error::new(Kind::NotApplied(migration.id.clone()), None));
        }

        if !force && !migration.has_down() {
            return Err(Error::new(Kind::NoDownStatements(migration.id.clone()), None));
        }

        let mut tx = pool.begin().await.migration_err(None)?;

        let result: Result<(), Error> = async {
            if !force {
                run_down_payload(&mut tx, migration).await?;
            }
            ledger::delete_row(&mut *tx, table_name, &migration.id).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await.migration_err(None)?;
                log::info!("rolled back migration {migration}");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn run_up_payload(tx: &mut Transaction<'_, Postgres>, migration: &MigrationFile) -> Result<(), Error> {
        match &migration.kind {
            MigrationKind::Sql { up, .. } => {
                sqlx::raw_sql(up).execute(&mut **tx).await.migration_err(None)?;
                Ok(())
            }
            MigrationKind::Code { program } => run_code_migration(program, "up").await,
        }
    }

    async fn run_down_payload(tx: &mut Transaction<'_, Postgres>, migration: &MigrationFile) -> Result<(), Error> {
        match &migration.kind {
            MigrationKind::Sql { down, .. } => {
                sqlx::raw_sql(down).execute(&mut **tx).await.migration_err(None)?;
                Ok(())
            }
            MigrationKind::Code { program } => run_code_migration(program, "down").await,
        }
    }

    /// Invoke a code migration as an out-of-process program: `<program> <up|down>
    /// <DATABASE_URL>`. The child is expected to connect, run its own statements against
    /// the same database and exit zero on success — see DESIGN.md for why this replaces
    /// the source's dynamic module import.
    async fn run_code_migration(program: &std::path::Path, direction: &str) -> Result<(), Error> {
        let database_url = std::env::var("DATABASE_URL").unwrap_or_default();
        let status = tokio::process::Command::new(program)
            .arg(direction)
            .arg(database_url)
            .status()
            .await
            .map_err(|e| Error::new(Kind::ReadError(program.to_path_buf(), e), None))?;

        if !status.success() {
            return Err(Error::new(
                Kind::DatabaseError(Box::new(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("code migration {} exited with {status}", program.display()),
                ))),
                None,
            ));
        }
        Ok(())
    }

    /// Pre-run integrity scan: fetch the current ledger and verify it against the
    /// migrations found on disk before any migration in this call is applied.
    pub async fn scan_integrity(
        pool: &PgPool,
        table_name: &str,
        files: &[MigrationFile],
    ) -> Result<Vec<LedgerRow>, Error> {
        let applied = ledger::list_applied(pool, table_name).await?;
        verify_checksums(files, &applied)?;
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MigrationId, MigrationKind};
    use std::path::PathBuf;
    use time::OffsetDateTime;

    fn file(id: &str, name: &str) -> MigrationFile {
        MigrationFile {
            id: MigrationId::parse(id).unwrap(),
            name: name.into(),
            path: PathBuf::new(),
            kind: MigrationKind::Sql {
                up: "select 1;".into(),
                down: "select 1;".into(),
            },
            checksum: crate::migration::checksum_of(b"select 1;"),
        }
    }

    fn row(id: &str, checksum: &str) -> LedgerRow {
        LedgerRow {
            id: MigrationId::parse(id).unwrap(),
            checksum: checksum.into(),
            migration_name: "x".into(),
            started_at: OffsetDateTime::UNIX_EPOCH,
            finished_at: Some(OffsetDateTime::UNIX_EPOCH),
            rolled_back_at: None,
            applied_steps_count: 1,
            logs: None,
        }
    }

    #[test]
    fn checksum_tampering_aborts_the_whole_run() {
        let f = file("20240101000000", "init");
        let mismatched = row("20240101000000", "deadbeef");
        let err = verify_checksums(&[f], &[mismatched]).unwrap_err();
        assert!(matches!(err.kind(), Kind::ChecksumMismatch(_)));
    }

    #[test]
    fn matching_checksum_passes() {
        let f = file("20240101000000", "init");
        let matching = row("20240101000000", &f.checksum);
        assert!(verify_checksums(&[f], &[matching]).is_ok());
    }

    #[test]
    fn pending_excludes_applied_and_sorts_ascending() {
        let a = file("20240102000000", "second");
        let b = file("20240101000000", "first");
        let applied = vec![row("20240101000000", &b.checksum)];
        let pending = compute_pending(&[a.clone(), b], &applied);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a.id);
    }

    #[test]
    fn down_set_is_last_n_in_reverse_order() {
        let rows = vec![
            row("20240101000000", "a"),
            row("20240102000000", "b"),
            row("20240103000000", "c"),
        ];
        let down_set = compute_down_set(&rows, 2);
        assert_eq!(down_set[0].id.as_str(), "20240103000000");
        assert_eq!(down_set[1].id.as_str(), "20240102000000");
    }
}
