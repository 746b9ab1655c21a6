use time::OffsetDateTime;

use crate::ledger::LedgerRow;
use crate::migration::MigrationFile;

/// The migrations applied (or would-be-applied) during one call, returned alongside
/// an [`Error`](crate::Error) so a caller can see what already committed.
#[derive(Clone, Debug, Default)]
pub struct Report {
    applied_migrations: Vec<MigrationFile>,
}

impl Report {
    pub(crate) fn new(applied_migrations: Vec<MigrationFile>) -> Report {
        Report { applied_migrations }
    }

    pub fn applied_migrations(&self) -> &[MigrationFile] {
        &self.applied_migrations
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationState {
    Applied,
    Pending,
}

#[derive(Clone, Debug)]
pub struct StatusEntry {
    pub id: crate::migration::MigrationId,
    pub name: String,
    pub state: MigrationState,
    pub applied_at: Option<OffsetDateTime>,
}

/// Result of `upIfNotLocked`: the lock may be held by another instance, in which case
/// no work is attempted and no error is raised, per spec.md §4.5.
#[derive(Clone, Debug)]
pub struct UpIfNotLockedOutcome {
    pub ran: bool,
    pub count: usize,
    pub reason: Option<String>,
}

/// Combined result of `refresh`: the count rolled back, then the count (re)applied.
#[derive(Clone, Copy, Debug)]
pub struct RefreshOutcome {
    pub down: usize,
    pub up: usize,
}

/// Union of on-disk migrations and ledger rows into the `status()` view, ordered by id.
pub(crate) fn compute_status(files: &[MigrationFile], applied: &[LedgerRow]) -> Vec<StatusEntry> {
    let mut ids: std::collections::BTreeSet<&crate::migration::MigrationId> =
        files.iter().map(|f| &f.id).collect();
    ids.extend(applied.iter().map(|r| &r.id));

    ids.into_iter()
        .map(|id| {
            let row = applied.iter().find(|r| &r.id == id);
            let file = files.iter().find(|f| &f.id == id);
            StatusEntry {
                id: id.clone(),
                name: file
                    .map(|f| f.name.clone())
                    .or_else(|| row.map(|r| r.migration_name.clone()))
                    .unwrap_or_default(),
                state: if row.is_some() {
                    MigrationState::Applied
                } else {
                    MigrationState::Pending
                },
                applied_at: row.map(|r| r.finished_at.unwrap_or(r.started_at)),
            }
        })
        .collect()
}

#[cfg(feature = "postgres")]
pub mod pg {
    use std::path::PathBuf;

    use sqlx::PgPool;

    use super::{compute_status, RefreshOutcome, Report, StatusEntry, UpIfNotLockedOutcome};
    use crate::config::Settings;
    use crate::error::Error;
    use crate::executor::{compute_down_set, compute_pending};
    use crate::ledger::{pg as ledger, LedgerRow};
    use crate::lock::lock_key;
    use crate::lock::pg::{LockToken, PgLockManager};
    use crate::migration::MigrationFile;
    use crate::{executor::pg as exec, reader};

    /// Orchestrates the Reader, Ledger Store, Lock Manager and Executor to implement
    /// the public migration operations. Holds no ambient state beyond what's passed to
    /// its constructor.
    pub struct Runner {
        pool: PgPool,
        settings: Settings,
        lock: PgLockManager,
    }

    impl Runner {
        pub fn new(pool: PgPool, settings: Settings) -> Runner {
            let lock = PgLockManager::new(pool.clone(), lock_key(), format!("{}_lock", settings.table_name()));
            Runner { pool, settings, lock }
        }

        fn files(&self) -> Result<Vec<MigrationFile>, Error> {
            reader::read_migrations(self.settings.migrations_dir())
        }

        async fn applied_rows(&self) -> Result<Vec<LedgerRow>, Error> {
            ledger::ensure_table(&self.pool, self.settings.table_name()).await?;
            ledger::list_applied(&self.pool, self.settings.table_name()).await
        }

        /// `{id, name, state, appliedAt?}` for the union of files and ledger.
        pub async fn status(&self) -> Result<Vec<StatusEntry>, Error> {
            let files = self.files()?;
            let applied = self.applied_rows().await?;
            Ok(compute_status(&files, &applied))
        }

        /// On-disk migrations not yet in the ledger, ascending by id.
        pub async fn pending(&self) -> Result<Vec<MigrationFile>, Error> {
            let files = self.files()?;
            let applied = self.applied_rows().await?;
            Ok(compute_pending(&files, &applied))
        }

        pub async fn applied(&self) -> Result<Vec<LedgerRow>, Error> {
            self.applied_rows().await
        }

        /// Last applied row by `started_at`, or `None` if nothing has been applied.
        pub async fn latest(&self) -> Result<Option<LedgerRow>, Error> {
            Ok(self.applied_rows().await?.into_iter().last())
        }

        /// Apply up to `steps` pending migrations (all if `None`), in id order.
        pub async fn up(&self, steps: Option<usize>) -> Result<usize, Error> {
            let token = self.lock.acquire(self.settings.lock_timeout()).await?;
            let result = self.up_locked(steps).await;
            self.release(token).await;
            result
        }

        /// As `up`, but returns immediately without waiting if another instance holds
        /// the lock, instead of raising an error.
        pub async fn up_if_not_locked(&self, steps: Option<usize>) -> Result<UpIfNotLockedOutcome, Error> {
            match self.lock.try_acquire().await? {
                None => Ok(UpIfNotLockedOutcome {
                    ran: false,
                    count: 0,
                    reason: Some("Another instance is running migrations".to_string()),
                }),
                Some(token) => {
                    let result = self.up_locked(steps).await;
                    self.release(token).await;
                    let count = result?;
                    Ok(UpIfNotLockedOutcome { ran: true, count, reason: None })
                }
            }
        }

        async fn up_locked(&self, steps: Option<usize>) -> Result<usize, Error> {
            let files = self.files()?;
            ledger::ensure_table(&self.pool, self.settings.table_name()).await?;
            let applied = exec::scan_integrity(&self.pool, self.settings.table_name(), &files).await?;

            let mut pending = compute_pending(&files, &applied);
            if let Some(n) = steps {
                pending.truncate(n);
            }

            let mut applied_this_run = Vec::new();
            for migration in &pending {
                if let Err(e) = exec::up(&self.pool, self.settings.table_name(), migration).await {
                    return Err(attach_report(e, applied_this_run));
                }
                applied_this_run.push(migration.clone());
            }
            Ok(applied_this_run.len())
        }

        /// Roll back the last `steps` applied migrations, most-recent-id first.
        pub async fn down(&self, steps: usize) -> Result<usize, Error> {
            let token = self.lock.acquire(self.settings.lock_timeout()).await?;
            let result = self.down_locked(steps, false).await;
            self.release(token).await;
            result
        }

        async fn down_locked(&self, steps: usize, force: bool) -> Result<usize, Error> {
            let files = self.files()?;
            let applied = self.applied_rows().await?;
            let down_set = compute_down_set(&applied, steps);

            let mut rolled_back = 0usize;
            for row in &down_set {
                let migration = files.iter().find(|f| f.id == row.id).cloned().unwrap_or_else(|| {
                    MigrationFile {
                        id: row.id.clone(),
                        name: row.migration_name.clone(),
                        path: PathBuf::new(),
                        kind: crate::migration::MigrationKind::Sql {
                            up: String::new(),
                            down: String::new(),
                        },
                        checksum: row.checksum.clone(),
                    }
                });
                exec::down(&self.pool, self.settings.table_name(), &migration, force).await?;
                rolled_back += 1;
            }
            Ok(rolled_back)
        }

        /// Roll back every applied migration.
        pub async fn reset(&self) -> Result<usize, Error> {
            let token = self.lock.acquire(self.settings.lock_timeout()).await?;
            let applied = self.applied_rows().await;
            let result = match applied {
                Ok(rows) => self.down_locked(rows.len(), false).await,
                Err(e) => Err(e),
            };
            self.release(token).await;
            result
        }

        /// `reset()` followed by `up()`, returning the count (re)applied.
        pub async fn fresh(&self) -> Result<usize, Error> {
            self.reset().await?;
            self.up(None).await
        }

        /// Same as `fresh`, reporting both the down and up counts.
        pub async fn refresh(&self) -> Result<RefreshOutcome, Error> {
            let down = self.reset().await?;
            let up = self.up(None).await?;
            Ok(RefreshOutcome { down, up })
        }

        /// The migrations the next `up(steps)` would apply, without running anything
        /// and without acquiring the lock.
        pub async fn dry_run(&self, steps: Option<usize>) -> Result<Vec<MigrationFile>, Error> {
            let files = self.files()?;
            ledger::ensure_table(&self.pool, self.settings.table_name()).await?;
            let applied = exec::scan_integrity(&self.pool, self.settings.table_name(), &files).await?;
            let mut pending = compute_pending(&files, &applied);
            if let Some(n) = steps {
                pending.truncate(n);
            }
            Ok(pending)
        }

        async fn release(&self, token: LockToken) {
            if let Err(e) = self.lock.release(token).await {
                log::error!("failed to release migration lock: {e}");
            }
        }
    }

    fn attach_report(err: Error, applied_this_run: Vec<MigrationFile>) -> Error {
        err.with_report(Report::new(applied_this_run))
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
            kind: MigrationKind::Sql { up: String::new(), down: String::new() },
            checksum: "chk".into(),
        }
    }

    fn row(id: &str, name: &str) -> LedgerRow {
        LedgerRow {
            id: MigrationId::parse(id).unwrap(),
            checksum: "chk".into(),
            migration_name: name.into(),
            started_at: OffsetDateTime::UNIX_EPOCH,
            finished_at: Some(OffsetDateTime::UNIX_EPOCH),
            rolled_back_at: None,
            applied_steps_count: 1,
            logs: None,
        }
    }

    #[test]
    fn status_unions_files_and_ledger() {
        let files = vec![file("20240101000000", "init"), file("20240102000000", "seed")];
        let applied = vec![row("20240101000000", "init")];
        let status = compute_status(&files, &applied);

        assert_eq!(status.len(), 2);
        assert_eq!(status[0].state, MigrationState::Applied);
        assert_eq!(status[1].state, MigrationState::Pending);
    }

    #[test]
    fn status_includes_ledger_rows_missing_from_disk() {
        let files = vec![file("20240101000000", "init")];
        let applied = vec![row("20240101000000", "init"), row("20240102000000", "gone")];
        let status = compute_status(&files, &applied);

        assert_eq!(status.len(), 2);
        let missing = status.iter().find(|e| e.id.as_str() == "20240102000000").unwrap();
        assert_eq!(missing.name, "gone");
        assert_eq!(missing.state, MigrationState::Applied);
    }
}
