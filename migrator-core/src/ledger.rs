use time::OffsetDateTime;

use crate::migration::MigrationId;

/// A row of the ledger table, as read back from the database.
///
/// Applied means `rolled_back_at IS NULL`; this design mandates delete-on-rollback
/// (see DESIGN.md), so in practice a row only ever shows up with `rolled_back_at` unset,
/// but the field is kept so tables written by a prior delete-vs-flag implementation
/// remain readable.
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerRow {
    pub id: MigrationId,
    pub checksum: String,
    pub migration_name: String,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub rolled_back_at: Option<OffsetDateTime>,
    pub applied_steps_count: i32,
    pub logs: Option<String>,
}

impl LedgerRow {
    pub fn is_applied(&self) -> bool {
        self.rolled_back_at.is_none()
    }
}

#[cfg(feature = "postgres")]
pub mod pg {
    use sqlx::PgExecutor;

    use super::LedgerRow;
    use crate::error::{Error, Kind, WrapMigrationError};
    use crate::migration::MigrationId;

    /// Quote an identifier for use as a table name.
    ///
    /// `table_name` is operator-controlled configuration, not untrusted user input, but
    /// it still flows into raw SQL, so it's quoted defensively the way a hand-written
    /// schema-history table name would be in any driver that accepts one.
    fn quote_ident(name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// `CREATE TABLE IF NOT EXISTS` for the ledger, matching the column set in the data
    /// model. Idempotent, safe to call at the top of every mutating operation.
    pub async fn ensure_table<'e, E>(executor: E, table_name: &str) -> Result<(), Error>
    where
        E: PgExecutor<'e>,
    {
        let ident = quote_ident(table_name);
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {ident} (
                id VARCHAR PRIMARY KEY,
                checksum VARCHAR NOT NULL,
                finished_at TIMESTAMPTZ,
                migration_name VARCHAR NOT NULL,
                logs TEXT,
                rolled_back_at TIMESTAMPTZ,
                started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                applied_steps_count INT NOT NULL DEFAULT 0
            )"
        );
        sqlx::query(&sql).execute(executor).await.migration_err(None)?;
        Ok(())
    }

    fn row_from(row: sqlx::postgres::PgRow) -> Result<LedgerRow, Error> {
        use sqlx::Row;
        let id_str: String = row
            .try_get("id")
            .map_err(|e| Error::new(Kind::LedgerCorrupt(format!("missing id column: {e}")), None))?;
        let id = MigrationId::parse(&id_str)
            .ok_or_else(|| Error::new(Kind::LedgerCorrupt(format!("id {id_str:?} is not 14 digits")), None))?;
        let started_at = row
            .try_get("started_at")
            .map_err(|e| Error::new(Kind::LedgerCorrupt(format!("missing started_at column: {e}")), None))?;
        Ok(LedgerRow {
            id,
            checksum: row.try_get("checksum").unwrap_or_default(),
            migration_name: row.try_get("migration_name").unwrap_or_default(),
            started_at,
            finished_at: row.try_get("finished_at").ok(),
            rolled_back_at: row.try_get("rolled_back_at").ok(),
            applied_steps_count: row.try_get("applied_steps_count").unwrap_or_default(),
            logs: row.try_get("logs").ok(),
        })
    }

    /// Rows with `rolled_back_at IS NULL`, ordered by `started_at` ascending.
    pub async fn list_applied<'e, E>(executor: E, table_name: &str) -> Result<Vec<LedgerRow>, Error>
    where
        E: PgExecutor<'e>,
    {
        let ident = quote_ident(table_name);
        let sql = format!(
            "SELECT id, checksum, migration_name, started_at, finished_at, rolled_back_at, \
             applied_steps_count, logs FROM {ident} WHERE rolled_back_at IS NULL ORDER BY started_at ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(executor).await.migration_err(None)?;
        rows.into_iter().map(row_from).collect()
    }

    pub async fn is_applied<'e, E>(executor: E, table_name: &str, id: &MigrationId) -> Result<bool, Error>
    where
        E: PgExecutor<'e>,
    {
        use sqlx::Row;
        let ident = quote_ident(table_name);
        let sql = format!("SELECT 1 FROM {ident} WHERE id = $1 AND rolled_back_at IS NULL");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(executor)
            .await
            .migration_err(None)?;
        Ok(row.map(|r| r.try_get::<i32, _>(0).is_ok()).unwrap_or(false))
    }

    pub async fn get_checksum<'e, E>(
        executor: E,
        table_name: &str,
        id: &MigrationId,
    ) -> Result<Option<String>, Error>
    where
        E: PgExecutor<'e>,
    {
        use sqlx::Row;
        let ident = quote_ident(table_name);
        let sql = format!("SELECT checksum FROM {ident} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(executor)
            .await
            .migration_err(None)?;
        Ok(row.map(|r| r.get::<String, _>("checksum")))
    }

    /// Insert a `started_at = now(), finished_at = null` row. Errors if `id` already has
    /// a row (a caller retrying a `--force` repair is expected to delete it first).
    pub async fn insert_start<'e, E>(
        executor: E,
        table_name: &str,
        id: &MigrationId,
        name: &str,
        checksum: &str,
    ) -> Result<(), Error>
    where
        E: PgExecutor<'e>,
    {
        let ident = quote_ident(table_name);
        let sql = format!(
            "INSERT INTO {ident} (id, checksum, migration_name, started_at, applied_steps_count) \
             VALUES ($1, $2, $3, now(), 0)"
        );
        sqlx::query(&sql)
            .bind(id.as_str())
            .bind(checksum)
            .bind(name)
            .execute(executor)
            .await
            .migration_err(None)?;
        Ok(())
    }

    pub async fn mark_finished<'e, E>(executor: E, table_name: &str, id: &MigrationId) -> Result<(), Error>
    where
        E: PgExecutor<'e>,
    {
        let ident = quote_ident(table_name);
        let sql = format!(
            "UPDATE {ident} SET finished_at = now(), applied_steps_count = 1 WHERE id = $1"
        );
        sqlx::query(&sql).bind(id.as_str()).execute(executor).await.migration_err(None)?;
        Ok(())
    }

    pub async fn delete_row<'e, E>(executor: E, table_name: &str, id: &MigrationId) -> Result<(), Error>
    where
        E: PgExecutor<'e>,
    {
        let ident = quote_ident(table_name);
        let sql = format!("DELETE FROM {ident} WHERE id = $1");
        sqlx::query(&sql).bind(id.as_str()).execute(executor).await.migration_err(None)?;
        Ok(())
    }
}
