use siphasher::sip::SipHasher13;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Fixed advisory-lock key derived from the literal string `"prisma-migrations-lock"`,
/// the same `SipHasher13` the teacher uses for migration checksums (kept stable across
/// releases, unlike `DefaultHasher`), cast down to the signed 64-bit key Postgres'
/// advisory lock functions expect.
pub fn lock_key() -> i64 {
    let mut hasher = SipHasher13::new();
    "prisma-migrations-lock".hash(&mut hasher);
    hasher.finish() as i64
}

/// Default lock acquisition timeout, per spec.md §4.3.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval used by `acquire` while waiting for the lock.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// A fallback-table row is considered abandoned once older than this multiple of the
/// caller's timeout.
pub const ABANDONED_FACTOR: u32 = 2;

#[cfg(feature = "postgres")]
pub mod pg {
    use std::time::{Duration, Instant};

    use sqlx::pool::PoolConnection;
    use sqlx::{PgPool, Postgres, Row};
    use tokio::time::sleep;

    use super::{ABANDONED_FACTOR, POLL_INTERVAL};
    use crate::error::{Error, Kind, WrapMigrationError};

    /// An opaque handle proving the holder currently owns the migration lock.
    ///
    /// `pg_advisory_lock`/`pg_advisory_unlock` are session-scoped: the lock lives on
    /// whichever physical connection took it, not on the key itself. A session-scoped
    /// acquire/release pair must therefore run on the *same* connection, never on two
    /// connections drawn independently from the pool. This token pins the connection it
    /// was acquired on (`None` for the sentinel-table fallback path, which has no
    /// session affinity) and carries it through to `release`.
    ///
    /// Dropping a `LockToken` without calling [`PgLockManager::release`] returns the
    /// pinned connection to the pool still holding the advisory lock; the lock is only
    /// freed once that connection's session ends (pool shutdown or `DISCARD ALL`),
    /// unlike the teacher's `Transaction`, whose `Drop` rolls back for free.
    #[derive(Debug)]
    pub struct LockToken {
        key: i64,
        conn: Option<PoolConnection<Postgres>>,
    }

    /// Session-scoped advisory lock manager backed by `pg_advisory_lock`, with the
    /// sentinel-table CAS fallback from spec.md §4.3 for backends that can't hold a
    /// session-scoped lock through a pool (e.g. when `pool_max_connections` rotates the
    /// underlying session). This implementation always uses the advisory-lock path;
    /// the fallback table is provided for hosts that front the pool with a connection
    /// proxy that doesn't preserve session state, and is exercised by
    /// `try_acquire_fallback`/`release_fallback`.
    pub struct PgLockManager {
        pool: PgPool,
        key: i64,
        table_name: String,
    }

    impl PgLockManager {
        pub fn new(pool: PgPool, key: i64, table_name: impl Into<String>) -> Self {
            PgLockManager {
                pool,
                key,
                table_name: table_name.into(),
            }
        }

        /// Block until the lock is obtained or `timeout` elapses.
        pub async fn acquire(&self, timeout: Duration) -> Result<LockToken, Error> {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(token) = self.try_acquire().await? {
                    return Ok(token);
                }
                if Instant::now() >= deadline {
                    return Err(Error::new(
                        Kind::LockAcquisitionTimeout(timeout.as_millis() as u64),
                        None,
                    ));
                }
                sleep(POLL_INTERVAL).await;
            }
        }

        /// Non-blocking attempt; `None` if another holder currently has the lock.
        ///
        /// Draws a single connection from the pool and keeps it for the lifetime of the
        /// `LockToken` so the matching `release` call unlocks the same session that
        /// locked it — `pg_try_advisory_lock`/`pg_advisory_unlock` only agree with each
        /// other on one connection, not across the pool.
        pub async fn try_acquire(&self) -> Result<Option<LockToken>, Error> {
            let mut conn = self.pool.acquire().await.migration_err(None)?;
            let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
                .bind(self.key)
                .fetch_one(&mut *conn)
                .await
                .migration_err(None)?;
            let acquired: bool = row.get("acquired");
            Ok(acquired.then_some(LockToken { key: self.key, conn: Some(conn) }))
        }

        /// Idempotent: releasing a key this session doesn't hold is a no-op, matching
        /// `pg_advisory_unlock`'s own semantics.
        pub async fn release(&self, mut token: LockToken) -> Result<(), Error> {
            match token.conn.take() {
                Some(mut conn) => {
                    sqlx::query("SELECT pg_advisory_unlock($1)")
                        .bind(token.key)
                        .execute(&mut *conn)
                        .await
                        .migration_err(None)?;
                }
                None => {
                    sqlx::query("SELECT pg_advisory_unlock($1)")
                        .bind(token.key)
                        .execute(&self.pool)
                        .await
                        .migration_err(None)?;
                }
            }
            Ok(())
        }

        /// A single-argument bigint advisory lock is recorded in `pg_locks` split across
        /// `classid` (high 32 bits) and `objid` (low 32 bits) with `objsubid = 1`; a bare
        /// `objid = key` match would only ever be correct for keys that fit in 32 bits.
        pub async fn is_held(&self) -> Result<bool, Error> {
            let classid = (self.key >> 32) as i32;
            let objid = (self.key & 0xffff_ffff) as i32;
            let row = sqlx::query(
                "SELECT EXISTS(SELECT 1 FROM pg_locks \
                 WHERE locktype = 'advisory' AND classid = $1 AND objid = $2 AND objsubid = 1) AS held",
            )
            .bind(classid)
            .bind(objid)
            .fetch_one(&self.pool)
            .await
            .migration_err(None)?;
            Ok(row.get("held"))
        }

        /// `INSERT ... ON CONFLICT DO NOTHING` fallback for backends without a usable
        /// session-scoped advisory lock. Stale rows older than
        /// `ABANDONED_FACTOR * timeout` are garbage-collected before the insert attempt.
        pub async fn try_acquire_fallback(&self, timeout: Duration) -> Result<Option<LockToken>, Error> {
            let ensure_table = format!(
                "CREATE TABLE IF NOT EXISTS {}(id INT PRIMARY KEY, acquired_at TIMESTAMPTZ)",
                self.table_name
            );
            sqlx::query(&ensure_table).execute(&self.pool).await.migration_err(None)?;

            let stale_before = timeout * ABANDONED_FACTOR;
            let gc = format!(
                "DELETE FROM {} WHERE id = 1 AND acquired_at < now() - $1::interval",
                self.table_name
            );
            sqlx::query(&gc)
                .bind(format!("{} seconds", stale_before.as_secs()))
                .execute(&self.pool)
                .await
                .migration_err(None)?;

            let insert = format!(
                "INSERT INTO {}(id, acquired_at) VALUES (1, now()) ON CONFLICT DO NOTHING",
                self.table_name
            );
            let result = sqlx::query(&insert).execute(&self.pool).await.migration_err(None)?;
            Ok((result.rows_affected() > 0).then_some(LockToken { key: self.key, conn: None }))
        }

        pub async fn release_fallback(&self, _token: LockToken) -> Result<(), Error> {
            let sql = format!("DELETE FROM {} WHERE id = 1", self.table_name);
            sqlx::query(&sql).execute(&self.pool).await.migration_err(None)?;
            Ok(())
        }
    }
}
