//! SQLite-backed persistence shared by the store, queue and lock.
//!
//! All three collaborators live in one database so a worker process only
//! needs `DATABASE_URL` to join a deployment. Timestamps are stored as unix
//! milliseconds; counts as `INTEGER`.

use super::Store;
use crate::{
    Error, Result,
    model::{
        Calculation, CalculationRef, CalculationResult, Chunk, ChunkStatus, NewCalculation,
        Status,
    },
    sampler::Sample,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core::{str::FromStr, time::Duration};
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS calculations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        total_points INTEGER NOT NULL,
        mode TEXT NOT NULL DEFAULT 'single',
        status TEXT NOT NULL DEFAULT 'pending',
        result_pi REAL,
        result_inside INTEGER,
        result_total INTEGER,
        duration_ms INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS calculations_status_created ON calculations (status, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS calculation_chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        calculation_id INTEGER NOT NULL REFERENCES calculations (id) ON DELETE CASCADE,
        chunk_index INTEGER NOT NULL,
        total_points INTEGER NOT NULL,
        result_inside INTEGER,
        result_total INTEGER,
        duration_ms INTEGER,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (calculation_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        reserved_at INTEGER,
        available_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_queue_available ON jobs (queue, available_at)",
    r#"
    CREATE TABLE IF NOT EXISTS failed_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        payload TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        error TEXT NOT NULL,
        failed_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cache_locks (
        key TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
    "#,
];

/// Opens (creating if needed) the database at `url` and applies the schema.
///
/// In-memory databases are pinned to a single long-lived connection, since
/// every new SQLite connection to `:memory:` would see an empty database.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));
    let options = if in_memory {
        options
    } else {
        options.journal_mode(SqliteJournalMode::Wal)
    };

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(8)
    }
    .connect_with(options)
    .await?;

    migrate(&pool).await?;
    tracing::debug!(url, "database ready");
    Ok(pool)
}

/// Applies the schema. Idempotent thanks to `IF NOT EXISTS`.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| Error::Storage {
        context: format!("timestamp {millis} out of range"),
    })
}

pub(crate) fn to_db(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Storage {
        context: format!("{value} does not fit a database integer"),
    })
}

pub(crate) fn from_db(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Storage {
        context: format!("unexpected negative value {value}"),
    })
}

fn opt_from_db(value: Option<i64>) -> Result<Option<u64>> {
    value.map(from_db).transpose()
}

fn parse_column<T: FromStr>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|_| Error::Storage {
        context: format!("invalid value `{raw}` in column `{column}`"),
    })
}

fn calculation_from_row(row: &SqliteRow) -> Result<Calculation> {
    let uuid: String = row.try_get("uuid")?;
    Ok(Calculation {
        id: row.try_get("id")?,
        uuid: Uuid::parse_str(&uuid).map_err(|e| Error::Storage {
            context: format!("invalid uuid `{uuid}`: {e}"),
        })?,
        total_points: from_db(row.try_get("total_points")?)?,
        mode: parse_column(row, "mode")?,
        status: parse_column(row, "status")?,
        result_pi: row.try_get("result_pi")?,
        result_inside: opt_from_db(row.try_get("result_inside")?)?,
        result_total: opt_from_db(row.try_get("result_total")?)?,
        duration_ms: opt_from_db(row.try_get("duration_ms")?)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let index: i64 = row.try_get("chunk_index")?;
    Ok(Chunk {
        calculation_id: row.try_get("calculation_id")?,
        chunk_index: u32::try_from(index).map_err(|_| Error::Storage {
            context: format!("invalid chunk index {index}"),
        })?,
        total_points: from_db(row.try_get("total_points")?)?,
        result_inside: opt_from_db(row.try_get("result_inside")?)?,
        result_total: opt_from_db(row.try_get("result_total")?)?,
        duration_ms: opt_from_db(row.try_get("duration_ms")?)?,
        status: parse_column(row, "status")?,
    })
}

const CALCULATION_COLUMNS: &str = "id, uuid, total_points, mode, status, result_pi, \
     result_inside, result_total, duration_ms, created_at, updated_at";

const CHUNK_COLUMNS: &str = "calculation_id, chunk_index, total_points, result_inside, \
     result_total, duration_ms, status";

/// [`Store`] over a shared SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_calculation(&self, new: NewCalculation) -> Result<Calculation> {
        let uuid = Uuid::new_v4();
        let now = now_millis();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO calculations (uuid, total_points, mode, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(uuid.to_string())
        .bind(to_db(new.total_points)?)
        .bind(new.mode.as_str())
        .bind(Status::Running.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let timestamp = from_millis(now)?;
        Ok(Calculation {
            id,
            uuid,
            total_points: new.total_points,
            mode: new.mode,
            status: Status::Running,
            result_pi: None,
            result_inside: None,
            result_total: None,
            duration_ms: None,
            created_at: timestamp,
            updated_at: timestamp,
        })
    }

    async fn find_calculation(&self, reference: CalculationRef) -> Result<Option<Calculation>> {
        let row = match reference {
            CalculationRef::Id(id) => {
                sqlx::query(&format!(
                    "SELECT {CALCULATION_COLUMNS} FROM calculations WHERE id = ?"
                ))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            CalculationRef::Token(uuid) => {
                sqlx::query(&format!(
                    "SELECT {CALCULATION_COLUMNS} FROM calculations WHERE uuid = ?"
                ))
                .bind(uuid.to_string())
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(calculation_from_row).transpose()
    }

    async fn complete_calculation(&self, id: i64, result: CalculationResult) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE calculations SET status = ?, result_pi = ?, result_inside = ?, \
             result_total = ?, duration_ms = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(Status::Completed.as_str())
        .bind(result.pi)
        .bind(to_db(result.inside)?)
        .bind(to_db(result.total)?)
        .bind(to_db(result.duration_ms)?)
        .bind(now_millis())
        .bind(id)
        .bind(Status::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn fail_calculation(&self, id: i64) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE calculations SET status = ?, updated_at = ? \
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(Status::Failed.as_str())
        .bind(now_millis())
        .bind(id)
        .bind(Status::Pending.as_str())
        .bind(Status::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn delete_calculation(&self, id: i64) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM calculations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() == 1)
    }

    async fn create_chunks(&self, calculation_id: i64, sizes: &[u64]) -> Result<Vec<Chunk>> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(sizes.len());

        for (index, &points) in sizes.iter().enumerate() {
            let index = u32::try_from(index).map_err(|_| Error::Storage {
                context: "chunk index overflow".to_string(),
            })?;
            sqlx::query(
                "INSERT INTO calculation_chunks \
                 (calculation_id, chunk_index, total_points, status, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(calculation_id)
            .bind(i64::from(index))
            .bind(to_db(points)?)
            .bind(ChunkStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            created.push(Chunk::pending(calculation_id, index, points));
        }

        // Dropping `tx` on any early return rolls the whole batch back.
        tx.commit().await?;
        Ok(created)
    }

    async fn delete_chunks(&self, calculation_id: i64) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM calculation_chunks WHERE calculation_id = ?")
            .bind(calculation_id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    async fn find_chunk(&self, calculation_id: i64, chunk_index: u32) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM calculation_chunks \
             WHERE calculation_id = ? AND chunk_index = ?"
        ))
        .bind(calculation_id)
        .bind(i64::from(chunk_index))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn complete_chunk(
        &self,
        calculation_id: i64,
        chunk_index: u32,
        sample: Sample,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE calculation_chunks SET result_inside = ?, result_total = ?, \
             duration_ms = ?, status = ?, updated_at = ? \
             WHERE calculation_id = ? AND chunk_index = ? AND status = ?",
        )
        .bind(to_db(sample.inside)?)
        .bind(to_db(sample.total)?)
        .bind(to_db(sample.duration_ms)?)
        .bind(ChunkStatus::Completed.as_str())
        .bind(now_millis())
        .bind(calculation_id)
        .bind(i64::from(chunk_index))
        .bind(ChunkStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() == 1)
    }

    async fn chunks(&self, calculation_id: i64) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM calculation_chunks \
             WHERE calculation_id = ? ORDER BY chunk_index"
        ))
        .bind(calculation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn recent_completed(&self, limit: u32) -> Result<Vec<Calculation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CALCULATION_COLUMNS} FROM calculations WHERE status = ? \
             ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(Status::Completed.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(calculation_from_row).collect()
    }
}
