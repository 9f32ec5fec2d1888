//! SQLite-backed metadata store for ingested message records.

use std::path::{Path, PathBuf};
use std::time::Duration;

use inboxmeta_core::{MessageRecord, SenderAggregate};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "inboxmeta-storage";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECTIONS: u32 = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("opening metadata store {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("metadata store query failed: {0}")]
    Query(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable `id -> sender` table. Cloning shares the underlying pool.
///
/// All writes go through single transactions, so concurrent ingest and purge
/// runs are serialized by SQLite's writer lock and the primary key on `id`
/// keeps rows unique.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl MetadataStore {
    /// Opens the store file, creating it if missing. Does not create the schema;
    /// call [`MetadataStore::initialize`] for that.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;

        Ok(Self { pool, path })
    }

    /// Opens the store and ensures the schema exists.
    pub async fn open_initialized(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self::open(path).await?;
        store.initialize().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn initialize(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id     TEXT PRIMARY KEY,
                sender TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        info!(path = %self.path.display(), "metadata store initialized");
        Ok(())
    }

    /// Inserts all records in one transaction, skipping ids that already exist.
    /// Returns the number of rows that were actually new.
    pub async fn bulk_insert(&self, records: &[MessageRecord]) -> StoreResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in records {
            let result = sqlx::query("INSERT OR IGNORE INTO messages (id, sender) VALUES (?, ?)")
                .bind(&record.id)
                .bind(&record.sender)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        debug!(submitted = records.len(), inserted, "bulk insert committed");
        Ok(inserted)
    }

    /// Senders ranked by message count, highest first. Equal counts keep the
    /// order in which the sender was first stored.
    pub async fn top_senders(&self, limit: usize) -> StoreResult<Vec<SenderAggregate>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.sender_counts_limited(limit).await
    }

    /// Every sender with its count, in the same order as [`Self::top_senders`].
    pub async fn sender_counts(&self) -> StoreResult<Vec<SenderAggregate>> {
        // SQLite treats a negative LIMIT as unbounded.
        self.sender_counts_limited(-1).await
    }

    async fn sender_counts_limited(&self, limit: i64) -> StoreResult<Vec<SenderAggregate>> {
        let rows = sqlx::query(
            r#"
            SELECT sender, COUNT(*) AS cnt, MIN(rowid) AS first_seen
              FROM messages
             GROUP BY sender
             ORDER BY cnt DESC, first_seen ASC
             LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let count: i64 = row.try_get("cnt")?;
            out.push(SenderAggregate {
                sender: row.try_get("sender")?,
                count: count.max(0) as u64,
            });
        }
        Ok(out)
    }

    /// Ids stored for an exact sender string, in insertion order.
    pub async fn ids_for_sender(&self, sender: &str) -> StoreResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM messages WHERE sender = ? ORDER BY rowid",
        )
        .bind(sender)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Removes the given ids in one transaction. Unknown ids are ignored.
    pub async fn delete_by_ids(&self, ids: &[String]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for id in ids {
            let result = sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;

        debug!(requested = ids.len(), removed, "delete committed");
        Ok(removed)
    }

    pub async fn count(&self) -> StoreResult<u64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    pub async fn contains(&self, id: &str) -> StoreResult<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
