//! PostgreSQL queue backend.
//!
//! The claim runs `SELECT ... FOR UPDATE` and the `delivered_at` stamp in one
//! transaction, so two consumers never receive the same row inside the
//! redeliver window. The lock is a plain `FOR UPDATE`: a second consumer waits
//! for the first to commit instead of skipping ahead.
//!
//! With `use_notify`, one background task per backend holds a `LISTEN` on the
//! queue channel and wakes every idle consumer when a write is announced. The
//! task keeps a single pooled connection for the backend's lifetime; idle waits
//! themselves never take a connection.

use super::{Availability, NewRow, PendingKey, QueueBackend, SchemaManager, StoredRow};
use crate::config::TransportConfig;
use crate::error::StoreError;
use crate::message::RowId;
use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const LISTEN_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Column list shared by every row-returning query
const ROW_COLUMNS: &str = "m.id, m.dedup_key, m.encoded_payload, m.headers, m.provider_name, \
    m.template_name, m.handled, m.push_sent, m.email_sent, m.created_at, m.available_at, \
    m.delivered_at";

/// Eligibility predicate; binds `$1` redeliver cutoff, `$2` now, `$3` provider, `$4` template
const AVAILABLE_PREDICATE: &str = "m.handled = FALSE \
    AND m.available_at <= $2 \
    AND (m.delivered_at IS NULL OR m.delivered_at < $1) \
    AND m.provider_name IS NOT DISTINCT FROM $3 \
    AND m.template_name IS NOT DISTINCT FROM $4";

/// Background `LISTEN` loop, stopped when the last backend clone goes away
struct ListenerTask(JoinHandle<()>);

impl Drop for ListenerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Queue table stored in PostgreSQL
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    schema: SchemaManager,
    notify_channel: Option<String>,
    wakeup: Arc<Notify>,
    listener: Arc<OnceLock<ListenerTask>>,
}

impl PostgresBackend {
    /// Wrap an existing pool. The listener starts on the first idle wait.
    pub fn new(pool: PgPool, config: &TransportConfig) -> Self {
        Self {
            pool,
            schema: SchemaManager::new(config.table_name.clone()),
            notify_channel: config.use_notify.then(|| config.notify_channel()),
            wakeup: Arc::new(Notify::new()),
            listener: Arc::new(OnceLock::new()),
        }
    }

    /// Open a connection pool for `url` and wrap it
    pub async fn connect(url: &str, config: &TransportConfig) -> Result<Self, StoreError> {
        info!(store = %config.store.redacted(), "Connecting to queue database");

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await?;

        let backend = Self::new(pool, config);
        backend.ensure_listener();
        Ok(backend)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self) -> &str {
        self.schema.table()
    }

    /// Start the shared listener if notifications are enabled; no-op afterwards
    fn ensure_listener(&self) {
        let Some(channel) = &self.notify_channel else {
            return;
        };

        self.listener.get_or_init(|| {
            ListenerTask(tokio::spawn(listen_loop(
                self.pool.clone(),
                channel.clone(),
                Arc::clone(&self.wakeup),
            )))
        });
    }

    /// Map driver errors onto the store's error kinds
    fn classify(&self, err: sqlx::Error) -> StoreError {
        if let Some(db_err) = err.as_database_error() {
            match db_err.code().as_deref() {
                // undefined_table
                Some("42P01") => return StoreError::table_not_found(self.table()),
                // serialization_failure, deadlock_detected, lock_not_available
                Some("40001") | Some("40P01") | Some("55P03") => {
                    return StoreError::retryable(db_err.message().to_string())
                }
                _ => {}
            }
        }

        if matches!(err, sqlx::Error::PoolTimedOut) {
            return StoreError::retryable("timed out acquiring a database connection");
        }
        StoreError::Database(err)
    }

    async fn notify(&self) {
        let Some(channel) = &self.notify_channel else {
            return;
        };

        // Consumers fall back to their idle timeout if the wakeup is lost.
        if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
            .bind(channel)
            .execute(&self.pool)
            .await
        {
            warn!(channel = %channel, error = %e, "Failed to notify idle consumers");
        }
    }

    async fn claim_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        filter: &Availability,
    ) -> Result<Option<StoredRow>, sqlx::Error> {
        let select = format!(
            "SELECT {ROW_COLUMNS} FROM {table} m \
             WHERE {AVAILABLE_PREDICATE} \
             AND m.push_sent = FALSE AND m.email_sent = FALSE \
             ORDER BY m.available_at ASC \
             LIMIT 1 \
             FOR UPDATE",
            table = self.table()
        );

        let row = sqlx::query_as::<_, StoredRow>(&select)
            .bind(filter.redeliver_before)
            .bind(filter.now)
            .bind(&filter.provider_name)
            .bind(&filter.template_name)
            .fetch_optional(tx.as_mut())
            .await?;

        let Some(mut row) = row else {
            return Ok(None);
        };

        let stamp = format!(
            "UPDATE {table} SET delivered_at = $1 WHERE id = $2",
            table = self.table()
        );
        sqlx::query(&stamp)
            .bind(filter.now)
            .bind(row.id)
            .execute(tx.as_mut())
            .await?;

        row.delivered_at = Some(filter.now);
        Ok(Some(row))
    }
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("table", &self.table())
            .field("notify_channel", &self.notify_channel)
            .field("listening", &self.listener.get().is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl QueueBackend for PostgresBackend {
    #[instrument(skip(self), fields(table = %self.table()))]
    async fn create_table(&self) -> Result<(), StoreError> {
        for statement in self.schema.create_statements() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| self.classify(e))?;
        }
        Ok(())
    }

    async fn find_pending(&self, key: &PendingKey) -> Result<Option<RowId>, StoreError> {
        let sql = format!(
            "SELECT m.id FROM {table} m \
             WHERE m.dedup_key = $1 \
             AND m.template_name IS NOT DISTINCT FROM $2 \
             AND m.handled = FALSE \
             ORDER BY m.id ASC \
             LIMIT 1",
            table = self.table()
        );

        let id = sqlx::query_scalar::<_, i64>(&sql)
            .bind(key.dedup_key.as_str())
            .bind(&key.template_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;

        Ok(id.map(RowId::new))
    }

    async fn insert(&self, row: &NewRow) -> Result<RowId, StoreError> {
        let sql = format!(
            "INSERT INTO {table} \
             (dedup_key, encoded_payload, headers, provider_name, template_name, \
              handled, created_at, available_at) \
             VALUES ($1, $2, $3, $4, $5, FALSE, $6, $7) \
             RETURNING id",
            table = self.table()
        );

        let id = sqlx::query_scalar::<_, i64>(&sql)
            .bind(row.dedup_key.as_str())
            .bind(&row.encoded_payload[..])
            .bind(&row.headers)
            .bind(&row.provider_name)
            .bind(&row.template_name)
            .bind(row.created_at)
            .bind(row.available_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;

        self.notify().await;
        Ok(RowId::new(id))
    }

    async fn update(&self, id: RowId, row: &NewRow) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {table} SET \
             dedup_key = $1, encoded_payload = $2, headers = $3, provider_name = $4, \
             template_name = $5, handled = FALSE, created_at = $6, available_at = $7 \
             WHERE id = $8",
            table = self.table()
        );

        sqlx::query(&sql)
            .bind(row.dedup_key.as_str())
            .bind(&row.encoded_payload[..])
            .bind(&row.headers)
            .bind(&row.provider_name)
            .bind(&row.template_name)
            .bind(row.created_at)
            .bind(row.available_at)
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;

        self.notify().await;
        Ok(())
    }

    #[instrument(skip(self, filter), fields(table = %self.table()))]
    async fn claim_next(&self, filter: &Availability) -> Result<Option<StoredRow>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| self.classify(e))?;

        match self.claim_in(&mut tx, filter).await {
            Ok(row) => {
                tx.commit().await.map_err(|e| self.classify(e))?;
                Ok(row)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed claim also failed");
                }
                Err(self.classify(e))
            }
        }
    }

    async fn mark_handled(&self, id: RowId) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {table} SET handled = TRUE WHERE id = $1 AND handled = FALSE",
            table = self.table()
        );

        let result = sqlx::query(&sql)
            .bind(id.as_i64())
            .execute(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_available(&self, filter: &Availability) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(m.id) FROM {table} m WHERE {AVAILABLE_PREDICATE}",
            table = self.table()
        );

        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(filter.redeliver_before)
            .bind(filter.now)
            .bind(&filter.provider_name)
            .bind(&filter.template_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.classify(e))?;

        Ok(count.max(0) as u64)
    }

    async fn list_available(
        &self,
        filter: &Availability,
        limit: Option<u32>,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let mut sql = format!(
            "SELECT {ROW_COLUMNS} FROM {table} m \
             WHERE {AVAILABLE_PREDICATE} \
             ORDER BY m.available_at ASC",
            table = self.table()
        );
        if limit.is_some() {
            sql.push_str(" LIMIT $5");
        }

        let mut query = sqlx::query_as::<_, StoredRow>(&sql)
            .bind(filter.redeliver_before)
            .bind(filter.now)
            .bind(&filter.provider_name)
            .bind(&filter.template_name);
        if let Some(limit) = limit {
            query = query.bind(i64::from(limit));
        }

        query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.classify(e))
    }

    async fn find(&self, id: RowId) -> Result<Option<StoredRow>, StoreError> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM {table} m WHERE m.id = $1",
            table = self.table()
        );

        sqlx::query_as::<_, StoredRow>(&sql)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.classify(e))
    }

    async fn wait_for_work(&self, timeout: Duration) -> Result<bool, StoreError> {
        if self.notify_channel.is_none() {
            tokio::time::sleep(timeout).await;
            return Ok(false);
        }

        self.ensure_listener();
        Ok(tokio::time::timeout(timeout, self.wakeup.notified())
            .await
            .is_ok())
    }
}

/// Hold a `LISTEN` on `channel` and wake all idle consumers per notification.
///
/// Lost connections are reopened after a delay; meanwhile waits simply run to
/// their timeout.
async fn listen_loop(pool: PgPool, channel: String, wakeup: Arc<Notify>) {
    let mut reconnecting = false;

    loop {
        match open_listener(&pool, &channel).await {
            Ok(mut listener) => {
                info!(channel = %channel, "Listening for queue notifications");
                if reconnecting {
                    // Anything sent while disconnected went unannounced.
                    wakeup.notify_waiters();
                }

                loop {
                    match listener.recv().await {
                        Ok(_) => {
                            debug!(channel = %channel, "Queue notification received");
                            wakeup.notify_waiters();
                        }
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Notification listener failed; reconnecting");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "LISTEN unavailable; idle consumers fall back to their timeout");
            }
        }

        reconnecting = true;
        tokio::time::sleep(LISTEN_RECONNECT_DELAY).await;
    }
}

async fn open_listener(pool: &PgPool, channel: &str) -> Result<PgListener, sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;
    Ok(listener)
}

#[cfg(test)]
#[path = "postgres_tests.rs"]
mod tests;
